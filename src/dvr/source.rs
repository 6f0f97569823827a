//! Read-only query surface over the recording source.
//!
//! The pipeline only ever sees this trait, so tests can swap the real
//! library database for an in-memory source.

use crate::dvr::models::{MetadataKind, TunerSource};

/// Errors from the external recording source.
///
/// `Unavailable` is fatal for a single computation; the change monitor
/// treats it as transient and retries on the next signal.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("library database unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
    #[error("library database unavailable: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Pool(#[from] r2d2::Error),
}

/// One subscription row joined with its desired remote item
#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub subscription_id: i64,
    pub kind: MetadataKind,
    pub show_title: String,
    pub episode_title: String,
    pub remote_id: String,
    /// Opaque `key=value&key=value` ancillary blob, percent-encoded
    pub ancillary: Option<String>,
    pub priority_order: f64,
}

/// One guide entry for a desired remote id
#[derive(Debug, Clone)]
pub struct GuideRow {
    pub remote_id: String,
    pub season_number: Option<i64>,
    pub episode_number: Option<i64>,
    pub show_title: Option<String>,
    pub season_title: Option<String>,
    pub episode_title: Option<String>,
    /// Epoch seconds, UTC
    pub begins_at: Option<i64>,
    pub ends_at: Option<i64>,
    pub year: Option<i64>,
    /// Tuner source the guide entry was found under
    pub tuner_source_id: i64,
}

/// Read-only queries the pipeline needs. Implementations must never mutate
/// the underlying store.
pub trait RecordingSource: Send + Sync {
    /// Candidate subscriptions, one row per desired remote item
    fn subscriptions(&self) -> Result<Vec<SubscriptionRow>, SourceError>;

    /// Guide entries for the given remote ids (unmatched ids simply absent)
    fn guide_entries(&self, remote_ids: &[String]) -> Result<Vec<GuideRow>, SourceError>;

    /// Enabled tuner sources with their capture capacity
    fn tuner_sources(&self) -> Result<Vec<TunerSource>, SourceError>;

    /// Whether the season+episode already exists under the subscription's target
    fn episode_exists(
        &self,
        subscription_id: i64,
        kind: MetadataKind,
        season_number: i64,
        episode_number: i64,
    ) -> Result<bool, SourceError>;

    /// Whether a movie with this title and year already exists in the library
    fn movie_exists(&self, title: &str, year: i64) -> Result<bool, SourceError>;
}

/// Pull one value out of a percent-encoded `key=value&key=value` ancillary
/// blob. Keys match case-insensitively; a missing key, empty value, or
/// undecodable blob all yield `None` — malformed ancillary data is never an
/// error.
pub fn ancillary_value(blob: &str, key: &str) -> Option<String> {
    if blob.trim().is_empty() {
        return None;
    }

    let decoded = urlencoding::decode(blob)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| blob.to_string());

    for pair in decoded.split('&') {
        let mut parts = pair.splitn(2, '=');
        let (Some(k), Some(v)) = (parts.next(), parts.next()) else {
            continue;
        };
        if k.eq_ignore_ascii_case(key) && !k.trim().is_empty() && !v.trim().is_empty() {
            return Some(v.to_string());
        }
    }

    None
}
