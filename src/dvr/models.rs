//! Data models for DVR wake scheduling

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Local, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

/// Kind of library item a subscription records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    Movie,
    Show,
    Episode,
}

impl MetadataKind {
    /// Numeric code used by the library database
    pub fn code(&self) -> i64 {
        match self {
            MetadataKind::Movie => 1,
            MetadataKind::Show => 2,
            MetadataKind::Episode => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(MetadataKind::Movie),
            2 => Some(MetadataKind::Show),
            4 => Some(MetadataKind::Episode),
            _ => None,
        }
    }
}

/// A candidate recording assembled from subscription and guide data.
///
/// The full set is rebuilt from scratch on every computation; nothing here
/// survives across pipeline runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledRecording {
    pub remote_id: String,
    pub subscription_id: i64,
    pub kind: MetadataKind,
    pub show_title: String,
    pub season_title: String,
    pub episode_title: String,
    pub season_number: i64,
    pub episode_number: i64,
    /// Year the item was originally available (movie dedup key)
    pub year: i64,
    /// Raw guide start/end; `None` until guide data is matched
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    pub start_offset_minutes: i64,
    pub end_offset_minutes: i64,
    /// Lower value = higher priority
    pub priority_order: f64,
    /// Owning tuner source, when the guide identified one
    pub tuner_source_id: Option<i64>,
    /// Remote ids of recordings whose effective window overlaps this one
    pub conflicts: BTreeSet<String>,
    /// Cleared by the conflict resolver when this recording loses a tuner
    pub will_record: bool,
}

impl ScheduledRecording {
    pub fn new(
        remote_id: String,
        subscription_id: i64,
        kind: MetadataKind,
        priority_order: f64,
    ) -> Self {
        Self {
            remote_id,
            subscription_id,
            kind,
            show_title: String::new(),
            season_title: String::new(),
            episode_title: String::new(),
            season_number: 0,
            episode_number: 0,
            year: 0,
            start_time: None,
            end_time: None,
            start_offset_minutes: 0,
            end_offset_minutes: 0,
            priority_order,
            tuner_source_id: None,
            conflicts: BTreeSet::new(),
            will_record: true,
        }
    }

    /// Guide start adjusted by the pre-roll offset
    pub fn effective_start(&self) -> Option<DateTime<Local>> {
        self.start_time
            .map(|t| t - Duration::minutes(self.start_offset_minutes))
    }

    /// Guide end adjusted by the post-roll offset
    pub fn effective_end(&self) -> Option<DateTime<Local>> {
        self.end_time
            .map(|t| t + Duration::minutes(self.end_offset_minutes))
    }

    /// Open-interval overlap test; touching endpoints do not overlap.
    pub fn overlaps(&self, other: &ScheduledRecording) -> bool {
        match (
            self.effective_start(),
            self.effective_end(),
            other.effective_start(),
            other.effective_end(),
        ) {
            (Some(start1), Some(end1), Some(start2), Some(end2)) => {
                start1 < end2 && end1 > start2
            }
            _ => false,
        }
    }

    /// Human-readable title, e.g. `Nature - S02E07 - Owls`
    pub fn formatted_title(&self) -> String {
        let sxxexx = match self.kind {
            MetadataKind::Show | MetadataKind::Episode if self.episode_number > 0 => {
                format!("S{:02}E{:02}", self.season_number, self.episode_number)
            }
            _ => String::new(),
        };

        [
            self.show_title.as_str(),
            self.season_title.as_str(),
            sxxexx.as_str(),
            self.episode_title.as_str(),
        ]
        .iter()
        .filter(|p| !p.trim().is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(" - ")
    }
}

/// Recurring daily maintenance window, expressed as local clock hours.
///
/// Overnight windows (end hour before start hour) are rejected at
/// configuration time and never reach this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl MaintenanceWindow {
    /// Next occurrence of the window start: once the current hour has reached
    /// the start hour, the next start is tomorrow.
    pub fn next_start(&self, now: DateTime<Local>) -> DateTime<Local> {
        let date = if now.hour() >= self.start_hour {
            now.date_naive() + Duration::days(1)
        } else {
            now.date_naive()
        };
        at_hour(date, self.start_hour)
    }

    /// End instant of the next window (same date as `next_start`)
    pub fn next_end(&self, now: DateTime<Local>) -> DateTime<Local> {
        at_hour(self.next_start(now).date_naive(), self.end_hour)
    }

    /// Friendly hour label for log output (`2am`, `Noon`, ...)
    pub fn hour_label(hour: u32) -> String {
        match hour {
            0 => "Midnight".to_string(),
            12 => "Noon".to_string(),
            h if h > 12 => format!("{}pm", h - 12),
            h => format!("{}am", h),
        }
    }
}

fn at_hour(date: chrono::NaiveDate, hour: u32) -> DateTime<Local> {
    // A DST transition can make an exact local time ambiguous or skipped;
    // take the earliest valid interpretation.
    let naive = date.and_hms_opt(hour, 0, 0).expect("hour validated to 0-23");
    match Local.from_local_datetime(&naive) {
        chrono::LocalResult::Single(t) => t,
        chrono::LocalResult::Ambiguous(earliest, _) => earliest,
        chrono::LocalResult::None => Local
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .expect("time after a DST gap resolves"),
    }
}

/// A tuner grouping with a maximum concurrent-capture capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerSource {
    pub id: i64,
    pub capacity: u32,
}

/// Result of one wake computation
#[derive(Debug, Clone, Copy, Serialize)]
pub struct WakePlan {
    /// Earliest effective start among recordings that will record
    pub next_recording: Option<DateTime<Local>>,
    pub maintenance_start: DateTime<Local>,
    pub maintenance_end: DateTime<Local>,
    /// The instant the machine must be awake
    pub wakeup: DateTime<Local>,
}
