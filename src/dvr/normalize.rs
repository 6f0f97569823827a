//! Builds `ScheduledRecording` candidates from raw subscription and guide
//! rows, then drops everything that cannot or should not be captured.

use std::collections::HashMap;

use chrono::{DateTime, Local, TimeZone};
use tracing::{debug, info};

use crate::dvr::models::{MetadataKind, ScheduledRecording};
use crate::dvr::source::{ancillary_value, GuideRow, RecordingSource, SourceError, SubscriptionRow};

const START_OFFSET_KEY: &str = "pr:startOffsetMinutes";
const END_OFFSET_KEY: &str = "pr:endOffsetMinutes";

/// Merge subscription rows with their guide entries into candidate
/// recordings, keyed by remote id (first subscription row per id wins).
pub fn build_candidates(
    subscriptions: &[SubscriptionRow],
    guide: &[GuideRow],
) -> Vec<ScheduledRecording> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut candidates: Vec<ScheduledRecording> = Vec::new();

    for sub in subscriptions {
        if index.contains_key(&sub.remote_id) {
            continue;
        }

        let mut rec = ScheduledRecording::new(
            sub.remote_id.clone(),
            sub.subscription_id,
            sub.kind,
            sub.priority_order,
        );
        rec.show_title = sub.show_title.clone();
        rec.episode_title = sub.episode_title.clone();
        (rec.start_offset_minutes, rec.end_offset_minutes) =
            parse_offsets(sub.ancillary.as_deref());

        index.insert(rec.remote_id.clone(), candidates.len());
        candidates.push(rec);
    }

    for entry in guide {
        let Some(&i) = index.get(&entry.remote_id) else {
            continue;
        };
        apply_guide_entry(&mut candidates[i], entry);
    }

    info!(
        "Merged {} subscription row(s) into {} candidate(s), {} with guide data",
        subscriptions.len(),
        candidates.len(),
        candidates.iter().filter(|r| r.start_time.is_some()).count()
    );

    candidates
}

/// Pre/post-roll minutes from the subscription's ancillary blob. Absence or
/// parse failure defaults to 0; this never errors.
fn parse_offsets(ancillary: Option<&str>) -> (i64, i64) {
    let parse = |key: &str| {
        ancillary
            .and_then(|blob| ancillary_value(blob, key))
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0)
    };
    (parse(START_OFFSET_KEY), parse(END_OFFSET_KEY))
}

fn apply_guide_entry(rec: &mut ScheduledRecording, entry: &GuideRow) {
    rec.tuner_source_id = Some(entry.tuner_source_id);
    rec.season_number = entry.season_number.unwrap_or(0);
    rec.episode_number = entry.episode_number.unwrap_or(0);

    // Subscription-sourced titles are authoritative; the guide only fills
    // blanks.
    if rec.show_title.trim().is_empty() {
        rec.show_title = entry.show_title.clone().unwrap_or_default();
    }
    if rec.season_title.trim().is_empty() {
        rec.season_title = entry.season_title.clone().unwrap_or_default();
    }
    if rec.episode_title.trim().is_empty() {
        rec.episode_title = entry.episode_title.clone().unwrap_or_default();
    }

    rec.start_time = entry.begins_at.and_then(local_from_epoch);
    rec.end_time = entry.ends_at.and_then(local_from_epoch);
    rec.year = entry.year.unwrap_or(0);

    // Some guide feeds stuff the year into the season number, or use
    // negative episode numbers as placeholders.
    if rec.season_number >= 1900 {
        rec.season_number = 0;
        rec.season_title = String::new();
    }
    if rec.episode_number < 0 {
        rec.episode_number = 0;
        rec.episode_title = String::new();
    }
}

fn local_from_epoch(secs: i64) -> Option<DateTime<Local>> {
    chrono::Utc
        .timestamp_opt(secs, 0)
        .single()
        .map(|t| t.with_timezone(&Local))
}

/// Drop candidates that cannot be scheduled or are already in the library.
/// Each stage operates on the survivors of the previous one.
pub fn filter_eligible(
    mut candidates: Vec<ScheduledRecording>,
    source: &dyn RecordingSource,
    now: DateTime<Local>,
) -> Result<Vec<ScheduledRecording>, SourceError> {
    let before = candidates.len();
    candidates.retain(|rec| match (rec.effective_start(), rec.effective_end()) {
        (Some(start), Some(_)) => start > now,
        _ => false,
    });
    info!(
        "Removed {} unschedulable or past item(s)",
        before - candidates.len()
    );

    let mut survivors = Vec::with_capacity(candidates.len());
    let mut removed_episodes = 0usize;
    let mut removed_movies = 0usize;

    for rec in candidates {
        let already_recorded = match rec.kind {
            MetadataKind::Show | MetadataKind::Episode => {
                let exists = source.episode_exists(
                    rec.subscription_id,
                    rec.kind,
                    rec.season_number,
                    rec.episode_number,
                )?;
                if exists {
                    removed_episodes += 1;
                }
                exists
            }
            MetadataKind::Movie => {
                let exists = source.movie_exists(&rec.episode_title, rec.year)?;
                if exists {
                    removed_movies += 1;
                }
                exists
            }
        };

        if already_recorded {
            debug!("Already in library, skipping: {}", rec.formatted_title());
        } else {
            survivors.push(rec);
        }
    }

    info!(
        "Removed {} previously recorded episode(s) and {} movie(s)",
        removed_episodes, removed_movies
    );

    Ok(survivors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dvr::testing::FakeSource;
    use chrono::Duration;

    fn sub_row(remote_id: &str, kind: MetadataKind, ancillary: Option<&str>) -> SubscriptionRow {
        SubscriptionRow {
            subscription_id: 10,
            kind,
            show_title: String::new(),
            episode_title: String::new(),
            remote_id: remote_id.to_string(),
            ancillary: ancillary.map(|s| s.to_string()),
            priority_order: 1.0,
        }
    }

    fn guide_row(remote_id: &str, begins_at: i64, ends_at: i64) -> GuideRow {
        GuideRow {
            remote_id: remote_id.to_string(),
            season_number: Some(1),
            episode_number: Some(2),
            show_title: Some("Guide Show".to_string()),
            season_title: Some("Season 1".to_string()),
            episode_title: Some("Guide Episode".to_string()),
            begins_at: Some(begins_at),
            ends_at: Some(ends_at),
            year: Some(2024),
            tuner_source_id: 7,
        }
    }

    #[test]
    fn missing_offset_keys_default_to_zero() {
        // Scenario: ancillary blob present but without offset keys
        let subs = vec![sub_row("g1", MetadataKind::Episode, Some("hidden=1"))];
        let recs = build_candidates(&subs, &[]);
        assert_eq!(recs[0].start_offset_minutes, 0);
        assert_eq!(recs[0].end_offset_minutes, 0);

        // And entirely absent blob
        let subs = vec![sub_row("g2", MetadataKind::Episode, None)];
        let recs = build_candidates(&subs, &[]);
        assert_eq!(recs[0].start_offset_minutes, 0);
        assert_eq!(recs[0].end_offset_minutes, 0);
    }

    #[test]
    fn unparsable_offsets_default_to_zero() {
        let subs = vec![sub_row(
            "g1",
            MetadataKind::Episode,
            Some("pr:startOffsetMinutes=soon&pr:endOffsetMinutes=5"),
        )];
        let recs = build_candidates(&subs, &[]);
        assert_eq!(recs[0].start_offset_minutes, 0);
        assert_eq!(recs[0].end_offset_minutes, 5);
    }

    #[test]
    fn duplicate_remote_ids_keep_first_row() {
        let mut second = sub_row("g1", MetadataKind::Episode, None);
        second.subscription_id = 99;
        let subs = vec![sub_row("g1", MetadataKind::Episode, None), second];
        let recs = build_candidates(&subs, &[]);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].subscription_id, 10);
    }

    #[test]
    fn guide_fills_only_blank_titles() {
        let mut sub = sub_row("g1", MetadataKind::Episode, None);
        sub.episode_title = "Subscription Episode".to_string();
        let recs = build_candidates(&[sub], &[guide_row("g1", 1_700_000_000, 1_700_003_600)]);

        assert_eq!(recs[0].show_title, "Guide Show");
        assert_eq!(recs[0].episode_title, "Subscription Episode");
        assert_eq!(recs[0].tuner_source_id, Some(7));
        assert!(recs[0].start_time.is_some());
    }

    #[test]
    fn bad_guide_numbers_are_scrubbed() {
        let mut entry = guide_row("g1", 1_700_000_000, 1_700_003_600);
        entry.season_number = Some(2024);
        entry.episode_number = Some(-1);
        let recs = build_candidates(&[sub_row("g1", MetadataKind::Episode, None)], &[entry]);

        assert_eq!(recs[0].season_number, 0);
        assert_eq!(recs[0].season_title, "");
        assert_eq!(recs[0].episode_number, 0);
        assert_eq!(recs[0].episode_title, "");
    }

    #[test]
    fn filter_drops_guide_misses_and_past_items() {
        let now = Local::now();
        let source = FakeSource::default();

        let mut future = ScheduledRecording::new("f".into(), 1, MetadataKind::Episode, 1.0);
        future.start_time = Some(now + Duration::hours(1));
        future.end_time = Some(now + Duration::hours(2));

        let mut past = ScheduledRecording::new("p".into(), 1, MetadataKind::Episode, 1.0);
        past.start_time = Some(now - Duration::hours(2));
        past.end_time = Some(now - Duration::hours(1));

        let no_guide = ScheduledRecording::new("n".into(), 1, MetadataKind::Episode, 1.0);

        let survivors = filter_eligible(vec![future, past, no_guide], &source, now).unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].remote_id, "f");
    }

    #[test]
    fn filter_drops_items_already_in_library() {
        let now = Local::now();
        let mut source = FakeSource::default();
        source.existing_episodes.insert((10, 1, 2));
        source.existing_movies.insert(("Heat".to_string(), 1995));

        let mut episode = ScheduledRecording::new("e".into(), 10, MetadataKind::Show, 1.0);
        episode.season_number = 1;
        episode.episode_number = 2;
        episode.start_time = Some(now + Duration::hours(1));
        episode.end_time = Some(now + Duration::hours(2));

        let mut movie = ScheduledRecording::new("m".into(), 11, MetadataKind::Movie, 2.0);
        movie.episode_title = "Heat".to_string();
        movie.year = 1995;
        movie.start_time = Some(now + Duration::hours(3));
        movie.end_time = Some(now + Duration::hours(5));

        let mut new_movie = ScheduledRecording::new("m2".into(), 11, MetadataKind::Movie, 3.0);
        new_movie.episode_title = "Heat".to_string();
        new_movie.year = 2026; // remake, different year
        new_movie.start_time = Some(now + Duration::hours(3));
        new_movie.end_time = Some(now + Duration::hours(5));

        let survivors = filter_eligible(vec![episode, movie, new_movie], &source, now).unwrap();
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].remote_id, "m2");
    }
}
