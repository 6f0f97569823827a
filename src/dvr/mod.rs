//! DVR wake planning
//!
//! Computes the next instant the machine must be awake, either for the next
//! scheduled recording that will actually be captured or for the daily
//! maintenance window, and renders the upcoming schedule.

pub mod conflicts;
pub mod library;
pub mod models;
pub mod monitor;
pub mod normalize;
pub mod sink;
pub mod source;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tracing::info;

use crate::dvr::models::{MaintenanceWindow, ScheduledRecording, WakePlan};
use crate::dvr::source::RecordingSource;

/// Runs the recording pipeline end to end over a `RecordingSource`.
///
/// Every call rebuilds the recording set from scratch; the planner itself
/// holds no mutable state, so concurrent "list" and monitor-driven
/// computations cannot interfere.
pub struct WakePlanner {
    source: Arc<dyn RecordingSource>,
    maintenance: MaintenanceWindow,
}

impl WakePlanner {
    pub fn new(source: Arc<dyn RecordingSource>, maintenance: MaintenanceWindow) -> Self {
        Self { source, maintenance }
    }

    pub fn maintenance(&self) -> MaintenanceWindow {
        self.maintenance
    }

    /// The eligible schedule with conflicts resolved, ascending by effective
    /// start.
    pub fn scheduled_recordings(&self) -> Result<Vec<ScheduledRecording>> {
        self.scheduled_recordings_at(Local::now())
    }

    fn scheduled_recordings_at(&self, now: DateTime<Local>) -> Result<Vec<ScheduledRecording>> {
        info!("Getting scheduled recordings");

        let subscriptions = self
            .source
            .subscriptions()
            .context("loading subscriptions")?;
        if subscriptions.is_empty() {
            info!("Found 0 upcoming scheduled recordings");
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        let remote_ids: Vec<String> = subscriptions
            .iter()
            .filter(|s| seen.insert(s.remote_id.clone()))
            .map(|s| s.remote_id.clone())
            .collect();

        let guide = self
            .source
            .guide_entries(&remote_ids)
            .context("loading guide entries")?;

        let candidates = normalize::build_candidates(&subscriptions, &guide);
        let mut eligible = normalize::filter_eligible(candidates, self.source.as_ref(), now)
            .context("filtering candidates against the library")?;

        let tuners = self
            .source
            .tuner_sources()
            .context("loading tuner sources")?;
        conflicts::resolve_conflicts(&mut eligible, &tuners);

        eligible.sort_by(|a, b| {
            a.effective_start()
                .cmp(&b.effective_start())
                .then_with(|| a.remote_id.cmp(&b.remote_id))
        });

        let mut summary = format!("Found {} upcoming scheduled recordings", eligible.len());
        if let Some(next) = next_recording_start(&eligible) {
            summary.push_str(&format!(" starting at {}", next.format("%Y-%m-%d %H:%M")));
        }
        info!("{summary}");

        Ok(eligible)
    }

    /// Combine the schedule with the maintenance window into a wake plan.
    pub fn next_wakeup(&self) -> Result<WakePlan> {
        self.next_wakeup_at(Local::now())
    }

    fn next_wakeup_at(&self, now: DateTime<Local>) -> Result<WakePlan> {
        let recordings = self.scheduled_recordings_at(now)?;
        Ok(select_wakeup(&recordings, self.maintenance, now))
    }
}

/// Earliest effective start among recordings that will record
fn next_recording_start(recordings: &[ScheduledRecording]) -> Option<DateTime<Local>> {
    recordings
        .iter()
        .filter(|r| r.will_record)
        .filter_map(|r| r.effective_start())
        .min()
}

/// The wakeup instant is the earlier of the next surviving recording and the
/// next maintenance start; with no surviving recordings it is the
/// maintenance start alone.
fn select_wakeup(
    recordings: &[ScheduledRecording],
    maintenance: MaintenanceWindow,
    now: DateTime<Local>,
) -> WakePlan {
    let next_recording = next_recording_start(recordings);
    let maintenance_start = maintenance.next_start(now);

    let wakeup = match next_recording {
        Some(rec) if rec < maintenance_start => rec,
        _ => maintenance_start,
    };

    WakePlan {
        next_recording,
        maintenance_start,
        maintenance_end: maintenance.next_end(now),
        wakeup,
    }
}

/// Conflict marker used in the schedule listing
pub const CONFLICT_MARKER: &str = "▲";

/// Plain-text table of the upcoming schedule, ascending by effective start.
/// Recordings that lost a tuner carry the conflict marker.
pub fn render_schedule(recordings: &[ScheduledRecording]) -> String {
    if recordings.is_empty() {
        return "No upcoming scheduled recordings.\n".to_string();
    }

    let fmt = |t: Option<DateTime<Local>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default()
    };

    let start_width = recordings
        .iter()
        .map(|r| fmt(r.effective_start()).len())
        .max()
        .unwrap_or(0)
        .max("Start Time".len());
    let end_width = recordings
        .iter()
        .map(|r| fmt(r.effective_end()).len())
        .max()
        .unwrap_or(0)
        .max("End Time".len());
    let has_conflicts = recordings.iter().any(|r| !r.will_record);

    let mut out = String::new();
    out.push_str(&format!(
        "{:start_width$}  {:end_width$}  Title{}\n",
        "Start Time",
        "End Time",
        if has_conflicts {
            format!("  ({CONFLICT_MARKER} = conflict)")
        } else {
            String::new()
        }
    ));
    out.push_str(&format!(
        "{}  {}  {}\n",
        "-".repeat(start_width),
        "-".repeat(end_width),
        "-".repeat(50)
    ));

    for rec in recordings {
        let marker = if rec.will_record {
            String::new()
        } else {
            format!("{CONFLICT_MARKER} ")
        };
        out.push_str(&format!(
            "{:start_width$}  {:end_width$}  {}{}\n",
            fmt(rec.effective_start()),
            fmt(rec.effective_end()),
            marker,
            rec.formatted_title()
        ));
    }

    out
}
