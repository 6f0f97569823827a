//! Wake scheduler sink: the contract the pipeline publishes to, plus the
//! rtc wakealarm implementation.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use tracing::{info, warn};

/// Outcome of arming the wake trigger. `AccessDenied` is a first-class
/// result, not an error: callers decide how loudly to surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkStatus {
    Scheduled,
    AccessDenied,
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to arm wake trigger: {0}")]
    Io(#[from] io::Error),
}

/// External facility that arms the machine's OS-level wake trigger.
///
/// Implementations must be idempotent against a single logical task
/// identity: a second call replaces the previous trigger, never duplicates
/// it.
pub trait WakeSink: Send + Sync {
    /// Arm the wake trigger for `wake_at - pre_wake`, with `actions` to run
    /// on wake where the mechanism supports it.
    fn create_or_update(
        &self,
        wake_at: DateTime<Local>,
        pre_wake: Duration,
        actions: &[String],
    ) -> Result<SinkStatus, SinkError>;
}

/// Arms the hardware RTC via the kernel's `wakealarm` sysfs attribute.
///
/// The alarm is cleared before being set, which is what makes repeated
/// publishes safe: there is exactly one alarm slot, so the last write wins.
pub struct RtcWakeSink {
    alarm_path: PathBuf,
    warned_about_actions: AtomicBool,
}

const DEFAULT_ALARM_PATH: &str = "/sys/class/rtc/rtc0/wakealarm";

impl RtcWakeSink {
    pub fn new() -> Self {
        Self::with_alarm_path(PathBuf::from(DEFAULT_ALARM_PATH))
    }

    pub fn with_alarm_path(alarm_path: PathBuf) -> Self {
        Self {
            alarm_path,
            warned_about_actions: AtomicBool::new(false),
        }
    }
}

impl Default for RtcWakeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeSink for RtcWakeSink {
    fn create_or_update(
        &self,
        wake_at: DateTime<Local>,
        pre_wake: Duration,
        actions: &[String],
    ) -> Result<SinkStatus, SinkError> {
        if !actions.is_empty() && !self.warned_about_actions.swap(true, Ordering::Relaxed) {
            warn!(
                "RTC alarms cannot run commands; ignoring {} wake action(s)",
                actions.len()
            );
        }

        let trigger = wake_at - chrono::Duration::from_std(pre_wake).unwrap_or_default();
        let epoch = trigger.timestamp();

        // An already-armed alarm rejects a new value until cleared
        let armed = std::fs::write(&self.alarm_path, "0\n")
            .and_then(|_| std::fs::write(&self.alarm_path, format!("{epoch}\n")));

        match armed {
            Ok(()) => {
                info!(
                    "Wakeup alarm armed for {} ({}s before wake target)",
                    trigger.format("%Y-%m-%d %H:%M:%S"),
                    pre_wake.as_secs()
                );
                Ok(SinkStatus::Scheduled)
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                Ok(SinkStatus::AccessDenied)
            }
            Err(e) => Err(e.into()),
        }
    }
}
