//! Library database change monitor.
//!
//! Watches the library database (and its WAL/SHM siblings) for writes and
//! debounces the resulting bursts into single wake-plan refreshes. The state
//! machine is Idle -> Pending -> RecomputeInFlight -> Idle, with the
//! Idle -> Pending edge guarded by an atomic compare-and-set so any number of
//! near-simultaneous change signals schedule exactly one recompute.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{error, info, warn};

/// Refresh callback run once per debounced change burst. Errors are logged
/// by the cycle wrapper; the plan is simply not published and the next
/// signal retries.
pub type RefreshFn = Box<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Default)]
struct MonitorStats {
    started_at: Option<DateTime<Local>>,
    times_triggered: u64,
}

struct MonitorCore {
    refresh: RefreshFn,
    debounce: Duration,
    enabled: AtomicBool,
    /// True from the first signal of a burst until its recompute finishes
    pending: AtomicBool,
    stats: Mutex<MonitorStats>,
    runtime: tokio::runtime::Handle,
}

impl MonitorCore {
    /// Idle -> Pending transition. Signals arriving while Pending (or while
    /// the recompute is in flight) are absorbed; the debounce timer is never
    /// extended.
    fn signal_change(self: &Arc<Self>, origin: &str) {
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        // Cheap check on the common already-pending path
        if self.pending.load(Ordering::Acquire) {
            return;
        }
        if self
            .pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        {
            let mut stats = self.stats.lock();
            stats.times_triggered += 1;
            info!(
                "Change detected ({}), trigger {} since {}",
                origin,
                stats.times_triggered,
                stats
                    .started_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "start".to_string())
            );
        }
        info!(
            "Bundling changes, waiting {}s until next refresh",
            self.debounce.as_secs_f64()
        );

        let core = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(core.debounce).await;

            if core.enabled.load(Ordering::Acquire) {
                let blocking = Arc::clone(&core);
                match tokio::task::spawn_blocking(move || (blocking.refresh)()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Refresh failed, waiting for next change: {e:#}"),
                    Err(e) => error!("Refresh task panicked: {e}"),
                }
            }

            // Back to Idle; signals that arrived during the recompute were
            // absorbed, the next one starts a fresh cycle.
            core.pending.store(false, Ordering::Release);
        });
    }
}

/// Watches the library database files and keeps the wake plan fresh.
pub struct ChangeMonitor {
    core: Arc<MonitorCore>,
    watch_dir: PathBuf,
    file_names: Vec<OsString>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ChangeMonitor {
    /// Must be called from within a tokio runtime; the debounce timer and
    /// recompute run on that runtime.
    pub fn new(database_path: &Path, debounce: Duration, refresh: RefreshFn) -> Result<Self> {
        let watch_dir = database_path
            .parent()
            .context("library database path has no parent directory")?
            .to_path_buf();
        let base = database_path
            .file_name()
            .context("library database path has no file name")?
            .to_os_string();

        // SQLite in WAL mode writes to the -wal/-shm siblings far more often
        // than to the database itself.
        let mut wal = base.clone();
        wal.push("-wal");
        let mut shm = base.clone();
        shm.push("-shm");

        Ok(Self {
            core: Arc::new(MonitorCore {
                refresh,
                debounce,
                enabled: AtomicBool::new(false),
                pending: AtomicBool::new(false),
                stats: Mutex::new(MonitorStats::default()),
                runtime: tokio::runtime::Handle::current(),
            }),
            watch_dir,
            file_names: vec![base, wal, shm],
            watcher: Mutex::new(None),
        })
    }

    /// Start watching. Watch errors after this point are logged and
    /// monitoring continues; an event-queue overflow is folded into a plain
    /// change signal.
    pub fn enable(&self) -> Result<()> {
        let core = Arc::clone(&self.core);
        let file_names = self.file_names.clone();

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
                match res {
                    Ok(event) => {
                        if event.need_rescan() {
                            // The queue overflowed; whatever was lost, at
                            // least one signal survived.
                            core.signal_change("overflow");
                            return;
                        }
                        if !matches!(
                            event.kind,
                            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any
                        ) {
                            return;
                        }
                        for path in &event.paths {
                            if let Some(name) = path.file_name() {
                                if file_names.iter().any(|f| f == name) {
                                    core.signal_change(&name.to_string_lossy());
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => warn!("Watch error (monitoring continues): {e}"),
                }
            })
            .context("creating filesystem watcher")?;

        watcher
            .watch(&self.watch_dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("watching {:?}", self.watch_dir))?;

        {
            let mut stats = self.core.stats.lock();
            stats.started_at = Some(Local::now());
            stats.times_triggered = 0;
        }
        self.core.enabled.store(true, Ordering::Release);
        *self.watcher.lock() = Some(watcher);

        info!(
            "Monitoring {:?} for changes to {:?}",
            self.watch_dir, self.file_names
        );
        Ok(())
    }

    /// Stop handling signals immediately. A recompute already in flight is
    /// allowed to finish.
    pub fn disable(&self) {
        self.core.enabled.store(false, Ordering::Release);
        *self.watcher.lock() = None;
        info!("Monitoring disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.core.enabled.load(Ordering::Acquire)
    }

    pub fn times_triggered(&self) -> u64 {
        self.core.stats.lock().times_triggered
    }

    /// Inject a change signal directly, as if a watched file had changed.
    pub fn signal_change(&self, origin: &str) {
        self.core.signal_change(origin);
    }
}
