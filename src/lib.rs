//! DVR wake scheduling: figure out when the machine next needs to be awake
//! (a scheduled recording or the server's maintenance window) and keep the
//! OS wake trigger pointed at that instant.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;

pub mod config;
pub mod dvr;

/// Initialize logging for wake scheduling operations.
///
/// When `verbose` is false, only INFO and above are shown. With a log file,
/// output goes to both stderr and the file; the returned guard must be held
/// for the lifetime of the process or buffered lines are lost.
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info,notify=warn")
    };

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path.file_name().map(Path::new).unwrap_or_else(|| {
                Path::new("dvrwake.log")
            });
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let subscriber = fmt()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .with_writer(writer)
                .with_env_filter(filter)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
            Some(guard)
        }
        None => {
            let subscriber = fmt()
                .with_target(true)
                .with_level(true)
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
            None
        }
    }
}
