use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use dvrwake::config::{self, Settings};
use dvrwake::dvr::library::LibraryDatabase;
use dvrwake::dvr::models::MaintenanceWindow;
use dvrwake::dvr::monitor::ChangeMonitor;
use dvrwake::dvr::sink::{RtcWakeSink, SinkStatus, WakeSink};
use dvrwake::dvr::{render_schedule, WakePlanner};

#[derive(Parser)]
#[command(
    name = "dvrwake",
    version,
    about = "Keeps the machine's wake timer in sync with the next scheduled DVR recording"
)]
struct Cli {
    /// Path to the server's library database
    #[arg(long, global = true, env = "DVRWAKE_DATABASE")]
    database: Option<PathBuf>,

    /// Hour the server's maintenance window begins (0-23)
    #[arg(long, global = true, default_value_t = config::DEFAULT_MAINTENANCE_START_HOUR)]
    maintenance_start: u32,

    /// Hour the server's maintenance window ends (0-23)
    #[arg(long, global = true, default_value_t = config::DEFAULT_MAINTENANCE_END_HOUR)]
    maintenance_end: u32,

    /// Show debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the upcoming recording schedule
    List {
        /// Also show the maintenance window
        #[arg(long)]
        maintenance: bool,

        /// Emit the schedule as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Compute the next wake instant and arm the wake trigger once
    Wake {
        /// Seconds before the wake instant to actually wake the machine
        #[arg(long, default_value_t = 15)]
        offset: u64,

        /// Command to run on wake, where the wake mechanism supports it
        #[arg(long)]
        action: Vec<String>,
    },

    /// Watch the library database and keep the wake trigger in sync
    Monitor {
        /// Seconds to bundle change bursts before recomputing
        #[arg(long, default_value_t = 5.0)]
        debounce: f64,

        /// Seconds before the wake instant to actually wake the machine
        #[arg(long, default_value_t = 15)]
        offset: u64,

        /// Command to run on wake, where the wake mechanism supports it
        #[arg(long)]
        action: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let _log_guard = dvrwake::init_logging(cli.verbose, cli.log_file.as_deref());

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = Settings::new(
        cli.database.clone(),
        cli.maintenance_start,
        cli.maintenance_end,
    )?;

    match cli.command {
        Commands::List { maintenance, json } => run_list(&settings, maintenance, json),
        Commands::Wake { offset, action } => run_wake(&settings, offset, &action),
        Commands::Monitor {
            debounce,
            offset,
            action,
        } => run_monitor(&settings, debounce, offset, action).await,
    }
}

fn open_planner(settings: &Settings) -> Result<WakePlanner> {
    let library = LibraryDatabase::open(&settings.database_path).with_context(|| {
        format!(
            "opening library database {:?}",
            settings.database_path
        )
    })?;
    Ok(WakePlanner::new(Arc::new(library), settings.maintenance))
}

fn run_list(settings: &Settings, maintenance: bool, json: bool) -> Result<()> {
    let planner = open_planner(settings)?;
    let recordings = planner.scheduled_recordings()?;

    if json {
        let payload = serde_json::json!({
            "recordings": recordings,
            "plan": planner.next_wakeup()?,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    print!("{}", render_schedule(&recordings));

    if maintenance {
        let window = planner.maintenance();
        let now = chrono::Local::now();
        println!(
            "\nMaintenance runs between {} and {}; next window starts {}",
            MaintenanceWindow::hour_label(window.start_hour),
            MaintenanceWindow::hour_label(window.end_hour),
            window.next_start(now).format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

fn run_wake(settings: &Settings, offset: u64, actions: &[String]) -> Result<()> {
    let planner = open_planner(settings)?;
    let plan = planner.next_wakeup()?;

    info!(
        "Next wakeup: {} (recording: {}, maintenance: {})",
        plan.wakeup.format("%Y-%m-%d %H:%M"),
        plan.next_recording
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "none".to_string()),
        plan.maintenance_start.format("%Y-%m-%d %H:%M")
    );

    let sink = RtcWakeSink::new();
    match sink.create_or_update(plan.wakeup, Duration::from_secs(offset), actions)? {
        SinkStatus::Scheduled => {
            println!(
                "Wake trigger armed for {}",
                plan.wakeup.format("%Y-%m-%d %H:%M")
            );
            Ok(())
        }
        SinkStatus::AccessDenied => {
            bail!("not allowed to arm the wake trigger; re-run with elevated privileges")
        }
    }
}

async fn run_monitor(
    settings: &Settings,
    debounce: f64,
    offset: u64,
    actions: Vec<String>,
) -> Result<()> {
    let planner = Arc::new(open_planner(settings)?);
    let sink: Arc<dyn WakeSink> = Arc::new(RtcWakeSink::new());
    let pre_wake = Duration::from_secs(offset);

    let refresh = {
        let planner = Arc::clone(&planner);
        let sink = Arc::clone(&sink);
        move || -> Result<()> {
            let plan = planner.next_wakeup()?;
            match sink.create_or_update(plan.wakeup, pre_wake, &actions)? {
                SinkStatus::Scheduled => {
                    info!(
                        "Wake trigger armed for {}",
                        plan.wakeup.format("%Y-%m-%d %H:%M")
                    );
                }
                SinkStatus::AccessDenied => {
                    warn!("Not allowed to arm the wake trigger; will retry on the next change");
                }
            }
            Ok(())
        }
    };

    // Publish once up front so a quiet database still gets a wake trigger
    if let Err(e) = refresh() {
        warn!("Initial wake computation failed: {e:#}");
    }

    let monitor = ChangeMonitor::new(
        &settings.database_path,
        Duration::from_secs_f64(debounce),
        Box::new(refresh),
    )?;
    monitor.enable()?;

    info!("Press Ctrl+C to stop monitoring");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;

    monitor.disable();
    info!("Stopped after {} change trigger(s)", monitor.times_triggered());
    Ok(())
}
