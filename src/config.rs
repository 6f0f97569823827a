//! Runtime settings shared by every command.

use std::path::PathBuf;

use anyhow::{bail, Result};

use crate::dvr::models::MaintenanceWindow;

pub const DEFAULT_MAINTENANCE_START_HOUR: u32 = 2;
pub const DEFAULT_MAINTENANCE_END_HOUR: u32 = 5;

/// Validated settings for a single invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    pub maintenance: MaintenanceWindow,
}

impl Settings {
    pub fn new(
        database_path: Option<PathBuf>,
        maintenance_start_hour: u32,
        maintenance_end_hour: u32,
    ) -> Result<Self> {
        if maintenance_start_hour > 23 || maintenance_end_hour > 23 {
            bail!(
                "maintenance hours must be between 0 and 23 (got {} and {})",
                maintenance_start_hour,
                maintenance_end_hour
            );
        }
        if maintenance_end_hour < maintenance_start_hour {
            // Overnight windows would make "next start" ambiguous
            bail!(
                "maintenance window may not span midnight ({}:00 to {}:00)",
                maintenance_start_hour,
                maintenance_end_hour
            );
        }

        Ok(Self {
            database_path: database_path.unwrap_or_else(default_database_path),
            maintenance: MaintenanceWindow {
                start_hour: maintenance_start_hour,
                end_hour: maintenance_end_hour,
            },
        })
    }
}

/// Library database location under the server's data directory.
pub fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Plex Media Server")
        .join("Plug-in Support")
        .join("Databases")
        .join("com.plexapp.plugins.library.db")
}
