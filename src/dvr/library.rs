//! Read-only adapter over the media server's library databases.
//!
//! Uses rusqlite with connection pooling (r2d2). Every connection is opened
//! with `SQLITE_OPEN_READ_ONLY`; this process never writes to the server's
//! databases. Guide data lives in per-provider EPG databases next to the
//! main library database and is attached on demand.

use std::path::{Path, PathBuf};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::dvr::models::{MetadataKind, TunerSource};
use crate::dvr::source::{
    ancillary_value, GuideRow, RecordingSource, SourceError, SubscriptionRow,
};

/// Connection pool over the main library database
pub struct LibraryDatabase {
    pool: Pool<SqliteConnectionManager>,
    database_path: PathBuf,
}

impl LibraryDatabase {
    /// Open the library database read-only.
    pub fn open(database_path: &Path) -> Result<Self, SourceError> {
        info!("Opening library database at: {:?}", database_path);

        let manager = SqliteConnectionManager::file(database_path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );

        let pool = Pool::builder()
            .max_size(2)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        // Fail now rather than on the first query
        pool.get()?
            .query_row("select 1", [], |row| row.get::<_, i64>(0))?;

        Ok(Self {
            pool,
            database_path: database_path.to_path_buf(),
        })
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, SourceError> {
        Ok(self.pool.get()?)
    }

    /// EPG databases referenced by the library, paired with the id of the
    /// tuner source they belong to. The files live next to the main database
    /// as `{identifier}-{uuid}.db`.
    fn guide_databases(&self) -> Result<Vec<(PathBuf, i64)>, SourceError> {
        let conn = self.conn()?;
        let dir = self.database_path.parent().unwrap_or(Path::new("."));

        let mut stmt = conn.prepare(
            "select epg.identifier, dvr.uuid, dvr.id
             from media_provider_resources as epg
             inner join media_provider_resources as dvr on dvr.id = epg.parent_id
             where epg.identifier like 'tv.plex.providers.epg.%'",
        )?;

        let databases = stmt
            .query_map([], |row| {
                let identifier: String = row.get(0)?;
                let uuid: String = row.get(1)?;
                let source_id: i64 = row.get(2)?;
                Ok((dir.join(format!("{identifier}-{uuid}.db")), source_id))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        debug!("Found {} guide database(s)", databases.len());
        Ok(databases)
    }
}

impl RecordingSource for LibraryDatabase {
    fn subscriptions(&self) -> Result<Vec<SubscriptionRow>, SourceError> {
        let conn = self.conn()?;

        let movie = MetadataKind::Movie.code();
        let show = MetadataKind::Show.code();
        let episode = MetadataKind::Episode.code();

        let mut stmt = conn.prepare(&format!(
            "select distinct
               media_subscriptions.id,
               media_subscriptions.metadata_type,
               coalesce((case media_subscriptions.metadata_type
                 when {show} then metadata_items.title end), '') as show_title,
               coalesce((case media_subscriptions.metadata_type
                 when {episode} then metadata_items.title end), '') as episode_title,
               metadata_subscription_desired_items.remote_id,
               media_subscriptions.extra_data,
               media_subscriptions.\"order\"
             from media_subscriptions
             inner join metadata_subscription_desired_items
               on metadata_subscription_desired_items.sub_id = media_subscriptions.id
             left join metadata_items
               on metadata_items.id = media_subscriptions.target_metadata_item_id
             where media_subscriptions.metadata_type in ({movie}, {show}, {episode})"
        ))?;

        let rows = stmt
            .query_map([], |row| {
                let kind_code: i64 = row.get(1)?;
                let remote_id: String = row.get(4)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    kind_code,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    remote_id,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut subscriptions = Vec::with_capacity(rows.len());
        for (sub_id, kind_code, show_title, episode_title, remote_id, ancillary, order) in rows {
            let Some(kind) = MetadataKind::from_code(kind_code) else {
                // Filtered in SQL already; belt and braces for schema drift
                continue;
            };
            let remote_id = urlencoding::decode(&remote_id)
                .map(|s| s.into_owned())
                .unwrap_or(remote_id);
            subscriptions.push(SubscriptionRow {
                subscription_id: sub_id,
                kind,
                show_title,
                episode_title,
                remote_id,
                ancillary,
                priority_order: order,
            });
        }

        debug!("Loaded {} subscription row(s)", subscriptions.len());
        Ok(subscriptions)
    }

    fn guide_entries(&self, remote_ids: &[String]) -> Result<Vec<GuideRow>, SourceError> {
        if remote_ids.is_empty() {
            return Ok(Vec::new());
        }

        let movie = MetadataKind::Movie.code();
        let episode = MetadataKind::Episode.code();
        let placeholders = vec!["?"; remote_ids.len()].join(",");

        let sql = format!(
            "select
               episode.guid as remote_id,
               season.\"index\" as season_number,
               episode.\"index\" as episode_number,
               show.title as show_title,
               season.title as season_title,
               episode.title as episode_title,
               min(media_items.begins_at) as begins_at,
               min(media_items.ends_at) as ends_at,
               episode.year
             from metadata_items as episode
             left join metadata_items as season on season.id = episode.parent_id
             left join metadata_items as show on show.id = season.parent_id
             inner join media_items on media_items.metadata_item_id = episode.id
             where episode.metadata_type in ({movie}, {episode})
             and episode.guid in ({placeholders})
             group by remote_id, season_number, episode_number,
                      show_title, season_title, episode_title, episode.year"
        );

        let mut entries = Vec::new();
        for (guide_db, source_id) in self.guide_databases()? {
            let conn = Connection::open_with_flags(
                &guide_db,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(remote_ids.iter()), |row| {
                    Ok(GuideRow {
                        remote_id: row.get(0)?,
                        season_number: row.get(1)?,
                        episode_number: row.get(2)?,
                        show_title: row.get(3)?,
                        season_title: row.get(4)?,
                        episode_title: row.get(5)?,
                        begins_at: row.get(6)?,
                        ends_at: row.get(7)?,
                        year: row.get(8)?,
                        tuner_source_id: source_id,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;

            debug!(
                "Guide database {:?} matched {} of {} remote id(s)",
                guide_db,
                rows.len(),
                remote_ids.len()
            );
            entries.extend(rows);
        }

        Ok(entries)
    }

    fn tuner_sources(&self) -> Result<Vec<TunerSource>, SourceError> {
        let conn = self.conn()?;

        // The filters mirror what the server itself considers an enabled,
        // live tuner resource.
        let mut stmt = conn.prepare(
            "select parent_id, extra_data
             from media_provider_resources
             where identifier = 'tv.plex.grabbers.tunerservice'
             and protocol = 'livetv'
             and parent_id is not null
             and type = 4
             and status = 1
             and state = 1",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut sources = Vec::with_capacity(rows.len());
        for (id, ancillary) in rows {
            let capacity = ancillary
                .as_deref()
                .and_then(|blob| ancillary_value(blob, "at:tuners"))
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0);

            let capacity = if capacity == 0 {
                warn!(
                    "Unable to fetch tuner count for source '{}', assuming 1 tuner",
                    id
                );
                1
            } else {
                capacity
            };

            sources.push(TunerSource { id, capacity });
        }

        Ok(sources)
    }

    fn episode_exists(
        &self,
        subscription_id: i64,
        kind: MetadataKind,
        season_number: i64,
        episode_number: i64,
    ) -> Result<bool, SourceError> {
        let conn = self.conn()?;

        // The target item is the show itself for Show subscriptions, and the
        // episode for Episode subscriptions; the joins walk the hierarchy
        // accordingly.
        let sql = match kind {
            MetadataKind::Show => {
                "select 1
                 from media_subscriptions
                 inner join metadata_items as seasons
                   on seasons.parent_id = media_subscriptions.target_metadata_item_id
                 inner join metadata_items as episodes on episodes.parent_id = seasons.id
                 where media_subscriptions.id = ?1
                 and seasons.\"index\" = ?2
                 and episodes.\"index\" = ?3
                 limit 1"
            }
            MetadataKind::Episode => {
                "select 1
                 from media_subscriptions
                 inner join metadata_items as episodes
                   on episodes.id = media_subscriptions.target_metadata_item_id
                 inner join metadata_items as seasons on seasons.id = episodes.parent_id
                 where media_subscriptions.id = ?1
                 and seasons.\"index\" = ?2
                 and episodes.\"index\" = ?3
                 limit 1"
            }
            MetadataKind::Movie => return Ok(false),
        };

        let mut stmt = conn.prepare(sql)?;
        let exists = stmt.exists(params![subscription_id, season_number, episode_number])?;
        Ok(exists)
    }

    fn movie_exists(&self, title: &str, year: i64) -> Result<bool, SourceError> {
        let conn = self.conn()?;

        let mut stmt = conn.prepare(&format!(
            "select 1 from metadata_items
             where metadata_type = {}
             and year = ?1
             and title = ?2
             limit 1",
            MetadataKind::Movie.code()
        ))?;

        let exists = stmt.exists(params![year, title])?;
        Ok(exists)
    }
}
