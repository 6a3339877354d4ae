//! Bounded persistent store backed by SQLite.
//!
//! Three tables:
//!
//! - `latest_metrics`: a single row (`id = 1`) upserted in place
//! - `devices`: the last full device list, replaced wholesale
//! - `metrics_history`: append-only log capped at `history_cap` rows,
//!   evicted oldest-`recorded_at` first
//!
//! The connection is opened and the schema created lazily on first use,
//! exactly once, under the connection lock. Trimming takes a separate
//! trim lock so two trims never race each other, while inserts keep
//! flowing between them; the history may briefly exceed the cap until the
//! pending trim completes.

pub mod history;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use homelink_api::{DeviceState, MetricsSample};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use tracing::{debug, info, warn};

pub use history::{HistoryStats, HistoryWriter};

pub const DEFAULT_HISTORY_CAP: usize = 50;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS latest_metrics (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    temperature REAL    NOT NULL,
    humidity    INTEGER NOT NULL,
    power       INTEGER NOT NULL,
    timestamp   TEXT    NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS devices (
    id        TEXT    PRIMARY KEY,
    name      TEXT    NOT NULL,
    is_on     INTEGER NOT NULL,
    last_seen TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS metrics_history (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    temperature REAL    NOT NULL,
    humidity    INTEGER NOT NULL,
    power       INTEGER NOT NULL,
    timestamp   TEXT    NOT NULL,
    recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_recorded_at
    ON metrics_history (recorded_at, id);
";

// ── StoreError ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Store is closed")]
    Closed,

    #[error("Cannot create {}: {source}", path.display())]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Store lock poisoned")]
    Poisoned,
}

// ── HistoryRecord ────────────────────────────────────────────────────

/// A history row: the sample plus its store-assigned ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    #[serde(flatten)]
    pub sample: MetricsSample,
    pub recorded_at: DateTime<Utc>,
}

// ── Store ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

enum Db {
    Uninit,
    Open {
        conn: Connection,
        /// Last `recorded_at` handed out, in microseconds, seeded from the
        /// table on open. Keeps ingestion time strictly increasing even if
        /// the wall clock steps back.
        last_recorded: i64,
    },
    Closed,
}

pub struct Store {
    location: Location,
    history_cap: usize,
    db: Mutex<Db>,
    trim_lock: Mutex<()>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("location", &self.location)
            .field("history_cap", &self.history_cap)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Store at `path`. Nothing touches disk until the first operation.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(Location::File(path.into()))
    }

    /// Private in-memory store (tests, `--no-cache` runs).
    pub fn in_memory() -> Self {
        Self::new(Location::Memory)
    }

    fn new(location: Location) -> Self {
        Self {
            location,
            history_cap: DEFAULT_HISTORY_CAP,
            db: Mutex::new(Db::Uninit),
            trim_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(p) => Some(p),
            Location::Memory => None,
        }
    }

    // ── Latest snapshot ──────────────────────────────────────────────

    /// Upsert the singleton latest-metrics row.
    pub fn save_latest(&self, sample: &MetricsSample) -> Result<(), StoreError> {
        self.with_conn(|conn, _| {
            conn.execute(
                "INSERT INTO latest_metrics (id, temperature, humidity, power, timestamp, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    temperature = excluded.temperature,
                    humidity    = excluded.humidity,
                    power       = excluded.power,
                    timestamp   = excluded.timestamp,
                    updated_at  = excluded.updated_at",
                params![
                    sample.temperature,
                    sample.humidity,
                    sample.power,
                    sample.timestamp,
                    Utc::now().timestamp()
                ],
            )?;
            Ok(())
        })
    }

    pub fn load_latest(&self) -> Result<Option<MetricsSample>, StoreError> {
        self.with_conn(|conn, _| {
            let sample = conn
                .query_row(
                    "SELECT temperature, humidity, power, timestamp FROM latest_metrics WHERE id = 1",
                    [],
                    sample_from_row,
                )
                .optional()?;
            Ok(sample)
        })
    }

    // ── Devices ──────────────────────────────────────────────────────

    /// Replace the whole device table with `devices`.
    pub fn save_devices(&self, devices: &[DeviceState]) -> Result<(), StoreError> {
        self.with_conn(|conn, _| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM devices", [])?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR REPLACE INTO devices (id, name, is_on, last_seen)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for device in devices {
                    stmt.execute(params![device.id, device.name, device.is_on, device.last_seen])?;
                }
            }
            tx.commit()?;
            debug!(count = devices.len(), "device cache replaced");
            Ok(())
        })
    }

    pub fn load_devices(&self) -> Result<Vec<DeviceState>, StoreError> {
        self.with_conn(|conn, _| {
            let mut stmt =
                conn.prepare_cached("SELECT id, name, is_on, last_seen FROM devices ORDER BY id")?;
            let rows = stmt.query_map([], |row| {
                Ok(DeviceState {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    is_on: row.get(2)?,
                    last_seen: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn clear_devices(&self) -> Result<(), StoreError> {
        self.with_conn(|conn, _| {
            conn.execute("DELETE FROM devices", [])?;
            Ok(())
        })
    }

    // ── History ──────────────────────────────────────────────────────

    /// Append a sample to the history log and schedule a trim.
    ///
    /// Inside a tokio runtime the trim runs on the blocking pool and this
    /// returns right after the insert; outside one it runs inline.
    pub fn append_history(self: &Arc<Self>, sample: &MetricsSample) -> Result<(), StoreError> {
        self.insert_history(sample)?;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(self);
                handle.spawn_blocking(move || store.trim_logged());
            }
            Err(_) => self.trim_logged(),
        }
        Ok(())
    }

    fn insert_history(&self, sample: &MetricsSample) -> Result<(), StoreError> {
        self.with_conn(|conn, last_recorded| {
            let now = Utc::now().timestamp_micros();
            let recorded_at = now.max(last_recorded.saturating_add(1));
            conn.execute(
                "INSERT INTO metrics_history (temperature, humidity, power, timestamp, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    sample.temperature,
                    sample.humidity,
                    sample.power,
                    sample.timestamp,
                    recorded_at
                ],
            )?;
            *last_recorded = recorded_at;
            Ok(())
        })
    }

    fn trim_logged(&self) {
        match self.trim_history() {
            Ok(0) => {}
            Ok(deleted) => debug!(deleted, "history trimmed"),
            Err(StoreError::Closed) => {}
            Err(e) => warn!(error = %e, "history trim failed"),
        }
    }

    /// Delete the oldest rows beyond the cap. Returns how many were removed.
    pub fn trim_history(&self) -> Result<usize, StoreError> {
        let _trim = self.trim_lock.lock().map_err(|_| StoreError::Poisoned)?;
        let cap = i64::try_from(self.history_cap).unwrap_or(i64::MAX);

        self.with_conn(|conn, _| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM metrics_history", [], |r| r.get(0))?;
            if count <= cap {
                return Ok(0);
            }

            let excess = count - cap;
            let deleted = conn.execute(
                "DELETE FROM metrics_history WHERE id IN (
                    SELECT id FROM metrics_history
                    ORDER BY recorded_at ASC, id ASC
                    LIMIT ?1
                 )",
                [excess],
            )?;
            Ok(deleted)
        })
    }

    /// The newest `max_count` samples, oldest first.
    pub fn load_history(&self, max_count: usize) -> Result<Vec<MetricsSample>, StoreError> {
        Ok(self
            .load_history_records(max_count)?
            .into_iter()
            .map(|r| r.sample)
            .collect())
    }

    /// The newest `max_count` history rows with their ingestion times,
    /// oldest first.
    pub fn load_history_records(&self, max_count: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let limit = i64::try_from(max_count).unwrap_or(i64::MAX);

        self.with_conn(|conn, _| {
            let mut stmt = conn.prepare_cached(
                "SELECT temperature, humidity, power, timestamp, recorded_at
                 FROM metrics_history
                 ORDER BY recorded_at DESC, id DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                let micros: i64 = row.get(4)?;
                Ok(HistoryRecord {
                    sample: sample_from_row(row)?,
                    recorded_at: DateTime::from_timestamp_micros(micros).unwrap_or_default(),
                })
            })?;

            let mut records = rows.collect::<Result<Vec<_>, _>>()?;
            records.reverse();
            Ok(records)
        })
    }

    pub fn history_len(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn, _| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM metrics_history", [], |r| r.get(0))?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }

    pub fn clear_history(&self) -> Result<(), StoreError> {
        self.with_conn(|conn, _| {
            conn.execute("DELETE FROM metrics_history", [])?;
            Ok(())
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Close the connection. Every later operation fails with
    /// [`StoreError::Closed`].
    pub fn close(&self) {
        let Ok(mut db) = self.db.lock() else {
            return;
        };
        if let Db::Open { conn, .. } = std::mem::replace(&mut *db, Db::Closed) {
            if let Err((_, e)) = conn.close() {
                warn!(error = %e, "error closing store");
            }
            info!("store closed");
        }
    }

    /// Run `f` with the open connection, initializing it on first use.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection, &mut i64) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut db = self.db.lock().map_err(|_| StoreError::Poisoned)?;
        if matches!(*db, Db::Uninit) {
            let (conn, last_recorded) = self.initialize()?;
            *db = Db::Open {
                conn,
                last_recorded,
            };
        }

        let Db::Open {
            conn,
            last_recorded,
        } = &mut *db
        else {
            return Err(StoreError::Closed);
        };
        f(conn, last_recorded)
    }

    /// Open the connection and create the schema. Also returns the newest
    /// `recorded_at` already on disk.
    fn initialize(&self) -> Result<(Connection, i64), StoreError> {
        let conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|source| {
                        StoreError::CreateDirectory {
                            path: parent.to_path_buf(),
                            source,
                        }
                    })?;
                }
                info!(path = %path.display(), "opening store");
                let conn = Connection::open(path)?;
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;",
                )?;
                conn
            }
            Location::Memory => Connection::open_in_memory()?,
        };

        conn.execute_batch(SCHEMA)?;
        let last_recorded: i64 = conn.query_row(
            "SELECT COALESCE(MAX(recorded_at), 0) FROM metrics_history",
            [],
            |row| row.get(0),
        )?;
        Ok((conn, last_recorded))
    }
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<MetricsSample> {
    Ok(MetricsSample {
        temperature: row.get(0)?,
        humidity: row.get(1)?,
        power: row.get(2)?,
        timestamp: row.get(3)?,
    })
}

// ── Tests ────────────────────────────────────────────────────────────
