//! SQLite Storage Backend
//!
//! Persistent storage for records, the node clock, the generation and the
//! last issued counter, in a single `slate.db` under the data directory.
//!
//! SQLite integers are signed, so counters are checked on the way in and
//! out rather than cast.

use std::path::PathBuf;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;

use super::{Record, StorageBackend};
use crate::clock::VectorClock;
use crate::error::{Error, Result};
use crate::id::{Counter, NodeId, VersionId};

/// Values at least this large are LZ4-compressed when compression is on
const COMPRESSION_THRESHOLD: usize = 256;

/// Persistent storage backed by SQLite
pub struct SqliteBackend {
    /// Database connection
    conn: Mutex<Connection>,
    /// Compress large values
    compression: bool,
}

impl SqliteBackend {
    /// Create or open the database in `data_dir`
    pub fn new(data_dir: PathBuf, compression: bool) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)?;

        let db_path = data_dir.join("slate.db");
        let conn = Connection::open(&db_path)?;
        tracing::debug!("Opened SQLite store at {:?}", db_path);

        Self::with_connection(conn, compression)
    }

    /// Volatile SQLite database (tests)
    pub fn in_memory(compression: bool) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, compression)
    }

    fn with_connection(conn: Connection, compression: bool) -> Result<Self> {
        // Initialize schema
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS node_state (
                key TEXT PRIMARY KEY,
                value_int INTEGER,
                value_text TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                compressed INTEGER NOT NULL DEFAULT 0,
                origin TEXT NOT NULL,
                counter INTEGER NOT NULL,
                clock TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_records_timestamp
                ON records(timestamp_ms);

            CREATE TABLE IF NOT EXISTS node_clock (
                origin TEXT PRIMARY KEY,
                counter INTEGER NOT NULL
            );
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            compression,
        })
    }

    fn load_state(conn: &Connection, key: &str) -> Result<u64> {
        let value: Option<i64> = conn
            .query_row(
                "SELECT value_int FROM node_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Storage(format!("Failed to get {}: {}", key, e)))?;

        value.map_or(Ok(0), |v| from_sql_int(key, v))
    }

    fn save_state(conn: &Connection, key: &str, value: u64) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO node_state (key, value_int) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_int = ?2, updated_at = CURRENT_TIMESTAMP
            "#,
            params![key, to_sql_int(key, value)?],
        )?;
        Ok(())
    }

    fn encode_value(&self, value: &[u8]) -> (Vec<u8>, bool) {
        if self.compression && value.len() >= COMPRESSION_THRESHOLD {
            (lz4_flex::compress_prepend_size(value), true)
        } else {
            (value.to_vec(), false)
        }
    }
}

fn to_sql_int(what: &str, value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| Error::Storage(format!("{} {} does not fit a SQLite integer", what, value)))
}

fn from_sql_int(what: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| Error::Storage(format!("Negative {} {} in database", what, value)))
}

/// Raw columns of a `records` row
struct RecordRow {
    key: String,
    value: Vec<u8>,
    compressed: bool,
    origin: String,
    counter: i64,
    clock: String,
    timestamp_ms: i64,
}

const RECORD_COLUMNS: &str = "key, value, compressed, origin, counter, clock, timestamp_ms";

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            compressed: row.get(2)?,
            origin: row.get(3)?,
            counter: row.get(4)?,
            clock: row.get(5)?,
            timestamp_ms: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<Record> {
        let value = if self.compressed {
            lz4_flex::decompress_size_prepended(&self.value).map_err(|e| {
                Error::Storage(format!("Failed to decompress value of {}: {}", self.key, e))
            })?
        } else {
            self.value
        };

        let clock: VectorClock = serde_json::from_str(&self.clock)?;
        let timestamp = Utc
            .timestamp_millis_opt(self.timestamp_ms)
            .single()
            .ok_or_else(|| {
                Error::Storage(format!("Invalid timestamp {} for {}", self.timestamp_ms, self.key))
            })?;

        Ok(Record {
            key: self.key,
            value,
            version: VersionId::new(NodeId::new(self.origin), from_sql_int("counter", self.counter)?),
            clock,
            timestamp,
        })
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn load_record(&self, key: &str) -> Result<Option<Record>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM records WHERE key = ?1", RECORD_COLUMNS),
                params![key],
                RecordRow::from_row,
            )
            .optional()?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn save_record(&self, record: &Record) -> Result<()> {
        let (value, compressed) = self.encode_value(&record.value);
        let clock = serde_json::to_string(&record.clock)?;
        let counter = to_sql_int("counter", record.version.counter)?;

        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO records (key, value, compressed, origin, counter, clock, timestamp_ms)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                compressed = excluded.compressed,
                origin = excluded.origin,
                counter = excluded.counter,
                clock = excluded.clock,
                timestamp_ms = excluded.timestamp_ms
            "#,
            params![
                record.key,
                value,
                compressed,
                record.version.node.as_str(),
                counter,
                clock,
                record.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    async fn all_records(&self) -> Result<Vec<Record>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM records", RECORD_COLUMNS))?;
        let rows = stmt.query_map([], RecordRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    async fn recent_records(&self, limit: usize) -> Result<Vec<Record>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM records ORDER BY timestamp_ms DESC, origin DESC, counter DESC LIMIT ?1",
            RECORD_COLUMNS
        ))?;
        let rows = stmt.query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], RecordRow::from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    async fn load_node_clock(&self) -> Result<VectorClock> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT origin, counter FROM node_clock")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut clock = VectorClock::new();
        for row in rows {
            let (origin, counter) = row?;
            clock.observe(&NodeId::new(origin), from_sql_int("clock entry", counter)?);
        }
        Ok(clock)
    }

    async fn save_node_clock(&self, clock: &VectorClock) -> Result<()> {
        let entries = clock
            .iter()
            .map(|(origin, counter)| Ok((origin.as_str(), to_sql_int("clock entry", *counter)?)))
            .collect::<Result<Vec<_>>>()?;

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for (origin, counter) in entries {
            tx.execute(
                r#"
                INSERT INTO node_clock (origin, counter) VALUES (?1, ?2)
                ON CONFLICT(origin) DO UPDATE SET counter = MAX(counter, excluded.counter)
                "#,
                params![origin, counter],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn load_counter(&self) -> Result<Counter> {
        let conn = self.conn.lock().await;
        Self::load_state(&conn, "last_counter")
    }

    async fn save_counter(&self, counter: Counter) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::save_state(&conn, "last_counter", counter)
    }

    async fn load_generation(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        Self::load_state(&conn, "generation")
    }

    async fn save_generation(&self, generation: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::save_state(&conn, "generation", generation)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(format!("SQLite error: {}", e))
    }
}
