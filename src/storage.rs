use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};

use crate::now_s;

/// Persisted shape of one speeding violation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub plate_number: String,
    pub speed: f64,
    pub speed_limit: f64,
    pub exceed_speed: f64,
    pub location: String,
    /// Seconds into the stream at which the violation was observed.
    pub timestamp: f64,
}

/// Persistence collaborator. Returns the identifier assigned by the store.
pub trait ViolationSink: Send {
    fn save(&mut self, record: &ViolationRecord) -> Result<i64>;
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub struct SqliteViolationStore {
    conn: Connection,
}

impl SqliteViolationStore {
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !db_path.starts_with("file:") && !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow!("failed to create database directory {}: {}", parent.display(), e)
                })?;
            }
        }
        let conn = open_db_connection(db_path)?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS violations (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              plate_number TEXT NOT NULL,
              speed REAL NOT NULL,
              speed_limit REAL NOT NULL,
              exceed_speed REAL NOT NULL,
              location TEXT NOT NULL,
              timestamp REAL NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_violations_created ON violations(created_at);
            "#,
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM violations", [], |row| row.get(0))?;
        Ok(n as usize)
    }
}

impl ViolationSink for SqliteViolationStore {
    fn save(&mut self, record: &ViolationRecord) -> Result<i64> {
        if record.plate_number.trim().is_empty() {
            return Err(anyhow!("refusing to persist a violation without a plate"));
        }
        let created_at = i64::try_from(now_s()?)
            .map_err(|_| anyhow!("current time exceeds i64 range"))?;
        self.conn.execute(
            r#"
            INSERT INTO violations(plate_number, speed, speed_limit, exceed_speed, location, timestamp, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.plate_number,
                record.speed,
                record.speed_limit,
                record.exceed_speed,
                record.location,
                record.timestamp,
                created_at
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StoredViolation {
    pub id: i64,
    pub created_at: u64,
    pub record: ViolationRecord,
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryViolationStore {
    rows: Vec<StoredViolation>,
}

impl InMemoryViolationStore {
    pub fn records(&self) -> &[StoredViolation] {
        &self.rows
    }
}

impl ViolationSink for InMemoryViolationStore {
    fn save(&mut self, record: &ViolationRecord) -> Result<i64> {
        if record.plate_number.trim().is_empty() {
            return Err(anyhow!("refusing to persist a violation without a plate"));
        }
        let id = self.rows.last().map_or(1, |row| row.id + 1);
        self.rows.push(StoredViolation {
            id,
            created_at: now_s()?,
            record: record.clone(),
        });
        Ok(id)
    }
}
