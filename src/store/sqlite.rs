//! SQLite implementation of `ExposureStore`

use super::{ExposureStore, StateKey, StoredExposure, TokenRecord};
use crate::error::StoreError;
use crate::risk::types::ExposureRecord;
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::{Arc, Mutex, MutexGuard};

/// Idempotent schema, executed on every open
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS exposures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_timestamp_ms INTEGER NOT NULL,
    days_since_last_exposure INTEGER NOT NULL,
    matched_key_count INTEGER NOT NULL,
    maximum_risk_score INTEGER NOT NULL,
    summation_risk_score INTEGER NOT NULL,
    attenuation_durations TEXT NOT NULL,
    exposure_contact_date INTEGER NOT NULL,
    window_data TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_exposures_contact_date
    ON exposures (exposure_contact_date DESC);

CREATE TABLE IF NOT EXISTS tokens (
    token TEXT PRIMARY KEY,
    created_timestamp_ms INTEGER NOT NULL,
    responded INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS run_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const EXPOSURE_COLUMNS: &str = "id, created_timestamp_ms, days_since_last_exposure, \
     matched_key_count, maximum_risk_score, summation_risk_score, \
     attenuation_durations, exposure_contact_date, window_data";

pub struct SqliteExposureStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExposureStore {
    /// Open (or create) a database file and apply the schema
    ///
    /// Arguments:
    /// - `db_path`: Path to the SQLite database file
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        log::info!("📊 Opened exposure store at {} (WAL)", db_path);

        Self::with_connection(conn)
    }

    /// In-memory store, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn row_to_exposure(row: &Row) -> rusqlite::Result<StoredExposure> {
    Ok(StoredExposure {
        id: row.get(0)?,
        record: ExposureRecord {
            created_timestamp_ms: row.get(1)?,
            days_since_last_exposure: row.get(2)?,
            matched_key_count: row.get(3)?,
            maximum_risk_score: row.get(4)?,
            summation_risk_score: row.get(5)?,
            attenuation_durations: row.get(6)?,
            exposure_contact_date: row.get(7)?,
            window_data: row.get(8)?,
        },
    })
}

fn row_to_token(row: &Row) -> rusqlite::Result<TokenRecord> {
    Ok(TokenRecord {
        token: row.get(0)?,
        created_timestamp_ms: row.get(1)?,
        responded: row.get::<_, i64>(2)? != 0,
    })
}

#[async_trait]
impl ExposureStore for SqliteExposureStore {
    async fn insert_exposure(&self, record: &ExposureRecord) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO exposures (
                created_timestamp_ms, days_since_last_exposure, matched_key_count,
                maximum_risk_score, summation_risk_score, attenuation_durations,
                exposure_contact_date, window_data
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.created_timestamp_ms,
                record.days_since_last_exposure,
                record.matched_key_count,
                record.maximum_risk_score,
                record.summation_risk_score,
                record.attenuation_durations,
                record.exposure_contact_date,
                record.window_data,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    async fn most_recent_exposure(&self) -> Result<Option<StoredExposure>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM exposures ORDER BY exposure_contact_date DESC, id DESC LIMIT 1",
            EXPOSURE_COLUMNS
        );
        let exposure = conn.query_row(&sql, [], row_to_exposure).optional()?;
        Ok(exposure)
    }

    async fn list_exposures(&self) -> Result<Vec<StoredExposure>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM exposures ORDER BY exposure_contact_date DESC, id DESC",
            EXPOSURE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], row_to_exposure)?;

        let mut exposures = Vec::new();
        for row in rows {
            exposures.push(row?);
        }
        Ok(exposures)
    }

    async fn delete_exposures_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM exposures WHERE created_timestamp_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    async fn upsert_token(&self, token: &TokenRecord) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO tokens (token, created_timestamp_ms, responded)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(token) DO UPDATE SET
                created_timestamp_ms = excluded.created_timestamp_ms,
                responded = excluded.responded",
            params![token.token, token.created_timestamp_ms, token.responded as i64],
        )?;
        Ok(())
    }

    async fn get_token(&self, token: &str) -> Result<Option<TokenRecord>, StoreError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT token, created_timestamp_ms, responded FROM tokens WHERE token = ?1",
                params![token],
                row_to_token,
            )
            .optional()?;
        Ok(record)
    }

    async fn mark_token_responded(&self, token: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tokens SET responded = 1 WHERE token = ?1",
            params![token],
        )?;
        Ok(())
    }

    async fn delete_token(&self, token: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM tokens WHERE token = ?1", params![token])?;
        Ok(())
    }

    async fn delete_tokens_before(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM tokens WHERE created_timestamp_ms < ?1",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    async fn get_state(&self, key: StateKey) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM run_state WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set_state(&self, key: StateKey, value: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO run_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key.as_str(), value],
        )?;
        Ok(())
    }

    async fn remove_state(&self, key: StateKey) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM run_state WHERE key = ?1", params![key.as_str()])?;
        Ok(())
    }
}
