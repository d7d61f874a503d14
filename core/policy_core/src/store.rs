//! Settings persistence.
//!
//! The aggregate lives as one JSON blob in SQLite. Writes larger than the
//! primary quota, or writes the primary rejects, go to a JSON fallback file
//! next to the database instead.

use crate::error::{PolicyError, Result};
use crate::model::Settings;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{error, warn};

/// Size cap for the primary backend, in bytes of serialized JSON.
pub const PRIMARY_QUOTA_BYTES: usize = 102_400;

pub trait SettingsStore {
    /// Fully defaulted aggregate. Never fails: read errors fall back to the
    /// secondary backend and then to defaults.
    fn load(&mut self) -> Settings;

    fn save(&mut self, settings: &Settings) -> Result<()>;
}

pub struct SqliteSettingsStore {
    conn: Connection,
    fallback: Option<PathBuf>,
    quota_bytes: usize,
}

impl SqliteSettingsStore {
    /// Opens the database at `path`; the fallback file sits beside it.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn, Some(path.with_extension("settings.json")))
    }

    pub fn in_memory(fallback: Option<PathBuf>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, fallback)
    }

    fn with_connection(conn: Connection, fallback: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(
            r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS app_settings (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  settings_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
"#,
        )?;
        Ok(Self {
            conn,
            fallback,
            quota_bytes: PRIMARY_QUOTA_BYTES,
        })
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    fn load_primary(&mut self) -> rusqlite::Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT settings_json FROM app_settings WHERE id = 1")?;
        match stmt.query_row([], |row| row.get::<_, String>(0)) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn upsert_primary(&mut self, json: &str, updated_at: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            r#"
INSERT INTO app_settings (id, settings_json, updated_at)
VALUES (1, ?1, ?2)
ON CONFLICT(id) DO UPDATE SET
  settings_json=excluded.settings_json,
  updated_at=excluded.updated_at
"#,
            (json, updated_at),
        )?;
        Ok(())
    }

    fn write_fallback(&mut self, json: &str) -> Result<()> {
        let Some(path) = self.fallback.as_ref() else {
            return Err(PolicyError::Storage(
                "primary write failed and no fallback is configured".to_string(),
            ));
        };
        fs::write(path, json).map_err(|e| PolicyError::Storage(e.to_string()))?;
        // The primary row would otherwise shadow the fresher fallback copy.
        if let Err(err) = self.conn.execute("DELETE FROM app_settings WHERE id = 1", []) {
            warn!("could not clear stale primary settings: {err}");
        }
        Ok(())
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn load(&mut self) -> Settings {
        match self.load_primary() {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(settings) => return settings,
                Err(err) => error!("primary settings unreadable, trying fallback: {err}"),
            },
            Ok(None) => {}
            Err(err) => error!("load_primary failed: {err}"),
        }

        if let Some(path) = self.fallback.as_ref().filter(|p| p.exists()) {
            match fs::read_to_string(path).map(|json| serde_json::from_str::<Settings>(&json)) {
                Ok(Ok(settings)) => return settings,
                Ok(Err(err)) => error!("fallback settings unreadable: {err}"),
                Err(err) => error!("reading {} failed: {err}", path.display()),
            }
        }

        Settings::default()
    }

    fn save(&mut self, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        if json.len() > self.quota_bytes {
            warn!(
                "settings are {} bytes, over the {} byte quota; writing fallback",
                json.len(),
                self.quota_bytes
            );
            return self.write_fallback(&json);
        }

        let updated_at = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        if let Err(err) = self.upsert_primary(&json, &updated_at) {
            warn!("upsert_primary failed, writing fallback: {err}");
            return self.write_fallback(&json);
        }
        Ok(())
    }
}
