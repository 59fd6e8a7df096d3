//! SQLite-backed target config store — survives restarts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{BurstError, Result};
use crate::traits::ConfigStore;
use crate::types::TargetConfig;

/// SQLite-backed persistence for target configuration.
///
/// Each row keeps the serialized `TargetConfig` plus a separate `running`
/// column so the running flag can be flipped without rewriting the config.
pub struct SqliteConfigStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteConfigStore {
    /// Open or create the target database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(rusqlite::Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                config TEXT NOT NULL,           -- JSON TargetConfig
                running INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| BurstError::Store("database lock poisoned".into()))
    }

    fn decode(config_json: &str, running: i32) -> Result<TargetConfig> {
        let mut config: TargetConfig = serde_json::from_str(config_json)?;
        config.running = running != 0;
        Ok(config)
    }

    /// Clear every running flag, returning how many rows changed.
    pub fn reset_running(&self) -> Result<usize> {
        let changed = self
            .conn()?
            .execute("UPDATE targets SET running = 0 WHERE running != 0", [])?;
        Ok(changed)
    }
}

impl ConfigStore for SqliteConfigStore {
    fn get(&self, id: &str) -> Result<Option<TargetConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT config, running FROM targets WHERE id = ?1")?;
        let mut rows = stmt.query(rusqlite::params![id])?;
        match rows.next()? {
            Some(row) => {
                let config: String = row.get(0)?;
                let running: i32 = row.get(1)?;
                Ok(Some(Self::decode(&config, running)?))
            }
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<HashMap<String, TargetConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, config, running FROM targets ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i32>(2)?,
            ))
        })?;

        let mut targets = HashMap::new();
        for row in rows {
            let (id, config, running) = row?;
            match Self::decode(&config, running) {
                Ok(cfg) => {
                    targets.insert(id, cfg);
                }
                Err(e) => tracing::warn!("⚠️ Skipping unreadable target '{id}': {e}"),
            }
        }
        Ok(targets)
    }

    fn upsert(&self, id: &str, config: &TargetConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO targets (id, name, config, running, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id,
                config.name,
                json,
                config.running as i32,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        tracing::debug!("💾 Saved target '{}' ({})", config.name, id);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let changed = self
            .conn()?
            .execute("DELETE FROM targets WHERE id = ?1", rusqlite::params![id])?;
        if changed == 0 {
            return Err(BurstError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn set_running(&self, id: &str, running: bool) -> Result<()> {
        let changed = self.conn()?.execute(
            "UPDATE targets SET running = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![running as i32, chrono::Utc::now().to_rfc3339(), id],
        )?;
        if changed == 0 {
            return Err(BurstError::NotFound(id.to_string()));
        }
        Ok(())
    }
}
