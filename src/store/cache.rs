//! Write-once cache of per-batch feedback keyed by (persona, batch id).

use std::path::Path;

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

pub struct BatchCache {
    conn: Mutex<Connection>,
}

impl BatchCache {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS batch_feedback (
                persona TEXT NOT NULL,
                batch_id TEXT NOT NULL,
                feedback TEXT NOT NULL,
                created TEXT NOT NULL,
                PRIMARY KEY (persona, batch_id)
            );
        ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Previously stored feedback. Lookup failures count as a miss.
    pub async fn get(&self, persona: &str, batch_id: &str) -> Option<Value> {
        let conn = self.conn.lock().await;
        let row: rusqlite::Result<Option<String>> = conn
            .query_row(
                "SELECT feedback FROM batch_feedback WHERE persona = ?1 AND batch_id = ?2",
                rusqlite::params![persona, batch_id],
                |row| row.get(0),
            )
            .optional();
        match row {
            Ok(Some(text)) => match serde_json::from_str(&text) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(persona, batch_id, error = %e, "corrupt cache entry ignored");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(persona, batch_id, error = %e, "cache lookup failed");
                None
            }
        }
    }

    /// Store feedback unless an entry already exists. Returns whether a row
    /// was written.
    pub async fn put(&self, persona: &str, batch_id: &str, feedback: &Value) -> bool {
        let conn = self.conn.lock().await;
        let result = conn.execute(
            "INSERT OR IGNORE INTO batch_feedback (persona, batch_id, feedback, created) \
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                persona,
                batch_id,
                feedback.to_string(),
                chrono::Utc::now().to_rfc3339(),
            ],
        );
        match result {
            Ok(rows) => rows > 0,
            Err(e) => {
                tracing::warn!(persona, batch_id, error = %e, "cache insert failed");
                false
            }
        }
    }
}
