//! SQLite-backed [`ObjectStore`].
//!
//! Every record lives in one `objects` table keyed by a random UUID, tagged
//! with its kind and stored as JSON text. Insertion order (rowid) defines
//! "newest first".

use facetrack_core::{ObjectStore, StoreError, StoredObject};
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = r#"
PRAGMA journal_mode=WAL;

CREATE TABLE IF NOT EXISTS objects (
  id         TEXT PRIMARY KEY,
  kind       TEXT NOT NULL,
  data       TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_objects_kind ON objects(kind);
"#;

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("create database directory: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SqliteStoreError> for StoreError {
    fn from(e: SqliteStoreError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn backend(e: tokio_rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self, SqliteStoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).await?;
        let store = Self::with_connection(conn).await?;
        tracing::info!(path = %path.display(), "opened face store");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, SqliteStoreError> {
        Self::with_connection(Connection::open_in_memory().await?).await
    }

    async fn with_connection(conn: Connection) -> Result<Self, SqliteStoreError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn count(&self, kind: &str) -> Result<usize, StoreError> {
        let kind = kind.to_string();
        self.conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM objects WHERE kind = ?1",
                    params![kind],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            })
            .await
            .map_err(backend)
    }
}

impl ObjectStore for SqliteStore {
    async fn create(&self, kind: &str, record: serde_json::Value) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let data = serde_json::to_string(&record)?;
        let created_at = chrono::Utc::now().to_rfc3339();
        let kind = kind.to_string();

        let row_id = id.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO objects (id, kind, data, created_at) VALUES (?1, ?2, ?3, ?4)",
                    params![row_id, kind, data, created_at],
                )?;
                Ok(())
            })
            .await
            .map_err(backend)?;

        tracing::debug!(id = %id, "object created");
        Ok(id)
    }

    async fn list(
        &self,
        kind: &str,
        limit: usize,
        newest_first: bool,
    ) -> Result<Vec<StoredObject>, StoreError> {
        let kind = kind.to_string();
        let sql = if newest_first {
            "SELECT id, data, created_at FROM objects WHERE kind = ?1 ORDER BY rowid DESC LIMIT ?2"
        } else {
            "SELECT id, data, created_at FROM objects WHERE kind = ?1 ORDER BY rowid ASC LIMIT ?2"
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows: Vec<(String, String, String)> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let rows = stmt
                    .query_map(params![kind, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
            .map_err(backend)?;

        let mut objects = Vec::with_capacity(rows.len());
        for (id, data, created_at) in rows {
            match serde_json::from_str(&data) {
                Ok(record) => objects.push(StoredObject {
                    id,
                    record,
                    created_at: Some(created_at),
                }),
                Err(e) => tracing::warn!(id = %id, error = %e, "skipping corrupt record"),
            }
        }
        Ok(objects)
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<(), StoreError> {
        let (kind, id) = (kind.to_string(), id.to_string());
        let (k, i) = (kind.clone(), id.clone());
        let found = self
            .conn
            .call(move |conn| {
                let hit: Option<i64> = conn
                    .query_row(
                        "DELETE FROM objects WHERE kind = ?1 AND id = ?2 RETURNING rowid",
                        params![k, i],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(hit.is_some())
            })
            .await
            .map_err(backend)?;

        if !found {
            return Err(StoreError::NotFound { kind, id });
        }
        tracing::debug!(id = %id, "object deleted");
        Ok(())
    }
}
