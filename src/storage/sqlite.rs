use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::models::{
    ActionType, CollectionAddress, ManualTask, ManualTaskConfig, ManualTaskField, ManualTaskStatus,
    PrivacyRequest, RequestStatus, RequestTask, TaskStatus,
};

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS privacy_requests (
    id TEXT PRIMARY KEY,
    policy_json TEXT NOT NULL,
    identity_json TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS request_tasks (
    id TEXT PRIMARY KEY,
    request_id TEXT NOT NULL,
    collection_address TEXT NOT NULL,
    dataset_name TEXT NOT NULL,
    collection_name TEXT NOT NULL,
    action_type TEXT NOT NULL,
    position INTEGER NOT NULL,
    collection_schema_json TEXT NOT NULL,
    traversal_details_json TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    result_json TEXT,
    rows_masked INTEGER,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (request_id) REFERENCES privacy_requests(id) ON DELETE CASCADE,
    UNIQUE(request_id, collection_address, action_type)
);

CREATE INDEX IF NOT EXISTS idx_request_tasks_request
    ON request_tasks(request_id, action_type, position);

CREATE TABLE IF NOT EXISTS manual_task_configs (
    collection_address TEXT PRIMARY KEY,
    fields_json TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS manual_tasks (
    id TEXT PRIMARY KEY,
    request_id TEXT NOT NULL,
    collection_address TEXT NOT NULL,
    action_type TEXT NOT NULL,
    status TEXT NOT NULL,
    submissions_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(request_id, collection_address, action_type)
);

CREATE TABLE IF NOT EXISTS request_execution_locks (
    request_id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    acquired_at TEXT NOT NULL
);
"#;

const TASK_COLUMNS: &str = "id, request_id, collection_address, action_type, collection_schema_json, \
     traversal_details_json, status, attempts, result_json, rows_masked, error_message, created_at, updated_at";

/// SQLite store for privacy requests, their checkpointed tasks and manual tasks
/// Uses tokio::Mutex for async-friendly locking
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the store at `db_path`
    pub async fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        // Handle SQLite URL format (sqlite:./path or sqlite://path)
        let path_str = db_path.as_ref().to_string_lossy();
        let clean_path = path_str.trim_start_matches("sqlite:").trim_start_matches("//");

        let conn = Connection::open(clean_path)?;
        Self::from_connection(conn).await
    }

    /// Private in-memory store, for tests and the in-memory execution mode
    pub async fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let storage = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables if they do not exist
    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(())
    }

    // ---- privacy requests ----

    pub async fn save_request(&self, request: &PrivacyRequest) -> Result<()> {
        let policy_json = serde_json::to_string(&request.policy)?;
        let identity_json = serde_json::to_string(&request.identity)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO privacy_requests
            (id, policy_json, identity_json, status, created_at, updated_at, finished_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            rusqlite::params![
                request.id,
                policy_json,
                identity_json,
                request.status.as_str(),
                request.created_at.to_rfc3339(),
                request.updated_at.to_rfc3339(),
                request.finished_at.map(|d| d.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn get_request(&self, id: &str) -> Result<Option<PrivacyRequest>> {
        let conn = self.conn.lock().await;
        let request = conn
            .query_row(
                "SELECT id, policy_json, identity_json, status, created_at, updated_at, finished_at FROM privacy_requests WHERE id = ?1",
                rusqlite::params![id],
                |row| {
                    Ok(PrivacyRequest {
                        id: row.get(0)?,
                        policy: json_col(row, 1)?,
                        identity: json_col(row, 2)?,
                        status: enum_col(row, 3, RequestStatus::parse)?,
                        created_at: time_col(row, 4)?,
                        updated_at: time_col(row, 5)?,
                        finished_at: optional_time_col(row, 6)?,
                    })
                },
            )
            .optional()?;
        Ok(request)
    }

    /// Update the status; terminal statuses also stamp `finished_at`
    pub async fn update_request_status(&self, id: &str, status: RequestStatus) -> Result<()> {
        self.write_status(id, status, false).await.map(|_| ())
    }

    /// Like `update_request_status`, but never overwrites a cancellation.
    ///
    /// Returns `false` when the stored request is already canceled.
    pub async fn update_request_status_unless_canceled(&self, id: &str, status: RequestStatus) -> Result<bool> {
        self.write_status(id, status, true).await
    }

    async fn write_status(&self, id: &str, status: RequestStatus, keep_canceled: bool) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let finished = matches!(
            status,
            RequestStatus::Complete | RequestStatus::Partial | RequestStatus::Error | RequestStatus::Canceled
        );
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE privacy_requests SET status = ?2, updated_at = ?3, finished_at = CASE WHEN ?4 THEN ?3 ELSE NULL END \
             WHERE id = ?1 AND (NOT ?5 OR status != ?6)",
            rusqlite::params![
                id,
                status.as_str(),
                now,
                finished,
                keep_canceled,
                RequestStatus::Canceled.as_str()
            ],
        )?;
        if changed > 0 {
            return Ok(true);
        }
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM privacy_requests WHERE id = ?1)",
            rusqlite::params![id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(EngineError::NotFound(format!("Privacy request {}", id)));
        }
        Ok(false)
    }

    // ---- request tasks ----

    /// Insert all tasks of a plan in one transaction
    pub async fn insert_tasks(&self, tasks: &[RequestTask]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO request_tasks
                (id, request_id, collection_address, dataset_name, collection_name, action_type, position,
                 collection_schema_json, traversal_details_json, status, attempts, result_json, rows_masked,
                 error_message, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                "#,
            )?;
            for task in tasks {
                stmt.execute(rusqlite::params![
                    task.id,
                    task.request_id,
                    task.collection_address.to_string(),
                    task.collection_address.dataset,
                    task.collection_address.collection,
                    task.action_type.as_str(),
                    task.traversal.position as i64,
                    serde_json::to_string(&task.collection)?,
                    serde_json::to_string(&task.traversal)?,
                    task.status.as_str(),
                    task.attempts,
                    task.rows.as_ref().map(serde_json::to_string).transpose()?,
                    task.rows_masked.map(|n| n as i64),
                    task.error_message,
                    task.created_at.to_rfc3339(),
                    task.updated_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Tasks of one request and action, in plan order
    pub async fn get_tasks(&self, request_id: &str, action_type: ActionType) -> Result<Vec<RequestTask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM request_tasks WHERE request_id = ?1 AND action_type = ?2 ORDER BY position",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(rusqlite::params![request_id, action_type.as_str()], task_from_row)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Persist the mutable part of a task
    pub async fn update_task(&self, task: &RequestTask) -> Result<()> {
        let result_json = task.rows.as_ref().map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            r#"
            UPDATE request_tasks
            SET status = ?2, attempts = ?3, result_json = ?4, rows_masked = ?5, error_message = ?6, updated_at = ?7
            WHERE id = ?1
            "#,
            rusqlite::params![
                task.id,
                task.status.as_str(),
                task.attempts,
                result_json,
                task.rows_masked.map(|n| n as i64),
                task.error_message,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(EngineError::NotFound(format!("Request task {}", task.id)));
        }
        Ok(())
    }

    // ---- manual tasks ----

    /// Save the field list for a manual collection, bumping its version
    pub async fn save_manual_task_config(
        &self,
        collection: &CollectionAddress,
        fields: &[ManualTaskField],
    ) -> Result<ManualTaskConfig> {
        let fields_json = serde_json::to_string(fields)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO manual_task_configs (collection_address, fields_json, version, updated_at)
            VALUES (?1, ?2, 1, ?3)
            ON CONFLICT(collection_address) DO UPDATE
            SET fields_json = excluded.fields_json, version = version + 1, updated_at = excluded.updated_at
            "#,
            rusqlite::params![collection.to_string(), fields_json, Utc::now().to_rfc3339()],
        )?;
        let version: u32 = conn.query_row(
            "SELECT version FROM manual_task_configs WHERE collection_address = ?1",
            rusqlite::params![collection.to_string()],
            |row| row.get(0),
        )?;
        Ok(ManualTaskConfig {
            collection: collection.clone(),
            fields: fields.to_vec(),
            version,
        })
    }

    pub async fn get_manual_task_config(&self, collection: &CollectionAddress) -> Result<Option<ManualTaskConfig>> {
        let conn = self.conn.lock().await;
        let config = conn
            .query_row(
                "SELECT fields_json, version FROM manual_task_configs WHERE collection_address = ?1",
                rusqlite::params![collection.to_string()],
                |row| {
                    Ok(ManualTaskConfig {
                        collection: collection.clone(),
                        fields: json_col(row, 0)?,
                        version: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    pub async fn save_manual_task(&self, task: &ManualTask) -> Result<()> {
        let submissions_json = serde_json::to_string(&task.submissions)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT OR REPLACE INTO manual_tasks
            (id, request_id, collection_address, action_type, status, submissions_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            rusqlite::params![
                task.id,
                task.request_id,
                task.collection.to_string(),
                task.action_type.as_str(),
                task.status.as_str(),
                submissions_json,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub async fn find_manual_task(
        &self,
        request_id: &str,
        collection: &CollectionAddress,
        action_type: ActionType,
    ) -> Result<Option<ManualTask>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                "SELECT id, request_id, collection_address, action_type, status, submissions_json, created_at, updated_at \
                 FROM manual_tasks WHERE request_id = ?1 AND collection_address = ?2 AND action_type = ?3",
                rusqlite::params![request_id, collection.to_string(), action_type.as_str()],
                manual_task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    pub async fn get_manual_task(&self, id: &str) -> Result<Option<ManualTask>> {
        let conn = self.conn.lock().await;
        let task = conn
            .query_row(
                "SELECT id, request_id, collection_address, action_type, status, submissions_json, created_at, updated_at \
                 FROM manual_tasks WHERE id = ?1",
                rusqlite::params![id],
                manual_task_from_row,
            )
            .optional()?;
        Ok(task)
    }

    // ---- execution locks ----

    /// Take the single-writer lock for a request.
    ///
    /// Returns `false` if another owner holds it. A lock older than
    /// `stale_after` is assumed to belong to a crashed process and is taken over.
    pub async fn try_acquire_lock(&self, request_id: &str, owner: &str, stale_after: Duration) -> Result<bool> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        let conn = self.conn.lock().await;
        let stale = conn.execute(
            "DELETE FROM request_execution_locks WHERE request_id = ?1 AND acquired_at < ?2",
            rusqlite::params![request_id, cutoff.to_rfc3339()],
        )?;
        if stale > 0 {
            tracing::warn!("Took over stale execution lock for request {}", request_id);
        }
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO request_execution_locks (request_id, owner, acquired_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![request_id, owner, now.to_rfc3339()],
        )?;
        Ok(inserted == 1)
    }

    /// Re-stamp a held lock so it is not mistaken for a crashed owner's.
    ///
    /// Returns `false` when `owner` no longer holds the lock.
    pub async fn refresh_lock(&self, request_id: &str, owner: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let refreshed = conn.execute(
            "UPDATE request_execution_locks SET acquired_at = ?3 WHERE request_id = ?1 AND owner = ?2",
            rusqlite::params![request_id, owner, Utc::now().to_rfc3339()],
        )?;
        Ok(refreshed == 1)
    }

    pub async fn release_lock(&self, request_id: &str, owner: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM request_execution_locks WHERE request_id = ?1 AND owner = ?2",
            rusqlite::params![request_id, owner],
        )?;
        Ok(removed > 0)
    }
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn json_col<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn time_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn optional_time_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => time_col(row, idx).map(Some),
        None => Ok(None),
    }
}

fn enum_col<T>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    parse: impl Fn(&str) -> std::result::Result<T, EngineError>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|e| conversion_error(idx, e))
}

fn address_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<CollectionAddress> {
    enum_col(row, idx, CollectionAddress::parse)
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestTask> {
    let result_json: Option<String> = row.get(8)?;
    let rows = result_json
        .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(8, e)))
        .transpose()?;
    Ok(RequestTask {
        id: row.get(0)?,
        request_id: row.get(1)?,
        collection_address: address_col(row, 2)?,
        action_type: enum_col(row, 3, ActionType::parse)?,
        collection: json_col(row, 4)?,
        traversal: json_col(row, 5)?,
        status: enum_col(row, 6, TaskStatus::parse)?,
        attempts: row.get(7)?,
        rows,
        rows_masked: row.get::<_, Option<i64>>(9)?.map(|n| n as usize),
        error_message: row.get(10)?,
        created_at: time_col(row, 11)?,
        updated_at: time_col(row, 12)?,
    })
}

fn manual_task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManualTask> {
    Ok(ManualTask {
        id: row.get(0)?,
        request_id: row.get(1)?,
        collection: address_col(row, 2)?,
        action_type: enum_col(row, 3, ActionType::parse)?,
        status: enum_col(row, 4, ManualTaskStatus::parse)?,
        submissions: json_col(row, 5)?,
        created_at: time_col(row, 6)?,
        updated_at: time_col(row, 7)?,
    })
}
