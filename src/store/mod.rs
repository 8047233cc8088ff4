//! SQLite-backed content record store.
//!
//! The store owns the `content` table and its migrations. All writes of one
//! import (or delete) go through [`ContentStore::apply_batch`], which runs them
//! in a single transaction: either every insert, update and removal lands or
//! none does.
//!
//! Writers are serialized in two layers:
//! - the connection itself sits behind an async mutex
//! - [`ContentStore::lock_batch`] hands out a guard that pipelines hold from
//!   their existence check until their batch commits

pub mod schema;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::domain::{ContentRecord, ContentState, Visibility};

use schema::CONTENT_COLUMNS;

/// Identifiers per `IN (...)` query, well under SQLite's parameter limit
const FETCH_CHUNK: usize = 500;

/// Errors raised by the record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to prepare database location: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid value {value:?} in column {column}")]
    InvalidColumn { column: &'static str, value: String },

    #[error("content {0} does not exist")]
    RecordMissing(String),

    #[error("unsupported schema version {found}; expected {expected}")]
    UnsupportedSchema { found: i64, expected: i64 },
}

/// Writes applied together in one transaction
#[derive(Debug, Clone, Default)]
pub struct ContentBatch {
    /// Records that do not exist yet
    pub inserts: Vec<ContentRecord>,

    /// Full replacements of existing records
    pub updates: Vec<ContentRecord>,

    /// Identifiers to remove
    pub removals: Vec<String>,
}

impl ContentBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.removals.is_empty()
    }

    /// Number of rows this batch writes
    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.removals.len()
    }
}

/// Filter for [`ContentStore::list`]
#[derive(Debug, Clone, Default)]
pub struct ContentFilter {
    pub visibility: Option<Visibility>,
    pub state: Option<ContentState>,
    pub limit: Option<usize>,
}

impl ContentFilter {
    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn with_state(mut self, state: ContentState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Content record store over a single SQLite connection
pub struct ContentStore {
    conn: Mutex<Connection>,
    batch_lock: Mutex<()>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl ContentStore {
    /// Open (or create) the database at `path` and migrate it
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        Self::with_connection(conn, Some(path.to_path_buf()))
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, None)
    }

    fn with_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self, StoreError> {
        schema::migrate(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            batch_lock: Mutex::new(()),
            path,
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-run forward migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        schema::migrate(&conn)
    }

    /// Serialize a read-check-write sequence against other writers
    pub async fn lock_batch(&self) -> MutexGuard<'_, ()> {
        self.batch_lock.lock().await
    }

    /// Look up one record
    pub async fn get(&self, identifier: &str) -> Result<Option<ContentRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {CONTENT_COLUMNS} FROM content WHERE identifier = ?1");

        let raw = conn
            .query_row(&sql, params![identifier], RawRecord::from_row)
            .optional()?;

        raw.map(RawRecord::into_record).transpose()
    }

    /// Look up many records at once, keyed by identifier
    ///
    /// Missing identifiers are simply absent from the result.
    pub async fn fetch_many(
        &self,
        identifiers: &[String],
    ) -> Result<HashMap<String, ContentRecord>, StoreError> {
        let mut found = HashMap::new();
        if identifiers.is_empty() {
            return Ok(found);
        }

        let conn = self.conn.lock().await;
        for chunk in identifiers.chunks(FETCH_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {CONTENT_COLUMNS} FROM content WHERE identifier IN ({placeholders})"
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), RawRecord::from_row)?;
            for raw in rows {
                let record = raw?.into_record()?;
                found.insert(record.identifier.clone(), record);
            }
        }

        Ok(found)
    }

    /// List records, most recently updated first
    pub async fn list(&self, filter: &ContentFilter) -> Result<Vec<ContentRecord>, StoreError> {
        let mut clauses = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(visibility) = filter.visibility {
            clauses.push("visibility = ?");
            values.push(SqlValue::Text(visibility.as_str().to_string()));
        }
        if let Some(state) = filter.state {
            clauses.push("content_state = ?");
            values.push(SqlValue::Integer(state.as_i64()));
        }

        let mut sql = format!("SELECT {CONTENT_COLUMNS} FROM content");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY local_last_updated_on DESC, identifier ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(SqlValue::Integer(to_i64(limit as u64)));
        }

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), RawRecord::from_row)?;
        let records = rows
            .map(|raw| raw?.into_record())
            .collect::<Result<Vec<_>, StoreError>>()?;

        Ok(records)
    }

    /// Apply a batch in one transaction
    ///
    /// Any failure rolls the whole batch back. Updating or removing a record
    /// that does not exist is a failure.
    pub async fn apply_batch(&self, batch: &ContentBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        for record in &batch.inserts {
            insert_record(&tx, record)?;
        }
        for record in &batch.updates {
            if update_record(&tx, record)? == 0 {
                return Err(StoreError::RecordMissing(record.identifier.clone()));
            }
        }
        for identifier in &batch.removals {
            let removed = tx.execute(
                "DELETE FROM content WHERE identifier = ?1",
                params![identifier],
            )?;
            if removed == 0 {
                return Err(StoreError::RecordMissing(identifier.clone()));
            }
        }

        tx.commit()?;
        debug!(
            inserted = batch.inserts.len(),
            updated = batch.updates.len(),
            removed = batch.removals.len(),
            "Committed content batch"
        );
        Ok(())
    }

    /// Overwrite `size_on_device` for many records in one transaction
    ///
    /// Identifiers that no longer exist are ignored.
    pub async fn update_sizes(&self, sizes: &[(String, u64)]) -> Result<(), StoreError> {
        if sizes.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE content SET size_on_device = ?1 WHERE identifier = ?2")?;
            for (identifier, size) in sizes {
                stmt.execute(params![to_i64(*size), identifier])?;
            }
        }
        tx.commit()?;

        Ok(())
    }
}

fn insert_record(tx: &Transaction<'_>, record: &ContentRecord) -> Result<(), StoreError> {
    tx.execute(
        &format!(
            "INSERT INTO content ({CONTENT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
        ),
        params![
            record.identifier,
            record.local_path.as_deref().map(path_to_text),
            i64::from(record.reference_count),
            record.state.as_i64(),
            record.visibility.as_str(),
            record.mime_type,
            record.content_type,
            record.manifest_version,
            record.package_version,
            to_i64(record.size_on_device),
            record.audience,
            record.pragma,
            record.board,
            record.medium,
            record.grade,
            record.raw_metadata,
            timestamp(&record.last_updated_at),
        ],
    )?;
    Ok(())
}

fn update_record(tx: &Transaction<'_>, record: &ContentRecord) -> Result<usize, StoreError> {
    let changed = tx.execute(
        "UPDATE content SET path = ?2, ref_count = ?3, content_state = ?4, visibility = ?5, \
         mime_type = ?6, content_type = ?7, manifest_version = ?8, pkg_version = ?9, \
         size_on_device = ?10, audience = ?11, pragma = ?12, board = ?13, medium = ?14, \
         grade = ?15, local_data = ?16, local_last_updated_on = ?17 \
         WHERE identifier = ?1",
        params![
            record.identifier,
            record.local_path.as_deref().map(path_to_text),
            i64::from(record.reference_count),
            record.state.as_i64(),
            record.visibility.as_str(),
            record.mime_type,
            record.content_type,
            record.manifest_version,
            record.package_version,
            to_i64(record.size_on_device),
            record.audience,
            record.pragma,
            record.board,
            record.medium,
            record.grade,
            record.raw_metadata,
            timestamp(&record.last_updated_at),
        ],
    )?;
    Ok(changed)
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn timestamp(at: &DateTime<Utc>) -> String {
    // Fixed-width UTC so text ordering matches time ordering
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Row exactly as stored, before domain validation
struct RawRecord {
    identifier: String,
    path: Option<String>,
    ref_count: i64,
    content_state: i64,
    visibility: String,
    mime_type: String,
    content_type: String,
    manifest_version: String,
    pkg_version: Option<f64>,
    size_on_device: i64,
    audience: String,
    pragma: String,
    board: String,
    medium: String,
    grade: String,
    local_data: String,
    local_last_updated_on: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identifier: row.get(0)?,
            path: row.get(1)?,
            ref_count: row.get(2)?,
            content_state: row.get(3)?,
            visibility: row.get(4)?,
            mime_type: row.get(5)?,
            content_type: row.get(6)?,
            manifest_version: row.get(7)?,
            pkg_version: row.get(8)?,
            size_on_device: row.get(9)?,
            audience: row.get(10)?,
            pragma: row.get(11)?,
            board: row.get(12)?,
            medium: row.get(13)?,
            grade: row.get(14)?,
            local_data: row.get(15)?,
            local_last_updated_on: row.get(16)?,
        })
    }

    fn into_record(self) -> Result<ContentRecord, StoreError> {
        let state =
            ContentState::from_i64(self.content_state).ok_or_else(|| StoreError::InvalidColumn {
                column: "content_state",
                value: self.content_state.to_string(),
            })?;
        let visibility =
            self.visibility
                .parse::<Visibility>()
                .map_err(|_| StoreError::InvalidColumn {
                    column: "visibility",
                    value: self.visibility.clone(),
                })?;
        let reference_count =
            u32::try_from(self.ref_count).map_err(|_| StoreError::InvalidColumn {
                column: "ref_count",
                value: self.ref_count.to_string(),
            })?;
        let last_updated_at = DateTime::parse_from_rfc3339(&self.local_last_updated_on)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|_| StoreError::InvalidColumn {
                column: "local_last_updated_on",
                value: self.local_last_updated_on.clone(),
            })?;

        Ok(ContentRecord {
            identifier: self.identifier,
            local_path: self.path.map(PathBuf::from),
            reference_count,
            state,
            visibility,
            mime_type: self.mime_type,
            content_type: self.content_type,
            manifest_version: self.manifest_version,
            package_version: self.pkg_version,
            size_on_device: u64::try_from(self.size_on_device).unwrap_or(0),
            audience: self.audience,
            pragma: self.pragma,
            board: self.board,
            medium: self.medium,
            grade: self.grade,
            raw_metadata: self.local_data,
            last_updated_at,
        })
    }
}
