//! Schema and forward migrations of the content database.

use chrono::Utc;
use rusqlite::{params, Connection};

use super::StoreError;

pub const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS content (
  identifier TEXT PRIMARY KEY,
  path TEXT,
  ref_count INTEGER NOT NULL CHECK (ref_count >= 1),
  content_state INTEGER NOT NULL CHECK (content_state IN (1, 2)),
  visibility TEXT NOT NULL CHECK (visibility IN ('Default','Parent','Visible')),
  mime_type TEXT NOT NULL,
  content_type TEXT NOT NULL,
  manifest_version TEXT NOT NULL,
  pkg_version REAL,
  size_on_device INTEGER NOT NULL DEFAULT 0 CHECK (size_on_device >= 0),
  audience TEXT NOT NULL,
  pragma TEXT NOT NULL,
  board TEXT NOT NULL,
  medium TEXT NOT NULL,
  grade TEXT NOT NULL,
  local_data TEXT NOT NULL,
  local_last_updated_on TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_content_visibility ON content(visibility);
CREATE INDEX IF NOT EXISTS idx_content_updated ON content(local_last_updated_on);
";

/// Column list shared by every `SELECT` on `content`
pub const CONTENT_COLUMNS: &str = "identifier, path, ref_count, content_state, visibility, \
     mime_type, content_type, manifest_version, pkg_version, size_on_device, audience, pragma, \
     board, medium, grade, local_data, local_last_updated_on";

/// Apply all forward migrations up to `LATEST_SCHEMA_VERSION`
pub fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;

    let version = current_schema_version(conn)?;

    if version < 1 {
        apply_migration_1(conn)?;
    }

    let version = current_schema_version(conn)?;
    if version != LATEST_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchema {
            found: version,
            expected: LATEST_SCHEMA_VERSION,
        });
    }

    Ok(())
}

pub fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn apply_migration_1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(MIGRATION_001_SQL)?;
    record_schema_version(conn, 1)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
