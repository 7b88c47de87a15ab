//! Database schema definitions

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::TrackerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), TrackerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.execute_batch(PROJECTS_SCHEMA)
            .map_err(|e| TrackerError::Internal(format!("Failed to create project tables: {}", e)))?;
        conn.execute_batch(RESOURCES_SCHEMA)
            .map_err(|e| TrackerError::Internal(format!("Failed to create resource tables: {}", e)))?;
        conn.execute_batch(SUBSCRIPTIONS_SCHEMA)
            .map_err(|e| TrackerError::Internal(format!("Failed to create subscription tables: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(TrackerError::Internal(format!(
            "Database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, TrackerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .optional()?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<(), TrackerError> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

const PROJECTS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    thread_handle TEXT,
    deadline INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projects_deadline ON projects(deadline);
"#;

// Foreign keys reject dangling references; deletion cascades are done by
// the tree store itself.
const RESOURCES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS resources (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    resource TEXT NOT NULL,
    amount INTEGER NOT NULL CHECK (amount > 0),
    progress INTEGER NOT NULL DEFAULT 0 CHECK (progress >= 0 AND progress <= amount),
    completed INTEGER NOT NULL DEFAULT 0,
    resource_type TEXT,
    parent_id INTEGER REFERENCES resources(id),
    deadline INTEGER
);

CREATE INDEX IF NOT EXISTS idx_resources_project ON resources(project_id);
CREATE INDEX IF NOT EXISTS idx_resources_parent ON resources(parent_id);
CREATE INDEX IF NOT EXISTS idx_resources_deadline ON resources(deadline);
"#;

const SUBSCRIPTIONS_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    resource_id INTEGER REFERENCES resources(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_triple
    ON subscriptions(user_id, project_id, COALESCE(resource_id, -1));
CREATE INDEX IF NOT EXISTS idx_subscriptions_resource ON subscriptions(resource_id);

CREATE TABLE IF NOT EXISTS project_members (
    user_id TEXT NOT NULL,
    project_id INTEGER NOT NULL REFERENCES projects(id),
    PRIMARY KEY (user_id, project_id)
);
"#;
