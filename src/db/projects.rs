//! Project rows

use rusqlite::{ffi, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{fold, now_secs, FOLD_FUNCTION};
use crate::error::TrackerError;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProjectRow {
    pub id: i64,
    pub name: String,
    pub thread_handle: Option<String>,
    pub deadline: Option<i64>,
    pub created_at: i64,
}

/// Project hit from a local substring search
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectHit {
    pub project: String,
    /// Every resource name in the project, in insertion order
    pub resources: Vec<String>,
}

/// Counts behind a project summary
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct ProjectCounts {
    pub resources: u64,
    pub completed: u64,
}

const PROJECT_COLUMNS: &str = "id, name, thread_handle, deadline, created_at";

fn map_project(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok(ProjectRow {
        id: row.get(0)?,
        name: row.get(1)?,
        thread_handle: row.get(2)?,
        deadline: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// UNIQUE or PRIMARY KEY conflict; CHECK, NOT NULL and foreign key failures
/// share the primary code and are not matched
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

// =============================================================================
// CRUD Operations
// =============================================================================

/// Insert a project; a duplicate name is `AlreadyExists`
pub fn create_project(
    conn: &Connection,
    name: &str,
    thread_handle: Option<&str>,
) -> Result<ProjectRow, TrackerError> {
    let created_at = now_secs();
    conn.execute(
        "INSERT INTO projects (name, thread_handle, created_at) VALUES (?, ?, ?)",
        params![name, thread_handle, created_at],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            TrackerError::AlreadyExists(format!("project {}", name))
        } else {
            TrackerError::Database(e)
        }
    })?;

    Ok(ProjectRow {
        id: conn.last_insert_rowid(),
        name: name.to_string(),
        thread_handle: thread_handle.map(str::to_string),
        deadline: None,
        created_at,
    })
}

pub fn get_project(conn: &Connection, id: i64) -> Result<Option<ProjectRow>, TrackerError> {
    let sql = format!("SELECT {} FROM projects WHERE id = ?", PROJECT_COLUMNS);
    Ok(conn.query_row(&sql, params![id], map_project).optional()?)
}

/// Exact-name lookup
pub fn get_project_by_name(conn: &Connection, name: &str) -> Result<Option<ProjectRow>, TrackerError> {
    let sql = format!("SELECT {} FROM projects WHERE name = ?", PROJECT_COLUMNS);
    Ok(conn.query_row(&sql, params![name], map_project).optional()?)
}

pub fn set_project_deadline(
    conn: &Connection,
    project_id: i64,
    deadline: Option<i64>,
) -> Result<bool, TrackerError> {
    let rows = conn.execute(
        "UPDATE projects SET deadline = ? WHERE id = ?",
        params![deadline, project_id],
    )?;
    Ok(rows > 0)
}

pub fn count_projects(conn: &Connection) -> Result<u64, TrackerError> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM projects", [], |row| row.get(0))?;
    Ok(n as u64)
}

pub fn project_counts(conn: &Connection, project_id: i64) -> Result<ProjectCounts, TrackerError> {
    let (resources, completed): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(completed), 0) FROM resources WHERE project_id = ?",
        params![project_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok(ProjectCounts {
        resources: resources as u64,
        completed: completed as u64,
    })
}

// =============================================================================
// Deadline scan
// =============================================================================

/// One page of projects whose deadline lies in `[from, to]`, keyed by id
pub fn projects_due_between(
    conn: &Connection,
    from: i64,
    to: i64,
    after_id: i64,
    limit: u32,
) -> Result<Vec<ProjectRow>, TrackerError> {
    let sql = format!(
        "SELECT {} FROM projects
         WHERE deadline IS NOT NULL AND deadline >= ? AND deadline <= ? AND id > ?
         ORDER BY id LIMIT ?",
        PROJECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![from, to, after_id, limit], map_project)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

// =============================================================================
// Search
// =============================================================================

fn escape_like(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Case-insensitive substring match against project and resource names
///
/// Both sides are folded with Unicode lowercasing, so "ÉCLAT" finds "Éclat".
pub fn search_projects(conn: &Connection, query: &str) -> Result<Vec<ProjectHit>, TrackerError> {
    let pattern = escape_like(&fold(query));
    let sql = format!(
        "SELECT p.id, p.name FROM projects p
         WHERE {f}(p.name) LIKE ?1 ESCAPE '\\'
            OR EXISTS (SELECT 1 FROM resources r
                       WHERE r.project_id = p.id AND {f}(r.resource) LIKE ?1 ESCAPE '\\')
         ORDER BY p.id",
        f = FOLD_FUNCTION
    );
    let mut stmt = conn.prepare(&sql)?;
    let projects = stmt
        .query_map(params![pattern], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut names_stmt =
        conn.prepare("SELECT resource FROM resources WHERE project_id = ? ORDER BY id")?;
    let mut hits = Vec::with_capacity(projects.len());
    for (id, name) in projects {
        let resources = names_stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        hits.push(ProjectHit { project: name, resources });
    }
    Ok(hits)
}
