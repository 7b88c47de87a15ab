//! Resource tree store
//!
//! Each project owns a forest of resource nodes linked through `parent_id`.
//! Every mutation here runs in one `BEGIN IMMEDIATE` transaction: a failure
//! part way leaves no partial subtree, no partially cascaded completion and
//! no row pointing at a deleted parent. Taking the write lock before the
//! first read keeps read-modify-write updates from other shard processes
//! from interleaving.
//!
//! Invariants kept on every write:
//! - `0 <= progress <= amount` (also enforced by CHECK constraints)
//! - `completed` implies `progress == amount`
//! - a parent always belongs to the same project as its children

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::VecDeque;
use tracing::debug;

use super::{commit, fold, write_tx, FOLD_FUNCTION};
use crate::error::TrackerError;
use crate::expansion::ResourceSpec;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceRow {
    pub id: i64,
    pub project_id: i64,
    pub resource: String,
    pub amount: i64,
    pub progress: i64,
    pub completed: bool,
    pub resource_type: Option<String>,
    pub parent_id: Option<i64>,
    pub deadline: Option<i64>,
}

impl ResourceRow {
    /// Rounded completion percentage
    pub fn percent(&self) -> i64 {
        if self.amount <= 0 {
            return 0;
        }
        ((self.progress as f64 / self.amount as f64) * 100.0).round() as i64
    }
}

/// Result of a cascading completion
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    /// The node the cascade started from, after the update
    pub root: ResourceRow,
    /// Nodes (root included) that were not completed before the cascade
    pub newly_completed: Vec<ResourceRow>,
}

/// Result of a single-node progress change
#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub node: ResourceRow,
    /// True only when this call moved the node into the completed state
    pub became_completed: bool,
}

/// Result of a node removal
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteOutcome {
    pub removed: Vec<i64>,
    /// Former children moved to the top level
    pub detached: Vec<i64>,
}

/// Open resource whose deadline falls in a scan window
#[derive(Debug, Clone)]
pub struct DueResource {
    pub resource: ResourceRow,
    pub project_name: String,
}

const RESOURCE_COLUMNS: &str =
    "id, project_id, resource, amount, progress, completed, resource_type, parent_id, deadline";

fn map_resource(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResourceRow> {
    Ok(ResourceRow {
        id: row.get(0)?,
        project_id: row.get(1)?,
        resource: row.get(2)?,
        amount: row.get(3)?,
        progress: row.get(4)?,
        completed: row.get(5)?,
        resource_type: row.get(6)?,
        parent_id: row.get(7)?,
        deadline: row.get(8)?,
    })
}

fn require(conn: &Connection, id: i64) -> Result<ResourceRow, TrackerError> {
    get_resource(conn, id)?.ok_or_else(|| TrackerError::NotFound(format!("resource {}", id)))
}

// =============================================================================
// Reads
// =============================================================================

pub fn get_resource(conn: &Connection, id: i64) -> Result<Option<ResourceRow>, TrackerError> {
    let sql = format!("SELECT {} FROM resources WHERE id = ?", RESOURCE_COLUMNS);
    Ok(conn.query_row(&sql, params![id], map_resource).optional()?)
}

/// Every node of a project, in insertion order
pub fn get_tree(conn: &Connection, project_id: i64) -> Result<Vec<ResourceRow>, TrackerError> {
    let sql = format!(
        "SELECT {} FROM resources WHERE project_id = ? ORDER BY id",
        RESOURCE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![project_id], map_resource)?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}

/// Case-insensitive (Unicode) name lookup within a project
///
/// With `open_first`, an uncompleted node is preferred over a completed one.
/// Ties go to the earliest inserted node.
pub fn find_by_name(
    conn: &Connection,
    project_id: i64,
    name: &str,
    open_first: bool,
) -> Result<Option<ResourceRow>, TrackerError> {
    let order = if open_first { "completed ASC, id ASC" } else { "id ASC" };
    let sql = format!(
        "SELECT {} FROM resources
         WHERE project_id = ? AND {}(resource) = ?
         ORDER BY {} LIMIT 1",
        RESOURCE_COLUMNS, FOLD_FUNCTION, order
    );
    Ok(conn.query_row(&sql, params![project_id, fold(name)], map_resource).optional()?)
}

fn child_ids(conn: &Connection, id: i64) -> Result<Vec<i64>, TrackerError> {
    let mut stmt = conn.prepare_cached("SELECT id FROM resources WHERE parent_id = ? ORDER BY id")?;
    let ids = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// The node and all of its transitive descendants, parents before children
pub fn subtree_ids(conn: &Connection, root_id: i64) -> Result<Vec<i64>, TrackerError> {
    let mut ordered = Vec::new();
    let mut queue = VecDeque::from([root_id]);
    while let Some(id) = queue.pop_front() {
        ordered.push(id);
        queue.extend(child_ids(conn, id)?);
    }
    Ok(ordered)
}

// =============================================================================
// Creation
// =============================================================================

/// Persist an expanded node tree atomically, returning the root id
///
/// `parent_id`, when given, must name a node of the same project.
pub fn create_subtree(
    conn: &mut Connection,
    project_id: i64,
    parent_id: Option<i64>,
    spec: &ResourceSpec,
) -> Result<i64, TrackerError> {
    let tx = write_tx(conn)?;

    if let Some(parent_id) = parent_id {
        let parent = require(&tx, parent_id)?;
        if parent.project_id != project_id {
            return Err(TrackerError::Validation(format!(
                "parent resource {} belongs to another project",
                parent_id
            )));
        }
    }

    let root_id = insert_node(&tx, project_id, parent_id, spec)?;

    commit(tx)?;

    debug!(project_id, root_id, nodes = spec.node_count(), "Created resource subtree");
    Ok(root_id)
}

fn insert_node(
    conn: &Connection,
    project_id: i64,
    parent_id: Option<i64>,
    spec: &ResourceSpec,
) -> Result<i64, TrackerError> {
    conn.execute(
        "INSERT INTO resources (project_id, resource, amount, progress, completed, resource_type, parent_id)
         VALUES (?, ?, ?, 0, 0, ?, ?)",
        params![project_id, spec.resource, spec.amount, spec.resource_type, parent_id],
    )?;
    let id = conn.last_insert_rowid();

    for child in &spec.children {
        insert_node(conn, project_id, Some(id), child)?;
    }
    Ok(id)
}

// =============================================================================
// Completion and progress
// =============================================================================

/// Complete a node and every descendant; ancestors are untouched
pub fn cascade_complete(conn: &mut Connection, id: i64) -> Result<CompletionOutcome, TrackerError> {
    let tx = write_tx(conn)?;

    require(&tx, id)?;
    let ids = subtree_ids(&tx, id)?;

    let mut newly_completed = Vec::new();
    {
        let mut update =
            tx.prepare("UPDATE resources SET completed = 1, progress = amount WHERE id = ?")?;
        for node_id in &ids {
            let before = require(&tx, *node_id)?;
            update.execute(params![node_id])?;
            if !before.completed {
                newly_completed.push(ResourceRow {
                    progress: before.amount,
                    completed: true,
                    ..before
                });
            }
        }
    }

    let root = require(&tx, id)?;

    commit(tx)?;

    debug!(id, cascade = ids.len(), newly = newly_completed.len(), "Cascade complete");
    Ok(CompletionOutcome { root, newly_completed })
}

/// Complete exactly one node
pub fn complete_single(conn: &mut Connection, id: i64) -> Result<ProgressOutcome, TrackerError> {
    let tx = write_tx(conn)?;
    let before = require(&tx, id)?;
    tx.execute(
        "UPDATE resources SET completed = 1, progress = amount WHERE id = ?",
        params![id],
    )?;
    let outcome = ProgressOutcome {
        became_completed: !before.completed,
        node: require(&tx, id)?,
    };
    commit(tx)?;
    Ok(outcome)
}

fn write_progress(conn: &Connection, before: ResourceRow, progress: i64) -> Result<ProgressOutcome, TrackerError> {
    let completed = progress == before.amount;
    conn.execute(
        "UPDATE resources SET progress = ?, completed = ? WHERE id = ?",
        params![progress, completed, before.id],
    )?;
    Ok(ProgressOutcome {
        became_completed: completed && !before.completed,
        node: ResourceRow { progress, completed, ..before },
    })
}

/// Apply a progress delta, clamped to `[0, amount]`
pub fn update_progress(conn: &mut Connection, id: i64, delta: i64) -> Result<ProgressOutcome, TrackerError> {
    let tx = write_tx(conn)?;
    let before = require(&tx, id)?;
    let progress = before.progress.saturating_add(delta).clamp(0, before.amount);
    let outcome = write_progress(&tx, before, progress)?;
    commit(tx)?;
    Ok(outcome)
}

/// Set an absolute progress value; anything outside `[0, amount]` is rejected
pub fn set_progress(conn: &mut Connection, id: i64, progress: i64) -> Result<ProgressOutcome, TrackerError> {
    let tx = write_tx(conn)?;
    let before = require(&tx, id)?;
    if progress < 0 || progress > before.amount {
        return Err(TrackerError::Validation(format!(
            "progress {} is outside 0..={} for {}",
            progress, before.amount, before.resource
        )));
    }
    let outcome = write_progress(&tx, before, progress)?;
    commit(tx)?;
    Ok(outcome)
}

/// Change amount and/or type; progress is clamped down to a smaller amount
pub fn edit_resource(
    conn: &mut Connection,
    id: i64,
    amount: Option<i64>,
    resource_type: Option<&str>,
) -> Result<ProgressOutcome, TrackerError> {
    if let Some(amount) = amount {
        if amount <= 0 {
            return Err(TrackerError::Validation(format!("amount must be positive, got {}", amount)));
        }
    }

    let tx = write_tx(conn)?;
    let before = require(&tx, id)?;

    let amount = amount.unwrap_or(before.amount);
    let progress = before.progress.min(amount);
    let completed = progress == amount;
    let resource_type = resource_type.map(str::to_string).or_else(|| before.resource_type.clone());

    tx.execute(
        "UPDATE resources SET amount = ?, progress = ?, completed = ?, resource_type = ? WHERE id = ?",
        params![amount, progress, completed, resource_type, id],
    )?;
    commit(tx)?;

    Ok(ProgressOutcome {
        became_completed: completed && !before.completed,
        node: ResourceRow {
            amount,
            progress,
            completed,
            resource_type,
            ..before
        },
    })
}

pub fn set_resource_deadline(conn: &Connection, id: i64, deadline: Option<i64>) -> Result<bool, TrackerError> {
    let rows = conn.execute(
        "UPDATE resources SET deadline = ? WHERE id = ?",
        params![deadline, id],
    )?;
    Ok(rows > 0)
}

// =============================================================================
// Deletion
// =============================================================================

/// Remove a node
///
/// With `cascade`, the whole subtree goes. Otherwise direct children are
/// detached to the top level and only the node itself is deleted. Resource
/// level subscriptions on removed nodes are deleted with them.
pub fn cascade_delete(conn: &mut Connection, id: i64, cascade: bool) -> Result<DeleteOutcome, TrackerError> {
    let tx = write_tx(conn)?;

    require(&tx, id)?;

    let outcome = if cascade {
        DeleteOutcome {
            removed: subtree_ids(&tx, id)?,
            detached: Vec::new(),
        }
    } else {
        let detached = child_ids(&tx, id)?;
        tx.execute("UPDATE resources SET parent_id = NULL WHERE parent_id = ?", params![id])?;
        DeleteOutcome {
            removed: vec![id],
            detached,
        }
    };

    {
        let mut drop_subs = tx.prepare("DELETE FROM subscriptions WHERE resource_id = ?")?;
        let mut drop_node = tx.prepare("DELETE FROM resources WHERE id = ?")?;
        // Children precede their parent in reverse breadth-first order
        for node_id in outcome.removed.iter().rev() {
            drop_subs.execute(params![node_id])?;
            drop_node.execute(params![node_id])?;
        }
    }

    commit(tx)?;

    debug!(id, cascade, removed = outcome.removed.len(), detached = outcome.detached.len(), "Removed resource");
    Ok(outcome)
}

// =============================================================================
// Deadline scan
// =============================================================================

/// One page of open resources whose deadline lies in `[from, to]`, keyed by id
pub fn resources_due_between(
    conn: &Connection,
    from: i64,
    to: i64,
    after_id: i64,
    limit: u32,
) -> Result<Vec<DueResource>, TrackerError> {
    let columns = RESOURCE_COLUMNS
        .split(", ")
        .map(|c| format!("r.{}", c))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT {}, p.name FROM resources r JOIN projects p ON p.id = r.project_id
         WHERE r.completed = 0 AND r.deadline IS NOT NULL
           AND r.deadline >= ? AND r.deadline <= ? AND r.id > ?
         ORDER BY r.id LIMIT ?",
        columns
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![from, to, after_id, limit], |row| {
        Ok(DueResource {
            resource: map_resource(row)?,
            project_name: row.get(9)?,
        })
    })?;

    let mut results = Vec::new();
    for row in rows {
        results.push(row?);
    }
    Ok(results)
}
