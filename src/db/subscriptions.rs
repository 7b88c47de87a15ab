//! Subscriptions and project membership

use rusqlite::{params, Connection};
use std::collections::BTreeSet;

use crate::error::TrackerError;

fn collect_users(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<BTreeSet<String>, TrackerError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let users = stmt
        .query_map(params, |row| row.get(0))?
        .collect::<Result<BTreeSet<String>, _>>()?;
    Ok(users)
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Subscribe a user to a project (`resource_id = None`) or one resource
///
/// Returns false when the subscription already existed.
pub fn subscribe(
    conn: &Connection,
    user_id: &str,
    project_id: i64,
    resource_id: Option<i64>,
) -> Result<bool, TrackerError> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO subscriptions (user_id, project_id, resource_id) VALUES (?, ?, ?)",
        params![user_id, project_id, resource_id],
    )?;
    Ok(rows > 0)
}

/// Returns false when there was nothing to remove
pub fn unsubscribe(
    conn: &Connection,
    user_id: &str,
    project_id: i64,
    resource_id: Option<i64>,
) -> Result<bool, TrackerError> {
    let rows = conn.execute(
        "DELETE FROM subscriptions
         WHERE user_id = ? AND project_id = ? AND resource_id IS ?",
        params![user_id, project_id, resource_id],
    )?;
    Ok(rows > 0)
}

/// Project-level subscribers
pub fn project_subscribers(conn: &Connection, project_id: i64) -> Result<BTreeSet<String>, TrackerError> {
    collect_users(
        conn,
        "SELECT user_id FROM subscriptions WHERE project_id = ? AND resource_id IS NULL",
        params![project_id],
    )
}

/// Subscribers of exactly this resource (ancestors do not count)
pub fn resource_subscribers(conn: &Connection, resource_id: i64) -> Result<BTreeSet<String>, TrackerError> {
    collect_users(
        conn,
        "SELECT user_id FROM subscriptions WHERE resource_id = ?",
        params![resource_id],
    )
}

// =============================================================================
// Members
// =============================================================================

/// Returns false when the user was already a member
pub fn add_member(conn: &Connection, user_id: &str, project_id: i64) -> Result<bool, TrackerError> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO project_members (user_id, project_id) VALUES (?, ?)",
        params![user_id, project_id],
    )?;
    Ok(rows > 0)
}

pub fn remove_member(conn: &Connection, user_id: &str, project_id: i64) -> Result<bool, TrackerError> {
    let rows = conn.execute(
        "DELETE FROM project_members WHERE user_id = ? AND project_id = ?",
        params![user_id, project_id],
    )?;
    Ok(rows > 0)
}

pub fn is_member(conn: &Connection, user_id: &str, project_id: i64) -> Result<bool, TrackerError> {
    let found: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM project_members WHERE user_id = ? AND project_id = ?)",
        params![user_id, project_id],
        |row| row.get(0),
    )?;
    Ok(found)
}

pub fn members(conn: &Connection, project_id: i64) -> Result<BTreeSet<String>, TrackerError> {
    collect_users(
        conn,
        "SELECT user_id FROM project_members WHERE project_id = ?",
        params![project_id],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{projects, resources, TrackerDb};
    use crate::expansion::ResourceSpec;

    fn setup() -> (TrackerDb, i64, i64) {
        let db = TrackerDb::open_in_memory().unwrap();
        let ids = db
            .with_conn_mut(|conn| {
                let project = projects::create_project(conn, "Keep", None)?;
                let root = resources::create_subtree(
                    conn,
                    project.id,
                    None,
                    &ResourceSpec::leaf("Wall", 10, None),
                )?;
                Ok((project.id, root))
            })
            .unwrap();
        (db, ids.0, ids.1)
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let (db, project_id, wall) = setup();
        db.with_conn(|conn| {
            assert!(subscribe(conn, "ana", project_id, None)?);
            assert!(!subscribe(conn, "ana", project_id, None)?);
            assert!(subscribe(conn, "ana", project_id, Some(wall))?);
            assert!(!subscribe(conn, "ana", project_id, Some(wall))?);
            Ok(())
        })
        .unwrap();
        assert_eq!(db.stats().unwrap().subscription_count, 2);
    }

    #[test]
    fn test_unsubscribe_targets_exact_level() {
        let (db, project_id, wall) = setup();
        db.with_conn(|conn| {
            subscribe(conn, "ana", project_id, None)?;
            subscribe(conn, "ana", project_id, Some(wall))?;

            assert!(unsubscribe(conn, "ana", project_id, Some(wall))?);
            assert!(!unsubscribe(conn, "ana", project_id, Some(wall))?);
            assert_eq!(project_subscribers(conn, project_id)?.len(), 1);
            assert!(resource_subscribers(conn, wall)?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_membership() {
        let (db, project_id, _) = setup();
        db.with_conn(|conn| {
            assert!(!is_member(conn, "bo", project_id)?);
            assert!(add_member(conn, "bo", project_id)?);
            assert!(!add_member(conn, "bo", project_id)?);
            assert!(is_member(conn, "bo", project_id)?);
            assert_eq!(members(conn, project_id)?.into_iter().collect::<Vec<_>>(), vec!["bo"]);
            assert!(remove_member(conn, "bo", project_id)?);
            assert!(!is_member(conn, "bo", project_id)?);
            Ok(())
        })
        .unwrap();
    }
}
