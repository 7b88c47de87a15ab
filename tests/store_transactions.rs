//! Write atomicity of the resource store: concurrent writers on one file and
//! rollback of multi-row mutations that fail part way

use quartermaster::db::{projects, resources, subscriptions};
use quartermaster::{ResourceSpec, TrackerDb, TrackerError};
use std::path::Path;

fn node(name: &str, amount: i64, children: Vec<ResourceSpec>) -> ResourceSpec {
    ResourceSpec {
        resource: name.to_string(),
        amount,
        resource_type: None,
        children,
    }
}

struct Gate {
    db: TrackerDb,
    project_id: i64,
    gate: i64,
    hinge: i64,
}

/// Gate(1) with children Hinge(2) and Plank(3); bo watches Hinge
fn seeded() -> Gate {
    let db = TrackerDb::open_in_memory().unwrap();
    let (project_id, gate) = db
        .with_conn_mut(|conn| {
            let keep = projects::create_project(conn, "Keep", None)?;
            let tree = node("Gate", 1, vec![node("Hinge", 2, vec![]), node("Plank", 3, vec![])]);
            let gate = resources::create_subtree(conn, keep.id, None, &tree)?;
            Ok((keep.id, gate))
        })
        .unwrap();
    let hinge = db
        .with_conn(|conn| {
            let hinge = resources::find_by_name(conn, project_id, "Hinge", false)?.unwrap();
            subscriptions::subscribe(conn, "bo", project_id, Some(hinge.id))?;
            Ok(hinge.id)
        })
        .unwrap();
    Gate { db, project_id, gate, hinge }
}

fn block(db: &TrackerDb, trigger_sql: &str) {
    db.with_conn(|conn| Ok(conn.execute_batch(trigger_sql)?)).unwrap();
}

fn assert_tree_intact(seed: &Gate) {
    let tree = seed.db.with_conn(|conn| resources::get_tree(conn, seed.project_id)).unwrap();
    assert_eq!(tree.len(), 3);
    for child in tree.iter().filter(|r| r.resource != "Gate") {
        assert_eq!(child.parent_id, Some(seed.gate), "{} lost its parent", child.resource);
    }
    let watchers = seed
        .db
        .with_conn(|conn| subscriptions::resource_subscribers(conn, seed.hinge))
        .unwrap();
    assert!(watchers.contains("bo"));
}

#[test]
fn test_failed_cascade_delete_rolls_back() {
    let seed = seeded();
    block(
        &seed.db,
        "CREATE TRIGGER keep_gate BEFORE DELETE ON resources WHEN OLD.resource = 'Gate'
         BEGIN SELECT RAISE(ABORT, 'gate is load bearing'); END;",
    );

    // Children go first, then the root delete fails
    let err = seed
        .db
        .with_conn_mut(|conn| resources::cascade_delete(conn, seed.gate, true))
        .unwrap_err();
    assert!(matches!(err, TrackerError::Database(_)));
    assert_tree_intact(&seed);
}

#[test]
fn test_failed_detaching_delete_restores_parents() {
    let seed = seeded();
    block(
        &seed.db,
        "CREATE TRIGGER keep_gate BEFORE DELETE ON resources WHEN OLD.resource = 'Gate'
         BEGIN SELECT RAISE(ABORT, 'gate is load bearing'); END;",
    );

    // Children are detached before the failing delete
    let err = seed
        .db
        .with_conn_mut(|conn| resources::cascade_delete(conn, seed.gate, false))
        .unwrap_err();
    assert!(matches!(err, TrackerError::Database(_)));
    assert_tree_intact(&seed);
}

#[test]
fn test_failed_cascade_complete_rolls_back() {
    let seed = seeded();
    block(
        &seed.db,
        "CREATE TRIGGER stuck_hinge BEFORE UPDATE ON resources
         WHEN NEW.resource = 'Hinge' AND NEW.completed = 1
         BEGIN SELECT RAISE(ABORT, 'hinge is stuck'); END;",
    );

    assert!(seed
        .db
        .with_conn_mut(|conn| resources::cascade_complete(conn, seed.gate))
        .is_err());

    let tree = seed.db.with_conn(|conn| resources::get_tree(conn, seed.project_id)).unwrap();
    assert!(tree.iter().all(|r| !r.completed && r.progress == 0));
}

fn open_shared(path: &Path) -> (TrackerDb, TrackerDb, i64) {
    let first = TrackerDb::open(path).unwrap();
    let id = first
        .with_conn_mut(|conn| {
            let keep = projects::create_project(conn, "Keep", None)?;
            resources::create_subtree(conn, keep.id, None, &node("Wall", 100, vec![]))
        })
        .unwrap();
    let second = TrackerDb::open(path).unwrap();
    (first, second, id)
}

#[test]
fn test_two_handles_do_not_lose_updates() {
    let dir = tempfile::TempDir::new().unwrap();
    let (first, second, wall) = open_shared(&dir.path().join("tracker.db"));

    let completions: usize = std::thread::scope(|scope| {
        let workers: Vec<_> = [&first, &second]
            .into_iter()
            .map(|db| {
                scope.spawn(move || {
                    let mut completed = 0;
                    for _ in 0..50 {
                        let outcome = db
                            .with_conn_mut(|conn| resources::update_progress(conn, wall, 1))
                            .unwrap();
                        if outcome.became_completed {
                            completed += 1;
                        }
                    }
                    completed
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).sum()
    });

    assert_eq!(completions, 1);
    let stored = first.with_conn(|conn| resources::get_resource(conn, wall)).unwrap().unwrap();
    assert_eq!(stored.progress, 100);
    assert!(stored.completed);
}
