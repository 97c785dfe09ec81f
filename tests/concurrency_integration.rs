use std::sync::{Arc, Barrier};
use std::thread;

use agentmesh::error::MeshError;
use agentmesh::model::EventKind;
use agentmesh::store::claims::ClaimRequest;
use agentmesh::store::db::MeshDb;
use agentmesh::store::paths::MeshPaths;
use serde_json::json;
use tempfile::tempdir;

const AGENTS: usize = 16;
const APPENDS_PER_AGENT: usize = 20;

#[test]
fn racing_claimants_get_exactly_one_winner_integration() {
    let dir = tempdir().unwrap();
    let paths = MeshPaths::for_root(dir.path());
    paths.init().unwrap();
    // Creates the schema and switches the file to WAL before the race.
    drop(MeshDb::from_paths(&paths).unwrap());

    let barrier = Arc::new(Barrier::new(AGENTS));
    let handles: Vec<_> = (0..AGENTS)
        .map(|i| {
            let paths = paths.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let db = MeshDb::from_paths(&paths).unwrap();
                barrier.wait();
                db.acquire(&ClaimRequest::new("LOCK:deploy", format!("agent-{i}"), 600))
            })
        })
        .collect();

    let mut winners = Vec::new();
    for handle in handles {
        match handle.join().unwrap() {
            Ok(claim) => winners.push(claim.agent_id),
            Err(MeshError::ClaimConflict { .. }) => {}
            Err(other) => panic!("expected ClaimConflict, got {other:?}"),
        }
    }
    assert_eq!(winners.len(), 1, "winners: {winners:?}");

    let db = MeshDb::from_paths(&paths).unwrap();
    let active = db.list_active().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].agent_id, winners[0]);
    assert_eq!(db.tail_events(100, Some(EventKind::Claim)).unwrap().len(), 1);
}

#[test]
fn concurrent_appends_keep_the_chain_intact_integration() {
    let dir = tempdir().unwrap();
    let paths = MeshPaths::for_root(dir.path());
    paths.init().unwrap();
    drop(MeshDb::from_paths(&paths).unwrap());

    let barrier = Arc::new(Barrier::new(AGENTS));
    let handles: Vec<_> = (0..AGENTS)
        .map(|i| {
            let paths = paths.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let db = MeshDb::from_paths(&paths).unwrap();
                let agent = format!("agent-{i}");
                barrier.wait();
                for n in 0..APPENDS_PER_AGENT {
                    db.append_event(EventKind::Heartbeat, &agent, json!({"n": n}))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let db = MeshDb::from_paths(&paths).unwrap();
    let expected = (AGENTS * APPENDS_PER_AGENT) as i64;
    assert_eq!(db.event_count().unwrap(), expected);

    let report = db.verify_chain(None, None).unwrap();
    assert!(report.ok, "{report:?}");
    assert_eq!(report.checked, expected as u64);

    let seqs: Vec<i64> = db
        .read_events(0, expected + 10)
        .unwrap()
        .iter()
        .map(|e| e.seq)
        .collect();
    assert_eq!(seqs, (1..=expected).collect::<Vec<_>>());
}
