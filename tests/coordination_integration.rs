use agentmesh::error::MeshError;
use agentmesh::model::{EventKind, TaskState};
use agentmesh::orchestrator::{NewTask, Orchestrator};
use agentmesh::store::claims::ClaimRequest;
use agentmesh::store::db::MeshDb;
use agentmesh::store::paths::MeshPaths;
use agentmesh::weave::Weave;
use tempfile::tempdir;

/// Two independent connections to one initialized store, the way two agent
/// processes would see it.
fn two_handles(root: &std::path::Path) -> (MeshDb, MeshDb) {
    let paths = MeshPaths::for_root(root);
    paths.init().unwrap();
    let a = MeshDb::from_paths(&paths).unwrap();
    let b = MeshDb::from_paths(&paths).unwrap();
    (a, b)
}

#[test]
fn claims_conflict_across_connections_integration() {
    let dir = tempdir().unwrap();
    let (db_a, db_b) = two_handles(dir.path());

    db_a.acquire(&ClaimRequest::new("/repo/src/lib.rs", "agent-a", 600))
        .unwrap();

    let err = db_b
        .acquire(&ClaimRequest::new("/repo/src/lib.rs", "agent-b", 600))
        .unwrap_err();
    match err {
        MeshError::ClaimConflict { holder, .. } => assert_eq!(holder, "agent-a"),
        other => panic!("expected ClaimConflict, got {other:?}"),
    }

    let conflicts = db_b.check("/repo/src/lib.rs", Some("agent-b")).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert!(db_a.check("/repo/src/lib.rs", Some("agent-a")).unwrap().is_empty());

    db_a.release("/repo/src/lib.rs", "agent-a").unwrap();
    let claim = db_b
        .acquire(&ClaimRequest::new("/repo/src/lib.rs", "agent-b", 600))
        .unwrap();
    assert_eq!(claim.agent_id, "agent-b");
    assert_eq!(db_a.list_active().unwrap().len(), 1);
}

#[test]
fn steal_replaces_holder_and_logs_once_integration() {
    let dir = tempdir().unwrap();
    let (db_a, db_b) = two_handles(dir.path());

    db_a.acquire(&ClaimRequest::new("PORT:8080", "agent-a", 600))
        .unwrap();
    let stolen = db_b
        .steal(&ClaimRequest::new("PORT:8080", "agent-b", 600).reason("hung"))
        .unwrap();
    assert_eq!(stolen.agent_id, "agent-b");

    let steals = db_a.tail_events(50, Some(EventKind::Steal)).unwrap();
    assert_eq!(steals.len(), 1);
    assert_eq!(steals[0].payload["previous_holder"], "agent-a");

    assert!(matches!(
        db_a.release("PORT:8080", "agent-a"),
        Err(MeshError::NotClaimHolder { .. })
    ));
}

#[test]
fn lease_is_exclusive_between_controllers_integration() {
    let dir = tempdir().unwrap();
    let (db_x, db_y) = two_handles(dir.path());

    db_x.lease_acquire("orchctl_x", 300).unwrap();
    assert!(matches!(
        db_y.lease_acquire("orchctl_y", 300),
        Err(MeshError::LeaseConflict { .. })
    ));

    // Y cannot drive tasks either.
    let orch_y = Orchestrator::new(&db_y);
    assert!(matches!(
        orch_y.create("orchctl_y", &NewTask {
            title: "sneaky".into(),
            ..NewTask::default()
        }),
        Err(MeshError::LeaseConflict { .. })
    ));

    db_x.lease_release("orchctl_x").unwrap();
    let control = db_y.lease_acquire("orchctl_y", 300).unwrap();
    assert_eq!(control.lease_owner.as_deref(), Some("orchctl_y"));
}

#[test]
fn task_walks_the_full_lifecycle_integration() {
    let dir = tempdir().unwrap();
    let (db, _) = two_handles(dir.path());
    db.lease_acquire("orchctl_main", 300).unwrap();
    let orch = Orchestrator::new(&db);

    let task = orch
        .create("orchctl_main", &NewTask {
            title: "ship the parser".into(),
            ..NewTask::default()
        })
        .unwrap();
    assert_eq!(task.state, TaskState::Created);

    orch.assign("orchctl_main", &task.task_id, "worker-1").unwrap();
    for _ in 0..5 {
        orch.advance("orchctl_main", &task.task_id, None).unwrap();
    }
    let done = db.get_task(&task.task_id).unwrap();
    assert_eq!(done.state, TaskState::Merged);
    assert_eq!(done.assigned_agent.as_deref(), Some("worker-1"));

    let transitions: Vec<_> = db
        .read_events(0, 1000)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == EventKind::TaskTransition)
        .collect();
    let states: Vec<_> = transitions
        .iter()
        .map(|e| e.payload["to_state"].as_str().unwrap_or_default())
        .collect();
    assert_eq!(
        states,
        ["CREATED", "ASSIGNED", "RUNNING", "PR_OPEN", "CI_PASS", "REVIEW_PASS", "MERGED"]
    );
    assert!(transitions.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(Weave::new(&db).verify(None, None).unwrap().ok);

    assert!(matches!(
        orch.abort("orchctl_main", &task.task_id, "too late"),
        Err(MeshError::InvalidTransition { .. })
    ));
}

#[test]
fn over_budget_task_aborts_on_next_transition_integration() {
    let dir = tempdir().unwrap();
    let (db, _) = two_handles(dir.path());
    db.lease_acquire("orchctl_main", 300).unwrap();
    let orch = Orchestrator::new(&db);

    let task = orch
        .create("orchctl_main", &NewTask {
            title: "budgeted".into(),
            max_cost_usd: Some(2.50),
            ..NewTask::default()
        })
        .unwrap();
    orch.assign("orchctl_main", &task.task_id, "worker-1").unwrap();
    orch.advance("orchctl_main", &task.task_id, None).unwrap();

    let spawn = orch
        .spawn("orchctl_main", &task.task_id, "worker-1", std::process::id(), 3600)
        .unwrap();
    let done = orch
        .worker_done("orchctl_main", &spawn.spawn_id, "success", 3.10)
        .unwrap();
    assert!(done.over_budget);
    assert!((done.cumulative_cost_usd - 3.10).abs() < 1e-9);

    let err = orch
        .advance("orchctl_main", &task.task_id, None)
        .unwrap_err();
    assert!(matches!(err, MeshError::CostExceeded { .. }));
    assert_eq!(
        db.get_task(&task.task_id).unwrap().state,
        TaskState::Aborted
    );
}

#[test]
fn tampered_event_breaks_the_chain_integration() {
    let dir = tempdir().unwrap();
    let (db, _) = two_handles(dir.path());
    db.register_agent("agent-a", "/tmp").unwrap();
    db.acquire(&ClaimRequest::new("LOCK:deploy", "agent-a", 60))
        .unwrap();
    db.release("LOCK:deploy", "agent-a").unwrap();

    let weave = Weave::new(&db);
    assert!(weave.verify(None, None).unwrap().ok);

    let conn = rusqlite::Connection::open(MeshPaths::for_root(dir.path()).db_path()).unwrap();
    conn.execute(
        "UPDATE events SET payload = ?1 WHERE seq = 2",
        rusqlite::params![r#"{"resource_id":"LOCK:other"}"#],
    )
    .unwrap();

    let report = weave.verify(None, None).unwrap();
    assert!(!report.ok);
    assert_eq!(report.first_broken, Some(2));
}
