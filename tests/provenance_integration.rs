use std::collections::BTreeMap;

use agentmesh::error::MeshError;
use agentmesh::keystore::Keystore;
use agentmesh::meshpack::{self, CAPSULES_SHARD, SHARDS};
use agentmesh::model::{ClaimIntent, Sbar, Severity};
use agentmesh::store::claims::ClaimRequest;
use agentmesh::store::db::MeshDb;
use agentmesh::store::messages::NewMessage;
use agentmesh::store::paths::MeshPaths;
use agentmesh::weave::{NewCapsule, Weave};
use serde_json::{Map, Value, json};
use tempfile::tempdir;

fn open(root: &std::path::Path) -> (MeshDb, Keystore) {
    let paths = MeshPaths::for_root(root);
    paths.init().unwrap();
    (MeshDb::from_paths(&paths).unwrap(), Keystore::for_paths(&paths))
}

/// An episode with one capsule, one message and one claim, exported to
/// `out` with the signer's key inlined.
fn export_episode(root: &std::path::Path, out: &std::path::Path) -> String {
    let (db, keystore) = open(root);
    keystore.generate().unwrap();
    let episode = db.start_episode("agent-a", "auth refactor", None).unwrap();
    let id = episode.episode_id.clone();

    Weave::new(&db)
        .bind_capsule(
            &id,
            NewCapsule {
                agent_id: "agent-a".into(),
                task_desc: "split session module".into(),
                git_branch: "main".into(),
                git_sha: String::new(),
                files_changed: vec!["src/session.rs".into()],
                what_changed: "moved token refresh".into(),
                sbar: Sbar {
                    situation: "tokens expire early".into(),
                    ..Sbar::default()
                },
            },
        )
        .unwrap();
    db.post_message(&NewMessage {
        from_agent: "agent-a",
        to_agent: None,
        channel: "general",
        severity: Severity::Attn,
        body: "session module is mid-refactor",
        episode_id: Some(&id),
    })
    .unwrap();
    db.acquire(
        &ClaimRequest::new("/repo/src/session.rs", "agent-a", 600)
            .intent(ClaimIntent::Edit)
            .episode(Some(id.clone())),
    )
    .unwrap();

    let report = meshpack::export(&db, &keystore, &id, None, true, out).unwrap();
    assert_eq!(report.counts["capsules"], 1);
    assert_eq!(report.counts["messages"], 1);
    id
}

#[test]
fn meshpack_moves_an_episode_between_repos_integration() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    let pack = src.path().join("ep.meshpack");
    let source_id = export_episode(src.path(), &pack);

    let (db, keystore) = open(dst.path());
    let report = meshpack::verify(&pack, &keystore, false).unwrap();
    assert_eq!(report.kind, "signed_v1");
    assert_eq!(report.episode_id, source_id);

    let imported = meshpack::import(&db, &keystore, &pack, Some("peer"), "agent-b", false).unwrap();
    assert_eq!(imported.episode_id, format!("peer/{source_id}"));
    assert_eq!(imported.counts.episodes, 1);
    assert_eq!(imported.counts.capsules, 1);
    assert_eq!(imported.counts.messages, 1);

    let capsules = db.capsules_for_episode(&imported.episode_id).unwrap();
    assert_eq!(capsules[0].task_desc, "split session module");

    // Same pack again inserts nothing new.
    let again = meshpack::import(&db, &keystore, &pack, Some("peer"), "agent-b", false).unwrap();
    assert_eq!(again.counts.episodes, 0);
    assert_eq!(again.counts.capsules, 0);
    assert_eq!(again.counts.messages, 0);
}

#[test]
fn tampered_shard_is_rejected_and_nothing_imported_integration() {
    let src = tempdir().unwrap();
    let dst = tempdir().unwrap();
    let pack = src.path().join("ep.meshpack");
    let source_id = export_episode(src.path(), &pack);

    let mut contents = meshpack::read_pack(&pack).unwrap();
    let shard = contents.shards.get_mut(CAPSULES_SHARD).unwrap();
    let edited = String::from_utf8(shard.clone())
        .unwrap()
        .replace("split session module", "delete session module");
    *shard = edited.into_bytes();
    let forged = src.path().join("forged.meshpack");
    meshpack::write_pack(&forged, &contents.manifest, &contents.shards).unwrap();

    let (db, keystore) = open(dst.path());
    assert!(matches!(
        meshpack::import(&db, &keystore, &forged, None, "agent-b", false),
        Err(MeshError::SignatureInvalid(_))
    ));
    assert!(matches!(
        db.get_episode(&source_id),
        Err(MeshError::EpisodeNotFound(_))
    ));
}

#[test]
fn legacy_pack_needs_explicit_opt_in_integration() {
    let dir = tempdir().unwrap();
    let (_db, keystore) = open(dir.path());

    let mut shards = BTreeMap::new();
    for name in SHARDS {
        shards.insert(name.to_string(), Vec::new());
    }
    let mut manifest: Map<String, Value> = Map::new();
    manifest.insert("episode_id".into(), json!("ep_legacy"));
    manifest.insert(
        "signature".into(),
        json!(meshpack::legacy_hmac("ep_legacy", &shards).unwrap()),
    );
    let pack = dir.path().join("old.meshpack");
    meshpack::write_pack(&pack, &manifest, &shards).unwrap();

    let err = meshpack::verify(&pack, &keystore, false).unwrap_err();
    assert!(matches!(err, MeshError::LegacyPackRejected));
    assert_eq!(err.exit_code(), 2);

    let report = meshpack::verify(&pack, &keystore, true).unwrap();
    assert_eq!(report.kind, "legacy_hmac");
    assert!(report.signer_key_id.is_none());
}
