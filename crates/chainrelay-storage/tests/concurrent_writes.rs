//! Several scanners share one registry file; their writes must not collide.

use std::sync::Arc;

use chainrelay_core::registry::{KnownEntityRegistry, RegistrySnapshot, RegistryStore};
use chainrelay_storage::{write_atomic, FileRegistryStore};
use tokio::task::JoinSet;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_atomic_writes_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry.json");

    for round in 0..20 {
        let mut writers = JoinSet::new();
        for writer in 0..8 {
            let path = path.clone();
            writers.spawn(async move {
                let body = serde_json::json!({ "round": round, "writer": writer, "pad": "x".repeat(4096) });
                write_atomic(&path, &serde_json::to_vec(&body).unwrap()).await
            });
        }
        while let Some(joined) = writers.join_next().await {
            joined.unwrap().unwrap();
        }
        let parsed: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(parsed["round"], round);
    }

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .filter(|name| name != "registry.json")
        .collect();
    assert!(leftovers.is_empty(), "temp files left: {leftovers:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registry_saves_keep_every_entity() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileRegistryStore::new(dir.path().join("registry.json")));

    let mut scanners = JoinSet::new();
    for scanner in 0..8u64 {
        let store = store.clone();
        scanners.spawn(async move {
            let registry = KnownEntityRegistry::new();
            registry.add_at(&format!("0xentity{scanner}"), 100 + scanner);
            store.save(&registry.snapshot()).await
        });
    }
    while let Some(joined) = scanners.join_next().await {
        joined.unwrap().unwrap();
    }

    let saved = store.load().await.unwrap().unwrap();
    assert_eq!(saved.count, 8);
    let restored = KnownEntityRegistry::from_snapshot(&saved).unwrap();
    for scanner in 0..8u64 {
        assert_eq!(restored.learned_at(&format!("0xentity{scanner}")), Some(100 + scanner));
    }
}

#[tokio::test]
async fn older_snapshot_saved_late_does_not_drop_entities() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileRegistryStore::new(dir.path().join("registry.json"));

    let registry = KnownEntityRegistry::new();
    registry.add("0xaaa");
    let older = registry.snapshot();
    registry.add("0xbbb");
    store.save(&registry.snapshot()).await.unwrap();
    store.save(&older).await.unwrap();

    let saved: RegistrySnapshot = store.load().await.unwrap().unwrap();
    assert_eq!(saved.escrows, vec!["0xaaa", "0xbbb"]);
}
