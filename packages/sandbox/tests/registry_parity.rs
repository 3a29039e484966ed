// ABOUTME: Contract tests run against every sandbox registry implementation
// ABOUTME: Local, shared-over-memory and shared-over-sqlite registries must behave identically

use pretty_assertions::assert_eq;
use std::sync::Arc;
use warden_sandbox::{
    ContainerModel, LocalSandboxRegistry, MemoryKvStore, SandboxKey, SandboxRegistry,
    SharedSandboxRegistry, SqliteKvStore,
};

fn model(id: &str, sandbox_type: &str) -> ContainerModel {
    ContainerModel::for_endpoint(
        id,
        format!("warden_{}", id),
        format!("session-{}", id),
        sandbox_type,
        "localhost",
        50000,
        "token",
        vec![50000],
    )
}

async fn registries() -> Vec<Box<dyn SandboxRegistry>> {
    let sqlite = SqliteKvStore::in_memory()
        .await
        .expect("Failed to open in-memory sqlite store");
    vec![
        Box::new(LocalSandboxRegistry::new()),
        Box::new(SharedSandboxRegistry::new(Arc::new(MemoryKvStore::new()))),
        Box::new(SharedSandboxRegistry::with_prefix(Arc::new(sqlite), "test:")),
    ]
}

#[tokio::test]
async fn test_round_trip() {
    for registry in registries().await {
        let key = SandboxKey::new("u1", "s1", "browser");
        let model = model("c1", "browser");

        registry.add(&key, &model).await.unwrap();
        assert_eq!(registry.get(&key).await.unwrap(), Some(model.clone()), "{}", registry.name());
        assert!(registry.contains(&key).await.unwrap());

        assert!(registry.remove(&key).await.unwrap());
        assert!(!registry.contains(&key).await.unwrap(), "{}", registry.name());
        assert!(!registry.contains_container_id("c1").await.unwrap());
        assert!(!registry.remove(&key).await.unwrap());
    }
}

#[tokio::test]
async fn test_reverse_lookup_matches_forward() {
    for registry in registries().await {
        let key = SandboxKey::new("u1", "s1", "base");
        registry.add(&key, &model("c1", "base")).await.unwrap();

        assert_eq!(registry.lookup_key("c1").await.unwrap(), Some(key.clone()));
        let by_id = registry.get_by_container_id("c1").await.unwrap().unwrap();
        assert_eq!(by_id.container_id, "c1");
        assert_eq!(registry.lookup_key("nope").await.unwrap(), None);
    }
}

#[tokio::test]
async fn test_remove_by_container_id_clears_key() {
    for registry in registries().await {
        let key = SandboxKey::new("u2", "s9", "filesystem");
        registry.add(&key, &model("c9", "filesystem")).await.unwrap();

        assert!(registry.remove_by_container_id("c9").await.unwrap());
        assert_eq!(registry.get(&key).await.unwrap(), None, "{}", registry.name());
        assert!(registry.list_all().await.unwrap().is_empty());
        assert!(!registry.remove_by_container_id("c9").await.unwrap());
    }
}

#[tokio::test]
async fn test_list_all_keyed_by_container_id() {
    for registry in registries().await {
        registry
            .add(&SandboxKey::new("u1", "s1", "base"), &model("a", "base"))
            .await
            .unwrap();
        registry
            .add(&SandboxKey::new("u1", "s2", "base"), &model("b", "base"))
            .await
            .unwrap();
        registry
            .add(&SandboxKey::new("u2", "s1", "browser"), &model("c", "browser"))
            .await
            .unwrap();

        let all = registry.list_all().await.unwrap();
        let mut ids: Vec<_> = all.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b", "c"], "{}", registry.name());
        assert_eq!(all["c"].sandbox_type, "browser");
    }
}

#[tokio::test]
async fn test_rebinding_key_replaces_container() {
    for registry in registries().await {
        let key = SandboxKey::new("u1", "s1", "base");
        registry.add(&key, &model("old", "base")).await.unwrap();
        registry.add(&key, &model("new", "base")).await.unwrap();

        assert_eq!(registry.get(&key).await.unwrap().unwrap().container_id, "new");
        assert!(!registry.contains_container_id("old").await.unwrap(), "{}", registry.name());
        assert_eq!(registry.list_all().await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn test_keys_differing_in_one_field_are_distinct() {
    for registry in registries().await {
        registry
            .add(&SandboxKey::new("u1", "s1", "base"), &model("a", "base"))
            .await
            .unwrap();

        assert!(!registry
            .contains(&SandboxKey::new("u1", "s1", "browser"))
            .await
            .unwrap());
        assert!(!registry
            .contains(&SandboxKey::new("u2", "s1", "base"))
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn test_moving_container_to_new_key_unbinds_old_key() {
    for registry in registries().await {
        let first = SandboxKey::new("u1", "s1", "base");
        let second = SandboxKey::new("u2", "s2", "base");
        registry.add(&first, &model("c1", "base")).await.unwrap();
        registry.add(&second, &model("c1", "base")).await.unwrap();

        assert!(!registry.contains(&first).await.unwrap(), "{}", registry.name());
        assert_eq!(registry.get(&first).await.unwrap(), None);
        assert_eq!(
            registry.get(&second).await.unwrap().unwrap().container_id,
            "c1"
        );
        assert_eq!(registry.lookup_key("c1").await.unwrap(), Some(second.clone()));
        assert_eq!(registry.list_all().await.unwrap().len(), 1);
    }
}
