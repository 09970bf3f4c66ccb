use std::sync::Arc;

use serde_json::json;

use weft::{ExecutionId, MemoryStateStore, SharedState, StateStore};
use weft_test_utils::state;

#[tokio::test]
async fn test_merges_union_keys() {
    let store = MemoryStateStore::new();
    let id = ExecutionId::new();

    store.merge(&id, state(json!({"a": 1}))).await.unwrap();
    store.merge(&id, state(json!({"b": 2}))).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap(), state(json!({"a": 1, "b": 2})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_merges_lose_nothing() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
    let id = ExecutionId::new();
    store.replace(&id, SharedState::new()).await.unwrap();

    let handles: Vec<_> = (0..100)
        .map(|i| {
            let store = Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                let key = if i % 2 == 0 { "a".to_string() } else { format!("k{}", i) };
                store.merge(&id, SharedState::new().with(key, json!(1))).await.unwrap();
            })
        })
        .collect();
    futures::future::join_all(handles).await;

    let merged = store.get(&id).await.unwrap();
    assert_eq!(merged.len(), 51);
    assert_eq!(merged.get("a"), Some(&json!(1)));
}

#[tokio::test]
async fn test_delete_then_get_is_empty() {
    let store = MemoryStateStore::new();
    let id = ExecutionId::new();
    store.replace(&id, state(json!({"x": true}))).await.unwrap();

    store.delete(&id).await.unwrap();
    assert!(store.get(&id).await.unwrap().is_empty());
    assert!(store.is_empty());
}
