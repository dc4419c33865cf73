//! Concurrent id allocation tests.

use std::collections::HashSet;
use std::sync::Arc;

use castwright::core::IdAllocator;
use castwright::domain::ResourceType;
use castwright::ResourceStore;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_thousand_concurrent_allocations_are_unique() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
    let allocator = Arc::new(IdAllocator::new(store));

    let mut handles = Vec::with_capacity(10_000);
    for _ in 0..10_000 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move {
            allocator.allocate(ResourceType::Audio).await
        }));
    }

    let mut ids = HashSet::new();
    for handle in handles {
        let id = handle.await.unwrap().unwrap();
        assert!(ids.insert(id), "duplicate id allocated");
    }
    assert_eq!(ids.len(), 10_000);
}

#[tokio::test]
async fn test_committed_ids_are_unique_across_allocators() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
    let first = IdAllocator::new(store.clone());
    let second = IdAllocator::new(store.clone());

    let mut ids = HashSet::new();
    for _ in 0..20 {
        let a = first
            .allocate_record(ResourceType::Document, Default::default())
            .await
            .unwrap();
        let b = second
            .allocate_record(ResourceType::Document, Default::default())
            .await
            .unwrap();
        assert!(ids.insert(a.id));
        assert!(ids.insert(b.id));
    }

    assert_eq!(store.list(ResourceType::Document).await.unwrap().len(), 40);
}
