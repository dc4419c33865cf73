//! Collision-free identifiers scoped by resource type.
//!
//! Ids are random 128-bit tokens. Before an id is handed out it is checked
//! against the store's index and against ids already reserved in this
//! process but not yet committed, so concurrent stage executions never
//! receive the same id.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};
use uuid::Uuid;

use crate::domain::{Metadata, ResourceKey, ResourceRecord, ResourceType};
use crate::error::{PipelineError, Result};

use super::resource_store::ResourceStore;

/// Collision retries before allocation is treated as a fatal error
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 8;

/// A fresh random opaque token
pub fn token() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Types whose ids must not collide with `resource_type`'s.
///
/// A segment set and its composed podcast share one id.
fn id_space(resource_type: ResourceType) -> &'static [ResourceType] {
    match resource_type {
        ResourceType::Segments | ResourceType::Podcast => {
            &[ResourceType::Segments, ResourceType::Podcast]
        }
        ResourceType::Document => &[ResourceType::Document],
        ResourceType::Audio => &[ResourceType::Audio],
    }
}

/// Issues ids that are unique within a resource type
pub struct IdAllocator {
    store: Arc<ResourceStore>,

    /// Ids handed out but not yet committed to the index
    reserved: Mutex<HashSet<ResourceKey>>,

    max_attempts: u32,
}

impl IdAllocator {
    pub fn new(store: Arc<ResourceStore>) -> Self {
        Self {
            store,
            reserved: Mutex::new(HashSet::new()),
            max_attempts: MAX_ALLOCATION_ATTEMPTS,
        }
    }

    /// Allocate an id using a custom token source (for collision testing)
    pub async fn allocate_with<F>(&self, resource_type: ResourceType, mut next: F) -> Result<String>
    where
        F: FnMut() -> String,
    {
        let space = id_space(resource_type);

        'candidates: for attempt in 1..=self.max_attempts {
            let id = next();

            for shared in space {
                let key = ResourceKey::new(*shared, id.clone());
                if self.store.contains(&key).await? {
                    debug!(%key, attempt, "Id collides with the index, retrying");
                    continue 'candidates;
                }
            }

            // Reservations are keyed by the first type of the id space
            let reservation = ResourceKey::new(space[0], id);
            let fresh = self
                .reserved
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(reservation.clone());
            if fresh {
                return Ok(reservation.id);
            }
            debug!(key = %reservation, attempt, "Id already reserved, retrying");
        }

        error!(%resource_type, attempts = self.max_attempts, "Id allocation exhausted");
        Err(PipelineError::AllocationExhausted {
            resource_type,
            attempts: self.max_attempts,
        })
    }

    /// Allocate a fresh id for `resource_type`.
    ///
    /// The id stays reserved until it is committed through
    /// [`allocate_record`](Self::allocate_record) or released.
    pub async fn allocate(&self, resource_type: ResourceType) -> Result<String> {
        self.allocate_with(resource_type, token).await
    }

    /// Allocate an id and commit a pending record for it
    pub async fn allocate_record(
        &self,
        resource_type: ResourceType,
        metadata: Metadata,
    ) -> Result<ResourceRecord> {
        let id = self.allocate(resource_type).await?;
        let key = ResourceKey::new(resource_type, id);
        let result = self.store.create(&key, metadata).await;
        self.release(&key);
        result
    }

    /// Drop a reservation (the id is either committed or abandoned)
    pub fn release(&self, key: &ResourceKey) {
        let reservation = ResourceKey::new(id_space(key.resource_type)[0], key.id.clone());
        self.reserved
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&reservation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_retries_past_committed_collision() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
        store
            .create(&ResourceKey::podcast("taken"), Metadata::new())
            .await
            .unwrap();

        let allocator = IdAllocator::new(store);
        let mut candidates = vec!["fresh".to_string(), "taken".to_string()];
        let id = allocator
            .allocate_with(ResourceType::Podcast, || candidates.pop().unwrap())
            .await
            .unwrap();

        assert_eq!(id, "fresh");
    }

    #[tokio::test]
    async fn test_exhaustion_is_fatal() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
        let allocator = IdAllocator::new(store);

        allocator
            .allocate_with(ResourceType::Audio, || "same".to_string())
            .await
            .unwrap();
        let result = allocator
            .allocate_with(ResourceType::Audio, || "same".to_string())
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::AllocationExhausted { attempts: 8, .. })
        ));
    }

    #[tokio::test]
    async fn test_ids_are_scoped_by_type() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
        let allocator = IdAllocator::new(store);

        let a = allocator
            .allocate_with(ResourceType::Document, || "x".to_string())
            .await
            .unwrap();
        let b = allocator
            .allocate_with(ResourceType::Podcast, || "x".to_string())
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_podcast_ids_avoid_segment_sets() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
        store
            .create(&ResourceKey::segments("shared"), Metadata::new())
            .await
            .unwrap();

        let allocator = IdAllocator::new(store);
        let mut candidates = vec!["own".to_string(), "shared".to_string()];
        let id = allocator
            .allocate_with(ResourceType::Podcast, || candidates.pop().unwrap())
            .await
            .unwrap();

        assert_eq!(id, "own");
    }

    #[tokio::test]
    async fn test_allocate_record_commits_and_releases() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
        let allocator = IdAllocator::new(store.clone());

        let record = allocator
            .allocate_record(ResourceType::Document, Metadata::new())
            .await
            .unwrap();

        assert!(store.contains(&record.key()).await.unwrap());
        assert_eq!(record.id.len(), 32);
    }
}
