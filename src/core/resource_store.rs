//! Durable keyed store for artifacts and their records.
//!
//! Layout under the store root:
//!
//! ```text
//! index/<type>.json          index shard: every record of one type, in insertion order
//! index/<type>.lock          cross-process lock file for the shard
//! objects/<type>/<id>/...    payload parts, content-addressed by checksum
//! jobs/<job>/events.jsonl    stage journals (see `journal`)
//! ```
//!
//! Every index mutation is read-merge-write under the shard lock and is
//! committed by writing a temp file and renaming it over the shard, so a
//! crash leaves either the old or the new index, never a torn one. Payload
//! bytes are always written before the index entry that references them.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::domain::{
    Metadata, PartRef, RecordError, ResourceKey, ResourceRecord, ResourceStatus, ResourceType,
    DEFAULT_PART,
};
use crate::error::{PipelineError, Result};

const INDEX_VERSION: u32 = 1;

/// One index shard as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexShard {
    version: u32,
    resource_type: ResourceType,
    entries: Vec<ResourceRecord>,
}

impl IndexShard {
    fn empty(resource_type: ResourceType) -> Self {
        Self {
            version: INDEX_VERSION,
            resource_type,
            entries: Vec::new(),
        }
    }

    fn find(&self, id: &str) -> Option<&ResourceRecord> {
        self.entries.iter().find(|r| r.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut ResourceRecord> {
        self.entries.iter_mut().find(|r| r.id == id)
    }
}

/// File-backed resource store with an atomically committed index
pub struct ResourceStore {
    root: PathBuf,

    /// Serializes in-process writers per index shard
    shard_locks: HashMap<ResourceType, Mutex<()>>,

    /// Serializes payload writers per resource id
    key_locks: KeyedLocks,
}

impl ResourceStore {
    /// Open (or create) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("index")).await?;
        fs::create_dir_all(root.join("objects")).await?;

        let store = Self {
            shard_locks: ResourceType::ALL
                .iter()
                .map(|t| (*t, Mutex::new(())))
                .collect(),
            key_locks: KeyedLocks::default(),
            root,
        };
        store.sweep_stale_temp_files().await?;

        debug!(root = %store.root.display(), "Opened resource store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for per-job stage journals
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn shard_path(&self, resource_type: ResourceType) -> PathBuf {
        self.index_dir().join(format!("{}.json", resource_type))
    }

    /// Create a new pending record. Fails if the key already exists.
    pub async fn create(&self, key: &ResourceKey, metadata: Metadata) -> Result<ResourceRecord> {
        let key = key.clone();
        self.mutate(key.resource_type, move |shard| {
            if shard.find(&key.id).is_some() {
                return Err(PipelineError::Validation(format!("{} already exists", key)));
            }
            let record = ResourceRecord::new(&key, metadata);
            shard.entries.push(record.clone());
            Ok(record)
        })
        .await
    }

    /// Persist `payload` as the default part and merge `metadata`
    pub async fn put(
        &self,
        key: &ResourceKey,
        payload: &[u8],
        metadata: Metadata,
    ) -> Result<ResourceRecord> {
        self.put_part(key, DEFAULT_PART, payload, metadata).await
    }

    /// Persist a named payload part and merge `metadata`.
    ///
    /// Creates a pending record if none exists. A succeeded record only
    /// accepts bytes identical to what it already holds.
    pub async fn put_part(
        &self,
        key: &ResourceKey,
        part: &str,
        payload: &[u8],
        metadata: Metadata,
    ) -> Result<ResourceRecord> {
        let _guard = self.key_locks.lock(key).await;

        let part_ref = self.write_part(key, part, payload).await?;

        let key = key.clone();
        let part = part.to_string();
        self.mutate(key.resource_type, move |shard| {
            let now = Utc::now();
            match shard.find_mut(&key.id) {
                Some(record) => {
                    if record.status == ResourceStatus::Succeeded {
                        let unchanged = record
                            .parts
                            .get(&part)
                            .map(|p| p.checksum == part_ref.checksum)
                            .unwrap_or(false);
                        if !unchanged {
                            return Err(PipelineError::Validation(format!(
                                "{} has succeeded and its '{}' payload is immutable",
                                key, part
                            )));
                        }
                    }
                    record.parts.insert(part, part_ref);
                    record.metadata.extend(metadata);
                    record.updated_at = now;
                    Ok(record.clone())
                }
                None => {
                    let mut record = ResourceRecord::new(&key, metadata);
                    record.parts.insert(part, part_ref);
                    shard.entries.push(record.clone());
                    Ok(record)
                }
            }
        })
        .await
    }

    /// Fetch the default payload part together with the record
    pub async fn get(&self, key: &ResourceKey) -> Result<(Vec<u8>, ResourceRecord)> {
        let record = self.record(key).await?;
        let payload = self.read_part(&record, DEFAULT_PART).await?;
        Ok((payload, record))
    }

    /// Fetch a named payload part
    pub async fn get_part(&self, key: &ResourceKey, part: &str) -> Result<Vec<u8>> {
        let record = self.record(key).await?;
        self.read_part(&record, part).await
    }

    /// Fetch a record, failing with `NotFound` if absent
    pub async fn record(&self, key: &ResourceKey) -> Result<ResourceRecord> {
        self.find(key)
            .await?
            .ok_or_else(|| PipelineError::not_found(key))
    }

    /// Fetch a record if present
    pub async fn find(&self, key: &ResourceKey) -> Result<Option<ResourceRecord>> {
        let shard = self.load(key.resource_type).await?;
        Ok(shard.find(&key.id).cloned())
    }

    pub async fn contains(&self, key: &ResourceKey) -> Result<bool> {
        Ok(self.find(key).await?.is_some())
    }

    /// Ids of one type, in insertion order
    pub async fn list(&self, resource_type: ResourceType) -> Result<Vec<String>> {
        let shard = self.load(resource_type).await?;
        Ok(shard.entries.into_iter().map(|r| r.id).collect())
    }

    /// Records of one type, in insertion order
    pub async fn records(&self, resource_type: ResourceType) -> Result<Vec<ResourceRecord>> {
        Ok(self.load(resource_type).await?.entries)
    }

    /// Transition a record's status, retaining `error` when it fails
    pub async fn update_status(
        &self,
        key: &ResourceKey,
        status: ResourceStatus,
        error: Option<RecordError>,
    ) -> Result<ResourceRecord> {
        self.transition(key, status, error, Metadata::new()).await
    }

    /// Transition status and merge metadata in a single commit
    pub async fn transition(
        &self,
        key: &ResourceKey,
        status: ResourceStatus,
        error: Option<RecordError>,
        metadata: Metadata,
    ) -> Result<ResourceRecord> {
        let key = key.clone();
        self.mutate(key.resource_type, move |shard| {
            let record = shard
                .find_mut(&key.id)
                .ok_or_else(|| PipelineError::not_found(&key))?;

            if !record.status.can_transition_to(status) {
                return Err(PipelineError::InvalidTransition {
                    resource: key.to_string(),
                    from: record.status,
                    to: status,
                });
            }

            record.status = status;
            if status == ResourceStatus::Failed {
                record.last_error = error;
            }
            record.metadata.extend(metadata);
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
        .await
    }

    /// Merge metadata without touching status
    pub async fn merge_metadata(
        &self,
        key: &ResourceKey,
        metadata: Metadata,
    ) -> Result<ResourceRecord> {
        let key = key.clone();
        self.mutate(key.resource_type, move |shard| {
            let record = shard
                .find_mut(&key.id)
                .ok_or_else(|| PipelineError::not_found(&key))?;
            record.metadata.extend(metadata);
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
        .await
    }

    /// Re-open a failed record for a fresh, explicit invocation.
    ///
    /// The previous error is cleared and the `invocation` counter bumped.
    pub async fn reopen(&self, key: &ResourceKey) -> Result<ResourceRecord> {
        let key = key.clone();
        self.mutate(key.resource_type, move |shard| {
            let record = shard
                .find_mut(&key.id)
                .ok_or_else(|| PipelineError::not_found(&key))?;

            if record.status != ResourceStatus::Failed {
                return Err(PipelineError::InvalidTransition {
                    resource: key.to_string(),
                    from: record.status,
                    to: ResourceStatus::Pending,
                });
            }

            let invocation = record.meta_u64("invocation").unwrap_or(1) + 1;
            record.status = ResourceStatus::Pending;
            record.last_error = None;
            record
                .metadata
                .insert("invocation".to_string(), serde_json::json!(invocation));
            record.updated_at = Utc::now();
            Ok(record.clone())
        })
        .await
    }

    /// Load a shard without taking the write lock.
    ///
    /// Shards are only ever replaced by rename, so a read always sees a
    /// complete version.
    async fn load(&self, resource_type: ResourceType) -> Result<IndexShard> {
        let path = self.shard_path(resource_type);
        match fs::read(&path).await {
            Ok(bytes) => parse_shard(&bytes, resource_type),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(IndexShard::empty(resource_type))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read-merge-write one shard under its in-process and on-disk locks.
    ///
    /// If `apply` fails nothing is written.
    async fn mutate<R, F>(&self, resource_type: ResourceType, apply: F) -> Result<R>
    where
        F: FnOnce(&mut IndexShard) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let lock = self
            .shard_locks
            .get(&resource_type)
            .ok_or_else(|| PipelineError::Validation(format!("no index for {}", resource_type)))?;
        let _guard = lock.lock().await;

        let index_dir = self.index_dir();
        let shard_path = self.shard_path(resource_type);
        let lock_path = index_dir.join(format!("{}.lock", resource_type));

        tokio::task::spawn_blocking(move || {
            let lock_file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)?;
            lock_file.lock_exclusive()?;

            let mut shard = match std::fs::read(&shard_path) {
                Ok(bytes) => parse_shard(&bytes, resource_type)?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    IndexShard::empty(resource_type)
                }
                Err(e) => return Err(e.into()),
            };

            let result = apply(&mut shard)?;
            commit_shard(&index_dir, &shard_path, &shard)?;

            // Lock is released when lock_file is dropped
            Ok(result)
        })
        .await
        .map_err(|e| PipelineError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }

    /// Write a payload part next to its record, content-addressed
    async fn write_part(&self, key: &ResourceKey, part: &str, payload: &[u8]) -> Result<PartRef> {
        let checksum = checksum_hex(payload);
        let file = format!("{}-{}.bin", part, &checksum[..16]);

        let dir = self.root.join(ResourceRecord::new(key, Metadata::new()).location);
        fs::create_dir_all(&dir).await?;

        let path = dir.join(&file);
        if !fs::try_exists(&path).await? {
            let payload = payload.to_vec();
            tokio::task::spawn_blocking(move || commit_file(&dir, &path, &payload))
                .await
                .map_err(|e| PipelineError::Internal(format!("payload write panicked: {}", e)))??;
        }

        Ok(PartRef {
            file,
            size_bytes: payload.len() as u64,
            checksum,
        })
    }

    async fn read_part(&self, record: &ResourceRecord, part: &str) -> Result<Vec<u8>> {
        let part_ref = record.parts.get(part).ok_or_else(|| PipelineError::NotFound {
            resource: format!("{}/{} (status: {})", record.key(), part, record.status),
        })?;

        let path = self.root.join(&record.location).join(&part_ref.file);
        let bytes = fs::read(&path).await?;

        if checksum_hex(&bytes) != part_ref.checksum {
            warn!(path = %path.display(), "Payload checksum mismatch");
            return Err(PipelineError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("checksum mismatch for {}", path.display()),
            )));
        }

        Ok(bytes)
    }

    /// Remove temp files left behind by a crash mid-commit
    async fn sweep_stale_temp_files(&self) -> Result<()> {
        remove_temp_files(&self.index_dir()).await?;

        // objects/<type>/<id>/
        let mut types = fs::read_dir(self.root.join("objects")).await?;
        while let Some(type_dir) = types.next_entry().await? {
            if !type_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut ids = fs::read_dir(type_dir.path()).await?;
            while let Some(id_dir) = ids.next_entry().await? {
                if id_dir.file_type().await?.is_dir() {
                    remove_temp_files(&id_dir.path()).await?;
                }
            }
        }
        Ok(())
    }

    /// Fail every record a previous process left `pending` or `running`.
    ///
    /// Only one process may drive stages against a store, so at start-up
    /// such records can no longer finish. Failing them with `interrupted`
    /// lets the regular re-invocation path take over.
    pub async fn recover_interrupted(&self) -> Result<Vec<ResourceKey>> {
        let mut recovered = Vec::new();
        for resource_type in ResourceType::ALL {
            let keys = self
                .mutate(resource_type, |shard| {
                    let mut keys = Vec::new();
                    for record in shard.entries.iter_mut() {
                        if record.status.is_terminal() {
                            continue;
                        }
                        let err = PipelineError::Interrupted {
                            resource: record.key().to_string(),
                            status: record.status,
                        };
                        record.status = ResourceStatus::Failed;
                        record.last_error = Some(RecordError::from(&err));
                        record.updated_at = Utc::now();
                        keys.push(record.key());
                    }
                    Ok(keys)
                })
                .await?;
            recovered.extend(keys);
        }

        for key in &recovered {
            warn!(resource = %key, "Marked interrupted record as failed");
        }
        Ok(recovered)
    }
}

fn parse_shard(bytes: &[u8], resource_type: ResourceType) -> Result<IndexShard> {
    let shard: IndexShard =
        serde_json::from_slice(bytes).map_err(|e| PipelineError::IndexCorruption {
            resource_type,
            message: e.to_string(),
        })?;

    if shard.resource_type != resource_type {
        return Err(PipelineError::IndexCorruption {
            resource_type,
            message: format!("shard holds '{}' records", shard.resource_type),
        });
    }

    Ok(shard)
}

/// Write the shard to a temp file in the same directory, fsync, rename over
/// the live shard, then fsync the directory
fn commit_shard(index_dir: &Path, shard_path: &Path, shard: &IndexShard) -> Result<()> {
    let mut temp = tempfile::Builder::new()
        .prefix(".tmp")
        .tempfile_in(index_dir)?;

    serde_json::to_writer_pretty(temp.as_file_mut(), shard)?;
    temp.as_file_mut().flush()?;
    temp.as_file().sync_all()?;
    temp.persist(shard_path).map_err(|e| e.error)?;

    if let Ok(dir) = std::fs::File::open(index_dir) {
        let _ = dir.sync_all();
    }

    Ok(())
}

/// Write `payload` to a temp file in `dir`, fsync, rename it to `path`,
/// then fsync the directory
fn commit_file(dir: &Path, path: &Path, payload: &[u8]) -> Result<()> {
    let mut temp = tempfile::Builder::new().prefix(".tmp").tempfile_in(dir)?;

    temp.write_all(payload)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    if let Ok(dir) = std::fs::File::open(dir) {
        let _ = dir.sync_all();
    }

    Ok(())
}

async fn remove_temp_files(dir: &Path) -> Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(".tmp") {
            debug!(file = %entry.path().display(), "Removing stale temp file");
            let _ = fs::remove_file(entry.path()).await;
        }
    }
    Ok(())
}

/// Hex SHA-256 of a payload
pub fn checksum_hex(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Per-key async locks, dropped from the map once nobody holds them
#[derive(Default)]
struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<ResourceKey, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    async fn lock(&self, key: &ResourceKey) -> KeyGuard<'_> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            owner: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }
}

struct KeyGuard<'a> {
    owner: &'a KeyedLocks,
    key: ResourceKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self.owner.locks.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(&self.key)
            .map(|l| Arc::strong_count(l) == 1)
            .unwrap_or(false)
        {
            map.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(pairs: &[(&str, serde_json::Value)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_put_then_get_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = ResourceStore::open(temp.path()).await.unwrap();
        let key = ResourceKey::document("d1");

        let metadata = meta(&[("name", serde_json::json!("notes.md"))]);
        store.put(&key, b"hello world", metadata.clone()).await.unwrap();

        let (payload, record) = store.get(&key).await.unwrap();
        assert_eq!(payload, b"hello world");
        assert_eq!(record.metadata, metadata);
        assert_eq!(record.status, ResourceStatus::Pending);
    }

    #[tokio::test]
    async fn test_list_preserves_insertion_order() {
        let temp = TempDir::new().unwrap();
        let store = ResourceStore::open(temp.path()).await.unwrap();

        for id in ["c", "a", "b"] {
            store
                .create(&ResourceKey::podcast(id), Metadata::new())
                .await
                .unwrap();
        }

        let ids = store.list(ResourceType::Podcast).await.unwrap();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert!(store.list(ResourceType::Audio).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_succeeded_payload_is_immutable() {
        let temp = TempDir::new().unwrap();
        let store = ResourceStore::open(temp.path()).await.unwrap();
        let key = ResourceKey::podcast("p1");

        store.create(&key, Metadata::new()).await.unwrap();
        store.put(&key, b"v1", Metadata::new()).await.unwrap();
        store
            .update_status(&key, ResourceStatus::Running, None)
            .await
            .unwrap();
        store
            .update_status(&key, ResourceStatus::Succeeded, None)
            .await
            .unwrap();

        // Same bytes are accepted
        assert!(store.put(&key, b"v1", Metadata::new()).await.is_ok());

        // Different bytes are not
        let result = store.put(&key, b"v2", Metadata::new()).await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));

        let (payload, _) = store.get(&key).await.unwrap();
        assert_eq!(payload, b"v1");
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let temp = TempDir::new().unwrap();
        let store = ResourceStore::open(temp.path()).await.unwrap();
        let key = ResourceKey::audio("a1");

        store.create(&key, Metadata::new()).await.unwrap();
        let result = store
            .update_status(&key, ResourceStatus::Succeeded, None)
            .await;
        assert!(matches!(
            result,
            Err(PipelineError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_record_keeps_error_and_can_reopen() {
        let temp = TempDir::new().unwrap();
        let store = ResourceStore::open(temp.path()).await.unwrap();
        let key = ResourceKey::podcast("p1");

        store.create(&key, Metadata::new()).await.unwrap();
        let error = RecordError {
            code: "permanent_provider_error".to_string(),
            message: "bad".to_string(),
        };
        store
            .update_status(&key, ResourceStatus::Failed, Some(error.clone()))
            .await
            .unwrap();

        let record = store.record(&key).await.unwrap();
        assert_eq!(record.last_error, Some(error));

        let reopened = store.reopen(&key).await.unwrap();
        assert_eq!(reopened.status, ResourceStatus::Pending);
        assert_eq!(reopened.last_error, None);
        assert_eq!(reopened.meta_u64("invocation"), Some(2));
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = ResourceStore::open(temp.path()).await.unwrap();

        let result = store.get(&ResourceKey::audio("nope")).await;
        assert!(matches!(result, Err(PipelineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_record_without_payload_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = ResourceStore::open(temp.path()).await.unwrap();
        let key = ResourceKey::audio("a1");

        store.create(&key, Metadata::new()).await.unwrap();
        assert!(store.record(&key).await.is_ok());
        assert!(matches!(
            store.get(&key).await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
