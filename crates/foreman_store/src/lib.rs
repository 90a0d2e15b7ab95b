//! Result store: persist artifacts, answer owner-scoped lookups, expire
//! old content.
//!
//! Small artifacts live inline on the record; large ones (or those whose
//! worker prefers it) go to a blob backend behind a locator. Lookups run
//! cache-through over an LRU keyed by `(owner, result_id)`. Ownership is
//! absolute: a mismatched owner sees `NotFound`, never a permission
//! error, so existence does not leak.

pub mod blob;

use chrono::Utc;
use foreman_protocol::{
    sha256_hex, FailureInfo, RequestId, ResultBody, ResultId, StoreError, StoredResult,
};
use foreman_state::{StateError, StateStore};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info};

pub use blob::{BlobBackend, FsBlobBackend, MemoryBlobBackend};

/// Result store tunables.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Bodies at or below this many bytes stay inline.
    pub inline_threshold: usize,
    pub cache_entries: usize,
    pub cache_ttl: Duration,
    /// Results older than this are swept.
    pub retention: Duration,
    /// Cadence of the retention sweep.
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        use foreman_protocol::defaults::*;
        Self {
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
            cache_entries: DEFAULT_RESULT_CACHE_ENTRIES,
            cache_ttl: Duration::from_secs(DEFAULT_RESULT_CACHE_TTL_SECS),
            retention: Duration::from_secs(DEFAULT_RESULT_RETENTION_SECS),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Storage hints derived from the executing worker's routing flags.
#[derive(Debug, Clone, Default)]
pub struct PutHints {
    pub prefer_pointer: bool,
    pub content_type: String,
}

struct CachedResult {
    result: StoredResult,
    cached_at: Instant,
}

pub struct ResultStore {
    state: Arc<dyn StateStore>,
    blobs: Arc<dyn BlobBackend>,
    cache: Mutex<LruCache<(String, ResultId), CachedResult>>,
    config: StoreConfig,
}

impl ResultStore {
    pub fn new(
        state: Arc<dyn StateStore>,
        blobs: Arc<dyn BlobBackend>,
        config: StoreConfig,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(config.cache_entries.max(1)).expect("max(1) is non-zero");
        Self {
            state,
            blobs,
            cache: Mutex::new(LruCache::new(capacity)),
            config,
        }
    }

    /// Store an artifact for `request_id`, choosing inline vs pointer by
    /// size threshold and worker hints.
    pub async fn put(
        &self,
        owner: &str,
        request_id: &RequestId,
        bytes: Vec<u8>,
        hints: PutHints,
    ) -> Result<StoredResult, StoreError> {
        let size = bytes.len() as u64;
        let checksum = sha256_hex(&bytes);
        let content_type = if hints.content_type.is_empty() {
            "application/octet-stream".to_string()
        } else {
            hints.content_type
        };

        let body = if hints.prefer_pointer || bytes.len() > self.config.inline_threshold {
            let locator = self.blobs.write(&bytes).await?;
            debug!(%owner, request = %request_id, %locator, size, "stored pointer result");
            ResultBody::Pointer {
                locator,
                content_type,
            }
        } else {
            ResultBody::Inline {
                bytes,
                content_type,
            }
        };

        let result = StoredResult {
            id: ResultId::new(),
            request_id: request_id.clone(),
            owner: owner.to_string(),
            kind: body.kind(),
            body,
            created_at: Utc::now(),
            size,
            checksum,
        };
        self.persist(result).await
    }

    /// Store a typed failure as the terminal artifact of a request.
    pub async fn put_failure(
        &self,
        owner: &str,
        request_id: &RequestId,
        failure: FailureInfo,
    ) -> Result<StoredResult, StoreError> {
        let result = StoredResult {
            id: ResultId::new(),
            request_id: request_id.clone(),
            owner: owner.to_string(),
            kind: foreman_protocol::ResultKind::Error,
            body: ResultBody::Error { failure },
            created_at: Utc::now(),
            size: 0,
            checksum: String::new(),
        };
        self.persist(result).await
    }

    async fn persist(&self, result: StoredResult) -> Result<StoredResult, StoreError> {
        self.state.put_result(&result).await.map_err(to_store_err)?;
        self.cache_insert(&result);
        Ok(result)
    }

    /// Owner-scoped fetch, cache-through.
    pub async fn get(&self, owner: &str, id: &ResultId) -> Result<StoredResult, StoreError> {
        if let Some(result) = self.cache_lookup(owner, id) {
            return Ok(result);
        }
        let result = self
            .state
            .get_result(owner, id)
            .await
            .map_err(to_store_err)?
            .ok_or(StoreError::NotFound)?;
        self.cache_insert(&result);
        Ok(result)
    }

    /// Materialize the artifact bytes behind a result. Pointer bodies are
    /// read from the blob backend and checked against the checksum.
    pub async fn resolve_bytes(&self, result: &StoredResult) -> Result<Vec<u8>, StoreError> {
        match &result.body {
            ResultBody::Inline { bytes, .. } => Ok(bytes.clone()),
            ResultBody::Pointer { locator, .. } => {
                let bytes = self.blobs.read(locator).await?;
                if sha256_hex(&bytes) != result.checksum {
                    return Err(StoreError::Blob(format!(
                        "checksum mismatch for {locator}"
                    )));
                }
                Ok(bytes)
            }
            ResultBody::Error { .. } => {
                Err(StoreError::Blob("result carries no artifact".to_string()))
            }
        }
    }

    /// Page through an owner's results, newest first. The cursor is
    /// opaque; pass the returned value back to continue.
    pub async fn list_by_owner(
        &self,
        owner: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<(Vec<StoredResult>, Option<String>), StoreError> {
        let offset: usize = match cursor {
            Some(raw) => raw
                .parse()
                .map_err(|_| StoreError::Backend(format!("bad cursor: {raw}")))?,
            None => 0,
        };
        let page = self
            .state
            .list_results(owner, offset, limit)
            .await
            .map_err(to_store_err)?;
        let next = (page.len() == limit).then(|| (offset + limit).to_string());
        Ok((page, next))
    }

    /// Delete a result. Idempotent; also removes the pointer blob.
    pub async fn delete(&self, owner: &str, id: &ResultId) -> Result<(), StoreError> {
        let existing = self
            .state
            .get_result(owner, id)
            .await
            .map_err(to_store_err)?;
        if let Some(result) = existing {
            if let ResultBody::Pointer { locator, .. } = &result.body {
                self.blobs.remove(locator).await?;
            }
            self.state
                .delete_result(owner, id)
                .await
                .map_err(to_store_err)?;
        }
        self.cache
            .lock()
            .expect("result cache lock poisoned")
            .pop(&(owner.to_string(), id.clone()));
        Ok(())
    }

    /// Sweep results older than the retention window. Returns how many
    /// records were removed.
    pub async fn cleanup(&self, older_than: Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        let expired = self
            .state
            .expire_results(cutoff)
            .await
            .map_err(to_store_err)?;
        let count = expired.len();
        {
            let mut cache = self.cache.lock().expect("result cache lock poisoned");
            for result in &expired {
                cache.pop(&(result.owner.clone(), result.id.clone()));
            }
        }
        for result in &expired {
            if let ResultBody::Pointer { locator, .. } = &result.body {
                self.blobs.remove(locator).await?;
            }
        }
        if count > 0 {
            info!(count, "retention sweep removed results");
        }
        Ok(count)
    }

    /// Background retention sweep until `shutdown` flips true.
    pub async fn run_retention_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cleanup(self.config.retention).await {
                        tracing::warn!(error = %e, "retention sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("retention loop stopping");
                        return;
                    }
                }
            }
        }
    }

    fn cache_lookup(&self, owner: &str, id: &ResultId) -> Option<StoredResult> {
        let mut cache = self.cache.lock().expect("result cache lock poisoned");
        let key = (owner.to_string(), id.clone());
        let hit = cache
            .get(&key)
            .map(|entry| (entry.result.clone(), entry.cached_at.elapsed()));
        match hit {
            Some((result, age)) if age <= self.config.cache_ttl => Some(result),
            Some(_) => {
                cache.pop(&key);
                None
            }
            None => None,
        }
    }

    fn cache_insert(&self, result: &StoredResult) {
        let mut cache = self.cache.lock().expect("result cache lock poisoned");
        cache.put(
            (result.owner.clone(), result.id.clone()),
            CachedResult {
                result: result.clone(),
                cached_at: Instant::now(),
            },
        );
    }
}

fn to_store_err(e: StateError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_protocol::ResultKind;
    use foreman_state::MemoryStateStore;

    fn store() -> (ResultStore, Arc<MemoryBlobBackend>) {
        let blobs = Arc::new(MemoryBlobBackend::new());
        let state = Arc::new(MemoryStateStore::new());
        (
            ResultStore::new(state, blobs.clone(), StoreConfig::default()),
            blobs,
        )
    }

    #[tokio::test]
    async fn test_small_result_stays_inline() {
        let (store, blobs) = store();
        let request_id = RequestId::new();
        let result = store
            .put("alice", &request_id, vec![7u8; 1024], PutHints::default())
            .await
            .unwrap();
        assert_eq!(result.kind, ResultKind::Inline);
        assert_eq!(result.size, 1024);
        assert!(blobs.is_empty());
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let (store, blobs) = store();
        let threshold = StoreConfig::default().inline_threshold;

        let at = store
            .put("alice", &RequestId::new(), vec![0u8; threshold], PutHints::default())
            .await
            .unwrap();
        assert_eq!(at.kind, ResultKind::Inline);

        // One byte over goes to the blob backend.
        let over = store
            .put(
                "alice",
                &RequestId::new(),
                vec![0u8; threshold + 1],
                PutHints::default(),
            )
            .await
            .unwrap();
        assert_eq!(over.kind, ResultKind::Pointer);
        assert_eq!(over.size, (threshold + 1) as u64);
        assert_eq!(blobs.len(), 1);
    }

    #[tokio::test]
    async fn test_prefer_pointer_hint_wins() {
        let (store, blobs) = store();
        let result = store
            .put(
                "alice",
                &RequestId::new(),
                b"tiny".to_vec(),
                PutHints {
                    prefer_pointer: true,
                    content_type: "application/json".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.kind, ResultKind::Pointer);
        assert_eq!(blobs.len(), 1);
        assert_eq!(store.resolve_bytes(&result).await.unwrap(), b"tiny");
    }

    #[tokio::test]
    async fn test_pointer_checksum_roundtrip() {
        let (store, _blobs) = store();
        let megabyte = vec![0xA5u8; 1024 * 1024];
        let result = store
            .put(
                "alice",
                &RequestId::new(),
                megabyte.clone(),
                PutHints {
                    prefer_pointer: true,
                    content_type: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(result.size, 1024 * 1024);
        assert_eq!(result.checksum, sha256_hex(&megabyte));
        assert_eq!(store.resolve_bytes(&result).await.unwrap(), megabyte);
    }

    #[tokio::test]
    async fn test_owner_mismatch_is_not_found() {
        let (store, _blobs) = store();
        let result = store
            .put("alice", &RequestId::new(), b"secret".to_vec(), PutHints::default())
            .await
            .unwrap();
        assert_eq!(
            store.get("mallory", &result.id).await,
            Err(StoreError::NotFound)
        );
        assert!(store.get("alice", &result.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_drops_blob() {
        let (store, blobs) = store();
        let result = store
            .put(
                "alice",
                &RequestId::new(),
                b"pointer me".to_vec(),
                PutHints {
                    prefer_pointer: true,
                    content_type: String::new(),
                },
            )
            .await
            .unwrap();
        assert_eq!(blobs.len(), 1);
        store.delete("alice", &result.id).await.unwrap();
        store.delete("alice", &result.id).await.unwrap();
        assert!(blobs.is_empty());
        assert_eq!(
            store.get("alice", &result.id).await,
            Err(StoreError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_list_by_owner_pages() {
        let (store, _blobs) = store();
        for _ in 0..5 {
            store
                .put("alice", &RequestId::new(), b"r".to_vec(), PutHints::default())
                .await
                .unwrap();
        }
        let (page1, cursor) = store.list_by_owner("alice", None, 3).await.unwrap();
        assert_eq!(page1.len(), 3);
        let cursor = cursor.unwrap();
        let (page2, cursor2) = store
            .list_by_owner("alice", Some(&cursor), 3)
            .await
            .unwrap();
        assert_eq!(page2.len(), 2);
        assert!(cursor2.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_honors_retention() {
        let (store, _blobs) = store();
        store
            .put("alice", &RequestId::new(), b"fresh".to_vec(), PutHints::default())
            .await
            .unwrap();
        // Nothing is old enough yet.
        assert_eq!(store.cleanup(Duration::from_secs(3600)).await.unwrap(), 0);
        // Zero retention sweeps everything.
        assert_eq!(store.cleanup(Duration::ZERO).await.unwrap(), 1);
        let (page, _) = store.list_by_owner("alice", None, 10).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_error_result_has_no_artifact() {
        let (store, _blobs) = store();
        let failure = FailureInfo {
            kind: foreman_protocol::ErrorKind::JobTimeout,
            message: "deadline exceeded".to_string(),
        };
        let result = store
            .put_failure("alice", &RequestId::new(), failure)
            .await
            .unwrap();
        assert_eq!(result.kind, ResultKind::Error);
        assert!(store.resolve_bytes(&result).await.is_err());
    }
}
