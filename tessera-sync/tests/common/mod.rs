//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tessera_sync::{
    ColdStore, DocumentId, HistoryEntry, MemoryColdStore, MemoryWarmCache, PersistBatch,
    PropagationBus, RawUpdate, ReplicatedDocument, StoreError, StoredDocument, SyncConfig,
    SyncCore,
};

pub const ROOT: &str = "content";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Cold store whose writes can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryColdStore,
    failing: AtomicBool,
    failed_writes: AtomicU64,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.inner.write_count()
    }
}

impl ColdStore for FlakyStore {
    fn load(&self, document: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        self.inner.load(document)
    }

    fn persist(&self, batch: &PersistBatch) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            self.failed_writes.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.inner.persist(batch)
    }

    fn history(&self, document: DocumentId, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        self.inner.history(document, limit)
    }

    fn updates(&self, document: DocumentId) -> Result<Vec<RawUpdate>, StoreError> {
        self.inner.updates(document)
    }
}

/// Shared collaborators for several cores: one warm cache, one cold store
/// and one propagation bus, as several server processes would share them.
pub struct Cluster {
    pub warm: Arc<MemoryWarmCache>,
    pub cold: Arc<FlakyStore>,
    pub bus: Arc<PropagationBus>,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_bus_capacity(256)
    }

    /// A cluster whose bus retains only `capacity` notices per subscriber.
    pub fn with_bus_capacity(capacity: usize) -> Self {
        init_logging();
        Self {
            warm: Arc::new(MemoryWarmCache::with_defaults()),
            cold: Arc::new(FlakyStore::new()),
            bus: Arc::new(PropagationBus::new("doc-updates", capacity)),
        }
    }

    /// A core with production timings.
    pub fn core(&self) -> SyncCore {
        self.core_with(SyncConfig::default())
    }

    pub fn core_with(&self, config: SyncConfig) -> SyncCore {
        SyncCore::new(config, self.warm.clone(), self.cold.clone(), self.bus.clone()).unwrap()
    }
}

pub fn state_key(document: DocumentId) -> String {
    format!("doc:{document}:state")
}

/// Text of the root `content` in an encoded full state.
pub fn text_of(state: &[u8]) -> String {
    ReplicatedDocument::from_state(state).unwrap().text(ROOT)
}

/// Let background tasks (propagation listeners, flush workers) run.
pub async fn settle() {
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
