//! The hot tier: this process's live engines.
//!
//! Every document has at most one slot. The slot's mutex is the per-document
//! mutation lock: merges, restores, flush bookkeeping and eviction all run
//! while holding it, so they never interleave for one document. Documents do
//! not share locks.
//!
//! Slot lifecycle:
//! ```text
//! Unloaded ──load──► Ready ──evict──► Evicted (removed from the arena)
//! ```
//! A caller that locks a slot and finds it `Evicted` lost a race with
//! teardown; it drops the slot and retries against a fresh one.
//!
//! Lock order is slot, then arena map. The arena map lock is never held
//! while waiting for a slot.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{Mutex, RwLock};

use crate::engine::ReplicatedDocument;
use crate::protocol::{ActorId, DocumentId, RawUpdate};
use crate::storage::cold::{PendingRecord, PersistBatch};
use crate::storage::tiers::{LoadedDocument, WarmSnapshot};

/// Hot-tier record for one document.
#[derive(Debug)]
pub struct DocumentEntry {
    pub(crate) engine: ReplicatedDocument,
    pub(crate) version: u64,
    /// Highest version known to be in the cold tier.
    pub(crate) persisted_version: u64,
    pub(crate) last_update_at: Option<SystemTime>,
    pub(crate) last_actor: Option<ActorId>,
    /// Local records not yet written to the cold history, oldest first.
    pub(crate) unflushed: VecDeque<PendingRecord>,
    pub(crate) persist_failures: u32,
    /// Set when an eviction had to be abandoned because its flush failed.
    pub(crate) evict_after_flush: bool,
}

impl DocumentEntry {
    pub(crate) fn from_loaded(loaded: LoadedDocument) -> Self {
        Self {
            engine: loaded.engine,
            version: loaded.version,
            persisted_version: loaded.durable_version,
            last_update_at: None,
            last_actor: loaded.last_modified_by,
            unflushed: loaded.unflushed.into(),
            persist_failures: 0,
            evict_after_flush: false,
        }
    }

    /// True iff at least one applied update is not yet durable.
    pub fn pending_persist(&self) -> bool {
        self.version > self.persisted_version
    }

    /// Bookkeeping for a successful local merge: the version must already be
    /// bumped to `update.version`.
    pub(crate) fn record_local(&mut self, update: &RawUpdate, limit: usize) -> PendingRecord {
        let record = PendingRecord::new(update.clone());
        self.unflushed.push_back(record.clone());
        while self.unflushed.len() > limit {
            self.unflushed.pop_front();
        }
        self.last_actor = Some(update.actor);
        self.last_update_at = Some(SystemTime::now());
        record
    }

    /// Adopt a sibling's update already merged into the engine.
    pub(crate) fn record_remote(&mut self, version: u64) {
        let was_clean = !self.pending_persist();
        self.version = self.version.max(version);
        if was_clean {
            self.persisted_version = self.version;
        }
        self.last_update_at = Some(SystemTime::now());
    }

    pub(crate) fn warm_snapshot(&self) -> WarmSnapshot {
        WarmSnapshot {
            version: self.version,
            durable_version: self.persisted_version,
            state: self.engine.encode_full(),
        }
    }

    pub(crate) fn persist_batch(&self, document: DocumentId, retention: usize) -> PersistBatch {
        PersistBatch {
            document,
            state: self.engine.encode_full(),
            version: self.version,
            last_modified_by: self.last_actor,
            records: self.unflushed.iter().cloned().collect(),
            retention,
        }
    }

    /// Everything up to `version` reached the cold tier.
    pub(crate) fn mark_persisted(&mut self, version: u64) {
        self.persisted_version = self.persisted_version.max(version);
        self.unflushed.retain(|record| record.update.version > version);
        self.persist_failures = 0;
    }
}

pub(crate) enum SlotState {
    Unloaded,
    Ready(DocumentEntry),
    Evicted,
}

impl SlotState {
    pub(crate) fn ready_mut(&mut self) -> Option<&mut DocumentEntry> {
        match self {
            SlotState::Ready(entry) => Some(entry),
            _ => None,
        }
    }
}

pub(crate) type Slot = Arc<Mutex<SlotState>>;

/// Reference arena of slots keyed by document id.
#[derive(Default)]
pub(crate) struct HotArena {
    slots: RwLock<HashMap<DocumentId, Slot>>,
}

impl HotArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Existing slot for `document`, or a fresh `Unloaded` one.
    pub(crate) async fn slot(&self, document: DocumentId) -> Slot {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(&document) {
                return Arc::clone(slot);
            }
        }

        let mut slots = self.slots.write().await;
        Arc::clone(
            slots
                .entry(document)
                .or_insert_with(|| Arc::new(Mutex::new(SlotState::Unloaded))),
        )
    }

    pub(crate) async fn existing(&self, document: DocumentId) -> Option<Slot> {
        self.slots.read().await.get(&document).cloned()
    }

    /// Remove `slot` if it is still the one registered for `document`.
    pub(crate) async fn remove_if_same(&self, document: DocumentId, slot: &Slot) -> bool {
        let mut slots = self.slots.write().await;
        match slots.get(&document) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                slots.remove(&document);
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn documents(&self) -> Vec<DocumentId> {
        self.slots.read().await.keys().copied().collect()
    }

    pub(crate) async fn drain(&self) -> Vec<(DocumentId, Slot)> {
        self.slots.write().await.drain().collect()
    }
}
