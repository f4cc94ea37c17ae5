//! The document sync facade.
//!
//! Architecture:
//! ```text
//!  add_client / apply_update / get_diff / restore_version ...
//!        │
//!        ▼
//! ┌──────────────┐   ┌──────────┐   ┌─────────────┐   ┌──────────────┐
//! │ SessionTrack │──►│ HotArena │──►│ Replicated  │──►│ HistoryLog   │
//! │ (membership) │   │ (load)   │   │ Document    │   │ (record)     │
//! └──────────────┘   └────┬─────┘   └──────┬──────┘   └──────┬───────┘
//!                         │ miss           │ merged          │
//!                         ▼                ▼                 ▼
//!                    TieredCache     PropagationBus    PersistenceScheduler
//!                    warm → cold     (siblings)        (debounced flush)
//! ```
//!
//! A [`SyncCore`] owns two background tasks: the persistence worker, which
//! flushes documents whose debounce timer fired, and the propagation
//! listener, which merges sibling updates into documents held hot here.
//! Both hold only a weak reference to the core and stop when it is dropped
//! or shut down.

use futures_util::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::SystemTime;
use tokio::sync::{broadcast, mpsc, OwnedMappedMutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::history::HistoryLog;
use crate::hot::{DocumentEntry, HotArena, SlotState};
use crate::propagation::PropagationBus;
use crate::protocol::{
    ActorId, ClientId, DocumentId, HistoryEntry, RawUpdate, ReplicaId, SyncReply, UpdateNotice,
};
use crate::scheduler::PersistenceScheduler;
use crate::session::{Detach, SessionTracker};
use crate::storage::cold::{ColdStore, StoreError};
use crate::storage::tiers::{Tier, TieredCache};
use crate::storage::warm::WarmCache;

type EntryGuard = OwnedMappedMutexGuard<SlotState, DocumentEntry>;

/// Result of flushing one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Written to the cold tier through `version`.
    Persisted { version: u64 },
    /// Nothing pending.
    Clean,
    /// Not held hot by this core.
    NotLoaded,
}

/// Result of [`SyncCore::persist_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub persisted: Vec<DocumentId>,
    pub clean: usize,
    pub failed: Vec<DocumentId>,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn absorb(&mut self, document: DocumentId, outcome: &Result<FlushOutcome>) {
        match outcome {
            Ok(FlushOutcome::Persisted { .. }) => self.persisted.push(document),
            Ok(FlushOutcome::Clean) | Ok(FlushOutcome::NotLoaded) => self.clean += 1,
            Err(_) => self.failed.push(document),
        }
    }
}

/// Point-in-time view of a hot document.
#[derive(Debug, Clone)]
pub struct DocumentView {
    pub document: DocumentId,
    pub version: u64,
    /// Full encoded state.
    pub state: Vec<u8>,
    pub state_vector: Vec<u8>,
    pub client_count: usize,
    /// `Hot` if the document was already loaded, otherwise the tier that
    /// served this call.
    pub source: Tier,
    pub pending_persist: bool,
    pub last_update_at: Option<SystemTime>,
    pub last_modified_by: Option<ActorId>,
}

/// One process's sync core. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncCore {
    inner: Arc<CoreInner>,
}

struct CoreInner {
    replica: ReplicaId,
    config: SyncConfig,
    hot: HotArena,
    tiers: Arc<TieredCache>,
    history: HistoryLog,
    scheduler: PersistenceScheduler,
    sessions: SessionTracker,
    bus: Arc<PropagationBus>,
    shut_down: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SyncCore {
    /// Build a core over shared warm, cold and propagation collaborators.
    ///
    /// Must be called inside a tokio runtime: the background tasks are
    /// spawned here.
    pub fn new(
        config: SyncConfig,
        warm: Arc<dyn WarmCache>,
        cold: Arc<dyn ColdStore>,
        bus: Arc<PropagationBus>,
    ) -> Result<Self> {
        config.validate()?;

        let tiers = Arc::new(TieredCache::new(
            warm,
            cold,
            config.warm_ttl,
            config.fallback_ttl,
        ));
        let (scheduler, fired) = PersistenceScheduler::new(config.debounce);
        let notices = bus.subscribe();

        let inner = Arc::new(CoreInner {
            replica: ReplicaId::random(),
            history: HistoryLog::new(Arc::clone(&tiers), config.history_limit),
            config,
            hot: HotArena::new(),
            tiers,
            scheduler,
            sessions: SessionTracker::new(),
            bus,
            shut_down: AtomicBool::new(false),
            tasks: StdMutex::new(Vec::new()),
        });

        let worker = tokio::spawn(persistence_worker(Arc::downgrade(&inner), fired));
        let listener = tokio::spawn(propagation_listener(Arc::downgrade(&inner), notices));
        inner
            .tasks
            .lock()
            .map_err(|_| SyncError::Worker("task registry poisoned".into()))?
            .extend([worker, listener]);

        log::info!(
            "sync core {} started on channel '{}'",
            inner.replica,
            inner.bus.channel()
        );
        Ok(Self { inner })
    }

    /// Load (if needed) and describe `document`.
    pub async fn get_document(&self, document: DocumentId) -> Result<DocumentView> {
        let client_count = self.inner.sessions.client_count(document).await;
        let (entry, source) = self.inner.acquire(document).await?;
        Ok(DocumentView {
            document,
            version: entry.version,
            state: entry.engine.encode_full(),
            state_vector: entry.engine.state_vector(),
            client_count,
            source,
            pending_persist: entry.pending_persist(),
            last_update_at: entry.last_update_at,
            last_modified_by: entry.last_actor,
        })
    }

    /// Merge a client update. Returns the update tagged with the version it
    /// produced.
    ///
    /// A malformed update fails with [`SyncError::Decode`] and leaves the
    /// document untouched.
    pub async fn apply_update(
        &self,
        document: DocumentId,
        actor: ActorId,
        update: Vec<u8>,
    ) -> Result<RawUpdate> {
        self.inner.apply_local(document, actor, update).await
    }

    /// Operations a client at `state_vector` is missing, plus the version
    /// they bring it to. An empty vector yields the full state.
    pub async fn get_diff(&self, document: DocumentId, state_vector: &[u8]) -> Result<SyncReply> {
        let (entry, _) = self.inner.acquire(document).await?;
        let diff = entry
            .engine
            .diff(state_vector)
            .map_err(|e| SyncError::decode(document, e))?;
        Ok(SyncReply {
            diff,
            version: entry.version,
        })
    }

    pub async fn get_full_state(&self, document: DocumentId) -> Result<Vec<u8>> {
        let (entry, _) = self.inner.acquire(document).await?;
        Ok(entry.engine.encode_full())
    }

    pub async fn get_state_vector(&self, document: DocumentId) -> Result<Vec<u8>> {
        let (entry, _) = self.inner.acquire(document).await?;
        Ok(entry.engine.state_vector())
    }

    /// Re-arm the debounce timer of a hot document. Documents not held hot
    /// are left alone.
    pub async fn schedule_persist(&self, document: DocumentId) -> Result<()> {
        self.inner.ensure_running()?;
        if self.inner.hot.existing(document).await.is_some() {
            self.inner.scheduler.schedule(document).await;
        }
        Ok(())
    }

    /// Cancel the debounce timer and write the full state now.
    pub async fn flush_now(&self, document: DocumentId) -> Result<FlushOutcome> {
        self.inner.ensure_running()?;
        self.inner.flush_now(document).await
    }

    /// Replay retained history up to `target` and apply the result as a new
    /// forward update authored by `actor`.
    ///
    /// Fails with [`SyncError::VersionNotRetained`], leaving the document
    /// unchanged, if `target` predates the retained history.
    pub async fn restore_version(
        &self,
        document: DocumentId,
        target: u64,
        actor: ActorId,
    ) -> Result<RawUpdate> {
        self.inner.ensure_running()?;
        let replayed = self.inner.history.replay_to(document, target).await?;
        let state = replayed.encode_full();
        replayed.destroy();

        let update = self.inner.apply_local(document, actor, state).await?;
        log::info!(
            "document {document} restored to v{target} by {actor}, now at v{}",
            update.version
        );
        Ok(update)
    }

    /// Attach `client` and make sure the document is hot. Returns the number
    /// of attached clients.
    pub async fn add_client(&self, document: DocumentId, client: ClientId) -> Result<usize> {
        self.inner.ensure_running()?;
        let count = self.inner.sessions.attach(document, client).await;
        match self.inner.acquire(document).await {
            Ok((mut entry, _)) => {
                entry.evict_after_flush = false;
                log::debug!("client {client} attached to {document} ({count} attached)");
                Ok(count)
            }
            Err(e) => {
                self.inner.sessions.detach(document, client).await;
                Err(e)
            }
        }
    }

    /// Detach `client`. When the last client leaves, the document is flushed
    /// and evicted; a failed flush keeps it hot and is reported here.
    pub async fn remove_client(&self, document: DocumentId, client: ClientId) -> Result<Detach> {
        self.inner.ensure_running()?;
        let detach = self.inner.sessions.detach(document, client).await;
        log::debug!("client {client} detached from {document}: {detach:?}");
        if detach == Detach::LastClientLeft {
            self.inner.evict(document).await?;
        }
        Ok(detach)
    }

    /// Flush every hot document with pending changes, concurrently.
    pub async fn persist_all(&self) -> Result<FlushReport> {
        self.inner.ensure_running()?;
        Ok(self.inner.flush_all().await)
    }

    /// Stop the core: cancel timers, flush everything, destroy every engine
    /// and clear all maps. Later calls fail with [`SyncError::ShutDown`].
    ///
    /// Fails with [`SyncError::PartialFlush`] if any document could not be
    /// written; the teardown still completes.
    pub async fn shutdown(&self) -> Result<FlushReport> {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return Err(SyncError::ShutDown);
        }
        let inner = &self.inner;
        let cancelled = inner.scheduler.cancel_all().await;

        // Every slot is flushed and destroyed under its own lock, so a merge
        // that was in flight when the flag flipped is still persisted.
        let slots = inner.hot.drain().await;
        let outcomes = join_all(slots.iter().map(|(document, slot)| async move {
            let mut guard = slot.lock().await;
            let outcome = match guard.ready_mut() {
                Some(entry) if entry.pending_persist() => {
                    inner.flush_locked(*document, entry).await
                }
                Some(_) => Ok(FlushOutcome::Clean),
                None => Ok(FlushOutcome::NotLoaded),
            };
            if let SlotState::Ready(entry) = std::mem::replace(&mut *guard, SlotState::Evicted) {
                entry.engine.destroy();
            }
            outcome
        }))
        .await;

        let mut report = FlushReport::default();
        for ((document, _), outcome) in slots.iter().zip(&outcomes) {
            report.absorb(*document, outcome);
        }
        inner.sessions.clear().await;
        inner.scheduler.cancel_all().await;
        inner.abort_tasks();

        log::info!(
            "sync core {} shut down: {} timers cancelled, {} documents destroyed, {} persisted, {} failed",
            inner.replica,
            cancelled,
            slots.len(),
            report.persisted.len(),
            report.failed.len()
        );
        if report.is_complete() {
            Ok(report)
        } else {
            Err(SyncError::PartialFlush {
                failed: report.failed,
            })
        }
    }

    /// Newest-first history of `document`, from the warm and cold tiers.
    pub async fn history(&self, document: DocumentId, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.inner.history.list(document, limit).await
    }

    pub async fn client_count(&self, document: DocumentId) -> usize {
        self.inner.sessions.client_count(document).await
    }

    /// Version of the hot entry, if this core holds `document`.
    pub async fn version(&self, document: DocumentId) -> Option<u64> {
        self.inner.inspect(document, |entry| entry.version).await
    }

    /// Whether the hot entry has changes not yet in the cold tier.
    pub async fn pending_persist(&self, document: DocumentId) -> bool {
        self.inner
            .inspect(document, DocumentEntry::pending_persist)
            .await
            .unwrap_or(false)
    }

    /// Version last mirrored to the warm tier by any process.
    pub fn polled_version(&self, document: DocumentId) -> Option<u64> {
        self.inner.tiers.polled_version(document)
    }

    pub async fn is_hot(&self, document: DocumentId) -> bool {
        self.version(document).await.is_some()
    }

    pub async fn hot_documents(&self) -> Vec<DocumentId> {
        self.inner.hot.documents().await
    }

    pub fn replica(&self) -> ReplicaId {
        self.inner.replica
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn bus(&self) -> &Arc<PropagationBus> {
        &self.inner.bus
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shut_down()
    }
}

impl CoreInner {
    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Read a hot entry without loading it.
    async fn inspect<R>(
        &self,
        document: DocumentId,
        f: impl FnOnce(&DocumentEntry) -> R,
    ) -> Option<R> {
        let slot = self.hot.existing(document).await?;
        let mut guard = slot.lock().await;
        guard.ready_mut().map(|entry| f(entry))
    }

    /// Lock the hot entry of `document`, loading it on a miss.
    ///
    /// Also returns where the entry came from on this call.
    async fn acquire(&self, document: DocumentId) -> Result<(EntryGuard, Tier)> {
        loop {
            self.ensure_running()?;
            let slot = self.hot.slot(document).await;
            let mut guard = Arc::clone(&slot).lock_owned().await;

            if self.is_shut_down() {
                let unloaded = matches!(*guard, SlotState::Unloaded);
                drop(guard);
                if unloaded {
                    self.hot.remove_if_same(document, &slot).await;
                }
                return Err(SyncError::ShutDown);
            }

            let mut source = Tier::Hot;
            if matches!(*guard, SlotState::Unloaded) {
                match self.tiers.load(document).await {
                    Ok(loaded) => {
                        source = loaded.tier;
                        *guard = SlotState::Ready(DocumentEntry::from_loaded(loaded));
                    }
                    Err(e) => {
                        *guard = SlotState::Evicted;
                        drop(guard);
                        self.hot.remove_if_same(document, &slot).await;
                        return Err(e);
                    }
                }
            }

            match OwnedMutexGuard::try_map(guard, SlotState::ready_mut) {
                Ok(entry) => {
                    if source != Tier::Hot && entry.pending_persist() {
                        // Warm state newer than the cold tier: finish its flush.
                        self.scheduler.schedule(document).await;
                    }
                    return Ok((entry, source));
                }
                Err(stale) => {
                    drop(stale);
                    self.hot.remove_if_same(document, &slot).await;
                }
            }
        }
    }

    async fn apply_local(
        &self,
        document: DocumentId,
        actor: ActorId,
        bytes: Vec<u8>,
    ) -> Result<RawUpdate> {
        let (mut entry, _) = self.acquire(document).await?;

        if let Err(e) = entry.engine.merge(&bytes) {
            log::warn!("rejected update from {actor} to {document}: {e}");
            return Err(SyncError::decode(document, e));
        }
        entry.version += 1;
        let update = RawUpdate::new(entry.version, actor, bytes);
        let record = entry.record_local(&update, self.config.history_limit);

        self.tiers.mirror(document, &entry.warm_snapshot());
        self.history.record(document, &record);
        self.publish(document, &update);
        drop(entry);

        self.scheduler.schedule(document).await;
        log::debug!(
            "applied {} bytes from {actor} to {document} at v{}",
            update.byte_size(),
            update.version
        );
        Ok(update)
    }

    fn publish(&self, document: DocumentId, update: &RawUpdate) {
        let notice = UpdateNotice {
            origin: self.replica,
            document,
            update: update.clone(),
        };
        match self.bus.publish(&notice) {
            Ok(receivers) => log::debug!(
                "published {document} v{} to {receivers} receivers",
                update.version
            ),
            Err(e) => log::warn!("publish of {document} v{} failed: {e}", update.version),
        }
    }

    /// Merge a sibling's update into a document held hot here. Never loads.
    async fn apply_remote(&self, notice: UpdateNotice) {
        if notice.origin == self.replica || self.is_shut_down() {
            return;
        }
        let Some(slot) = self.hot.existing(notice.document).await else {
            return;
        };
        let mut guard = slot.lock().await;
        let Some(entry) = guard.ready_mut() else {
            return;
        };

        let parked_before = entry.engine.has_missing();
        match entry.engine.merge(&notice.update.bytes) {
            Ok(()) if !parked_before && entry.engine.has_missing() => {
                log::info!(
                    "v{} of {} from replica {} arrived ahead of its predecessors",
                    notice.update.version,
                    notice.document,
                    notice.origin
                );
                self.resync(notice.document, entry);
            }
            Ok(()) => {
                entry.record_remote(notice.update.version);
                log::debug!(
                    "merged v{} of {} from replica {}",
                    notice.update.version,
                    notice.document,
                    notice.origin
                );
            }
            Err(e) => log::warn!(
                "dropping undecodable update for {} from replica {}: {e}",
                notice.document,
                notice.origin
            ),
        }
    }

    /// Catch a hot entry up from the warm mirror after missed notices.
    ///
    /// The mirror is a full state, so once it merges the engine holds
    /// everything up to the mirror's version and may adopt it. Without a
    /// usable mirror the version is left alone.
    fn resync(&self, document: DocumentId, entry: &mut DocumentEntry) {
        let Some(snapshot) = self.tiers.warm_snapshot(document) else {
            log::warn!("no warm mirror to resync {document} from");
            return;
        };
        if let Err(e) = entry.engine.merge(&snapshot.state) {
            log::warn!("warm mirror of {document} unusable for resync: {e}");
            return;
        }
        entry.record_remote(snapshot.version);
        if entry.engine.has_missing() {
            log::debug!("{document} still holds operations waiting on predecessors");
        }
        log::debug!("resynced {document} to v{}", entry.version);
    }

    /// Resync every hot entry; run after the listener dropped notices.
    async fn resync_hot(&self) {
        for document in self.hot.documents().await {
            let Some(slot) = self.hot.existing(document).await else {
                continue;
            };
            let mut guard = slot.lock().await;
            if let Some(entry) = guard.ready_mut() {
                self.resync(document, entry);
            }
        }
    }

    async fn flush_now(&self, document: DocumentId) -> Result<FlushOutcome> {
        self.scheduler.cancel(document).await;
        self.flush(document).await
    }

    async fn flush_all(&self) -> FlushReport {
        let documents = self.hot.documents().await;
        let outcomes = join_all(documents.iter().map(|document| self.flush_now(*document))).await;

        let mut report = FlushReport::default();
        for (document, outcome) in documents.into_iter().zip(&outcomes) {
            report.absorb(document, outcome);
        }
        report
    }

    /// Flush without holding the slot lock across the durable write.
    async fn flush(&self, document: DocumentId) -> Result<FlushOutcome> {
        let Some(slot) = self.hot.existing(document).await else {
            return Ok(FlushOutcome::NotLoaded);
        };

        let batch = {
            let mut guard = slot.lock().await;
            let Some(entry) = guard.ready_mut() else {
                return Ok(FlushOutcome::NotLoaded);
            };
            if !entry.pending_persist() {
                return Ok(FlushOutcome::Clean);
            }
            entry.persist_batch(document, self.config.history_limit)
        };
        let version = batch.version;
        let result = self.tiers.persist(batch).await;

        let outcome = {
            let mut guard = slot.lock().await;
            match guard.ready_mut() {
                Some(entry) => self.settle_flush(document, entry, version, result),
                // Evicted meanwhile; eviction ran its own flush.
                None => result
                    .map(|()| FlushOutcome::Persisted { version })
                    .map_err(|source| SyncError::Persistence { document, source }),
            }
        };
        if outcome.is_err() && !self.is_shut_down() {
            self.scheduler.schedule(document).await;
        }
        outcome
    }

    /// Flush while the caller holds the slot lock.
    async fn flush_locked(
        &self,
        document: DocumentId,
        entry: &mut DocumentEntry,
    ) -> Result<FlushOutcome> {
        let batch = entry.persist_batch(document, self.config.history_limit);
        let version = batch.version;
        let result = self.tiers.persist(batch).await;
        self.settle_flush(document, entry, version, result)
    }

    fn settle_flush(
        &self,
        document: DocumentId,
        entry: &mut DocumentEntry,
        version: u64,
        result: std::result::Result<(), StoreError>,
    ) -> Result<FlushOutcome> {
        match result {
            Ok(()) => {
                entry.mark_persisted(version);
                self.tiers.mirror(document, &entry.warm_snapshot());
                log::debug!("flushed {document} through v{version}");
                Ok(FlushOutcome::Persisted { version })
            }
            Err(source) => {
                entry.persist_failures += 1;
                self.tiers.mirror_fallback(document, &entry.warm_snapshot());
                if entry.persist_failures >= self.config.persist_alert_threshold {
                    log::error!(
                        "persisting {document} failed {} times in a row, latest v{}: {source}",
                        entry.persist_failures,
                        entry.version
                    );
                } else {
                    log::warn!(
                        "persisting {document} at v{version} failed (attempt {}), retrying: {source}",
                        entry.persist_failures
                    );
                }
                Err(SyncError::Persistence { document, source })
            }
        }
    }

    /// Tear down the hot entry of `document` once no client is attached.
    ///
    /// Returns `Ok(false)` if the document was not hot or got a client back.
    async fn evict(&self, document: DocumentId) -> Result<bool> {
        let Some(slot) = self.hot.existing(document).await else {
            return Ok(false);
        };
        let mut guard = slot.lock().await;
        if self.sessions.client_count(document).await > 0 {
            return Ok(false);
        }
        let Some(entry) = guard.ready_mut() else {
            return Ok(false);
        };

        self.scheduler.cancel(document).await;
        if entry.pending_persist() {
            if let Err(e) = self.flush_locked(document, entry).await {
                entry.evict_after_flush = true;
                drop(guard);
                self.scheduler.schedule(document).await;
                log::warn!("eviction of {document} postponed until it is persisted");
                return Err(e);
            }
        }

        let state = std::mem::replace(&mut *guard, SlotState::Evicted);
        self.hot.remove_if_same(document, &slot).await;
        drop(guard);
        if let SlotState::Ready(entry) = state {
            let version = entry.version;
            entry.engine.destroy();
            log::info!("document {document} evicted at v{version}");
        }
        Ok(true)
    }

    /// Debounce timer fired for `document`.
    async fn on_timer(&self, document: DocumentId) {
        if self.is_shut_down() || self.flush(document).await.is_err() {
            return;
        }

        let postponed_eviction = self
            .inspect(document, |entry| entry.evict_after_flush)
            .await
            .unwrap_or(false);
        if postponed_eviction && self.sessions.client_count(document).await == 0 {
            if let Err(e) = self.evict(document).await {
                log::warn!("postponed eviction of {document} failed: {e}");
            }
        }
    }

    fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

async fn persistence_worker(
    weak: Weak<CoreInner>,
    mut fired: mpsc::UnboundedReceiver<DocumentId>,
) {
    while let Some(document) = fired.recv().await {
        let Some(core) = weak.upgrade() else {
            break;
        };
        tokio::spawn(async move { core.on_timer(document).await });
    }
}

async fn propagation_listener(
    weak: Weak<CoreInner>,
    mut notices: broadcast::Receiver<Arc<Vec<u8>>>,
) {
    loop {
        let received = notices.recv().await;
        let Some(core) = weak.upgrade() else {
            break;
        };
        match received {
            Ok(bytes) => match UpdateNotice::decode(&bytes) {
                Ok(notice) => core.apply_remote(notice).await,
                Err(e) => {
                    core.bus.record_rejected();
                    log::warn!("undecodable notice on '{}': {e}", core.bus.channel());
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                core.bus.record_lagged(skipped);
                log::warn!(
                    "replica {} lagged {skipped} notices on '{}', resyncing hot documents",
                    core.replica,
                    core.bus.channel()
                );
                if !core.is_shut_down() {
                    core.resync_hot().await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
