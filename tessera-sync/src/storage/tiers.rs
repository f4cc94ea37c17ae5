//! Load-on-miss across the warm and cold tiers, plus warm mirroring.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::ReplicatedDocument;
use crate::error::{Result, SyncError};
use crate::protocol::{
    decode_framed, encode_framed, ActorId, DocumentId, ProtocolError, RawUpdate,
};
use crate::storage::cold::{ColdStore, PendingRecord, PersistBatch, StoreError};
use crate::storage::warm::WarmCache;

pub(crate) fn state_key(document: DocumentId) -> String {
    format!("doc:{document}:state")
}

pub(crate) fn version_key(document: DocumentId) -> String {
    format!("doc:{document}:version")
}

pub(crate) fn history_key(document: DocumentId) -> String {
    format!("doc:{document}:history")
}

pub(crate) fn updates_key(document: DocumentId) -> String {
    format!("doc:{document}:updates")
}

/// Where a hot entry's initial state came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
    /// Not found anywhere: a new document.
    Empty,
}

/// Full-state mirror kept in the warm tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmSnapshot {
    pub version: u64,
    /// Highest version the writer knew to be in the cold tier.
    pub durable_version: u64,
    pub state: Vec<u8>,
}

impl WarmSnapshot {
    pub fn encode(&self) -> std::result::Result<Vec<u8>, ProtocolError> {
        encode_framed(self)
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, ProtocolError> {
        decode_framed(bytes)
    }
}

/// Result of a hot miss.
#[derive(Debug)]
pub struct LoadedDocument {
    pub engine: ReplicatedDocument,
    pub version: u64,
    pub durable_version: u64,
    pub last_modified_by: Option<ActorId>,
    pub tier: Tier,
    /// Replay records newer than `durable_version`, oldest first. Only a warm
    /// load can have any.
    pub unflushed: Vec<PendingRecord>,
}

/// The warm and cold tiers behind one process's hot arena.
pub struct TieredCache {
    warm: Arc<dyn WarmCache>,
    cold: Arc<dyn ColdStore>,
    warm_ttl: Duration,
    fallback_ttl: Duration,
}

impl TieredCache {
    pub fn new(
        warm: Arc<dyn WarmCache>,
        cold: Arc<dyn ColdStore>,
        warm_ttl: Duration,
        fallback_ttl: Duration,
    ) -> Self {
        Self {
            warm,
            cold,
            warm_ttl,
            fallback_ttl,
        }
    }

    pub fn warm(&self) -> &Arc<dyn WarmCache> {
        &self.warm
    }

    pub fn warm_ttl(&self) -> Duration {
        self.warm_ttl
    }

    /// Resolve a hot miss: warm, then cold (promoted to warm), then empty.
    ///
    /// Warm failures and corrupt warm snapshots count as misses. A cold
    /// failure is returned so a new empty document never shadows durable
    /// state.
    pub async fn load(&self, document: DocumentId) -> Result<LoadedDocument> {
        if let Some(snapshot) = self.warm_snapshot(document) {
            match ReplicatedDocument::from_state(&snapshot.state) {
                Ok(engine) => {
                    let durable_version = snapshot.durable_version.min(snapshot.version);
                    let unflushed =
                        self.warm_unflushed(document, durable_version, snapshot.version);
                    log::info!(
                        "document {document} loaded from warm tier at version {} ({} unflushed)",
                        snapshot.version,
                        unflushed.len()
                    );
                    return Ok(LoadedDocument {
                        engine,
                        version: snapshot.version,
                        durable_version,
                        last_modified_by: unflushed.last().map(|record| record.update.actor),
                        tier: Tier::Warm,
                        unflushed,
                    });
                }
                Err(e) => log::warn!("discarding corrupt warm snapshot of {document}: {e}"),
            }
        }

        if let Some(row) = self.cold_call(move |cold| cold.load(document)).await? {
            let engine = ReplicatedDocument::from_state(&row.state)
                .map_err(|e| SyncError::decode(document, e))?;
            self.mirror(
                document,
                &WarmSnapshot {
                    version: row.version,
                    durable_version: row.version,
                    state: row.state,
                },
            );
            log::info!(
                "document {document} loaded from cold tier at version {}",
                row.version
            );
            return Ok(LoadedDocument {
                engine,
                version: row.version,
                durable_version: row.version,
                last_modified_by: row.last_modified_by,
                tier: Tier::Cold,
                unflushed: Vec::new(),
            });
        }

        log::info!("document {document} not found in any tier, starting empty");
        Ok(LoadedDocument {
            engine: ReplicatedDocument::new(),
            version: 0,
            durable_version: 0,
            last_modified_by: None,
            tier: Tier::Empty,
            unflushed: Vec::new(),
        })
    }

    /// Mirror full state and version with the regular TTL.
    pub fn mirror(&self, document: DocumentId, snapshot: &WarmSnapshot) -> bool {
        self.write_snapshot(document, snapshot, self.warm_ttl)
    }

    /// Mirror with the extended TTL used after a failed durable write.
    pub fn mirror_fallback(&self, document: DocumentId, snapshot: &WarmSnapshot) -> bool {
        self.write_snapshot(document, snapshot, self.fallback_ttl)
    }

    /// Version mirrored in the warm tier, without decoding state.
    pub fn polled_version(&self, document: DocumentId) -> Option<u64> {
        match self.warm.get(&version_key(document)) {
            Ok(Some(bytes)) => match <[u8; 8]>::try_from(bytes.as_slice()) {
                Ok(raw) => Some(u64::from_be_bytes(raw)),
                Err(_) => {
                    log::warn!("malformed warm version for {document}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("warm version read failed for {document}: {e}");
                None
            }
        }
    }

    /// Durable write on the blocking pool.
    pub async fn persist(&self, batch: PersistBatch) -> std::result::Result<(), StoreError> {
        let cold = Arc::clone(&self.cold);
        tokio::task::spawn_blocking(move || cold.persist(&batch))
            .await
            .map_err(|e| StoreError::Unavailable(format!("persist task failed: {e}")))?
    }

    /// Run a blocking cold-tier read on the blocking pool.
    pub(crate) async fn cold_call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn ColdStore) -> std::result::Result<T, StoreError> + Send + 'static,
    {
        let cold = Arc::clone(&self.cold);
        let result = tokio::task::spawn_blocking(move || f(cold.as_ref()))
            .await
            .map_err(|e| SyncError::Worker(e.to_string()))?;
        Ok(result?)
    }

    /// Warm replay records in `(durable, version]`, ascending.
    fn warm_unflushed(
        &self,
        document: DocumentId,
        durable: u64,
        version: u64,
    ) -> Vec<PendingRecord> {
        let raw = match self.warm.range(&updates_key(document)) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("warm replay list of {document} unreadable: {e}");
                return Vec::new();
            }
        };
        let mut updates: Vec<RawUpdate> = raw
            .iter()
            .filter_map(|bytes| match RawUpdate::decode(bytes) {
                Ok(update) => Some(update),
                Err(e) => {
                    log::warn!("skipping undecodable warm update of {document}: {e}");
                    None
                }
            })
            .filter(|update| update.version > durable && update.version <= version)
            .collect();
        updates.sort_by_key(|update| update.version);
        updates.dedup_by_key(|update| update.version);
        updates.into_iter().map(PendingRecord::new).collect()
    }

    /// Current warm mirror of `document`; failures and corrupt entries read
    /// as absent.
    pub(crate) fn warm_snapshot(&self, document: DocumentId) -> Option<WarmSnapshot> {
        match self.warm.get(&state_key(document)) {
            Ok(Some(bytes)) => match WarmSnapshot::decode(&bytes) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    log::warn!("discarding undecodable warm snapshot of {document}: {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("warm read failed for {document}, falling through: {e}");
                None
            }
        }
    }

    fn write_snapshot(&self, document: DocumentId, snapshot: &WarmSnapshot, ttl: Duration) -> bool {
        let encoded = match snapshot.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("warm snapshot encode failed for {document}: {e}");
                return false;
            }
        };
        let written = self
            .warm
            .set(&state_key(document), encoded, ttl)
            .and_then(|_| {
                self.warm.set(
                    &version_key(document),
                    snapshot.version.to_be_bytes().to_vec(),
                    ttl,
                )
            });
        if let Err(e) = written {
            log::warn!("warm mirror failed for {document}: {e}");
            return false;
        }
        true
    }
}
