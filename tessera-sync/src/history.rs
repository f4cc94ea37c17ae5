//! Bounded per-document update history with replay.
//!
//! Each applied update leaves two records: a [`HistoryEntry`] (metadata) and
//! the [`RawUpdate`] itself (replay). Both are appended to capped warm-tier
//! lists at apply time and written to the cold tier on flush, and every copy
//! is trimmed to the same `limit`, so whatever `list` reports as available
//! can also be replayed.
//!
//! Reads merge the warm lists with the cold rows, keyed by
//! `(version, actor)`. The warm lists hold entries that are not yet durable;
//! the cold rows cover what outlived a warm TTL.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::engine::ReplicatedDocument;
use crate::error::{Result, SyncError};
use crate::protocol::{ActorId, DocumentId, HistoryEntry, RawUpdate};
use crate::storage::cold::PendingRecord;
use crate::storage::tiers::{history_key, updates_key, TieredCache};

pub struct HistoryLog {
    tiers: Arc<TieredCache>,
    limit: usize,
}

impl HistoryLog {
    pub fn new(tiers: Arc<TieredCache>, limit: usize) -> Self {
        Self { tiers, limit }
    }

    /// Append `record` to the warm history and replay lists.
    ///
    /// Returns `false` if the warm tier rejected either write; the record is
    /// still written to the cold tier by the next flush.
    pub fn record(&self, document: DocumentId, record: &PendingRecord) -> bool {
        let warm = self.tiers.warm();
        let ttl = self.tiers.warm_ttl();

        let written = record
            .entry
            .encode()
            .map_err(|e| e.to_string())
            .and_then(|entry| {
                warm.push_bounded(&history_key(document), entry, self.limit, ttl)
                    .map_err(|e| e.to_string())
            })
            .and_then(|_| record.update.encode().map_err(|e| e.to_string()))
            .and_then(|update| {
                warm.push_bounded(&updates_key(document), update, self.limit, ttl)
                    .map_err(|e| e.to_string())
            });

        match written {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "history record for {document} v{} not mirrored to warm tier: {e}",
                    record.update.version
                );
                false
            }
        }
    }

    /// Newest-first history, at most `limit` entries.
    pub async fn list(&self, document: DocumentId, limit: usize) -> Result<Vec<HistoryEntry>> {
        let mut merged: BTreeMap<(u64, ActorId), HistoryEntry> = self
            .warm_items(&history_key(document), HistoryEntry::decode)
            .into_iter()
            .map(|entry| ((entry.version, entry.actor), entry))
            .collect();

        let horizon = self.limit;
        for entry in self
            .tiers
            .cold_call(move |cold| cold.history(document, horizon))
            .await?
        {
            merged.entry((entry.version, entry.actor)).or_insert(entry);
        }

        Ok(merged
            .into_values()
            .rev()
            .take(limit.min(self.limit))
            .collect())
    }

    /// Every retained update, ascending by version.
    pub async fn retained_updates(&self, document: DocumentId) -> Result<Vec<RawUpdate>> {
        let mut merged: BTreeMap<(u64, ActorId), RawUpdate> = self
            .warm_items(&updates_key(document), RawUpdate::decode)
            .into_iter()
            .map(|update| ((update.version, update.actor), update))
            .collect();

        for update in self.tiers.cold_call(move |cold| cold.updates(document)).await? {
            merged.entry((update.version, update.actor)).or_insert(update);
        }

        let excess = merged.len().saturating_sub(self.limit);
        Ok(merged.into_values().skip(excess).collect())
    }

    pub async fn oldest_retained(&self, document: DocumentId) -> Result<Option<u64>> {
        Ok(self
            .retained_updates(document)
            .await?
            .first()
            .map(|update| update.version))
    }

    /// Rebuild the state at `target` by replaying, from an empty engine,
    /// every retained update with `version <= target`.
    ///
    /// Fails with [`SyncError::VersionNotRetained`] when `target` predates the
    /// oldest retained update or nothing is retained.
    pub async fn replay_to(&self, document: DocumentId, target: u64) -> Result<ReplicatedDocument> {
        let updates = self.retained_updates(document).await?;
        let oldest = updates.first().map(|update| update.version);

        match oldest {
            Some(oldest) if target >= oldest => {}
            _ => {
                return Err(SyncError::VersionNotRetained {
                    document,
                    requested: target,
                    oldest,
                })
            }
        }

        let engine = ReplicatedDocument::new();
        let mut replayed = 0usize;
        for update in updates.iter().take_while(|update| update.version <= target) {
            engine
                .merge(&update.bytes)
                .map_err(|e| SyncError::decode(document, e))?;
            replayed += 1;
        }
        log::debug!("replayed {replayed} updates of {document} up to v{target}");
        Ok(engine)
    }

    /// Decoded warm list items; an unreadable list counts as empty.
    fn warm_items<T, E: std::fmt::Display>(
        &self,
        key: &str,
        decode: impl Fn(&[u8]) -> std::result::Result<T, E>,
    ) -> Vec<T> {
        let raw = match self.tiers.warm().range(key) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("warm history read of {key} failed: {e}");
                return Vec::new();
            }
        };
        let mut items = Vec::with_capacity(raw.len());
        for bytes in raw {
            match decode(&bytes) {
                Ok(item) => items.push(item),
                Err(e) => log::warn!("skipping undecodable item in {key}: {e}"),
            }
        }
        items
    }
}
