//! Cold tier: the durable store.
//!
//! Column families of [`RocksColdStore`]:
//! - `documents`: full-state snapshots (LZ4 compressed), keyed by document id
//! - `metadata`: version, last author and timestamps, keyed by document id
//! - `history`: one [`HistoryEntry`] per persisted update
//! - `updates`: the matching [`RawUpdate`] (LZ4 compressed) for replay
//!
//! History and update rows share one key layout so both are pruned to the
//! same horizon in the same write batch:
//! ```text
//! ┌──────────────┬──────────────────┬──────────────┐
//! │ document     │ version (BE)     │ actor        │
//! │ 16 bytes     │ 8 bytes          │ 16 bytes     │
//! └──────────────┴──────────────────┴──────────────┘
//! ```

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    DataBlockIndexType, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::protocol::{unix_millis, ActorId, DocumentId, HistoryEntry, ProtocolError, RawUpdate};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_HISTORY: &str = "history";
const CF_UPDATES: &str = "updates";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_HISTORY, CF_UPDATES];

/// document (16) + version (8) + actor (16)
const ROW_KEY_LEN: usize = 40;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// The store cannot be reached at all (lock poisoned, backend down).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<ProtocolError> for StoreError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Serialization(msg) => StoreError::Serialization(msg),
            other => StoreError::Deserialization(other.to_string()),
        }
    }
}

/// A document row as read back from the cold tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub state: Vec<u8>,
    pub version: u64,
    pub last_modified_by: Option<ActorId>,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

/// One update not yet written to the durable history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRecord {
    pub entry: HistoryEntry,
    pub update: RawUpdate,
}

impl PendingRecord {
    pub fn new(update: RawUpdate) -> Self {
        Self {
            entry: HistoryEntry::for_update(&update),
            update,
        }
    }
}

/// Everything one flush writes atomically.
#[derive(Debug, Clone)]
pub struct PersistBatch {
    pub document: DocumentId,
    /// Full state snapshot, never a delta.
    pub state: Vec<u8>,
    pub version: u64,
    pub last_modified_by: Option<ActorId>,
    /// History rows to append, ascending by version.
    pub records: Vec<PendingRecord>,
    /// Rows kept per document after this write.
    pub retention: usize,
}

/// Durable store contract. Implementations block; callers run them on the
/// blocking pool.
pub trait ColdStore: Send + Sync {
    fn load(&self, document: DocumentId) -> Result<Option<StoredDocument>, StoreError>;

    /// Write snapshot, metadata and history rows as one unit, then prune the
    /// history to `batch.retention` rows. A snapshot older than the stored
    /// one is not written; its history rows still are.
    fn persist(&self, batch: &PersistBatch) -> Result<(), StoreError>;

    /// Newest-first history rows, at most `limit`.
    fn history(&self, document: DocumentId, limit: usize) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Retained replay updates, ascending by version.
    fn updates(&self, document: DocumentId) -> Result<Vec<RawUpdate>, StoreError>;
}

/// RocksDB store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tessera_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub document: DocumentId,
    pub version: u64,
    pub last_modified_by: Option<ActorId>,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(document: DocumentId) -> Self {
        let now = unix_millis(SystemTime::now());
        Self {
            document,
            version: 0,
            last_modified_by: None,
            snapshot_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed cold tier.
pub struct RocksColdStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksColdStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.set_max_total_wal_size(128 * 1024 * 1024);
        db_opts.increase_parallelism(num_cpus());

        // One block cache shared by every column family.
        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache))
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("cold store opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        if matches!(name, CF_DOCUMENTS | CF_METADATA) {
            // Whole-key gets only: hash index inside each data block.
            block_opts.set_data_block_index_type(DataBlockIndexType::BinaryAndHash);
            block_opts.set_data_block_hash_ratio(0.75);
        }
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
            }
            CF_HISTORY | CF_UPDATES => {
                // Small appends, scanned by document prefix.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    /// Metadata row for `document`, if it was ever persisted.
    pub fn metadata(&self, document: DocumentId) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, document.as_bytes())?
            .map(|bytes| DocumentMetadata::decode(&bytes))
            .transpose()
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn row_key(document: DocumentId, version: u64, actor: ActorId) -> Vec<u8> {
        let mut key = Vec::with_capacity(ROW_KEY_LEN);
        key.extend_from_slice(document.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key.extend_from_slice(actor.as_bytes());
        key
    }

    /// All `(key, value)` rows of `document` in `cf_name`, ascending.
    fn scan_rows(
        &self,
        cf_name: &str,
        document: DocumentId,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = document.as_bytes();

        let mut rows = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() != ROW_KEY_LEN || &key[..16] != prefix {
                break;
            }
            rows.push((key, value));
        }
        Ok(rows)
    }

    /// Queue deletes so only the newest `retention` of existing plus new
    /// keys survive the batch.
    fn prune_rows(
        &self,
        batch: &mut WriteBatch,
        cf_name: &str,
        document: DocumentId,
        new_keys: &[Vec<u8>],
        retention: usize,
    ) -> Result<usize, StoreError> {
        let cf = self.cf(cf_name)?;
        let mut keys: BTreeSet<Vec<u8>> = self
            .scan_rows(cf_name, document)?
            .into_iter()
            .map(|(key, _)| key.into_vec())
            .collect();
        keys.extend(new_keys.iter().cloned());

        let excess = keys.len().saturating_sub(retention);
        for key in keys.iter().take(excess) {
            batch.delete_cf(cf, key);
        }
        Ok(excess)
    }
}

impl ColdStore for RocksColdStore {
    fn load(&self, document: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let Some(compressed) = self.db.get_cf(cf, document.as_bytes())? else {
            return Ok(None);
        };
        let state = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let meta = self
            .metadata(document)?
            .unwrap_or_else(|| DocumentMetadata::new(document));

        Ok(Some(StoredDocument {
            state,
            version: meta.version,
            last_modified_by: meta.last_modified_by,
            updated_at: meta.updated_at,
        }))
    }

    fn persist(&self, batch: &PersistBatch) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_history = self.cf(CF_HISTORY)?;
        let cf_updates = self.cf(CF_UPDATES)?;

        let compressed = lz4_flex::compress_prepend_size(&batch.state);

        let mut meta = self
            .metadata(batch.document)?
            .unwrap_or_else(|| DocumentMetadata::new(batch.document));

        let mut write = WriteBatch::default();
        let doc_key = batch.document.as_bytes();
        let stale = meta.version > batch.version;
        if stale {
            log::debug!(
                "snapshot of {} at v{} is older than stored v{}, keeping stored",
                batch.document,
                batch.version,
                meta.version
            );
        } else {
            meta.version = batch.version;
            meta.last_modified_by = batch.last_modified_by.or(meta.last_modified_by);
            meta.snapshot_size = batch.state.len() as u64;
            meta.compressed_size = compressed.len() as u64;
            meta.updated_at = unix_millis(SystemTime::now());
            write.put_cf(cf_docs, doc_key, &compressed);
            write.put_cf(cf_meta, doc_key, meta.encode()?);
        }

        let mut new_keys = Vec::with_capacity(batch.records.len());
        for record in &batch.records {
            let key = Self::row_key(batch.document, record.update.version, record.update.actor);
            write.put_cf(cf_history, &key, record.entry.encode()?);
            write.put_cf(
                cf_updates,
                &key,
                lz4_flex::compress_prepend_size(&record.update.encode()?),
            );
            new_keys.push(key);
        }

        let pruned = self.prune_rows(
            &mut write,
            CF_HISTORY,
            batch.document,
            &new_keys,
            batch.retention,
        )?;
        self.prune_rows(
            &mut write,
            CF_UPDATES,
            batch.document,
            &new_keys,
            batch.retention,
        )?;

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(write, &write_opts)?;

        log::debug!(
            "persisted document {} at version {} ({} history rows, {} pruned, {} bytes compressed)",
            batch.document,
            batch.version,
            batch.records.len(),
            pruned,
            meta.compressed_size
        );
        Ok(())
    }

    fn history(&self, document: DocumentId, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        self.scan_rows(CF_HISTORY, document)?
            .into_iter()
            .rev()
            .take(limit)
            .map(|(_, value)| HistoryEntry::decode(&value).map_err(StoreError::from))
            .collect()
    }

    fn updates(&self, document: DocumentId) -> Result<Vec<RawUpdate>, StoreError> {
        self.scan_rows(CF_UPDATES, document)?
            .into_iter()
            .map(|(_, value)| -> Result<RawUpdate, StoreError> {
                let framed = lz4_flex::decompress_size_prepended(&value)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(RawUpdate::decode(&framed)?)
            })
            .collect()
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[derive(Debug, Default)]
struct MemoryRow {
    document: Option<StoredDocument>,
    records: BTreeMap<(u64, ActorId), PendingRecord>,
}

/// In-process cold tier, used when no durable storage is configured and in
/// tests. Counts successful writes.
#[derive(Debug, Default)]
pub struct MemoryColdStore {
    rows: Mutex<HashMap<DocumentId, MemoryRow>>,
    writes: AtomicU64,
}

impl MemoryColdStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful `persist` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<DocumentId, MemoryRow>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store mutex poisoned".into()))
    }
}

impl ColdStore for MemoryColdStore {
    fn load(&self, document: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.lock()?.get(&document).and_then(|row| row.document.clone()))
    }

    fn persist(&self, batch: &PersistBatch) -> Result<(), StoreError> {
        let mut rows = self.lock()?;
        let row = rows.entry(batch.document).or_default();

        let stale = row
            .document
            .as_ref()
            .is_some_and(|stored| stored.version > batch.version);
        if !stale {
            let last_modified_by = batch
                .last_modified_by
                .or_else(|| row.document.as_ref().and_then(|d| d.last_modified_by));
            row.document = Some(StoredDocument {
                state: batch.state.clone(),
                version: batch.version,
                last_modified_by,
                updated_at: unix_millis(SystemTime::now()),
            });
        }
        for record in &batch.records {
            row.records
                .insert((record.update.version, record.update.actor), record.clone());
        }
        while row.records.len() > batch.retention {
            row.records.pop_first();
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn history(&self, document: DocumentId, limit: usize) -> Result<Vec<HistoryEntry>, StoreError> {
        Ok(self
            .lock()?
            .get(&document)
            .map(|row| {
                row.records
                    .values()
                    .rev()
                    .take(limit)
                    .map(|r| r.entry.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn updates(&self, document: DocumentId) -> Result<Vec<RawUpdate>, StoreError> {
        Ok(self
            .lock()?
            .get(&document)
            .map(|row| row.records.values().map(|r| r.update.clone()).collect())
            .unwrap_or_default())
    }
}
