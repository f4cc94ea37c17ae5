//! # tessera-sync: real-time collaborative document sync core
//!
//! Keeps CRDT documents consistent across many editors and across several
//! server processes sharing one warm cache, one durable store and one
//! propagation channel.
//!
//! ## Architecture
//!
//! ```text
//!  Process A                               Process B
//! ┌──────────────────┐                    ┌──────────────────┐
//! │ SyncCore         │  PropagationBus    │ SyncCore         │
//! │  hot: Yrs docs   │ ◄────────────────► │  hot: Yrs docs   │
//! └───────┬──────────┘   UpdateNotice     └──────────┬───────┘
//!         │ every apply                              │
//!         ▼                                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ WarmCache: full state + version mirror, history lists    │
//! └──────────────────────────────────────────────────────────┘
//!         │ debounced flush                          │
//!         ▼                                          ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ ColdStore: snapshots, metadata, bounded history          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: identifiers and versioned binary records
//! - [`engine`]: one replicated document (Yrs)
//! - [`storage`]: warm cache, cold store and tiered loading
//! - [`history`]: bounded history with replay-to-version
//! - [`scheduler`]: debounced persistence timers
//! - [`session`]: client attachments per document
//! - [`propagation`]: cross-process update fan-out
//! - [`facade`]: [`SyncCore`], the public contract
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera_sync::{
//!     ActorId, ClientId, DocumentId, MemoryColdStore, MemoryWarmCache, PropagationBus,
//!     ReplicatedDocument, SyncConfig, SyncCore,
//! };
//!
//! # async fn run() -> tessera_sync::Result<()> {
//! let core = SyncCore::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryWarmCache::with_defaults()),
//!     Arc::new(MemoryColdStore::new()),
//!     Arc::new(PropagationBus::new("doc-updates", 1024)),
//! )?;
//!
//! let doc = DocumentId::random();
//! let client = ClientId::random();
//! core.add_client(doc, client).await?;
//!
//! let editor = ReplicatedDocument::new();
//! let update = editor.insert_text("content", 0, "hello");
//! core.apply_update(doc, ActorId::random(), update).await?;
//!
//! core.remove_client(doc, client).await?;
//! core.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod history;
mod hot;
pub mod propagation;
pub mod protocol;
pub mod scheduler;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use config::SyncConfig;
pub use engine::{EngineError, ReplicatedDocument};
pub use error::{Result, SyncError};
pub use facade::{DocumentView, FlushOutcome, FlushReport, SyncCore};
pub use history::HistoryLog;
pub use propagation::{BusStats, PropagationBus};
pub use protocol::{
    ActorId, ClientId, DocumentId, HistoryEntry, ProtocolError, RawUpdate, ReplicaId, SyncReply,
    UpdateNotice,
};
pub use scheduler::PersistenceScheduler;
pub use session::{Detach, SessionTracker};
pub use storage::{
    ColdStore, DocumentMetadata, MemoryColdStore, MemoryWarmCache, PendingRecord, PersistBatch,
    RocksColdStore, StoreConfig, StoreError, StoredDocument, Tier, TieredCache, WarmCache,
    WarmCacheConfig, WarmError, WarmSnapshot,
};
