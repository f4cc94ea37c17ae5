//! Storage tiers below the in-process hot arena.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  every apply   ┌──────────────┐
//! │ Hot arena   │ ─────────────► │ Warm cache   │  TTL-bounded, shared
//! │ (per proc)  │                │ (WarmCache)  │
//! └──────┬──────┘                └──────────────┘
//!        │ debounced flush
//!        ▼
//! ┌──────────────────────────────────────┐
//! │ Cold store (ColdStore)               │
//! │ CF "documents": full snapshots       │
//! │ CF "metadata": version, author       │
//! │ CF "history": history rows           │
//! │ CF "updates": replayable updates     │
//! └──────────────────────────────────────┘
//! ```
//!
//! A hot miss is served by [`TieredCache::load`]: warm, then cold, then an
//! empty document.

pub mod cold;
pub mod tiers;
pub mod warm;

pub use cold::{
    ColdStore, DocumentMetadata, MemoryColdStore, PendingRecord, PersistBatch, RocksColdStore,
    StoreConfig, StoreError, StoredDocument,
};
pub use tiers::{LoadedDocument, Tier, TieredCache, WarmSnapshot};
pub use warm::{MemoryWarmCache, WarmCache, WarmCacheConfig, WarmError};
