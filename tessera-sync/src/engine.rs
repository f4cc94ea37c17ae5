//! Replicated state engine: one Yrs document per hot entry.
//!
//! The engine only knows how to merge, encode and diff. It has no notion of
//! versions, tiers or clients; the hot entry that owns it tracks those.
//!
//! Merge semantics (idempotent, commutative, associative) come from Yrs. The
//! engine guarantees the rest of the contract as follows: an update is fully
//! decoded before a write transaction is opened, so a malformed payload never
//! touches the document. Inputs pass a structural check first, so a forged
//! count is rejected instead of sizing an allocation.

mod wire;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

/// Engine errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("update decode failed: {0}")]
    Decode(String),
    #[error("state vector decode failed: {0}")]
    StateVector(String),
    #[error("update rejected: {0}")]
    Apply(String),
}

/// A single CRDT replica.
pub struct ReplicatedDocument {
    doc: Doc,
}

impl ReplicatedDocument {
    /// Empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Fresh engine seeded from a full-state snapshot.
    ///
    /// An empty slice yields an empty document.
    pub fn from_state(state: &[u8]) -> Result<Self, EngineError> {
        let engine = Self::new();
        if !state.is_empty() {
            engine.merge(state)?;
        }
        Ok(engine)
    }

    /// Merge an encoded update (v1 encoding) into this replica.
    pub fn merge(&self, update: &[u8]) -> Result<(), EngineError> {
        wire::check_update(update).map_err(|e| EngineError::Decode(e.to_string()))?;
        let update = Update::decode_v1(update).map_err(|e| EngineError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| EngineError::Apply(e.to_string()))
    }

    /// Whether merged operations are parked waiting for causal predecessors.
    ///
    /// While this holds, [`text`](Self::text) and [`encode_full`](Self::encode_full)
    /// reflect less than everything merged so far.
    pub fn has_missing(&self) -> bool {
        self.doc.transact().has_missing_updates()
    }

    /// Complete current state as a single update.
    pub fn encode_full(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Operations a peer at `state_vector` is missing.
    ///
    /// An empty vector means the peer has nothing, so the result equals
    /// [`encode_full`](Self::encode_full).
    pub fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, EngineError> {
        let remote = if state_vector.is_empty() {
            StateVector::default()
        } else {
            wire::check_state_vector(state_vector)
                .map_err(|e| EngineError::StateVector(e.to_string()))?;
            StateVector::decode_v1(state_vector)
                .map_err(|e| EngineError::StateVector(e.to_string()))?
        };
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// This replica's own state vector (v1 encoding).
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Insert `chunk` into the root text `root` and return the resulting
    /// update, ready to be sent to a server.
    pub fn insert_text(&self, root: &str, index: u32, chunk: &str) -> Vec<u8> {
        let before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        {
            let mut txn = self.doc.transact_mut();
            let text = txn.get_or_insert_text(root);
            text.insert(&mut txn, index, chunk);
        }
        let txn = self.doc.transact();
        txn.encode_diff_v1(&before)
    }

    /// Append `chunk` at the end of the root text `root`.
    pub fn append_text(&self, root: &str, chunk: &str) -> Vec<u8> {
        let len = self.text(root).len() as u32;
        self.insert_text(root, len, chunk)
    }

    /// Current contents of the root text `root` (empty if it does not exist).
    pub fn text(&self, root: &str) -> String {
        let txn = self.doc.transact();
        txn.get_text(root)
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Release the underlying document.
    ///
    /// Consuming `self` makes a destroyed engine unreachable.
    pub fn destroy(self) {
        drop(self.doc);
    }
}

impl Default for ReplicatedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicatedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDocument")
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}
