//! Identifiers and the versioned binary records exchanged between tiers.
//!
//! Every record that leaves the process (warm tier, cold tier, pub/sub) is
//! framed as one format byte followed by a bincode body:
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ format   │ bincode body (standard cfg)  │
//! │ 1 byte   │ variable                     │
//! └──────────┴──────────────────────────────┘
//! ```
//!
//! The format byte lets a reader reject records written by a newer layout
//! instead of misinterpreting them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use uuid::Uuid;

/// Current on-wire layout for all framed records.
pub const FORMAT_V1: u8 = 1;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Fresh random identifier.
            pub fn random() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Stable key of a document across every tier.
    DocumentId
);
uuid_id!(
    /// One client attachment (a connected editor session).
    ClientId
);
uuid_id!(
    /// The user or service that authored an update.
    ActorId
);
uuid_id!(
    /// Identity of one server process on the propagation channel.
    ReplicaId
);

/// An opaque CRDT delta tagged with its author and the version it produced.
///
/// This is the unit stored in the replay log and broadcast to sibling
/// processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawUpdate {
    pub version: u64,
    pub actor: ActorId,
    pub bytes: Vec<u8>,
}

impl RawUpdate {
    pub fn new(version: u64, actor: ActorId, bytes: Vec<u8>) -> Self {
        Self {
            version,
            actor,
            bytes,
        }
    }

    pub fn byte_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_framed(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_framed(bytes)
    }
}

/// Metadata row describing one applied update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub actor: ActorId,
    /// Milliseconds since the Unix epoch.
    pub applied_at: u64,
    pub byte_size: u64,
}

impl HistoryEntry {
    /// Describe `update` as applied right now.
    pub fn for_update(update: &RawUpdate) -> Self {
        Self {
            version: update.version,
            actor: update.actor,
            applied_at: unix_millis(SystemTime::now()),
            byte_size: update.byte_size() as u64,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_framed(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_framed(bytes)
    }
}

/// Payload published on the propagation channel after a local merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateNotice {
    /// Process that merged the update first.
    pub origin: ReplicaId,
    pub document: DocumentId,
    pub update: RawUpdate,
}

impl UpdateNotice {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_framed(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_framed(bytes)
    }
}

/// Server answer to a client's state vector: the missing operations plus the
/// version they bring the client to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReply {
    pub diff: Vec<u8>,
    pub version: u64,
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unsupported record format {0}")]
    UnsupportedFormat(u8),
    #[error("empty record")]
    Empty,
}

pub(crate) fn encode_framed<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(FORMAT_V1);
    out.extend_from_slice(&body);
    Ok(out)
}

pub(crate) fn decode_framed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    match bytes.split_first() {
        Some((&FORMAT_V1, body)) => {
            let (value, _) = bincode::serde::decode_from_slice(body, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
            Ok(value)
        }
        Some((&other, _)) => Err(ProtocolError::UnsupportedFormat(other)),
        None => Err(ProtocolError::Empty),
    }
}

/// Milliseconds since the Unix epoch, saturating at zero for clocks set
/// before it.
pub(crate) fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
