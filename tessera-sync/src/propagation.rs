//! Cross-process fan-out of applied updates.
//!
//! Every core publishes an encoded [`UpdateNotice`] after a local merge and
//! listens on the same channel for notices from its siblings. The bus is an
//! in-process stand-in for a shared pub/sub server: cores built on one
//! `Arc<PropagationBus>` behave like separate server processes.
//!
//! Receivers buffer up to `capacity` notices; a receiver that falls further
//! behind skips the oldest ones (reported as lagged).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, UpdateNotice};

/// Statistics for monitoring bus health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    pub messages_sent: u64,
    /// Notices skipped by lagging receivers.
    pub messages_dropped: u64,
    /// Notices that failed to decode on receipt.
    pub messages_rejected: u64,
    pub subscribers: usize,
}

/// Lock-free counters, read via [`PropagationBus::stats`].
#[derive(Default)]
struct AtomicBusStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    messages_rejected: AtomicU64,
}

/// A named pub/sub channel carrying encoded update notices.
pub struct PropagationBus {
    channel: String,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    stats: AtomicBusStats,
}

impl PropagationBus {
    pub fn new(channel: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            channel: channel.into(),
            sender,
            capacity: capacity.max(1),
            stats: AtomicBusStats::default(),
        }
    }

    /// Encode and send `notice` to every subscriber.
    ///
    /// Returns the number of receivers reached; zero when nobody listens.
    pub fn publish(&self, notice: &UpdateNotice) -> Result<usize, ProtocolError> {
        let encoded = Arc::new(notice.encode()?);
        let receivers = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    pub(crate) fn record_lagged(&self, skipped: u64) {
        self.stats.messages_dropped.fetch_add(skipped, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.stats.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            messages_rejected: self.stats.messages_rejected.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}
