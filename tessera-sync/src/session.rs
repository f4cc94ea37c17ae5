//! Client attachments per document.
//!
//! The tracker only counts. The zero-count transition it reports is what the
//! core uses as its sole eviction trigger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::protocol::{ClientId, DocumentId};

/// Outcome of [`SessionTracker::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detach {
    /// Other clients are still attached.
    Remaining(usize),
    /// The departing client was the last one.
    LastClientLeft,
    /// The client was not attached to this document.
    NotAttached,
}

#[derive(Debug, Default)]
pub struct SessionTracker {
    sessions: Arc<RwLock<HashMap<DocumentId, HashSet<ClientId>>>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `client` on `document`. Attaching twice is a no-op.
    ///
    /// Returns the number of attached clients afterwards.
    pub async fn attach(&self, document: DocumentId, client: ClientId) -> usize {
        let mut sessions = self.sessions.write().await;
        let clients = sessions.entry(document).or_default();
        clients.insert(client);
        clients.len()
    }

    pub async fn detach(&self, document: DocumentId, client: ClientId) -> Detach {
        let mut sessions = self.sessions.write().await;
        let Some(clients) = sessions.get_mut(&document) else {
            return Detach::NotAttached;
        };
        if !clients.remove(&client) {
            return Detach::NotAttached;
        }
        if clients.is_empty() {
            sessions.remove(&document);
            Detach::LastClientLeft
        } else {
            Detach::Remaining(clients.len())
        }
    }

    pub async fn client_count(&self, document: DocumentId) -> usize {
        self.sessions
            .read()
            .await
            .get(&document)
            .map_or(0, HashSet::len)
    }

    pub async fn clients(&self, document: DocumentId) -> Vec<ClientId> {
        self.sessions
            .read()
            .await
            .get(&document)
            .map(|clients| clients.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn clear(&self) {
        self.sessions.write().await.clear();
    }
}
