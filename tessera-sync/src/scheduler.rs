//! Debounced persistence timers.
//!
//! One timer per document. [`PersistenceScheduler::schedule`] re-arms it, so
//! a burst of edits produces a single fire `delay` after the last one. A
//! fire does not persist anything itself: the document id is sent on the
//! channel returned by [`PersistenceScheduler::new`] and the owner performs
//! the flush.
//!
//! Each timer carries a generation number. A timer task only removes its own
//! map entry and only fires if that entry still holds its generation, so a
//! task that woke up just as it was being replaced stays silent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::protocol::DocumentId;

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

type TimerMap = Arc<Mutex<HashMap<DocumentId, Timer>>>;

pub struct PersistenceScheduler {
    delay: Duration,
    timers: TimerMap,
    fire_tx: mpsc::UnboundedSender<DocumentId>,
    next_generation: AtomicU64,
}

impl PersistenceScheduler {
    /// Scheduler plus the receiving end of its fire channel.
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<DocumentId>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            delay,
            timers: Arc::new(Mutex::new(HashMap::new())),
            fire_tx,
            next_generation: AtomicU64::new(0),
        };
        (scheduler, fire_rx)
    }

    /// Arm, or re-arm, the timer for `document`.
    pub async fn schedule(&self, document: DocumentId) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.timers.lock().await;

        let handle = tokio::spawn(fire_after(
            self.delay,
            document,
            generation,
            Arc::clone(&self.timers),
            self.fire_tx.clone(),
        ));
        if let Some(previous) = timers.insert(document, Timer { generation, handle }) {
            previous.handle.abort();
        }
        log::debug!("persist timer armed for {document} ({:?})", self.delay);
    }

    /// Disarm the timer for `document`. Returns whether one was armed.
    pub async fn cancel(&self, document: DocumentId) -> bool {
        match self.timers.lock().await.remove(&document) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Disarm every timer. Returns how many were armed.
    pub async fn cancel_all(&self) -> usize {
        let mut timers = self.timers.lock().await;
        let count = timers.len();
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        count
    }

    pub async fn is_armed(&self, document: DocumentId) -> bool {
        self.timers.lock().await.contains_key(&document)
    }

    pub async fn armed_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

async fn fire_after(
    delay: Duration,
    document: DocumentId,
    generation: u64,
    timers: TimerMap,
    fire_tx: mpsc::UnboundedSender<DocumentId>,
) {
    tokio::time::sleep(delay).await;

    let mut timers = timers.lock().await;
    match timers.get(&document) {
        Some(timer) if timer.generation == generation => {
            timers.remove(&document);
        }
        _ => return,
    }
    drop(timers);

    if fire_tx.send(document).is_err() {
        log::debug!("persist timer for {document} fired after its owner went away");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_delay() {
        let (scheduler, mut fired) = PersistenceScheduler::new(DELAY);
        let doc = DocumentId::random();

        scheduler.schedule(doc).await;
        assert!(scheduler.is_armed(doc).await);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(fired.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.recv().await, Some(doc));
        assert!(!scheduler.is_armed(doc).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_debounces() {
        let (scheduler, mut fired) = PersistenceScheduler::new(DELAY);
        let doc = DocumentId::random();

        for _ in 0..5 {
            scheduler.schedule(doc).await;
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        assert!(fired.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.recv().await, Some(doc));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let (scheduler, mut fired) = PersistenceScheduler::new(DELAY);
        let doc = DocumentId::random();

        scheduler.schedule(doc).await;
        assert!(scheduler.cancel(doc).await);
        assert!(!scheduler.cancel(doc).await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fired.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (scheduler, mut fired) = PersistenceScheduler::new(DELAY);
        for _ in 0..3 {
            scheduler.schedule(DocumentId::random()).await;
        }
        assert_eq!(scheduler.armed_count().await, 3);
        assert_eq!(scheduler.cancel_all().await, 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(fired.try_recv().is_err());
        assert_eq!(scheduler.armed_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_are_per_document() {
        let (scheduler, mut fired) = PersistenceScheduler::new(DELAY);
        let a = DocumentId::random();
        let b = DocumentId::random();

        scheduler.schedule(a).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.schedule(b).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.recv().await, Some(a));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fired.recv().await, Some(b));
    }
}
