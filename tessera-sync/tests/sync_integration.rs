//! Sync core integration tests.
//!
//! Verifies:
//! - Apply, diff, debounced flush, eviction and reload of one document
//! - Convergence of two cores sharing a propagation bus, even when one lags
//! - Debounced writes coalesce bursts
//! - Restore is bounded by the retained history
//! - Failed flushes keep the entry hot, extend the warm TTL and retry
//! - Shutdown flushes every dirty document

mod common;

use std::time::Duration;

use common::{settle, state_key, text_of, Cluster, ROOT};
use tessera_sync::{
    ActorId, ClientId, ColdStore, Detach, DocumentId, FlushOutcome, ReplicatedDocument,
    SyncConfig, SyncError, Tier, WarmCache,
};
use yrs::updates::decoder::Decode;
use yrs::StateVector;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn decoded_vector(bytes: &[u8]) -> StateVector {
    StateVector::decode_v1(bytes).unwrap()
}

// ─── Document lifecycle ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_edit_flush_evict_reload() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    let alice = ClientId::random();

    assert_eq!(core.add_client(doc, alice).await.unwrap(), 1);

    let editor = ReplicatedDocument::new();
    let update = core
        .apply_update(doc, ActorId::random(), editor.insert_text(ROOT, 0, "hello"))
        .await
        .unwrap();
    assert_eq!(update.version, 1);
    assert_eq!(core.polled_version(doc), Some(1));

    // A fresh client asks for everything.
    let reply = core.get_diff(doc, &[]).await.unwrap();
    assert_eq!(reply.version, 1);
    let fresh = ReplicatedDocument::new();
    fresh.merge(&reply.diff).unwrap();
    assert_eq!(fresh.text(ROOT), "hello");

    // Debounce window passes with no further edits.
    tokio::time::sleep(Duration::from_secs(6)).await;
    let stored = cluster.cold.load(doc).unwrap().expect("flushed to cold tier");
    assert_eq!(stored.version, 1);
    assert_eq!(text_of(&stored.state), "hello");
    assert!(!core.pending_persist(doc).await);

    assert_eq!(
        core.remove_client(doc, alice).await.unwrap(),
        Detach::LastClientLeft
    );
    assert!(!core.is_hot(doc).await);

    // Outlive the warm mirror so the reload has to come from the cold tier.
    tokio::time::sleep(Duration::from_secs(3601)).await;
    let view = core.get_document(doc).await.unwrap();
    assert_eq!(view.source, Tier::Cold);
    assert_eq!(view.version, 1);
    assert_eq!(text_of(&view.state), "hello");
}

#[tokio::test]
async fn test_eviction_flushes_before_teardown() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    let client = ClientId::random();

    core.add_client(doc, client).await.unwrap();
    let editor = ReplicatedDocument::new();
    for chunk in ["one ", "two ", "three"] {
        core.apply_update(doc, ActorId::random(), editor.append_text(ROOT, chunk))
            .await
            .unwrap();
    }
    let before = core.get_document(doc).await.unwrap();

    // The debounce window has not elapsed: eviction must flush on its own.
    core.remove_client(doc, client).await.unwrap();
    assert!(!core.is_hot(doc).await);
    assert_eq!(cluster.cold.write_count(), 1);

    let after = core.get_document(doc).await.unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(text_of(&after.state), "one two three");
    assert_eq!(
        decoded_vector(&after.state_vector),
        decoded_vector(&before.state_vector)
    );
}

#[tokio::test]
async fn test_clients_keep_document_hot() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    let (a, b) = (ClientId::random(), ClientId::random());

    core.add_client(doc, a).await.unwrap();
    assert_eq!(core.add_client(doc, b).await.unwrap(), 2);
    assert_eq!(core.add_client(doc, b).await.unwrap(), 2);

    assert_eq!(core.remove_client(doc, a).await.unwrap(), Detach::Remaining(1));
    assert!(core.is_hot(doc).await);
    assert_eq!(
        core.remove_client(doc, a).await.unwrap(),
        Detach::NotAttached
    );
    assert_eq!(
        core.remove_client(doc, b).await.unwrap(),
        Detach::LastClientLeft
    );
    assert!(!core.is_hot(doc).await);
    assert_eq!(core.client_count(doc).await, 0);
}

#[tokio::test]
async fn test_malformed_update_leaves_document_untouched() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();

    let editor = ReplicatedDocument::new();
    core.apply_update(doc, ActorId::random(), editor.insert_text(ROOT, 0, "kept"))
        .await
        .unwrap();
    let history_before = core.history(doc, 10).await.unwrap().len();

    let err = core
        .apply_update(doc, ActorId::random(), b"definitely not yrs".to_vec())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Decode { document, .. } if document == doc));

    assert_eq!(core.version(doc).await, Some(1));
    assert_eq!(text_of(&core.get_full_state(doc).await.unwrap()), "kept");
    assert_eq!(core.history(doc, 10).await.unwrap().len(), history_before);
}

// ─── Cross-process convergence ───────────────────────────────────────────────

#[tokio::test]
async fn test_two_cores_converge_over_bus() {
    let cluster = Cluster::new();
    let core_a = cluster.core();
    let core_b = cluster.core();
    let doc = DocumentId::random();

    core_a.add_client(doc, ClientId::random()).await.unwrap();
    core_b.add_client(doc, ClientId::random()).await.unwrap();

    // Concurrent edits from editors that never saw each other.
    let left = ReplicatedDocument::new().insert_text(ROOT, 0, "left");
    let right = ReplicatedDocument::new().insert_text(ROOT, 0, "right");
    core_a.apply_update(doc, ActorId::random(), left.clone()).await.unwrap();
    core_b.apply_update(doc, ActorId::random(), right).await.unwrap();
    settle().await;

    let text_a = text_of(&core_a.get_full_state(doc).await.unwrap());
    let text_b = text_of(&core_b.get_full_state(doc).await.unwrap());
    assert_eq!(text_a, text_b);
    assert!(text_a.contains("left") && text_a.contains("right"));
    assert_eq!(
        decoded_vector(&core_a.get_state_vector(doc).await.unwrap()),
        decoded_vector(&core_b.get_state_vector(doc).await.unwrap())
    );

    // Redundant delivery changes nothing.
    core_b.apply_update(doc, ActorId::random(), left).await.unwrap();
    settle().await;
    assert_eq!(text_of(&core_b.get_full_state(doc).await.unwrap()), text_a);
    assert!(cluster.bus.stats().messages_sent >= 3);
}

#[tokio::test]
async fn test_delivery_order_does_not_matter() {
    let first = Cluster::new();
    let second = Cluster::new();
    let core_a = first.core();
    let core_b = second.core();
    let doc = DocumentId::random();

    let base = ReplicatedDocument::new();
    let u1 = base.insert_text(ROOT, 0, "abc");
    let u2 = base.append_text(ROOT, "def");
    let u3 = ReplicatedDocument::new().insert_text(ROOT, 0, "xyz");

    for update in [&u1, &u2, &u3] {
        core_a.apply_update(doc, ActorId::random(), update.clone()).await.unwrap();
    }
    // Yrs holds u2 as pending until u1 arrives.
    for update in [&u3, &u2, &u1, &u2] {
        core_b.apply_update(doc, ActorId::random(), update.clone()).await.unwrap();
    }

    let state_a = core_a.get_document(doc).await.unwrap();
    let state_b = core_b.get_document(doc).await.unwrap();
    assert_eq!(text_of(&state_a.state), text_of(&state_b.state));
    assert_eq!(
        decoded_vector(&state_a.state_vector),
        decoded_vector(&state_b.state_vector)
    );
}

#[tokio::test]
async fn test_lagging_sibling_resyncs_from_warm_mirror() {
    let cluster = Cluster::with_bus_capacity(1);
    let core_a = cluster.core();
    let core_b = cluster.core();
    let doc = DocumentId::random();

    core_a.add_client(doc, ClientId::random()).await.unwrap();
    core_b.add_client(doc, ClientId::random()).await.unwrap();

    // One editor, so every chunk depends on the one before it.
    let editor = ReplicatedDocument::new();
    for chunk in ["a", "b", "c", "d", "e"] {
        core_a
            .apply_update(doc, ActorId::random(), editor.append_text(ROOT, chunk))
            .await
            .unwrap();
    }
    settle().await;

    let view_a = core_a.get_document(doc).await.unwrap();
    let view_b = core_b.get_document(doc).await.unwrap();
    assert_eq!(text_of(&view_a.state), "abcde");
    assert_eq!(text_of(&view_b.state), "abcde");
    assert_eq!(view_b.version, view_a.version);
    assert_eq!(
        decoded_vector(&view_a.state_vector),
        decoded_vector(&view_b.state_vector)
    );
    assert!(!view_b.pending_persist);
}

#[tokio::test]
async fn test_remote_update_does_not_load_document() {
    let cluster = Cluster::new();
    let core_a = cluster.core();
    let core_b = cluster.core();
    let doc = DocumentId::random();

    let editor = ReplicatedDocument::new();
    core_a
        .apply_update(doc, ActorId::random(), editor.insert_text(ROOT, 0, "shared"))
        .await
        .unwrap();
    settle().await;
    assert!(!core_b.is_hot(doc).await);

    // The warm mirror lets the sibling pick it up, still waiting on a flush.
    let view = core_b.get_document(doc).await.unwrap();
    assert_eq!(view.source, Tier::Warm);
    assert_eq!(view.version, 1);
    assert!(view.pending_persist);
    assert_eq!(text_of(&view.state), "shared");
}

// ─── Debounced persistence ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_burst_coalesces_into_one_write() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    let editor = ReplicatedDocument::new();

    for _ in 0..10 {
        core.apply_update(doc, ActorId::random(), editor.append_text(ROOT, "x"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(cluster.cold.write_count(), 0);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(cluster.cold.write_count(), 1);
    assert_eq!(cluster.cold.load(doc).unwrap().unwrap().version, 10);

    // Edits spaced wider than the window each get their own write.
    for _ in 0..3 {
        core.apply_update(doc, ActorId::random(), editor.append_text(ROOT, "y"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;
    }
    assert_eq!(cluster.cold.write_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_flush_now_cancels_pending_timer() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    let editor = ReplicatedDocument::new();

    core.apply_update(doc, ActorId::random(), editor.insert_text(ROOT, 0, "now"))
        .await
        .unwrap();
    assert_eq!(
        core.flush_now(doc).await.unwrap(),
        FlushOutcome::Persisted { version: 1 }
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(cluster.cold.write_count(), 1);
}

#[tokio::test]
async fn test_persist_all_reports_each_document() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let dirty = DocumentId::random();
    let clean = DocumentId::random();

    core.apply_update(
        dirty,
        ActorId::random(),
        ReplicatedDocument::new().insert_text(ROOT, 0, "dirty"),
    )
    .await
    .unwrap();
    core.get_document(clean).await.unwrap();

    let report = core.persist_all().await.unwrap();
    assert_eq!(report.persisted, vec![dirty]);
    assert_eq!(report.clean, 1);
    assert!(report.is_complete());
    assert_eq!(cluster.cold.write_count(), 1);
}

// ─── History and restore ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_restore_respects_history_horizon() {
    let cluster = Cluster::new();
    let core = cluster.core_with(SyncConfig {
        history_limit: 3,
        ..SyncConfig::default()
    });
    let doc = DocumentId::random();
    let editor = ReplicatedDocument::new();

    for chunk in ["a", "b", "c", "d", "e"] {
        core.apply_update(doc, ActorId::random(), editor.append_text(ROOT, chunk))
            .await
            .unwrap();
    }
    let before = core.get_full_state(doc).await.unwrap();

    let err = core
        .restore_version(doc, 2, ActorId::random())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::VersionNotRetained {
            requested: 2,
            oldest: Some(3),
            ..
        }
    ));
    assert_eq!(core.version(doc).await, Some(5));
    assert_eq!(core.get_full_state(doc).await.unwrap(), before);

    let restorer = ActorId::random();
    let restored = core.restore_version(doc, 3, restorer).await.unwrap();
    assert_eq!(restored.version, 6);
    assert_eq!(restored.actor, restorer);

    let history = core.history(doc, 10).await.unwrap();
    let versions: Vec<u64> = history.iter().map(|entry| entry.version).collect();
    assert_eq!(versions, vec![6, 5, 4]);
}

#[tokio::test]
async fn test_history_survives_flush() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    let editor = ReplicatedDocument::new();
    let actor = ActorId::random();

    for chunk in ["a", "b"] {
        core.apply_update(doc, actor, editor.append_text(ROOT, chunk))
            .await
            .unwrap();
    }
    core.flush_now(doc).await.unwrap();
    core.apply_update(doc, actor, editor.append_text(ROOT, "c"))
        .await
        .unwrap();

    let history = core.history(doc, 10).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|entry| entry.actor == actor));
    assert_eq!(cluster.cold.history(doc, 10).unwrap().len(), 2);
}

// ─── Persistence failures ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_failed_flush_extends_warm_ttl_and_retries() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    cluster.cold.set_failing(true);

    core.add_client(doc, ClientId::random()).await.unwrap();
    core.apply_update(
        doc,
        ActorId::random(),
        ReplicatedDocument::new().insert_text(ROOT, 0, "fragile"),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(cluster.cold.failed_writes() >= 1);
    assert!(core.pending_persist(doc).await);
    let ttl = cluster.warm.ttl_remaining(&state_key(doc)).unwrap();
    assert!(ttl > core.config().warm_ttl);

    cluster.cold.set_failing(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(cluster.cold.write_count(), 1);
    assert!(!core.pending_persist(doc).await);
    let ttl = cluster.warm.ttl_remaining(&state_key(doc)).unwrap();
    assert!(ttl <= core.config().warm_ttl);
}

#[tokio::test(start_paused = true)]
async fn test_failed_eviction_completes_after_retry() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    let client = ClientId::random();
    cluster.cold.set_failing(true);

    core.add_client(doc, client).await.unwrap();
    core.apply_update(
        doc,
        ActorId::random(),
        ReplicatedDocument::new().insert_text(ROOT, 0, "stubborn"),
    )
    .await
    .unwrap();

    let err = core.remove_client(doc, client).await.unwrap_err();
    assert!(matches!(err, SyncError::Persistence { document, .. } if document == doc));
    assert!(core.is_hot(doc).await);

    cluster.cold.set_failing(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(!core.is_hot(doc).await);
    assert_eq!(cluster.cold.load(doc).unwrap().unwrap().version, 1);
}

#[tokio::test(start_paused = true)]
async fn test_returning_client_cancels_postponed_eviction() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    let client = ClientId::random();
    cluster.cold.set_failing(true);

    core.add_client(doc, client).await.unwrap();
    core.apply_update(
        doc,
        ActorId::random(),
        ReplicatedDocument::new().insert_text(ROOT, 0, "back"),
    )
    .await
    .unwrap();
    assert!(core.remove_client(doc, client).await.is_err());

    core.add_client(doc, client).await.unwrap();
    cluster.cold.set_failing(false);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(core.is_hot(doc).await);
    assert!(!core.pending_persist(doc).await);
}

// ─── Shutdown ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_shutdown_flushes_every_document() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let docs: Vec<DocumentId> = (0..3).map(|_| DocumentId::random()).collect();

    for doc in &docs {
        core.add_client(*doc, ClientId::random()).await.unwrap();
        core.apply_update(
            *doc,
            ActorId::random(),
            ReplicatedDocument::new().insert_text(ROOT, 0, "bye"),
        )
        .await
        .unwrap();
    }

    let report = core.shutdown().await.unwrap();
    assert_eq!(report.persisted.len(), 3);
    assert_eq!(cluster.cold.write_count(), 3);
    for doc in &docs {
        assert_eq!(cluster.cold.load(*doc).unwrap().unwrap().version, 1);
        assert_eq!(core.client_count(*doc).await, 0);
    }
    assert!(core.hot_documents().await.is_empty());
    assert!(matches!(
        core.get_document(docs[0]).await,
        Err(SyncError::ShutDown)
    ));
}

#[tokio::test]
async fn test_shutdown_reports_partial_flush() {
    let cluster = Cluster::new();
    let core = cluster.core();
    let doc = DocumentId::random();
    cluster.cold.set_failing(true);

    core.apply_update(
        doc,
        ActorId::random(),
        ReplicatedDocument::new().insert_text(ROOT, 0, "unsaved"),
    )
    .await
    .unwrap();

    let err = core.shutdown().await.unwrap_err();
    assert!(matches!(err, SyncError::PartialFlush { ref failed } if failed == &vec![doc]));
    assert!(core.hot_documents().await.is_empty());
    assert!(cluster.warm.get(&state_key(doc)).unwrap().is_some());
}

#[tokio::test]
async fn test_sibling_finishes_flush_after_failed_shutdown() {
    let cluster = Cluster::new();
    let doc = DocumentId::random();

    let leaving = cluster.core();
    cluster.cold.set_failing(true);
    leaving
        .apply_update(
            doc,
            ActorId::random(),
            ReplicatedDocument::new().insert_text(ROOT, 0, "rescued"),
        )
        .await
        .unwrap();
    assert!(leaving.shutdown().await.is_err());

    cluster.cold.set_failing(false);
    let sibling = cluster.core();
    let view = sibling.get_document(doc).await.unwrap();
    assert_eq!(view.source, Tier::Warm);
    assert!(view.pending_persist);

    assert_eq!(
        sibling.flush_now(doc).await.unwrap(),
        FlushOutcome::Persisted { version: 1 }
    );
    let stored = cluster.cold.load(doc).unwrap().unwrap();
    assert_eq!(text_of(&stored.state), "rescued");

    // The rescued flush carries the history the leaving core never wrote.
    let history = cluster.cold.history(doc, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 1);
    assert_eq!(cluster.cold.updates(doc).unwrap().len(), 1);
    assert_eq!(stored.last_modified_by, Some(history[0].actor));
}
