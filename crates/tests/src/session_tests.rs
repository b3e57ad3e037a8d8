use tokio::sync::mpsc;

use confab_intelligence::IntelligenceEvent;

use crate::fixtures::HarnessBuilder;

#[tokio::test]
async fn stop_session_releases_worker_and_state() {
    let mut h = HarnessBuilder::new().spawn();

    h.send("the migration planning continues this afternoon somehow").await;
    assert_eq!(h.engine.active_session_count(), 1);

    h.engine.stop_session(&h.descriptor.session_id);
    assert_eq!(h.engine.active_session_count(), 0);

    // Stopping an unknown session is a no-op.
    h.engine.stop_session("never-started");
    assert_eq!(h.engine.active_session_count(), 0);
}

#[tokio::test]
async fn natural_stream_end_closes_the_session() {
    let mut h = HarnessBuilder::new().llm_response("").spawn();

    h.send("the migration planning continues this afternoon somehow").await;
    h.close_stream();

    h.expect_event("session closed", |e| {
        matches!(e, IntelligenceEvent::SessionClosed { .. })
    })
    .await;

    assert_eq!(h.engine.active_session_count(), 0);
}

#[tokio::test]
async fn pending_batch_is_flushed_when_the_stream_ends() {
    let mut h = HarnessBuilder::new()
        .config(|c| c.signals.min_accumulated_words = 1_000)
        .llm_response("")
        .spawn();

    h.send("the migration planning continues this afternoon somehow").await;
    h.close_stream();

    let event = h
        .expect_event("final flush", |e| {
            matches!(e, IntelligenceEvent::BatchFlushed { .. })
        })
        .await;

    match event {
        IntelligenceEvent::BatchFlushed { reason, .. } => {
            assert_eq!(reason, "stream_ended");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn starting_a_session_twice_replaces_the_worker() {
    let h = HarnessBuilder::new().spawn();

    let (_tx, rx) = mpsc::channel(8);
    h.engine.start_session(h.descriptor.clone(), rx);

    assert_eq!(h.engine.active_session_count(), 1);
}
