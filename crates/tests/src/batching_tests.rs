use std::sync::atomic::Ordering;

use confab_intelligence::IntelligenceEvent;

use crate::fixtures::HarnessBuilder;

#[tokio::test]
async fn topic_change_closes_batch_before_new_fragment_joins() {
    let mut h = HarnessBuilder::new()
        .topics(vec!["authentication", "lunch"])
        .config(|c| {
            // Keep the accumulation policy out of the way so the coherence
            // gate alone decides the boundary.
            c.signals.max_accumulated_fragments = 10;
            c.signals.min_accumulated_words = 1_000;
        })
        .llm_response("")
        .spawn();

    h.send("our authentication strategy covers the login flows").await;
    h.send("the authentication tokens expire after ninety minutes").await;
    h.send("authentication sessions renew whenever the refresh succeeds").await;
    h.send("anyway lunch plans are pasta downstairs apparently").await;

    let event = h
        .expect_event("batch flushed on topic change", |e| {
            matches!(e, IntelligenceEvent::BatchFlushed { .. })
        })
        .await;

    match event {
        IntelligenceEvent::BatchFlushed {
            reason,
            fragment_count,
            ..
        } => {
            assert_eq!(reason, "topic_changed");
            assert_eq!(fragment_count, 3, "the lunch fragment must not join");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn immediate_priority_flushes_without_waiting_for_context() {
    let mut h = HarnessBuilder::new().llm_response("").spawn();

    h.send("we must send the incident report by friday").await;

    let event = h
        .expect_event("immediate flush", |e| {
            matches!(e, IntelligenceEvent::BatchFlushed { .. })
        })
        .await;

    match event {
        IntelligenceEvent::BatchFlushed {
            reason,
            fragment_count,
            ..
        } => {
            assert_eq!(reason, "priority_trigger");
            assert_eq!(fragment_count, 1);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn high_priority_waits_for_two_context_fragments() {
    let mut h = HarnessBuilder::new()
        .config(|c| c.signals.min_accumulated_words = 1_000)
        .llm_response("")
        .spawn();

    h.send("should we renegotiate the vendor contract terms?").await;
    h.send("the current terms run through next spring").await;
    h.send("procurement wanted another look at the numbers").await;

    let event = h
        .expect_event("trigger satisfied", |e| {
            matches!(e, IntelligenceEvent::BatchFlushed { .. })
        })
        .await;

    match event {
        IntelligenceEvent::BatchFlushed { fragment_count, .. } => {
            assert_eq!(fragment_count, 3, "question plus two context fragments");
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn filler_only_batch_is_discarded_without_a_model_call() {
    let mut h = HarnessBuilder::new()
        .config(|c| c.signals.min_accumulated_words = 1_000)
        .spawn();

    h.send("um yeah okay like right").await;
    h.send("uh so well yeah okay").await;
    h.send("hmm yeah right so um").await;
    h.send("like just yeah um well").await;
    h.send("okay okay so so um").await;

    let event = h
        .expect_event("batch discarded", |e| {
            matches!(e, IntelligenceEvent::BatchDiscarded { .. })
        })
        .await;

    match event {
        IntelligenceEvent::BatchDiscarded { fragment_count, .. } => {
            assert_eq!(fragment_count, 5);
        }
        _ => unreachable!(),
    }
    assert_eq!(
        h.llm.opens.load(Ordering::SeqCst),
        0,
        "no model call for content-free batches"
    );
}

#[tokio::test]
async fn accumulated_word_budget_forces_processing() {
    let mut h = HarnessBuilder::new().llm_response("").spawn();

    h.send(
        "the office renovation continues through the quarter with painters working across \
         three floors while furniture deliveries arrive slowly and the cafeteria menu rotates \
         between pasta salads soups and sandwiches during the entire period",
    )
    .await;

    let event = h
        .expect_event("word budget flush", |e| {
            matches!(e, IntelligenceEvent::BatchFlushed { .. })
        })
        .await;

    match event {
        IntelligenceEvent::BatchFlushed { reason, .. } => {
            assert_eq!(reason, "word_budget");
        }
        _ => unreachable!(),
    }
}
