use std::time::Duration;

use confab_intelligence::IntelligenceEvent;
use confab_intelligence::cascade::{AnswerTier, QuestionState};

use crate::fixtures::HarnessBuilder;

#[tokio::test]
async fn question_resolves_from_knowledge_base() {
    let mut h = HarnessBuilder::new()
        .config(|c| c.signals.max_accumulated_fragments = 1)
        .llm_response(
            "{\"type\":\"question\",\"text\":\"What is the parental leave policy?\",\"confidence\":0.9}\n",
        )
        .knowledge_hit(0.92, "Sixteen weeks fully paid.")
        .spawn();

    h.send("what is the parental leave policy for new hires?").await;

    h.expect_event("question opened", |e| {
        matches!(e, IntelligenceEvent::QuestionOpened { .. })
    })
    .await;

    let resolved = h
        .expect_event("question resolved", |e| {
            matches!(e, IntelligenceEvent::QuestionResolved { .. })
        })
        .await;

    match resolved {
        IntelligenceEvent::QuestionResolved {
            tier,
            state,
            confidence,
            ..
        } => {
            assert_eq!(tier, AnswerTier::KnowledgeSearch);
            assert_eq!(state, QuestionState::Found);
            assert!(confidence >= 0.75);
        }
        _ => unreachable!(),
    }

    assert_eq!(h.store.questions.lock().unwrap().len(), 1);
    let updates = h.store.question_updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].1.answer_text.as_deref(),
        Some("Sixteen weeks fully paid.")
    );

    let payloads = h.sink.payloads.lock().unwrap();
    assert!(
        payloads
            .iter()
            .any(|(_, p)| p["kind"] == "question_resolved")
    );
}

#[tokio::test]
async fn budget_question_answered_by_live_conversation() {
    let mut h = HarnessBuilder::new()
        .topics(vec!["budget"])
        .config(|c| c.signals.max_accumulated_fragments = 1)
        .llm_response(
            "{\"type\":\"question\",\"text\":\"What is the budget for Q4?\",\"confidence\":0.9}\n",
        )
        .llm_response(
            "{\"type\":\"answer\",\"match_question_text\":\"What is the budget for Q4?\",\
             \"answer_text\":\"The budget is $250,000\",\"confidence\":0.95}\n",
        )
        .spawn();

    h.send("What is the budget for Q4?").await;
    h.expect_event("question opened", |e| {
        matches!(e, IntelligenceEvent::QuestionOpened { .. })
    })
    .await;

    h.send("The budget is $250,000").await;

    let resolved = h
        .expect_event("question answered", |e| {
            matches!(e, IntelligenceEvent::QuestionResolved { .. })
        })
        .await;

    match resolved {
        IntelligenceEvent::QuestionResolved {
            tier,
            state,
            confidence,
            ..
        } => {
            assert_eq!(tier, AnswerTier::LiveConversation);
            assert_eq!(state, QuestionState::Answered);
            assert!(confidence >= 0.85);
        }
        _ => unreachable!(),
    }

    let updates = h.store.question_updates.lock().unwrap();
    assert_eq!(updates.len(), 1, "exactly one recorded resolution");
    assert_eq!(updates[0].1.state, QuestionState::Answered);
    assert_eq!(
        updates[0].1.answer_text.as_deref(),
        Some("The budget is $250,000")
    );
}

#[tokio::test]
async fn action_detections_are_routed_to_the_store() {
    let mut h = HarnessBuilder::new()
        .config(|c| c.signals.max_accumulated_fragments = 1)
        .llm_response(concat!(
            "{\"type\":\"action\",\"description\":\"Send the QBR deck\",\"owner\":\"Dana\",",
            "\"deadline\":\"friday\",\"completeness\":0.8,\"confidence\":0.9}\n",
            "{\"type\":\"action_update\",\"match_text\":\"Send the QBR deck\",",
            "\"completeness\":1.0,\"confidence\":0.85}\n",
        ))
        .spawn();

    h.send("dana will send the qbr deck by friday").await;

    h.expect_event("action detected", |e| {
        matches!(e, IntelligenceEvent::ActionDetected { .. })
    })
    .await;
    h.expect_event("action updated", |e| {
        matches!(e, IntelligenceEvent::ActionUpdated { .. })
    })
    .await;

    let actions = h.store.actions.lock().unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].owner.as_deref(), Some("Dana"));

    let updates = h.store.action_updates.lock().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].completeness, 1.0);
}

#[tokio::test]
async fn sink_failure_does_not_block_resolution() {
    let mut h = HarnessBuilder::new()
        .config(|c| c.signals.max_accumulated_fragments = 1)
        .llm_response(
            "{\"type\":\"question\",\"text\":\"Where is the runbook?\",\"confidence\":0.9}\n",
        )
        .knowledge_hit(0.9, "Linked from the operations wiki.")
        .failing_sink()
        .spawn();

    h.send("where is the runbook for this service kept?").await;

    h.expect_event("resolved despite sink failure", |e| {
        matches!(e, IntelligenceEvent::QuestionResolved { .. })
    })
    .await;

    assert_eq!(h.store.question_updates.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn unmatched_answer_detection_is_dropped() {
    let mut h = HarnessBuilder::new()
        .config(|c| c.signals.max_accumulated_fragments = 1)
        .llm_response(
            "{\"type\":\"answer\",\"match_question_text\":\"Was anything decided about hiring?\",\
             \"answer_text\":\"Two new roles\",\"confidence\":0.95}\n",
        )
        .spawn();

    h.send("we are opening two new roles next month").await;

    h.expect_event("batch flushed", |e| {
        matches!(e, IntelligenceEvent::BatchFlushed { .. })
    })
    .await;

    // Give routing a beat, then confirm nothing was resolved or stored.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.questions.lock().unwrap().is_empty());
    assert!(h.store.question_updates.lock().unwrap().is_empty());
}
