pub mod monitor;

pub use monitor::{LiveConversationMonitor, MonitorOutcome};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backends::{
    LlmMessage, LlmRequest, QuestionUpdate, SearchFilters, SearchHit,
};
use crate::cache::SharedSearchCache;
use crate::config::{CascadeConfig, StreamConfig, TierConfig};
use crate::engine::EngineServices;
use crate::signals::substantive_words;
use crate::{IntelligenceEvent, SessionDescriptor, TranscriptFragment};

/// Appended to every general-knowledge answer.
const GENERAL_KNOWLEDGE_DISCLAIMER: &str =
    "Generated from general knowledge, not from your organization's own content.";

const GENERATION_INSTRUCTION: &str = "\
Answer the question from your general knowledge only. Respond with exactly \
one JSON object: {\"answer\": \"...\", \"confidence\": 0..1}. Use a low \
confidence when you are unsure. No prose outside the JSON object.";

/// Question lifecycle. `Searching` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionState {
    Searching,
    /// A satisfying source was located (tiers 1, 2 and 4).
    Found,
    /// A live-conversation match arrived (tier 3 or an answer detection).
    Answered,
}

/// One ranked source in the answer-resolution cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerTier {
    KnowledgeSearch,
    MeetingContext,
    LiveConversation,
    GeneralKnowledge,
}

/// Log entry for one tier's result on one question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierAttempt {
    pub tier: AnswerTier,
    pub confidence: Option<f32>,
    pub accepted: bool,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// An open question tracked through the cascade.
#[derive(Debug, Clone)]
pub struct TrackedQuestion {
    pub id: Uuid,
    pub text: String,
    pub speaker: Option<String>,
    pub detection_confidence: f32,
    pub state: QuestionState,
    pub resolving_tier: Option<AnswerTier>,
    pub resolving_confidence: Option<f32>,
    pub answer_text: Option<String>,
    pub attempts: Vec<TierAttempt>,
    pub opened_at: DateTime<Utc>,
    /// Fired on any terminal transition so outstanding watches cancel.
    cancel: Arc<Notify>,
}

/// Per-session registry of open questions and their resolution state.
///
/// Mutations go through entry-level locks, so the session worker and any
/// in-flight monitor tasks can share it; terminal transitions are idempotent.
#[derive(Default)]
pub struct QuestionTracker {
    questions: DashMap<Uuid, TrackedQuestion>,
}

impl QuestionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, text: &str, speaker: Option<String>, confidence: f32) -> Uuid {
        let id = Uuid::new_v4();
        self.questions.insert(
            id,
            TrackedQuestion {
                id,
                text: text.to_string(),
                speaker,
                detection_confidence: confidence,
                state: QuestionState::Searching,
                resolving_tier: None,
                resolving_confidence: None,
                answer_text: None,
                attempts: Vec::new(),
                opened_at: Utc::now(),
                cancel: Arc::new(Notify::new()),
            },
        );
        id
    }

    pub fn get(&self, id: Uuid) -> Option<TrackedQuestion> {
        self.questions.get(&id).map(|q| q.clone())
    }

    pub fn state(&self, id: Uuid) -> Option<QuestionState> {
        self.questions.get(&id).map(|q| q.state)
    }

    pub fn question_text(&self, id: Uuid) -> Option<String> {
        self.questions.get(&id).map(|q| q.text.clone())
    }

    pub fn cancel_handle(&self, id: Uuid) -> Option<Arc<Notify>> {
        self.questions.get(&id).map(|q| Arc::clone(&q.cancel))
    }

    pub fn searching_count(&self) -> usize {
        self.questions
            .iter()
            .filter(|q| q.state == QuestionState::Searching)
            .count()
    }

    /// Records a tier result that did not resolve the question.
    pub fn record_attempt(&self, id: Uuid, tier: AnswerTier, confidence: Option<f32>, detail: &str) {
        if let Some(mut q) = self.questions.get_mut(&id) {
            q.attempts.push(TierAttempt {
                tier,
                confidence,
                accepted: false,
                detail: detail.to_string(),
                at: Utc::now(),
            });
        }
    }

    /// Attempts the terminal transition. Returns `true` only for the single
    /// call that actually moved the question out of `Searching`; later calls
    /// record their result as metadata and leave the state untouched.
    pub fn try_resolve(&self, id: Uuid, tier: AnswerTier, confidence: f32, answer_text: &str) -> bool {
        let Some(mut q) = self.questions.get_mut(&id) else {
            return false;
        };

        if q.state != QuestionState::Searching {
            q.attempts.push(TierAttempt {
                tier,
                confidence: Some(confidence),
                accepted: false,
                detail: "question already terminal".to_string(),
                at: Utc::now(),
            });
            return false;
        }

        q.state = if tier == AnswerTier::LiveConversation {
            QuestionState::Answered
        } else {
            QuestionState::Found
        };
        q.resolving_tier = Some(tier);
        q.resolving_confidence = Some(confidence);
        q.answer_text = Some(answer_text.to_string());
        q.attempts.push(TierAttempt {
            tier,
            confidence: Some(confidence),
            accepted: true,
            detail: "resolved".to_string(),
            at: Utc::now(),
        });
        q.cancel.notify_waiters();
        true
    }

    /// Finds the open question best matching an answer's `match_text`:
    /// normalized equality first, then highest keyword overlap above 0.6.
    pub fn match_answer(&self, match_text: &str) -> Option<Uuid> {
        let normalized = normalize(match_text);
        let keywords: HashSet<String> = substantive_words(match_text).into_iter().collect();

        let mut best: Option<(Uuid, f32)> = None;
        for q in self.questions.iter() {
            if q.state != QuestionState::Searching {
                continue;
            }
            if normalize(&q.text) == normalized {
                return Some(q.id);
            }
            if keywords.is_empty() {
                continue;
            }
            let question_words: HashSet<String> =
                substantive_words(&q.text).into_iter().collect();
            if question_words.is_empty() {
                continue;
            }
            let shared = keywords.intersection(&question_words).count();
            let overlap = shared as f32 / keywords.len().max(question_words.len()) as f32;
            if overlap >= 0.6 && best.is_none_or(|(_, b)| overlap > b) {
                best = Some((q.id, overlap));
            }
        }
        best.map(|(id, _)| id)
    }
}

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolves detected questions through an ordered cascade of answer sources,
/// each gated by its own confidence floor, first match wins.
///
/// Tiers 1–2 (knowledge search, meeting context) run inline in the session's
/// routing path; tiers 3–4 (live monitor, generation) continue as a deferred
/// background task per question.
pub struct AnswerResolutionCascade {
    config: CascadeConfig,
    stream_config: StreamConfig,
    services: EngineServices,
    cache: Arc<SharedSearchCache>,
    events: broadcast::Sender<IntelligenceEvent>,
}

impl AnswerResolutionCascade {
    pub fn new(
        config: CascadeConfig,
        stream_config: StreamConfig,
        services: EngineServices,
        cache: Arc<SharedSearchCache>,
        events: broadcast::Sender<IntelligenceEvent>,
    ) -> Self {
        Self {
            config,
            stream_config,
            services,
            cache,
            events,
        }
    }

    /// Runs the fast tiers (1: knowledge search, 2: meeting context).
    /// Returns `true` if the question reached a terminal state.
    pub async fn resolve_inline(
        &self,
        session: &SessionDescriptor,
        tracker: &QuestionTracker,
        question_id: Uuid,
    ) -> bool {
        let Some(question_text) = tracker.question_text(question_id) else {
            return false;
        };

        if self.knowledge_tier(session, tracker, question_id, &question_text).await {
            return true;
        }
        if self.meeting_context_tier(session, tracker, question_id, &question_text).await {
            return true;
        }
        false
    }

    /// Runs the slow tiers (3: live monitor, 4: generation) to completion.
    /// Spawned as a background task; bounded by the monitor window and the
    /// tier timeout, and cancellable through the question's notify handle.
    pub async fn run_deferred(
        self: Arc<Self>,
        session: SessionDescriptor,
        tracker: Arc<QuestionTracker>,
        question_id: Uuid,
        fragments: broadcast::Receiver<TranscriptFragment>,
    ) {
        if tracker.state(question_id) != Some(QuestionState::Searching) {
            return;
        }
        let Some(question_text) = tracker.question_text(question_id) else {
            return;
        };

        if self.config.live_monitor.enabled {
            let Some(cancel) = tracker.cancel_handle(question_id) else {
                return;
            };
            let monitor = LiveConversationMonitor::new(
                Arc::clone(&self.services.embedder),
                self.config.live_monitor.confidence_floor,
                Duration::from_secs(self.config.monitor_window_secs),
            );

            match monitor.watch(&question_text, cancel, fragments).await {
                MonitorOutcome::Matched {
                    fragment,
                    confidence,
                } => {
                    // Either this resolves the question or it already went
                    // terminal through another path; done either way.
                    self.finalize(
                        &session,
                        &tracker,
                        question_id,
                        AnswerTier::LiveConversation,
                        confidence,
                        &fragment.text,
                    )
                    .await;
                    return;
                }
                MonitorOutcome::Cancelled => {
                    debug!(%question_id, "Live monitor cancelled, question resolved elsewhere");
                    return;
                }
                MonitorOutcome::Expired => {
                    tracker.record_attempt(
                        question_id,
                        AnswerTier::LiveConversation,
                        None,
                        "monitor window expired",
                    );
                }
            }
        }

        if tracker.state(question_id) != Some(QuestionState::Searching) {
            return;
        }

        if self
            .generation_tier(&session, &tracker, question_id, &question_text)
            .await
        {
            return;
        }

        if tracker.state(question_id) == Some(QuestionState::Searching) {
            // Every enabled tier struck out. The question stays in Searching;
            // downstream decides how to surface "unresolved".
            info!(%question_id, "Answer cascade exhausted");
            let _ = self.events.send(IntelligenceEvent::CascadeExhausted {
                session_id: session.session_id.clone(),
                question_id,
            });
            self.notify(
                &session.session_id,
                json!({
                    "kind": "cascade_exhausted",
                    "question_id": question_id,
                }),
            )
            .await;
        }
    }

    /// Routes an `Answer` detection from the model stream: matches it against
    /// the open questions and resolves on a sufficient confidence.
    pub async fn handle_answer_detection(
        &self,
        session: &SessionDescriptor,
        tracker: &QuestionTracker,
        match_question_text: &str,
        answer_text: &str,
        confidence: f32,
    ) {
        let Some(question_id) = tracker.match_answer(match_question_text) else {
            // Not an error: the model matched against a question this core
            // never opened (or one already resolved).
            debug!(%match_question_text, "No open question matches answer, dropping");
            return;
        };

        if confidence < self.config.live_monitor.confidence_floor {
            tracker.record_attempt(
                question_id,
                AnswerTier::LiveConversation,
                Some(confidence),
                "answer detection below confidence floor",
            );
            return;
        }

        self.finalize(
            session,
            tracker,
            question_id,
            AnswerTier::LiveConversation,
            confidence,
            answer_text,
        )
        .await;
    }

    /// Tier 1: pre-indexed organizational knowledge, through the shared cache.
    async fn knowledge_tier(
        &self,
        session: &SessionDescriptor,
        tracker: &QuestionTracker,
        question_id: Uuid,
        question_text: &str,
    ) -> bool {
        if !self.config.knowledge.enabled {
            return false;
        }

        let filters = SearchFilters {
            content_types: vec!["document".to_string(), "knowledge".to_string()],
            session_id: None,
        };
        let results = self
            .scoped_search(session, question_text, filters, true)
            .await;

        self.accept_best(
            session,
            tracker,
            question_id,
            AnswerTier::KnowledgeSearch,
            &self.config.knowledge,
            results,
        )
        .await
    }

    /// Tier 2: the active session's own indexed content. Bypasses the shared
    /// cache; its result set is session-filtered and must not be served to
    /// (or poisoned by) the organization-wide phase.
    async fn meeting_context_tier(
        &self,
        session: &SessionDescriptor,
        tracker: &QuestionTracker,
        question_id: Uuid,
        question_text: &str,
    ) -> bool {
        if !self.config.meeting_context.enabled {
            return false;
        }

        let filters = SearchFilters {
            content_types: vec!["transcript".to_string()],
            session_id: Some(session.session_id.clone()),
        };
        let results = self
            .scoped_search(session, question_text, filters, false)
            .await;

        self.accept_best(
            session,
            tracker,
            question_id,
            AnswerTier::MeetingContext,
            &self.config.meeting_context,
            results,
        )
        .await
    }

    /// Tier 4: last-resort general-knowledge generation.
    async fn generation_tier(
        &self,
        session: &SessionDescriptor,
        tracker: &QuestionTracker,
        question_id: Uuid,
        question_text: &str,
    ) -> bool {
        if !self.config.generation.enabled {
            return false;
        }

        let request = LlmRequest {
            messages: vec![
                LlmMessage::system(GENERATION_INSTRUCTION),
                LlmMessage::user(question_text),
            ],
            model: self.stream_config.model.clone(),
            temperature: self.stream_config.temperature,
            max_tokens: self.stream_config.max_tokens,
        };

        let timeout = Duration::from_secs(self.config.tier_timeout_secs);
        let response =
            match tokio::time::timeout(timeout, self.services.transport.complete(request)).await {
                Ok(Ok(text)) => text,
                Ok(Err(e)) => {
                    warn!(%question_id, %e, "Generation tier transport failed");
                    tracker.record_attempt(
                        question_id,
                        AnswerTier::GeneralKnowledge,
                        None,
                        "transport failure",
                    );
                    return false;
                }
                Err(_) => {
                    warn!(%question_id, "Generation tier timed out");
                    tracker.record_attempt(
                        question_id,
                        AnswerTier::GeneralKnowledge,
                        None,
                        "timed out",
                    );
                    return false;
                }
            };

        let Some((answer, confidence)) = parse_generated_answer(&response) else {
            warn!(%question_id, "Generation tier returned unparseable output");
            tracker.record_attempt(
                question_id,
                AnswerTier::GeneralKnowledge,
                None,
                "unparseable output",
            );
            return false;
        };

        if confidence < self.config.generation.confidence_floor {
            tracker.record_attempt(
                question_id,
                AnswerTier::GeneralKnowledge,
                Some(confidence),
                "below confidence floor",
            );
            return false;
        }

        let disclaimed = format!("{answer}\n\n{GENERAL_KNOWLEDGE_DISCLAIMER}");
        self.finalize(
            session,
            tracker,
            question_id,
            AnswerTier::GeneralKnowledge,
            confidence,
            &disclaimed,
        )
        .await
    }

    async fn scoped_search(
        &self,
        session: &SessionDescriptor,
        question_text: &str,
        filters: SearchFilters,
        through_cache: bool,
    ) -> Vec<SearchHit> {
        let search = Arc::clone(&self.services.search);
        let scope = session.scope.clone();
        let limit = self.config.search_limit;
        let threshold = self.config.search_score_threshold;

        if through_cache {
            self.cache
                .get_or_search(&session.session_id, question_text, &session.scope, |vector| {
                    async move {
                        search
                            .search(&vector, &scope, &filters, limit, threshold)
                            .await
                    }
                })
                .await
        } else {
            let vector = match self.services.embedder.embed(question_text).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(%e, "Embedding failed for scoped search, skipping tier");
                    return Vec::new();
                }
            };
            match search.search(&vector, &scope, &filters, limit, threshold).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(%e, "Scoped search failed, skipping tier");
                    Vec::new()
                }
            }
        }
    }

    /// Accepts the best-scoring hit if it clears the tier's floor.
    async fn accept_best(
        &self,
        session: &SessionDescriptor,
        tracker: &QuestionTracker,
        question_id: Uuid,
        tier: AnswerTier,
        tier_config: &TierConfig,
        results: Vec<SearchHit>,
    ) -> bool {
        let best = results
            .into_iter()
            .max_by(|a, b| a.score.total_cmp(&b.score));

        let Some(best) = best else {
            tracker.record_attempt(question_id, tier, None, "no results");
            return false;
        };

        if best.score < tier_config.confidence_floor {
            tracker.record_attempt(question_id, tier, Some(best.score), "below confidence floor");
            return false;
        }

        let answer_text = best
            .content()
            .map(|s| s.to_string())
            .unwrap_or_else(|| best.payload.to_string());

        self.finalize(session, tracker, question_id, tier, best.score, &answer_text)
            .await
    }

    /// Performs the terminal transition plus its side effects: durable store
    /// update, notification sink, event bus.
    async fn finalize(
        &self,
        session: &SessionDescriptor,
        tracker: &QuestionTracker,
        question_id: Uuid,
        tier: AnswerTier,
        confidence: f32,
        answer_text: &str,
    ) -> bool {
        if !tracker.try_resolve(question_id, tier, confidence, answer_text) {
            return false;
        }

        let state = if tier == AnswerTier::LiveConversation {
            QuestionState::Answered
        } else {
            QuestionState::Found
        };

        info!(%question_id, ?tier, confidence, "Question resolved");

        let update = QuestionUpdate {
            state,
            resolving_tier: tier,
            resolving_confidence: confidence,
            answer_text: Some(answer_text.to_string()),
        };
        if let Err(e) = self.services.store.update_question(question_id, &update).await {
            warn!(%question_id, %e, "Failed to persist question resolution");
        }

        self.notify(
            &session.session_id,
            json!({
                "kind": "question_resolved",
                "question_id": question_id,
                "tier": tier,
                "state": state,
                "confidence": confidence,
                "answer": answer_text,
            }),
        )
        .await;

        let _ = self.events.send(IntelligenceEvent::QuestionResolved {
            session_id: session.session_id.clone(),
            question_id,
            tier,
            state,
            confidence,
        });

        true
    }

    /// Fire-and-forget: sink failures are logged and never fail the cascade.
    async fn notify(&self, session_id: &str, payload: serde_json::Value) {
        if let Err(e) = self.services.sink.notify(session_id, payload).await {
            warn!(%session_id, %e, "Notification sink failed");
        }
    }
}

/// Extracts `{"answer": ..., "confidence": ...}` from the model's response,
/// tolerating stray prose around the JSON object.
fn parse_generated_answer(response: &str) -> Option<(String, f32)> {
    let trimmed = response.trim();
    let candidate = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        trimmed.get(start..=end)?.to_string()
    };

    let value: serde_json::Value = serde_json::from_str(&candidate).ok()?;
    let answer = value.get("answer")?.as_str()?.to_string();
    let confidence = value.get("confidence")?.as_f64()? as f32;
    Some((answer, confidence))
}
