use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::TranscriptFragment;
use crate::backends::{EmbeddingBackend, cosine_similarity};
use crate::config::CoherenceConfig;

/// Why the gate continued or closed the open batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchReason {
    FirstFragment,
    TopicContinues,
    TopicChanged,
    MaxDurationExceeded,
    MaxFragmentsReached,
    /// Embedding service failed; the gate fails open.
    EmbeddingUnavailable,
}

/// Outcome of one coherence check.
#[derive(Debug, Clone)]
pub struct BatchDecision {
    /// `true`: the fragment continues the open batch. `false`: the open batch
    /// closes and the fragment becomes the first member of the next one.
    pub continue_batch: bool,
    pub reason: BatchReason,
    pub similarity: Option<f32>,
}

/// Per-session coherence state: the embedding of the most recent batched
/// fragment, a rolling window of recent embeddings, and batch bookkeeping.
struct CoherenceState {
    last_embedding: Option<Vec<f32>>,
    recent: VecDeque<Vec<f32>>,
    batch_opened_at: Instant,
    batch_len: usize,
}

impl CoherenceState {
    fn new(embedding: Option<Vec<f32>>) -> Self {
        let mut recent = VecDeque::new();
        if let Some(e) = &embedding {
            recent.push_back(e.clone());
        }
        Self {
            last_embedding: embedding,
            recent,
            batch_opened_at: Instant::now(),
            batch_len: 1,
        }
    }

    fn push(&mut self, embedding: Option<Vec<f32>>, window: usize) {
        if let Some(e) = embedding {
            self.recent.push_back(e.clone());
            while self.recent.len() > window {
                self.recent.pop_front();
            }
            self.last_embedding = Some(e);
        }
        self.batch_len += 1;
    }

    /// Resets batch bookkeeping after a flush, keeping the last embedding so
    /// the next fragment still compares against its true predecessor.
    fn reopen(&mut self, embedding: Option<Vec<f32>>, window: usize) {
        self.batch_opened_at = Instant::now();
        self.batch_len = 1;
        if let Some(e) = embedding {
            self.recent.push_back(e.clone());
            while self.recent.len() > window {
                self.recent.pop_front();
            }
            self.last_embedding = Some(e);
        }
    }
}

/// Decides whether a new fragment continues the currently accumulating batch
/// or forces it closed, using embedding similarity between consecutive
/// fragments plus hard duration/count ceilings.
///
/// Per-session state is created on first use and must be released with
/// `clear_session` when the session ends.
pub struct TopicCoherenceGate {
    embedder: Arc<dyn EmbeddingBackend>,
    config: CoherenceConfig,
    sessions: DashMap<String, CoherenceState>,
}

impl TopicCoherenceGate {
    pub fn new(embedder: Arc<dyn EmbeddingBackend>, config: CoherenceConfig) -> Self {
        Self {
            embedder,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Checks whether `fragment` continues the session's open batch.
    ///
    /// A closing decision already accounts for the fragment starting the next
    /// batch: the gate's state is reopened around it before returning.
    pub async fn should_batch(&self, session_id: &str, fragment: &TranscriptFragment) -> BatchDecision {
        // First fragment of a session: nothing to compare against.
        if !self.sessions.contains_key(session_id) {
            let embedding = self.embed(&fragment.text).await;
            self.sessions
                .insert(session_id.to_string(), CoherenceState::new(embedding));
            return BatchDecision {
                continue_batch: true,
                reason: BatchReason::FirstFragment,
                similarity: None,
            };
        }

        // Safety ceilings override the similarity decision.
        if let Some(reason) = self.ceiling_hit(session_id) {
            let embedding = self.embed(&fragment.text).await;
            if let Some(mut state) = self.sessions.get_mut(session_id) {
                state.reopen(embedding, self.config.embedding_window);
            }
            debug!(%session_id, ?reason, "Batch ceiling hit, forcing closure");
            return BatchDecision {
                continue_batch: false,
                reason,
                similarity: None,
            };
        }

        let embedding = self.embed(&fragment.text).await;

        let Some(embedding) = embedding else {
            // Fail open: treat the fragment as related rather than dropping
            // content on an embedding outage.
            if let Some(mut state) = self.sessions.get_mut(session_id) {
                state.push(None, self.config.embedding_window);
            }
            return BatchDecision {
                continue_batch: true,
                reason: BatchReason::EmbeddingUnavailable,
                similarity: None,
            };
        };

        let previous = self
            .sessions
            .get(session_id)
            .and_then(|s| s.last_embedding.clone());

        let Some(previous) = previous else {
            // Predecessor embedding was never computed (earlier failure).
            if let Some(mut state) = self.sessions.get_mut(session_id) {
                state.push(Some(embedding), self.config.embedding_window);
            }
            return BatchDecision {
                continue_batch: true,
                reason: BatchReason::EmbeddingUnavailable,
                similarity: None,
            };
        };

        let similarity = cosine_similarity(&previous, &embedding);

        if similarity >= self.config.similarity_threshold {
            if let Some(mut state) = self.sessions.get_mut(session_id) {
                state.push(Some(embedding), self.config.embedding_window);
            }
            BatchDecision {
                continue_batch: true,
                reason: BatchReason::TopicContinues,
                similarity: Some(similarity),
            }
        } else {
            debug!(%session_id, similarity, "Topic change detected, closing batch");
            if let Some(mut state) = self.sessions.get_mut(session_id) {
                state.reopen(Some(embedding), self.config.embedding_window);
            }
            BatchDecision {
                continue_batch: false,
                reason: BatchReason::TopicChanged,
                similarity: Some(similarity),
            }
        }
    }

    /// Resets batch bookkeeping after the caller flushed the batch for its own
    /// reasons (priority trigger, accumulation ceilings).
    pub fn note_flush(&self, session_id: &str) {
        if let Some(mut state) = self.sessions.get_mut(session_id) {
            state.batch_opened_at = Instant::now();
            state.batch_len = 0;
        }
    }

    /// Releases all per-session state. Required at session teardown.
    pub fn clear_session(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            debug!(%session_id, "Coherence state released");
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of embeddings currently held in a session's rolling window.
    pub fn window_len(&self, session_id: &str) -> usize {
        self.sessions
            .get(session_id)
            .map(|s| s.recent.len())
            .unwrap_or(0)
    }

    fn ceiling_hit(&self, session_id: &str) -> Option<BatchReason> {
        let state = self.sessions.get(session_id)?;
        if state.batch_opened_at.elapsed() > Duration::from_secs(self.config.max_batch_secs) {
            return Some(BatchReason::MaxDurationExceeded);
        }
        if state.batch_len >= self.config.max_batch_fragments {
            return Some(BatchReason::MaxFragmentsReached);
        }
        None
    }

    async fn embed(&self, text: &str) -> Option<Vec<f32>> {
        let timeout = Duration::from_millis(self.config.embed_timeout_ms);
        match tokio::time::timeout(timeout, self.embedder.embed(text)).await {
            Ok(Ok(embedding)) => Some(embedding),
            Ok(Err(e)) => {
                warn!(backend = %self.embedder.name(), %e, "Embedding call failed, failing open");
                None
            }
            Err(_) => {
                warn!(backend = %self.embedder.name(), "Embedding call timed out, failing open");
                None
            }
        }
    }
}
