use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, broadcast};
use tracing::debug;

use crate::TranscriptFragment;
use crate::backends::{EmbeddingBackend, cosine_similarity};
use crate::signals::substantive_words;

/// Outcome of one live-conversation watch.
#[derive(Debug)]
pub enum MonitorOutcome {
    /// A subsequent fragment matched the open question above the floor.
    Matched {
        fragment: TranscriptFragment,
        confidence: f32,
    },
    /// The question was resolved elsewhere; the watch was cancelled.
    Cancelled,
    /// The bounded window elapsed without a match.
    Expired,
}

/// Bounded-time watch over subsequent fragments for a semantically matching
/// answer to one open question.
///
/// Cancellation is explicit: the watch returns the instant `cancel` fires,
/// rather than waiting out its window, so the happy path stays low-latency.
pub struct LiveConversationMonitor {
    embedder: Arc<dyn EmbeddingBackend>,
    confidence_floor: f32,
    window: Duration,
}

impl LiveConversationMonitor {
    pub fn new(embedder: Arc<dyn EmbeddingBackend>, confidence_floor: f32, window: Duration) -> Self {
        Self {
            embedder,
            confidence_floor,
            window,
        }
    }

    pub async fn watch(
        &self,
        question_text: &str,
        cancel: Arc<Notify>,
        mut fragments: broadcast::Receiver<TranscriptFragment>,
    ) -> MonitorOutcome {
        let deadline = tokio::time::Instant::now() + self.window;
        let question_embedding = self.embedder.embed(question_text).await.ok();
        let question_keywords: HashSet<String> =
            substantive_words(question_text).into_iter().collect();
        let normalized_question = normalize(question_text);

        let cancelled = cancel.notified();
        tokio::pin!(cancelled);

        loop {
            let fragment = tokio::select! {
                _ = &mut cancelled => return MonitorOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return MonitorOutcome::Expired,
                received = fragments.recv() => match received {
                    Ok(fragment) => fragment,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "Live monitor lagged behind the fragment stream");
                        continue;
                    }
                    // Session stream ended; nothing left to watch.
                    Err(broadcast::error::RecvError::Closed) => return MonitorOutcome::Expired,
                },
            };

            // The question being repeated is not its own answer.
            if normalize(&fragment.text) == normalized_question {
                continue;
            }

            let confidence = self
                .match_confidence(&question_keywords, question_embedding.as_deref(), &fragment)
                .await;

            if confidence >= self.confidence_floor {
                debug!(confidence, text = %fragment.text, "Live conversation match");
                return MonitorOutcome::Matched {
                    fragment,
                    confidence,
                };
            }
        }
    }

    /// Combined text/semantic match score: the stronger of keyword overlap
    /// and embedding similarity (lexical-only when the embedder fails).
    async fn match_confidence(
        &self,
        question_keywords: &HashSet<String>,
        question_embedding: Option<&[f32]>,
        fragment: &TranscriptFragment,
    ) -> f32 {
        let fragment_words: HashSet<String> =
            substantive_words(&fragment.text).into_iter().collect();

        let lexical = if question_keywords.is_empty() {
            0.0
        } else {
            let shared = question_keywords.intersection(&fragment_words).count();
            shared as f32 / question_keywords.len() as f32
        };

        let semantic = match question_embedding {
            Some(q) => match self.embedder.embed(&fragment.text).await {
                Ok(f) => cosine_similarity(q, &f),
                Err(_) => 0.0,
            },
            None => 0.0,
        };

        lexical.max(semantic)
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
