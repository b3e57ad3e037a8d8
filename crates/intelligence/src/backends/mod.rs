pub mod http_llm;

pub use http_llm::HttpLlmTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::SearchScope;
use crate::cascade::{AnswerTier, QuestionState};

/// Computes text embeddings. External collaborator; assumed to fail
/// occasionally, always called with a bounded timeout.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync + 'static {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Human-readable backend name.
    fn name(&self) -> &str;
}

/// One ranked hit from the vector search engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub score: f32,
    pub payload: serde_json::Value,
}

impl SearchHit {
    /// Best-effort extraction of the hit's display text from its payload.
    pub fn content(&self) -> Option<&str> {
        self.payload
            .get("content")
            .or_else(|| self.payload.get("text"))
            .and_then(|v| v.as_str())
    }
}

/// Filters narrowing a vector search beyond its ownership scope.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    /// Restrict to these indexed content kinds (e.g. "document", "transcript").
    pub content_types: Vec<String>,
    /// Restrict to content produced by one meeting session.
    pub session_id: Option<String>,
}

/// Ranked vector search over pre-indexed content. External collaborator.
#[async_trait]
pub trait VectorSearchBackend: Send + Sync + 'static {
    async fn search(
        &self,
        vector: &[f32],
        scope: &SearchScope,
        filters: &SearchFilters,
        limit: usize,
        score_threshold: f32,
    ) -> anyhow::Result<Vec<SearchHit>>;

    fn name(&self) -> &str;
}

/// New question record routed to the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQuestion {
    pub id: Uuid,
    pub text: String,
    pub speaker: Option<String>,
    pub category: Option<String>,
    pub confidence: f32,
}

/// State change applied to a stored question when a tier resolves it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionUpdate {
    pub state: QuestionState,
    pub resolving_tier: AnswerTier,
    pub resolving_confidence: f32,
    pub answer_text: Option<String>,
}

/// New action item record routed to the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAction {
    pub id: Uuid,
    pub description: String,
    pub owner: Option<String>,
    pub deadline: Option<String>,
    pub speaker: Option<String>,
    pub completeness: f32,
    pub confidence: f32,
}

/// Update applied to a previously stored action, matched by description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionUpdateRecord {
    pub match_text: String,
    pub owner: Option<String>,
    pub deadline: Option<String>,
    pub completeness: f32,
    pub confidence: f32,
}

/// Durable question/action storage. External collaborator: this core decides
/// what to write and when a question changes state, never how it is stored.
#[async_trait]
pub trait QuestionStore: Send + Sync + 'static {
    async fn create_question(&self, session_id: &str, question: &NewQuestion)
    -> anyhow::Result<()>;

    async fn update_question(
        &self,
        question_id: Uuid,
        update: &QuestionUpdate,
    ) -> anyhow::Result<()>;

    async fn create_action(&self, session_id: &str, action: &NewAction) -> anyhow::Result<()>;

    async fn update_action(
        &self,
        session_id: &str,
        update: &ActionUpdateRecord,
    ) -> anyhow::Result<()>;
}

/// Fire-and-forget announcement channel for tier resolutions. Failures are
/// logged by callers and never fail the cascade.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(&self, session_id: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// A chat message sent to the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

impl LlmMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A model call: messages plus model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<LlmMessage>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Classified failure of the model transport call.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("rate limited")]
    RateLimited,
    #[error("request timed out")]
    TimedOut,
    #[error("service overloaded")]
    Overloaded,
    #[error("transport failure: {0}")]
    Other(String),
}

/// Byte chunks of a streamed model response.
pub type ByteStream = mpsc::Receiver<Result<Vec<u8>, TransportError>>;

/// Streaming language-model transport. External collaborator: this core owns
/// only the line-buffering/JSON-decoding layer on top of the byte stream.
#[async_trait]
pub trait LlmTransport: Send + Sync + 'static {
    /// Opens a streamed model call. Chunks arrive on the returned channel;
    /// the channel closing without an error item is normal completion.
    async fn open(&self, request: LlmRequest) -> Result<ByteStream, TransportError>;

    fn name(&self) -> &str;

    /// Runs a call to completion and returns the concatenated response text.
    /// Used by cascade tiers that need a single answer rather than a stream.
    async fn complete(&self, request: LlmRequest) -> Result<String, TransportError> {
        let mut rx = self.open(request).await?;
        let mut bytes = Vec::new();
        while let Some(chunk) = rx.recv().await {
            bytes.extend_from_slice(&chunk?);
        }
        String::from_utf8(bytes).map_err(|e| TransportError::Other(e.to_string()))
    }
}

/// Cosine similarity of two embedding vectors. Zero-magnitude or
/// length-mismatched inputs score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
