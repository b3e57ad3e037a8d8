pub mod backends;
pub mod cache;
pub mod cascade;
pub mod coherence;
pub mod config;
pub mod engine;
pub mod signals;
pub mod stream;
pub mod worker;

pub use cache::SharedSearchCache;
pub use cascade::{AnswerResolutionCascade, AnswerTier, QuestionState, QuestionTracker};
pub use coherence::TopicCoherenceGate;
pub use config::IntelligenceConfig;
pub use engine::{EngineServices, IntelligenceEngine};
pub use signals::{Priority, SemanticSignals, SignalAnalyzer};
pub use stream::{Detection, StreamingIntelligenceParser};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One incremental piece of transcript text delivered as the meeting progresses.
///
/// Fragments are immutable once created and arrive strictly ordered per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptFragment {
    /// Position in the session's ordered fragment stream.
    pub index: u64,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub speaker: Option<String>,
}

impl TranscriptFragment {
    pub fn new(index: u64, text: impl Into<String>, speaker: Option<String>) -> Self {
        Self {
            index,
            text: text.into(),
            timestamp: Utc::now(),
            speaker,
        }
    }
}

/// Ownership scope for searches and cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchScope {
    pub organization_id: Uuid,
    pub project_id: Uuid,
}

/// Identifies one meeting session and the scope its searches run under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub scope: SearchScope,
}

/// Events broadcast by the engine while sessions are being analyzed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IntelligenceEvent {
    /// A topic batch was closed and handed to the model.
    BatchFlushed {
        session_id: String,
        reason: String,
        fragment_count: usize,
    },
    /// A closed batch contained no analyzable content and was dropped.
    BatchDiscarded {
        session_id: String,
        fragment_count: usize,
    },
    /// A question was detected and entered the resolution cascade.
    QuestionOpened {
        session_id: String,
        question_id: Uuid,
        text: String,
    },
    /// A cascade tier resolved a question.
    QuestionResolved {
        session_id: String,
        question_id: Uuid,
        tier: AnswerTier,
        state: QuestionState,
        confidence: f32,
    },
    /// Every enabled tier was tried without clearing its confidence floor;
    /// the question stays open in `Searching`.
    CascadeExhausted {
        session_id: String,
        question_id: Uuid,
    },
    /// An action item was detected.
    ActionDetected {
        session_id: String,
        description: String,
        owner: Option<String>,
    },
    /// An update to a previously detected action item.
    ActionUpdated {
        session_id: String,
        match_text: String,
        completeness: f32,
    },
    /// The model stream for a batch failed terminally (after retries).
    StreamFailed {
        session_id: String,
        error: String,
    },
    /// A session worker exited and its state was released.
    SessionClosed {
        session_id: String,
    },
}
