use serde::{Deserialize, Serialize};

/// Configuration for the intelligence engine.
///
/// Every tunable threshold of every component lives here so deployments can
/// adjust them without code changes. Constructors take the section they need.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntelligenceConfig {
    pub signals: SignalConfig,
    pub coherence: CoherenceConfig,
    pub cache: CacheConfig,
    pub stream: StreamConfig,
    pub cascade: CascadeConfig,
}

/// Semantic signal scoring and batch accumulation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Fragments below this word count classify as Skip and score 0 density.
    pub min_word_count: usize,
    /// Density score at or above this is considered high density.
    pub high_density_threshold: f32,
    /// Accumulated fragment count that forces batch processing regardless of
    /// priority (worst-case latency bound).
    pub max_accumulated_fragments: usize,
    /// Accumulated word count that forces batch processing (keeps long
    /// monologues from starving analysis).
    pub min_accumulated_words: usize,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_word_count: 5,
            high_density_threshold: 0.3,
            max_accumulated_fragments: 5,
            min_accumulated_words: 30,
        }
    }
}

/// Topic coherence gating between consecutive fragments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoherenceConfig {
    /// Minimum cosine similarity between consecutive fragments to keep them
    /// in the same batch.
    pub similarity_threshold: f32,
    /// A batch open longer than this is force-closed even on a related topic.
    pub max_batch_secs: u64,
    /// A batch holding this many fragments is force-closed.
    pub max_batch_fragments: usize,
    /// Rolling window of recent fragment embeddings kept per session.
    pub embedding_window: usize,
    /// Timeout for a single embedding call.
    pub embed_timeout_ms: u64,
}

impl Default for CoherenceConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.70,
            max_batch_secs: 120,
            max_batch_fragments: 6,
            embedding_window: 8,
            embed_timeout_ms: 3_000,
        }
    }
}

/// Shared semantic-search cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Entry lifetime in seconds.
    pub ttl_secs: u64,
    /// Minimum cosine similarity between the cached query embedding and a new
    /// query for the cached results to be reused.
    pub reuse_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            reuse_threshold: 0.90,
        }
    }
}

/// Retry policy for one class of transport failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt budget (first call included).
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            backoff_factor: 2.0,
        }
    }
}

/// Streaming model call behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Model identifier passed to the transport.
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Rolling context fragments included with each batch request.
    pub context_window: usize,
    /// Retry policy for rate-limit signals (exponential backoff).
    pub rate_limit_retry: RetryPolicy,
    /// Retry policy for timeouts (small budget, increasing delay, then terminal).
    pub timeout_retry: RetryPolicy,
    /// Timeout for opening the transport call.
    pub open_timeout_secs: u64,
    /// Timeout between consecutive stream chunks once the call is open.
    pub chunk_timeout_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            temperature: 0.2,
            max_tokens: 2_048,
            context_window: 10,
            rate_limit_retry: RetryPolicy::default(),
            timeout_retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1_000,
                backoff_factor: 1.5,
            },
            open_timeout_secs: 30,
            chunk_timeout_secs: 30,
        }
    }
}

/// One ranked answer source in the resolution cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    pub enabled: bool,
    /// Minimum confidence a result must reach to resolve the question.
    pub confidence_floor: f32,
}

/// Answer resolution cascade tiers and their confidence floors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Tier 1: pre-indexed organizational knowledge search.
    pub knowledge: TierConfig,
    /// Tier 2: search over the active session's own indexed content.
    pub meeting_context: TierConfig,
    /// Tier 3: bounded live-conversation monitoring.
    pub live_monitor: TierConfig,
    /// Tier 4: general-knowledge generation (last resort, ungrounded).
    pub generation: TierConfig,
    /// How long the live-conversation monitor watches before giving up.
    pub monitor_window_secs: u64,
    /// Result cap for cascade vector searches.
    pub search_limit: usize,
    /// Score threshold passed to the vector search engine.
    pub search_score_threshold: f32,
    /// Timeout for per-tier model and search calls.
    pub tier_timeout_secs: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            knowledge: TierConfig {
                enabled: true,
                confidence_floor: 0.75,
            },
            meeting_context: TierConfig {
                enabled: true,
                confidence_floor: 0.75,
            },
            live_monitor: TierConfig {
                enabled: true,
                confidence_floor: 0.85,
            },
            generation: TierConfig {
                enabled: true,
                confidence_floor: 0.70,
            },
            monitor_window_secs: 120,
            search_limit: 5,
            search_score_threshold: 0.5,
            tier_timeout_secs: 15,
        }
    }
}
