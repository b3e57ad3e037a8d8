use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::backends::{
    EmbeddingBackend, LlmTransport, NotificationSink, QuestionStore, VectorSearchBackend,
};
use crate::cache::SharedSearchCache;
use crate::coherence::TopicCoherenceGate;
use crate::config::IntelligenceConfig;
use crate::worker::SessionWorker;
use crate::{IntelligenceEvent, SessionDescriptor, TranscriptFragment};

/// The external collaborators the engine composes. All are narrow contracts;
/// none are implemented by this crate beyond the provided HTTP LLM transport.
#[derive(Clone)]
pub struct EngineServices {
    pub embedder: Arc<dyn EmbeddingBackend>,
    pub search: Arc<dyn VectorSearchBackend>,
    pub transport: Arc<dyn LlmTransport>,
    pub store: Arc<dyn QuestionStore>,
    pub sink: Arc<dyn NotificationSink>,
}

struct WorkerHandle {
    abort_handle: tokio::task::AbortHandle,
}

/// Manages per-session intelligence pipelines.
///
/// Created once at startup and shared via `Arc`. Each session gets its own
/// worker task draining that session's ordered fragment stream; sessions
/// never share mutable state, so tens of them run side by side without
/// cross-contamination.
pub struct IntelligenceEngine {
    services: EngineServices,
    config: IntelligenceConfig,
    gate: Arc<TopicCoherenceGate>,
    cache: Arc<SharedSearchCache>,
    /// Active worker tasks, keyed by session id.
    workers: DashMap<String, WorkerHandle>,
    event_tx: broadcast::Sender<IntelligenceEvent>,
}

impl IntelligenceEngine {
    /// Creates the engine. Returns `(engine, event_receiver)`.
    pub fn new(
        services: EngineServices,
        config: IntelligenceConfig,
    ) -> (Arc<Self>, broadcast::Receiver<IntelligenceEvent>) {
        let (event_tx, event_rx) = broadcast::channel(256);

        let gate = Arc::new(TopicCoherenceGate::new(
            Arc::clone(&services.embedder),
            config.coherence.clone(),
        ));
        let cache = Arc::new(SharedSearchCache::new(
            Arc::clone(&services.embedder),
            config.cache.clone(),
        ));

        info!(
            embedder = %services.embedder.name(),
            search = %services.search.name(),
            transport = %services.transport.name(),
            "Intelligence engine created"
        );

        let engine = Arc::new(Self {
            services,
            config,
            gate,
            cache,
            workers: DashMap::new(),
            event_tx,
        });

        (engine, event_rx)
    }

    /// Returns a new receiver for intelligence events.
    pub fn subscribe(&self) -> broadcast::Receiver<IntelligenceEvent> {
        self.event_tx.subscribe()
    }

    /// Starts a session worker draining `fragment_rx`.
    ///
    /// If a worker already exists for this session id, it is stopped first
    /// and its state released.
    pub fn start_session(
        self: &Arc<Self>,
        descriptor: SessionDescriptor,
        fragment_rx: mpsc::Receiver<TranscriptFragment>,
    ) {
        let session_id = descriptor.session_id.clone();

        if self.workers.contains_key(&session_id) {
            info!(%session_id, "Replacing existing session worker");
            self.stop_session(&session_id);
        }

        let worker = SessionWorker::new(
            descriptor,
            self.services.clone(),
            Arc::clone(&self.gate),
            Arc::clone(&self.cache),
            self.config.clone(),
            fragment_rx,
            self.event_tx.clone(),
        );

        // Spawn and auto-cleanup on natural exit (fragment channel closed).
        let engine = Arc::clone(self);
        let cleanup_id = session_id.clone();
        let handle = tokio::spawn(async move {
            worker.run().await;
            engine.workers.remove(&cleanup_id);
            engine.release_session_state(&cleanup_id);
            let _ = engine.event_tx.send(IntelligenceEvent::SessionClosed {
                session_id: cleanup_id.clone(),
            });
            debug!(%cleanup_id, "Session worker entry cleaned up");
        });

        self.workers.insert(
            session_id.clone(),
            WorkerHandle {
                abort_handle: handle.abort_handle(),
            },
        );

        debug!(%session_id, "Session worker started");
    }

    /// Stops a session's worker and synchronously releases its coherence
    /// window and cache entry. Leaving these behind is a resource leak under
    /// long deployments with many short meetings.
    pub fn stop_session(&self, session_id: &str) {
        if let Some((_, handle)) = self.workers.remove(session_id) {
            handle.abort_handle.abort();
            self.release_session_state(session_id);
            info!(%session_id, "Session stopped");
        }
    }

    /// Returns the number of active session workers.
    pub fn active_session_count(&self) -> usize {
        self.workers.len()
    }

    /// (cache hits, cache misses) across all sessions.
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    fn release_session_state(&self, session_id: &str) {
        self.gate.clear_session(session_id);
        self.cache.clear_session(session_id);
    }
}
