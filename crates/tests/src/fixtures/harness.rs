//! Test harness: an intelligence engine wired to scripted mock collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use confab_intelligence::backends::{
    ActionUpdateRecord, ByteStream, EmbeddingBackend, LlmRequest, LlmTransport, NewAction,
    NewQuestion, NotificationSink, QuestionStore, QuestionUpdate, SearchFilters, SearchHit,
    TransportError, VectorSearchBackend,
};
use confab_intelligence::engine::EngineServices;
use confab_intelligence::{
    IntelligenceConfig, IntelligenceEngine, IntelligenceEvent, SearchScope, SessionDescriptor,
    TranscriptFragment,
};

/// Embeds each text onto the axis of the first topic marker it contains, so
/// same-topic texts are identical and different topics are orthogonal.
pub struct TopicEmbedder {
    topics: Vec<&'static str>,
}

#[async_trait]
impl EmbeddingBackend for TopicEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let lower = text.to_lowercase();
        let axis = self
            .topics
            .iter()
            .position(|t| lower.contains(t))
            .unwrap_or(self.topics.len());
        let mut vector = vec![0.0f32; self.topics.len() + 1];
        vector[axis] = 1.0;
        Ok(vector)
    }

    fn name(&self) -> &str {
        "topic"
    }
}

/// Vector search serving scripted hits: session-filtered searches get the
/// meeting list, everything else the knowledge list.
pub struct SplitSearch {
    knowledge: Vec<SearchHit>,
    meeting: Vec<SearchHit>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl VectorSearchBackend for SplitSearch {
    async fn search(
        &self,
        _vector: &[f32],
        _scope: &SearchScope,
        filters: &SearchFilters,
        _limit: usize,
        _score_threshold: f32,
    ) -> anyhow::Result<Vec<SearchHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if filters.session_id.is_some() {
            Ok(self.meeting.clone())
        } else {
            Ok(self.knowledge.clone())
        }
    }

    fn name(&self) -> &str {
        "split"
    }
}

/// LLM transport replaying one scripted response body per call, in order.
/// Calls beyond the script get an empty body.
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    pub opens: AtomicUsize,
}

#[async_trait]
impl LlmTransport for ScriptedLlm {
    async fn open(&self, _request: LlmRequest) -> Result<ByteStream, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let body = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            if !body.is_empty() {
                let _ = tx.send(Ok(body.into_bytes())).await;
            }
        });
        Ok(rx)
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Records everything the engine routes to the durable store.
#[derive(Default)]
pub struct RecordingStore {
    pub questions: Mutex<Vec<NewQuestion>>,
    pub question_updates: Mutex<Vec<(Uuid, QuestionUpdate)>>,
    pub actions: Mutex<Vec<NewAction>>,
    pub action_updates: Mutex<Vec<ActionUpdateRecord>>,
}

#[async_trait]
impl QuestionStore for RecordingStore {
    async fn create_question(&self, _session_id: &str, question: &NewQuestion) -> anyhow::Result<()> {
        self.questions.lock().unwrap().push(question.clone());
        Ok(())
    }

    async fn update_question(&self, id: Uuid, update: &QuestionUpdate) -> anyhow::Result<()> {
        self.question_updates.lock().unwrap().push((id, update.clone()));
        Ok(())
    }

    async fn create_action(&self, _session_id: &str, action: &NewAction) -> anyhow::Result<()> {
        self.actions.lock().unwrap().push(action.clone());
        Ok(())
    }

    async fn update_action(
        &self,
        _session_id: &str,
        update: &ActionUpdateRecord,
    ) -> anyhow::Result<()> {
        self.action_updates.lock().unwrap().push(update.clone());
        Ok(())
    }
}

/// Records notifications; optionally fails every call.
pub struct RecordingSink {
    pub payloads: Mutex<Vec<(String, serde_json::Value)>>,
    fail: bool,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, session_id: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        self.payloads
            .lock()
            .unwrap()
            .push((session_id.to_string(), payload));
        if self.fail {
            anyhow::bail!("sink unavailable");
        }
        Ok(())
    }
}

pub fn search_hit(score: f32, content: &str) -> SearchHit {
    SearchHit {
        id: Uuid::new_v4().to_string(),
        score,
        payload: serde_json::json!({ "content": content }),
    }
}

pub struct HarnessBuilder {
    config: IntelligenceConfig,
    topics: Vec<&'static str>,
    llm_responses: Vec<String>,
    knowledge_hits: Vec<SearchHit>,
    meeting_hits: Vec<SearchHit>,
    failing_sink: bool,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: IntelligenceConfig::default(),
            topics: Vec::new(),
            llm_responses: Vec::new(),
            knowledge_hits: Vec::new(),
            meeting_hits: Vec::new(),
            failing_sink: false,
        }
    }

    pub fn config(mut self, adjust: impl FnOnce(&mut IntelligenceConfig)) -> Self {
        adjust(&mut self.config);
        self
    }

    pub fn topics(mut self, topics: Vec<&'static str>) -> Self {
        self.topics = topics;
        self
    }

    pub fn llm_response(mut self, body: &str) -> Self {
        self.llm_responses.push(body.to_string());
        self
    }

    pub fn knowledge_hit(mut self, score: f32, content: &str) -> Self {
        self.knowledge_hits.push(search_hit(score, content));
        self
    }

    pub fn meeting_hit(mut self, score: f32, content: &str) -> Self {
        self.meeting_hits.push(search_hit(score, content));
        self
    }

    pub fn failing_sink(mut self) -> Self {
        self.failing_sink = true;
        self
    }

    /// Builds the engine and starts one session.
    pub fn spawn(self) -> TestHarness {
        let store = Arc::new(RecordingStore::default());
        let sink = Arc::new(RecordingSink {
            payloads: Mutex::new(Vec::new()),
            fail: self.failing_sink,
        });
        let search = Arc::new(SplitSearch {
            knowledge: self.knowledge_hits,
            meeting: self.meeting_hits,
            calls: AtomicUsize::new(0),
        });
        let llm = Arc::new(ScriptedLlm {
            responses: Mutex::new(self.llm_responses.into()),
            opens: AtomicUsize::new(0),
        });

        let services = EngineServices {
            embedder: Arc::new(TopicEmbedder {
                topics: self.topics,
            }),
            search: Arc::clone(&search) as Arc<dyn VectorSearchBackend>,
            transport: Arc::clone(&llm) as Arc<dyn LlmTransport>,
            store: Arc::clone(&store) as Arc<dyn QuestionStore>,
            sink: Arc::clone(&sink) as Arc<dyn NotificationSink>,
        };

        let (engine, events) = IntelligenceEngine::new(services, self.config);

        let descriptor = SessionDescriptor {
            session_id: format!("session-{}", Uuid::new_v4()),
            scope: SearchScope {
                organization_id: Uuid::new_v4(),
                project_id: Uuid::new_v4(),
            },
        };
        let (fragment_tx, fragment_rx) = mpsc::channel(64);
        engine.start_session(descriptor.clone(), fragment_rx);

        TestHarness {
            engine,
            events,
            fragment_tx: Some(fragment_tx),
            store,
            sink,
            search,
            llm,
            descriptor,
            next_index: 0,
        }
    }
}

pub struct TestHarness {
    pub engine: Arc<IntelligenceEngine>,
    pub events: broadcast::Receiver<IntelligenceEvent>,
    fragment_tx: Option<mpsc::Sender<TranscriptFragment>>,
    pub store: Arc<RecordingStore>,
    pub sink: Arc<RecordingSink>,
    pub search: Arc<SplitSearch>,
    pub llm: Arc<ScriptedLlm>,
    pub descriptor: SessionDescriptor,
    next_index: u64,
}

impl TestHarness {
    /// Delivers the next fragment of the session stream.
    pub async fn send(&mut self, text: &str) {
        self.send_from(None, text).await;
    }

    pub async fn send_from(&mut self, speaker: Option<&str>, text: &str) {
        let fragment = TranscriptFragment::new(
            self.next_index,
            text,
            speaker.map(|s| s.to_string()),
        );
        self.next_index += 1;
        self.fragment_tx
            .as_ref()
            .expect("fragment stream already closed")
            .send(fragment)
            .await
            .expect("session worker gone");
    }

    /// Ends the session's fragment stream (natural meeting end).
    pub fn close_stream(&mut self) {
        self.fragment_tx = None;
    }

    /// Waits up to five seconds for an event matching `matches`.
    pub async fn expect_event(
        &mut self,
        what: &str,
        matches: impl Fn(&IntelligenceEvent) -> bool,
    ) -> IntelligenceEvent {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for event: {what}"))
                .expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    }
}
