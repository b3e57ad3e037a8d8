use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backends::{ActionUpdateRecord, NewAction, NewQuestion, QuestionStore};
use crate::cache::SharedSearchCache;
use crate::cascade::{AnswerResolutionCascade, QuestionState, QuestionTracker};
use crate::coherence::{BatchReason, TopicCoherenceGate};
use crate::config::IntelligenceConfig;
use crate::engine::EngineServices;
use crate::signals::{Priority, SignalAnalyzer};
use crate::stream::{Detection, IntelligenceRequest, StreamingIntelligenceParser};
use crate::{IntelligenceEvent, SessionDescriptor, TranscriptFragment};

/// Guard that aborts a spawned task when dropped.
///
/// `tokio::spawn` returns a `JoinHandle` whose `Drop` impl detaches (does NOT
/// abort) the task. This wrapper ensures the ingestion task is cancelled if
/// the worker future is cancelled (e.g. via AbortHandle).
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Why the ingestion loop closed a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    TopicChanged,
    MaxDurationExceeded,
    MaxFragmentsReached,
    /// A priority trigger accumulated its required context.
    PriorityTrigger,
    /// The accumulation fragment ceiling was hit.
    AccumulationCeiling,
    /// The accumulated word budget was reached.
    WordBudget,
    /// The fragment stream ended with content still pending.
    StreamEnded,
}

impl FlushReason {
    fn as_str(&self) -> &'static str {
        match self {
            FlushReason::TopicChanged => "topic_changed",
            FlushReason::MaxDurationExceeded => "max_duration_exceeded",
            FlushReason::MaxFragmentsReached => "max_fragments_reached",
            FlushReason::PriorityTrigger => "priority_trigger",
            FlushReason::AccumulationCeiling => "accumulation_ceiling",
            FlushReason::WordBudget => "word_budget",
            FlushReason::StreamEnded => "stream_ended",
        }
    }
}

/// A closed topic batch handed from the ingestion loop to the analysis loop.
/// Batches without analyzable content are dropped before this point.
struct ClosedBatch {
    fragments: Vec<TranscriptFragment>,
    /// Rolling context preceding the batch.
    context: Vec<TranscriptFragment>,
    reason: FlushReason,
}

/// Per-session async pipeline task.
///
/// Fragments flow through: signal analysis → coherence gate → batch
/// accumulation → [channel] → streaming model call → detection routing →
/// answer cascade.
///
/// The ingestion loop and analysis loop run as separate tasks so that
/// fragment intake is never blocked by model inference; because the analysis
/// loop is sequential, one batch's detections are fully drained and routed
/// before the next batch starts streaming.
pub struct SessionWorker {
    descriptor: SessionDescriptor,
    services: EngineServices,
    gate: Arc<TopicCoherenceGate>,
    cache: Arc<SharedSearchCache>,
    config: IntelligenceConfig,
    fragment_rx: mpsc::Receiver<TranscriptFragment>,
    event_tx: broadcast::Sender<IntelligenceEvent>,
}

impl SessionWorker {
    pub fn new(
        descriptor: SessionDescriptor,
        services: EngineServices,
        gate: Arc<TopicCoherenceGate>,
        cache: Arc<SharedSearchCache>,
        config: IntelligenceConfig,
        fragment_rx: mpsc::Receiver<TranscriptFragment>,
        event_tx: broadcast::Sender<IntelligenceEvent>,
    ) -> Self {
        Self {
            descriptor,
            services,
            gate,
            cache,
            config,
            fragment_rx,
            event_tx,
        }
    }

    /// Runs the worker pipeline until the fragment channel is closed.
    pub async fn run(self) {
        info!(
            session_id = %self.descriptor.session_id,
            "Intelligence session worker started"
        );

        let (batch_tx, batch_rx) = mpsc::channel::<ClosedBatch>(8);
        // Per-session fragment re-broadcast feeding live-conversation monitors.
        let (live_tx, _) = broadcast::channel::<TranscriptFragment>(64);

        let analyzer = SignalAnalyzer::new(self.config.signals.clone());
        let parser = StreamingIntelligenceParser::new(
            Arc::clone(&self.services.transport),
            self.config.stream.clone(),
        );
        let tracker = Arc::new(QuestionTracker::new());
        let cascade = Arc::new(AnswerResolutionCascade::new(
            self.config.cascade.clone(),
            self.config.stream.clone(),
            self.services.clone(),
            Arc::clone(&self.cache),
            self.event_tx.clone(),
        ));

        let ingestion = tokio::spawn(Self::ingestion_loop(
            self.fragment_rx,
            analyzer,
            Arc::clone(&self.gate),
            self.descriptor.session_id.clone(),
            self.config.clone(),
            batch_tx,
            live_tx.clone(),
            self.event_tx.clone(),
        ));

        // Guard ensures the ingestion task dies with this future.
        let _ingestion_guard = AbortOnDrop(ingestion);

        Self::analysis_loop(
            batch_rx,
            parser,
            cascade,
            tracker,
            Arc::clone(&self.services.store),
            self.descriptor.clone(),
            live_tx,
            self.event_tx.clone(),
        )
        .await;

        debug!(session_id = %self.descriptor.session_id, "Intelligence session worker stopped");
    }

    /// Ingestion loop: signal analysis → coherence gate → batch accumulation.
    ///
    /// Runs independently so fragments keep flowing (and live monitors keep
    /// seeing them) while the analysis loop waits on the model.
    #[allow(clippy::too_many_arguments)]
    async fn ingestion_loop(
        mut fragment_rx: mpsc::Receiver<TranscriptFragment>,
        analyzer: SignalAnalyzer,
        gate: Arc<TopicCoherenceGate>,
        session_id: String,
        config: IntelligenceConfig,
        batch_tx: mpsc::Sender<ClosedBatch>,
        live_tx: broadcast::Sender<TranscriptFragment>,
        event_tx: broadcast::Sender<IntelligenceEvent>,
    ) {
        let mut open_batch: Vec<TranscriptFragment> = Vec::new();
        let mut has_signal = false;
        // Fragments still needed before an armed priority trigger fires.
        let mut pending_context: Option<usize> = None;
        let mut context_history: VecDeque<TranscriptFragment> = VecDeque::new();

        let max_batch_age = Duration::from_secs(config.coherence.max_batch_secs);
        let mut batch_deadline = tokio::time::Instant::now() + max_batch_age;
        let mut fragment_count: u64 = 0;

        loop {
            let fragment = tokio::select! {
                received = fragment_rx.recv() => match received {
                    Some(f) => f,
                    None => break,
                },
                // The duration ceiling also applies while the stream is idle.
                _ = tokio::time::sleep_until(batch_deadline), if !open_batch.is_empty() => {
                    let sent = Self::flush(
                        &mut open_batch,
                        &mut has_signal,
                        &mut pending_context,
                        &mut context_history,
                        FlushReason::MaxDurationExceeded,
                        true,
                        &session_id,
                        &gate,
                        &config,
                        &batch_tx,
                        &event_tx,
                    )
                    .await;
                    if !sent {
                        return;
                    }
                    batch_deadline = tokio::time::Instant::now() + max_batch_age;
                    continue;
                }
            };

            fragment_count += 1;
            if fragment_count == 1 || fragment_count.is_multiple_of(100) {
                debug!(%session_id, fragment_count, "Fragments received");
            }

            // Feed live-conversation monitors; no subscribers is normal.
            let _ = live_tx.send(fragment.clone());

            let signals = analyzer.analyze(&fragment);
            let priority = analyzer.classify(&fragment, &signals);

            // The gate may close the open batch before this fragment joins;
            // a dissimilar fragment always opens the next batch instead.
            let decision = gate.should_batch(&session_id, &fragment).await;
            if !decision.continue_batch && !open_batch.is_empty() {
                let reason = match decision.reason {
                    BatchReason::MaxDurationExceeded => FlushReason::MaxDurationExceeded,
                    BatchReason::MaxFragmentsReached => FlushReason::MaxFragmentsReached,
                    _ => FlushReason::TopicChanged,
                };
                if !Self::flush(
                    &mut open_batch,
                    &mut has_signal,
                    &mut pending_context,
                    &mut context_history,
                    reason,
                    false,
                    &session_id,
                    &gate,
                    &config,
                    &batch_tx,
                    &event_tx,
                )
                .await
                {
                    return;
                }
            }

            if open_batch.is_empty() {
                batch_deadline = tokio::time::Instant::now() + max_batch_age;
            }

            open_batch.push(fragment);
            if priority != Priority::Skip {
                has_signal = true;
            }

            // This fragment is subsequent context for an already armed trigger.
            if let Some(remaining) = pending_context.as_mut()
                && *remaining > 0
            {
                *remaining -= 1;
            }

            // Arm (or tighten to) this fragment's own requirement.
            if let Some(required) = priority.required_context()
                && pending_context.is_none_or(|r| required < r)
            {
                pending_context = Some(required);
            }

            let accumulated_words: usize = open_batch
                .iter()
                .map(|f| f.text.split_whitespace().count())
                .sum();

            let flush_reason = if pending_context == Some(0) {
                Some(FlushReason::PriorityTrigger)
            } else if open_batch.len() >= config.signals.max_accumulated_fragments {
                Some(FlushReason::AccumulationCeiling)
            } else if accumulated_words >= config.signals.min_accumulated_words {
                Some(FlushReason::WordBudget)
            } else {
                None
            };

            if let Some(reason) = flush_reason {
                if !Self::flush(
                    &mut open_batch,
                    &mut has_signal,
                    &mut pending_context,
                    &mut context_history,
                    reason,
                    true,
                    &session_id,
                    &gate,
                    &config,
                    &batch_tx,
                    &event_tx,
                )
                .await
                {
                    return;
                }
                batch_deadline = tokio::time::Instant::now() + max_batch_age;
            }
        }

        // Stream ended: whatever is pending still deserves analysis.
        if !open_batch.is_empty() {
            let _ = Self::flush(
                &mut open_batch,
                &mut has_signal,
                &mut pending_context,
                &mut context_history,
                FlushReason::StreamEnded,
                true,
                &session_id,
                &gate,
                &config,
                &batch_tx,
                &event_tx,
            )
            .await;
        }

        debug!(%session_id, "Fragment channel closed, ingestion loop exiting");
    }

    /// Closes the open batch and hands it to the analysis loop.
    ///
    /// `reset_gate` is set for planner-initiated flushes; when the gate itself
    /// decided the closure it has already reopened its state around the new
    /// fragment and must not be reset again.
    ///
    /// Batches with no fragment above Skip are discarded without a model
    /// call. Returns `false` when the analysis loop is gone.
    #[allow(clippy::too_many_arguments)]
    async fn flush(
        open_batch: &mut Vec<TranscriptFragment>,
        has_signal: &mut bool,
        pending_context: &mut Option<usize>,
        context_history: &mut VecDeque<TranscriptFragment>,
        reason: FlushReason,
        reset_gate: bool,
        session_id: &str,
        gate: &TopicCoherenceGate,
        config: &IntelligenceConfig,
        batch_tx: &mpsc::Sender<ClosedBatch>,
        event_tx: &broadcast::Sender<IntelligenceEvent>,
    ) -> bool {
        let fragments = std::mem::take(open_batch);
        let signal = std::mem::take(has_signal);
        *pending_context = None;
        if reset_gate {
            gate.note_flush(session_id);
        }

        let context: Vec<TranscriptFragment> = context_history.iter().cloned().collect();
        for f in &fragments {
            context_history.push_back(f.clone());
        }
        while context_history.len() > config.stream.context_window {
            context_history.pop_front();
        }

        if !signal {
            debug!(
                %session_id,
                fragment_count = fragments.len(),
                "Discarding batch with no analyzable content"
            );
            let _ = event_tx.send(IntelligenceEvent::BatchDiscarded {
                session_id: session_id.to_string(),
                fragment_count: fragments.len(),
            });
            return true;
        }

        debug!(
            %session_id,
            reason = reason.as_str(),
            fragment_count = fragments.len(),
            "Batch flushed"
        );
        let _ = event_tx.send(IntelligenceEvent::BatchFlushed {
            session_id: session_id.to_string(),
            reason: reason.as_str().to_string(),
            fragment_count: fragments.len(),
        });

        let batch = ClosedBatch {
            fragments,
            context,
            reason,
        };

        if batch_tx.send(batch).await.is_err() {
            debug!(%session_id, "Analysis loop closed, stopping ingestion");
            return false;
        }
        true
    }

    /// Analysis loop: streams each closed batch through the model and routes
    /// the resulting detections. Sequential on purpose: detections from one
    /// batch are fully drained before the next batch streams.
    #[allow(clippy::too_many_arguments)]
    async fn analysis_loop(
        mut batch_rx: mpsc::Receiver<ClosedBatch>,
        parser: StreamingIntelligenceParser,
        cascade: Arc<AnswerResolutionCascade>,
        tracker: Arc<QuestionTracker>,
        store: Arc<dyn QuestionStore>,
        descriptor: SessionDescriptor,
        live_tx: broadcast::Sender<TranscriptFragment>,
        event_tx: broadcast::Sender<IntelligenceEvent>,
    ) {
        // In-flight deferred cascades (live monitors, generation). Dropping
        // the set aborts them, which is exactly what session teardown needs.
        let mut deferred: JoinSet<()> = JoinSet::new();

        while let Some(batch) = batch_rx.recv().await {
            while deferred.try_join_next().is_some() {}

            let request = IntelligenceRequest::new(
                render_fragments(&batch.fragments),
                render_fragments(&batch.context),
            );

            debug!(
                session_id = %descriptor.session_id,
                reason = batch.reason.as_str(),
                fragment_count = batch.fragments.len(),
                "Streaming batch to model"
            );

            let (mut detections, handle) = parser.stream_intelligence(request);

            while let Some(detection) = detections.recv().await {
                Self::route_detection(
                    detection,
                    &cascade,
                    &tracker,
                    &store,
                    &descriptor,
                    &live_tx,
                    &event_tx,
                    &mut deferred,
                )
                .await;
            }

            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    // Terminal transport failure. The batch is lost but the
                    // session keeps processing subsequent fragments.
                    error!(
                        session_id = %descriptor.session_id,
                        %e,
                        "Model stream failed terminally"
                    );
                    let _ = event_tx.send(IntelligenceEvent::StreamFailed {
                        session_id: descriptor.session_id.clone(),
                        error: e.to_string(),
                    });
                }
                Err(e) => {
                    error!(session_id = %descriptor.session_id, %e, "Stream task died");
                }
            }
        }

        // No more fragments are coming: close the live feed so outstanding
        // monitors fall through to their remaining tiers, then drain them.
        drop(live_tx);
        while deferred.join_next().await.is_some() {}

        debug!(session_id = %descriptor.session_id, "Analysis loop exiting");
    }

    /// Routes one detection. Exhaustive over the wire protocol's sum type.
    #[allow(clippy::too_many_arguments)]
    async fn route_detection(
        detection: Detection,
        cascade: &Arc<AnswerResolutionCascade>,
        tracker: &Arc<QuestionTracker>,
        store: &Arc<dyn QuestionStore>,
        descriptor: &SessionDescriptor,
        live_tx: &broadcast::Sender<TranscriptFragment>,
        event_tx: &broadcast::Sender<IntelligenceEvent>,
        deferred: &mut JoinSet<()>,
    ) {
        let session_id = &descriptor.session_id;

        match detection {
            Detection::Question {
                text,
                speaker,
                category,
                confidence,
            } => {
                let question_id = tracker.open(&text, speaker.clone(), confidence);
                info!(%session_id, %question_id, %text, "Question detected");

                let record = NewQuestion {
                    id: question_id,
                    text: text.clone(),
                    speaker,
                    category,
                    confidence,
                };
                if let Err(e) = store.create_question(session_id, &record).await {
                    warn!(%session_id, %e, "Failed to persist question");
                }

                let _ = event_tx.send(IntelligenceEvent::QuestionOpened {
                    session_id: session_id.clone(),
                    question_id,
                    text,
                });

                let resolved = cascade
                    .resolve_inline(descriptor, tracker, question_id)
                    .await;

                if !resolved && tracker.state(question_id) == Some(QuestionState::Searching) {
                    // Subscribe before spawning so no fragment slips between.
                    let fragments = live_tx.subscribe();
                    deferred.spawn(Arc::clone(cascade).run_deferred(
                        descriptor.clone(),
                        Arc::clone(tracker),
                        question_id,
                        fragments,
                    ));
                }
            }
            Detection::Action {
                description,
                owner,
                deadline,
                speaker,
                completeness,
                confidence,
            } => {
                info!(%session_id, %description, "Action item detected");
                let record = NewAction {
                    id: uuid::Uuid::new_v4(),
                    description: description.clone(),
                    owner: owner.clone(),
                    deadline,
                    speaker,
                    completeness,
                    confidence,
                };
                if let Err(e) = store.create_action(session_id, &record).await {
                    warn!(%session_id, %e, "Failed to persist action");
                }
                let _ = event_tx.send(IntelligenceEvent::ActionDetected {
                    session_id: session_id.clone(),
                    description,
                    owner,
                });
            }
            Detection::ActionUpdate {
                match_text,
                owner,
                deadline,
                completeness,
                confidence,
            } => {
                debug!(%session_id, %match_text, completeness, "Action update detected");
                let record = ActionUpdateRecord {
                    match_text: match_text.clone(),
                    owner,
                    deadline,
                    completeness,
                    confidence,
                };
                if let Err(e) = store.update_action(session_id, &record).await {
                    warn!(%session_id, %e, "Failed to persist action update");
                }
                let _ = event_tx.send(IntelligenceEvent::ActionUpdated {
                    session_id: session_id.clone(),
                    match_text,
                    completeness,
                });
            }
            Detection::Answer {
                match_question_text,
                answer_text,
                speaker: _,
                confidence,
            } => {
                cascade
                    .handle_answer_detection(
                        descriptor,
                        tracker,
                        &match_question_text,
                        &answer_text,
                        confidence,
                    )
                    .await;
            }
        }
    }
}

/// Renders fragments as transcript lines for the model request.
fn render_fragments(fragments: &[TranscriptFragment]) -> String {
    fragments
        .iter()
        .map(|f| match &f.speaker {
            Some(speaker) => format!("{}: {}", speaker, f.text),
            None => f.text.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
