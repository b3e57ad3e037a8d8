pub mod ndjson;
pub mod retry;

pub use ndjson::NdjsonDecoder;
pub use retry::{StreamError, open_with_retry};

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::backends::{LlmMessage, LlmRequest, LlmTransport, TransportError};
use crate::config::StreamConfig;

/// Protocol instruction sent with every batch: one complete JSON object per
/// line, each carrying a `type` discriminator.
const SYSTEM_INSTRUCTION: &str = "\
You analyze meeting transcript excerpts. Emit one complete JSON object per \
line (newline-delimited, no surrounding array, no prose). Each object carries \
a \"type\" field, one of:
  {\"type\":\"question\",\"text\":...,\"speaker\":...,\"category\":...,\"confidence\":0..1}
  {\"type\":\"action\",\"description\":...,\"owner\":...,\"deadline\":...,\"speaker\":...,\"completeness\":0..1,\"confidence\":0..1}
  {\"type\":\"action_update\",\"match_text\":...,\"owner\":...,\"deadline\":...,\"completeness\":0..1,\"confidence\":0..1}
  {\"type\":\"answer\",\"match_question_text\":...,\"answer_text\":...,\"speaker\":...,\"confidence\":0..1}
Emit a record only when the transcript supports it. Never invent identifiers \
or timestamps.";

/// A structured detection decoded from the model's streamed output.
///
/// Closed sum type over the wire protocol's `type` discriminator; routing
/// sites match exhaustively so a new record type is a compile-time-visible
/// change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Detection {
    Question {
        text: String,
        #[serde(default)]
        speaker: Option<String>,
        #[serde(default)]
        category: Option<String>,
        confidence: f32,
    },
    Action {
        description: String,
        #[serde(default)]
        owner: Option<String>,
        #[serde(default)]
        deadline: Option<String>,
        #[serde(default)]
        speaker: Option<String>,
        completeness: f32,
        confidence: f32,
    },
    ActionUpdate {
        match_text: String,
        #[serde(default)]
        owner: Option<String>,
        #[serde(default)]
        deadline: Option<String>,
        completeness: f32,
        confidence: f32,
    },
    Answer {
        match_question_text: String,
        answer_text: String,
        #[serde(default)]
        speaker: Option<String>,
        confidence: f32,
    },
}

/// One batch analysis request: the closed batch plus rolling context.
#[derive(Debug, Clone)]
pub struct IntelligenceRequest {
    pub batch_text: String,
    pub context_text: String,
    pub system_instruction: String,
}

impl IntelligenceRequest {
    pub fn new(batch_text: String, context_text: String) -> Self {
        Self {
            batch_text,
            context_text,
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
        }
    }
}

/// Parses one NDJSON line into a detection.
///
/// Malformed JSON, a missing `type` field, or an unrecognized record shape
/// all skip the line (logged); none abort the stream.
pub fn parse_detection_line(line: &str) -> Option<Detection> {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(%e, %line, "Malformed detection line, skipping");
            return None;
        }
    };

    if !value.is_object() || value.get("type").is_none() {
        warn!(%line, "Detection line missing type discriminator, discarding");
        return None;
    }

    match serde_json::from_value::<Detection>(value) {
        Ok(detection) => Some(detection),
        Err(e) => {
            warn!(%e, %line, "Unrecognized detection record, discarding");
            None
        }
    }
}

/// Sends an accumulated batch plus rolling context to the language model and
/// incrementally decodes its streamed output into typed detections.
///
/// Each call produces a finite, non-restartable sequence: detections arrive
/// on the returned channel, and the join handle resolves to the terminal
/// outcome, `Ok(())` on normal completion and a `StreamError` otherwise,
/// raised distinctly from completion.
pub struct StreamingIntelligenceParser {
    transport: Arc<dyn LlmTransport>,
    config: StreamConfig,
}

impl StreamingIntelligenceParser {
    pub fn new(transport: Arc<dyn LlmTransport>, config: StreamConfig) -> Self {
        Self { transport, config }
    }

    pub fn stream_intelligence(
        &self,
        request: IntelligenceRequest,
    ) -> (mpsc::Receiver<Detection>, JoinHandle<Result<(), StreamError>>) {
        let llm_request = LlmRequest {
            messages: vec![
                LlmMessage::system(request.system_instruction),
                LlmMessage::user(format!(
                    "Recent context:\n{}\n\nAnalyze this segment:\n{}",
                    request.context_text, request.batch_text
                )),
            ],
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let (detection_tx, detection_rx) = mpsc::channel::<Detection>(32);

        let handle = tokio::spawn(async move {
            Self::run_stream(transport, config, llm_request, detection_tx).await
        });

        (detection_rx, handle)
    }

    async fn run_stream(
        transport: Arc<dyn LlmTransport>,
        config: StreamConfig,
        llm_request: LlmRequest,
        detection_tx: mpsc::Sender<Detection>,
    ) -> Result<(), StreamError> {
        let mut chunks = open_with_retry(transport.as_ref(), llm_request, &config).await?;
        let mut decoder = NdjsonDecoder::new();
        let chunk_timeout = Duration::from_secs(config.chunk_timeout_secs);
        let mut emitted: usize = 0;

        loop {
            let chunk = match tokio::time::timeout(chunk_timeout, chunks.recv()).await {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(Some(Err(e))) => return Err(Self::mid_stream_error(e)),
                Ok(None) => break,
                Err(_) => {
                    warn!("Model stream went silent mid-flight");
                    return Err(StreamError::Timeout { attempts: 1 });
                }
            };

            for line in decoder.push(&chunk) {
                if let Some(detection) = parse_detection_line(&line) {
                    emitted += 1;
                    if detection_tx.send(detection).await.is_err() {
                        debug!("Detection consumer dropped, ending stream early");
                        return Ok(());
                    }
                }
            }
        }

        // One more parse attempt for a final line without a trailing newline.
        if let Some(residual) = decoder.finish() {
            match parse_detection_line(&residual) {
                Some(detection) => {
                    emitted += 1;
                    let _ = detection_tx.send(detection).await;
                }
                None => warn!(line = %residual, "Discarding unparseable stream residual"),
            }
        }

        debug!(emitted, "Model stream complete");
        Ok(())
    }

    fn mid_stream_error(error: TransportError) -> StreamError {
        match error {
            // The stream is not restartable; mid-flight failures are terminal
            // regardless of class.
            TransportError::TimedOut => StreamError::Timeout { attempts: 1 },
            TransportError::Overloaded => StreamError::Overloaded,
            TransportError::RateLimited => {
                StreamError::Transport("rate limited mid-stream".to_string())
            }
            TransportError::Other(msg) => StreamError::Transport(msg),
        }
    }
}
