use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use super::{ByteStream, LlmRequest, LlmTransport, TransportError};

/// Streaming LLM transport over an OpenAI-compatible HTTP chat endpoint.
///
/// The server is expected to stream the raw newline-delimited response body;
/// this transport only moves bytes. All protocol decoding happens in the
/// streaming parser layer.
pub struct HttpLlmTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpLlmTransport {
    pub fn new(endpoint: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
        })
    }

    fn classify(error: &reqwest::Error) -> TransportError {
        if error.is_timeout() || error.is_connect() {
            TransportError::TimedOut
        } else {
            TransportError::Other(error.to_string())
        }
    }

    fn classify_status(status: StatusCode) -> Option<TransportError> {
        match status.as_u16() {
            429 => Some(TransportError::RateLimited),
            503 | 529 => Some(TransportError::Overloaded),
            s if s >= 400 => Some(TransportError::Other(format!("HTTP status {s}"))),
            _ => None,
        }
    }
}

#[async_trait]
impl LlmTransport for HttpLlmTransport {
    async fn open(&self, request: LlmRequest) -> Result<ByteStream, TransportError> {
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
        });

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| Self::classify(&e))?;

        if let Some(err) = Self::classify_status(response.status()) {
            return Err(err);
        }

        let (chunk_tx, chunk_rx) = mpsc::channel::<Result<Vec<u8>, TransportError>>(64);

        // Forward response bytes to the channel; the decoding layer upstream
        // owns line framing and JSON parsing.
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let item = match chunk {
                    Ok(bytes) => Ok(bytes.to_vec()),
                    Err(e) => Err(Self::classify(&e)),
                };
                let failed = item.is_err();
                if chunk_tx.send(item).await.is_err() {
                    debug!("Stream consumer dropped, stopping byte forwarding");
                    return;
                }
                if failed {
                    return;
                }
            }
            debug!("HTTP response stream complete");
        });

        Ok(chunk_rx)
    }

    fn name(&self) -> &str {
        "http_llm"
    }
}
