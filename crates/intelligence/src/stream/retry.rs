use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backends::{ByteStream, LlmRequest, LlmTransport, TransportError};
use crate::config::{RetryPolicy, StreamConfig};

/// Terminal outcome of a streaming model call, raised distinctly from normal
/// stream completion.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("rate limited after {attempts} attempts")]
    RateLimitExhausted { attempts: u32 },
    #[error("timed out after {attempts} attempts")]
    Timeout { attempts: u32 },
    /// Backpressure signal; surfaced immediately, never retried.
    #[error("model service overloaded")]
    Overloaded,
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), with a little jitter so
    /// concurrent sessions don't retry in lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let jitter = rand::rng().random_range(0.0..=0.1) * base;
        Duration::from_millis((base + jitter) as u64)
    }
}

/// Opens the transport call, classifying failures per the retry policies:
/// rate limits retry with exponential backoff, timeouts retry on a small
/// budget with increasing delay, overload surfaces immediately.
pub async fn open_with_retry(
    transport: &dyn LlmTransport,
    request: LlmRequest,
    config: &StreamConfig,
) -> Result<ByteStream, StreamError> {
    let mut rate_limit_attempts: u32 = 0;
    let mut timeout_attempts: u32 = 0;

    loop {
        let open_timeout = Duration::from_secs(config.open_timeout_secs);
        let attempt = tokio::time::timeout(open_timeout, transport.open(request.clone())).await;

        let error = match attempt {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => e,
            Err(_) => TransportError::TimedOut,
        };

        match error {
            TransportError::RateLimited => {
                rate_limit_attempts += 1;
                if rate_limit_attempts >= config.rate_limit_retry.max_attempts {
                    warn!(
                        attempts = rate_limit_attempts,
                        "Rate limit retry budget exhausted"
                    );
                    return Err(StreamError::RateLimitExhausted {
                        attempts: rate_limit_attempts,
                    });
                }
                let delay = config.rate_limit_retry.delay_for(rate_limit_attempts - 1);
                debug!(?delay, attempt = rate_limit_attempts, "Rate limited, backing off");
                tokio::time::sleep(delay).await;
            }
            TransportError::TimedOut => {
                timeout_attempts += 1;
                if timeout_attempts >= config.timeout_retry.max_attempts {
                    warn!(attempts = timeout_attempts, "Timeout retry budget exhausted");
                    return Err(StreamError::Timeout {
                        attempts: timeout_attempts,
                    });
                }
                let delay = config.timeout_retry.delay_for(timeout_attempts - 1);
                debug!(?delay, attempt = timeout_attempts, "Call timed out, retrying");
                tokio::time::sleep(delay).await;
            }
            TransportError::Overloaded => {
                warn!("Model service overloaded, surfacing backpressure");
                return Err(StreamError::Overloaded);
            }
            TransportError::Other(msg) => {
                return Err(StreamError::Transport(msg));
            }
        }
    }
}
