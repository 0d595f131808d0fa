//! Backoff for chain requests.
//!
//! The node issues two kinds of request. Head polls are cheap and repeated
//! while bulk sync chases the tip, so they back off from a short base. Range
//! fetches pull a whole chunk of blocks with their logs, and a node that just
//! failed one usually needs longer to recover. Both share the retry budget
//! (`MAX_REQUEST_RETRIES`) and the delay cap.

use std::future::Future;
use std::time::Duration;

use marketsync_core::error::IndexerError;
use marketsync_core::NodeConfig;

/// A chain request subject to retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRequest {
    /// `current_block`.
    HeadPoll,
    /// `blocks_with_logs` over one chunk.
    RangeFetch,
}

impl ChainRequest {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HeadPoll => "current_block",
            Self::RangeFetch => "blocks_with_logs",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First delay for a failed head poll.
    pub head_backoff: Duration,
    /// First delay for a failed range fetch.
    pub range_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            head_backoff: Duration::from_millis(125),
            range_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// `retry_initial_backoff_ms` sets the range-fetch base; head polls start
    /// at a quarter of it.
    pub fn from_node_config(config: &NodeConfig) -> Self {
        let range_backoff = Duration::from_millis(config.retry_initial_backoff_ms);
        Self {
            max_retries: config.max_request_retries,
            head_backoff: range_backoff / 4,
            range_backoff,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before retry number `retry` (1-based) of `request`, doubling from
    /// the request's base. `None` once the budget is spent.
    pub fn next_delay(&self, request: ChainRequest, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.config.max_retries {
            return None;
        }
        let base = match request {
            ChainRequest::HeadPoll => self.config.head_backoff,
            ChainRequest::RangeFetch => self.config.range_backoff,
        };
        let factor = 1u32 << (retry - 1).min(16);
        Some(base.saturating_mul(factor).min(self.config.max_backoff))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's budget is spent (`RetriesExhausted`).
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, request: ChainRequest, mut op: F) -> Result<T, IndexerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IndexerError>>,
{
    let mut retry = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => {
                retry += 1;
                let Some(delay) = policy.next_delay(request, retry) else {
                    tracing::error!(request = request.as_str(), attempts = retry, error = %e, "retries exhausted");
                    return Err(IndexerError::RetriesExhausted {
                        attempts: retry,
                        reason: e.to_string(),
                    });
                };
                tracing::warn!(
                    request = request.as_str(),
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient chain error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
