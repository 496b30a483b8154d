//! Bounded exponential backoff for page fetches.

use std::time::Duration;

use tracing::warn;

use conduit_core::defaults::{
    EXTRACTION_MAX_ATTEMPTS, EXTRACTION_RETRY_BASE_MS, EXTRACTION_RETRY_MAX_MS,
};
use conduit_core::{Page, PageRequest, Result, SourceClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: EXTRACTION_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(EXTRACTION_RETRY_BASE_MS),
            max_delay: Duration::from_millis(EXTRACTION_RETRY_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// Reads `EXTRACTION_MAX_ATTEMPTS`, `EXTRACTION_RETRY_BASE_MS` and
    /// `EXTRACTION_RETRY_MAX_MS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_attempts: std::env::var("EXTRACTION_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            base_delay: std::env::var("EXTRACTION_RETRY_BASE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: std::env::var("EXTRACTION_RETRY_MAX_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Fetch one page, retrying transient errors under `policy`. Permanent
/// errors and the last transient error are returned as is.
pub async fn fetch_with_retry(
    client: &dyn SourceClient,
    request: &PageRequest,
    policy: &RetryPolicy,
) -> Result<Page> {
    let mut attempt = 1;
    loop {
        match client.fetch_page(request).await {
            Ok(page) => return Ok(page),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    subsystem = "jobs",
                    component = "extraction",
                    source = client.name(),
                    resource = %request.resource,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient fetch error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
