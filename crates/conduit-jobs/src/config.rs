//! Aggregate pipeline configuration.

use std::time::Duration;

use conduit_core::defaults::{EMBED_MAX_CHARS, EVENT_BUS_CAPACITY, SCHEDULER_TICK_SECS};

use crate::completion::CompletionConfig;
use crate::extraction::RetryPolicy;
use crate::supervisor::{PoolSizes, WorkerConfig};

/// Which embedding provider the pipeline uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingProvider {
    /// Deterministic local hashing embedder. No network.
    #[default]
    Hashing,
    Ollama,
}

impl EmbeddingProvider {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hashing" | "local" => Some(Self::Hashing),
            "ollama" => Some(Self::Ollama),
            _ => None,
        }
    }
}

/// Everything the pipeline reads from the environment, in one place.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `SCHEDULER_TICK_SECS` | `30` | Interval of the due-job scan |
/// | `EMBED_MAX_CHARS` | `8000` | Text length sent to the embedder |
/// | `EMBEDDING_PROVIDER` | `hashing` | `hashing` or `ollama` |
/// | `EVENT_BUS_CAPACITY` | `256` | Notification buffer per subscriber |
///
/// Worker, pool, retry and completion settings are read by their own
/// `from_env` constructors.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub worker: WorkerConfig,
    pub pools: PoolSizes,
    pub retry: RetryPolicy,
    pub completion: CompletionConfig,
    pub scheduler_tick: Duration,
    pub embed_max_chars: usize,
    pub embedding_provider: EmbeddingProvider,
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker: WorkerConfig::default(),
            pools: PoolSizes::default(),
            retry: RetryPolicy::default(),
            completion: CompletionConfig::default(),
            scheduler_tick: Duration::from_secs(SCHEDULER_TICK_SECS),
            embed_max_chars: EMBED_MAX_CHARS,
            embedding_provider: EmbeddingProvider::default(),
            event_capacity: EVENT_BUS_CAPACITY,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker: WorkerConfig::from_env(),
            pools: PoolSizes::from_env(),
            retry: RetryPolicy::from_env(),
            completion: CompletionConfig::from_env(),
            scheduler_tick: std::env::var("SCHEDULER_TICK_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.scheduler_tick),
            embed_max_chars: std::env::var("EMBED_MAX_CHARS")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(defaults.embed_max_chars),
            embedding_provider: std::env::var("EMBEDDING_PROVIDER")
                .ok()
                .and_then(|v| EmbeddingProvider::parse(&v))
                .unwrap_or(defaults.embedding_provider),
            event_capacity: std::env::var("EVENT_BUS_CAPACITY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|c| *c > 0)
                .unwrap_or(defaults.event_capacity),
        }
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_pools(mut self, pools: PoolSizes) -> Self {
        self.pools = pools;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_completion(mut self, completion: CompletionConfig) -> Self {
        self.completion = completion;
        self
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn with_embedding_provider(mut self, provider: EmbeddingProvider) -> Self {
        self.embedding_provider = provider;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parse() {
        assert_eq!(EmbeddingProvider::parse("Ollama"), Some(EmbeddingProvider::Ollama));
        assert_eq!(EmbeddingProvider::parse("local"), Some(EmbeddingProvider::Hashing));
        assert_eq!(EmbeddingProvider::parse("openai"), None);
    }

    #[test]
    fn test_default_pool_sizes_follow_tiers() {
        let config = PipelineConfig::default();
        assert_eq!(config.pools, PoolSizes::default());
        assert_eq!(config.completion.backoff.len(), 4);
        assert_eq!(config.scheduler_tick, Duration::from_secs(30));
    }
}
