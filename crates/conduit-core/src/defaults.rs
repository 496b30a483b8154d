//! Centralized default constants for conduit.
//!
//! Every crate references these instead of defining its own magic numbers.
//! Environment variables in the workers and API override most of them.

// =============================================================================
// WORKER POOLS
// =============================================================================

/// Workers per stage for the free tier.
pub const POOL_SIZE_FREE: usize = 1;

/// Workers per stage for the basic tier.
pub const POOL_SIZE_BASIC: usize = 3;

/// Workers per stage for the premium tier.
pub const POOL_SIZE_PREMIUM: usize = 5;

/// Workers per stage for the enterprise tier.
pub const POOL_SIZE_ENTERPRISE: usize = 10;

/// Idle wait before a worker re-polls an empty queue (milliseconds).
pub const WORKER_POLL_INTERVAL_MS: u64 = 1000;

/// Times a worker slot may crash before it is disabled.
pub const WORKER_MAX_RESTARTS: u32 = 3;

/// Deliveries of one message before it is abandoned.
pub const WORKER_MAX_DELIVERIES: u32 = 5;

/// Maximum time a single message handler may run (seconds).
pub const HANDLER_TIMEOUT_SECS: u64 = 300;

// =============================================================================
// EXTRACTION
// =============================================================================

/// Attempts per page fetch, including the first.
pub const EXTRACTION_MAX_ATTEMPTS: u32 = 4;

/// Base delay for exponential page-fetch backoff (milliseconds).
pub const EXTRACTION_RETRY_BASE_MS: u64 = 500;

/// Upper bound on a single page-fetch backoff delay (milliseconds).
pub const EXTRACTION_RETRY_MAX_MS: u64 = 30_000;

// =============================================================================
// COMPLETION
// =============================================================================

/// Delays between completeness checks after a job finishes (seconds).
pub const COMPLETION_BACKOFF_SECS: [u64; 4] = [30, 60, 180, 300];

/// Grace period between a successful check and the reset (seconds).
pub const COMPLETION_GRACE_SECS: u64 = 30;

/// Interval of the completion monitor's sweep for finished jobs (seconds).
pub const COMPLETION_SWEEP_SECS: u64 = 60;

// =============================================================================
// SCHEDULING
// =============================================================================

/// Default interval between job runs (seconds).
pub const SCHEDULE_INTERVAL_SECS: i64 = 3600;

/// How often the scheduler looks for due jobs (seconds).
pub const SCHEDULER_TICK_SECS: u64 = 30;

// =============================================================================
// EMBEDDING
// =============================================================================

/// Dimension of vectors produced by the built-in hashing embedder.
pub const EMBED_DIMENSION: usize = 64;

/// Maximum characters of entity text sent to the embedding backend.
pub const EMBED_MAX_CHARS: usize = 8_000;

/// Ollama endpoint used when `OLLAMA_BASE` selects the HTTP embedder.
pub const OLLAMA_URL: &str = "http://localhost:11434";

/// Embedding model requested from Ollama.
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Dimension of [`EMBED_MODEL`].
pub const OLLAMA_EMBED_DIMENSION: usize = 768;

/// Timeout for one embedding request (seconds).
pub const EMBED_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// SERVER
// =============================================================================

/// Default HTTP server port.
pub const SERVER_PORT: u16 = 3000;

/// Buffer capacity of the event bus.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// SSE keep-alive interval (seconds).
pub const SSE_KEEPALIVE_SECS: u64 = 15;

// =============================================================================
// DATABASE
// =============================================================================

/// Maximum Postgres connections.
pub const DB_MAX_CONNECTIONS: u32 = 20;

/// Connection acquire timeout (seconds).
pub const DB_ACQUIRE_TIMEOUT_SECS: u64 = 30;
