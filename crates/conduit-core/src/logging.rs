//! Structured logging schema and field name constants for conduit.
//!
//! All crates use these constants for consistent structured logging fields so
//! log aggregation tools can query by the same names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention (stalled completion, disabled worker slot) |
//! | WARN  | Recoverable issue, automatic fallback applied (retry, respawn) |
//! | INFO  | Lifecycle events (startup, pool start/stop, job start/finalize/reset) |
//! | DEBUG | Decision points (flag assignment, sub-status transitions) |
//! | TRACE | Per-item iteration (each emitted message) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "api", "db", "jobs", "queue"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "extraction", "transform", "embedding", "supervisor", "completion"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "execute", "publish", "reset", "supervise"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Tenant UUID owning the job.
pub const TENANT_ID: &str = "tenant_id";

/// Step name within a job.
pub const STEP: &str = "step";

/// Pipeline stage ("extraction", "transform", "embedding").
pub const STAGE: &str = "stage";

/// Tenant tier ("free", "basic", "premium", "enterprise").
pub const TIER: &str = "tier";

/// Queue name (e.g. "transform.premium").
pub const QUEUE: &str = "queue";

/// Worker slot index within a pool.
pub const SLOT: &str = "slot";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Number of messages emitted by one extraction request.
pub const EMITTED: &str = "emitted";

/// Delivery attempt count.
pub const ATTEMPT: &str = "attempt";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Database table affected.
pub const DB_TABLE: &str = "db_table";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
