//! Connection pool for the pipeline stores.
//!
//! Every queue worker holds a connection while it claims a delivery and
//! writes its stage output, so the pool is the ceiling on how many handlers
//! can make progress at once across all tiers.

use std::time::{Duration, Instant};

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tracing::{debug, info, warn};

use conduit_core::{defaults, Error, Result};

/// Name reported in `pg_stat_activity` for pipeline connections.
pub const APPLICATION_NAME: &str = "conduit";

const IDLE_TIMEOUT_SECS: u64 = 600;
const MAX_LIFETIME_SECS: u64 = 1800;

/// Sizing and timeouts for the store pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a worker waits for a free connection before its handler fails.
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::DB_MAX_CONNECTIONS,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(defaults::DB_ACQUIRE_TIMEOUT_SECS),
            idle_timeout: Duration::from_secs(IDLE_TIMEOUT_SECS),
            max_lifetime: Some(Duration::from_secs(MAX_LIFETIME_SECS)),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `DB_MAX_CONNECTIONS`, `DB_MIN_CONNECTIONS`, `DB_ACQUIRE_TIMEOUT_SECS`
    /// and `DB_IDLE_TIMEOUT_SECS` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(
                        subsystem = "db",
                        component = "pool",
                        key,
                        value = %raw,
                        "Ignoring unparseable pool setting"
                    );
                    None
                }
            }
        }

        let mut config = Self::default();
        if let Some(n) = parsed(&lookup, "DB_MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(n) = parsed(&lookup, "DB_MIN_CONNECTIONS") {
            config.min_connections = n;
        }
        if let Some(secs) = parsed(&lookup, "DB_ACQUIRE_TIMEOUT_SECS") {
            config.acquire_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parsed(&lookup, "DB_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        config.normalized()
    }

    pub fn max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self.normalized()
    }

    pub fn min_connections(mut self, n: u32) -> Self {
        self.min_connections = n;
        self.normalized()
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// At least one connection; the floor never exceeds the ceiling.
    fn normalized(mut self) -> Self {
        self.max_connections = self.max_connections.max(1);
        self.min_connections = self.min_connections.min(self.max_connections);
        self
    }

    fn options(&self) -> PgPoolOptions {
        let options = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(self.idle_timeout);
        match self.max_lifetime {
            Some(lifetime) => options.max_lifetime(lifetime),
            None => options,
        }
    }
}

/// Connect with the default configuration.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    create_pool_with_config(database_url, PoolConfig::default()).await
}

/// Connect with `config`, tagging every connection with [`APPLICATION_NAME`].
pub async fn create_pool_with_config(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let started = Instant::now();
    let connect_options = database_url
        .parse::<PgConnectOptions>()
        .map_err(Error::Database)?
        .application_name(APPLICATION_NAME);

    info!(
        subsystem = "db",
        component = "pool",
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        "Connecting store pool"
    );

    let pool = config
        .options()
        .connect_with(connect_options)
        .await
        .map_err(Error::Database)?;

    let health = PoolHealth::of(&pool);
    info!(
        subsystem = "db",
        component = "pool",
        size = health.size,
        idle = health.idle,
        duration_ms = started.elapsed().as_millis() as u64,
        "Store pool ready"
    );
    Ok(pool)
}

/// Point-in-time occupancy of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealth {
    pub size: u32,
    pub idle: u32,
}

impl PoolHealth {
    pub fn of(pool: &PgPool) -> Self {
        Self {
            size: pool.size(),
            idle: pool.num_idle() as u32,
        }
    }

    pub fn in_use(&self) -> u32 {
        self.size.saturating_sub(self.idle)
    }

    /// Every open connection is checked out; the next worker will wait.
    pub fn is_saturated(&self) -> bool {
        self.size > 0 && self.idle == 0
    }
}

/// Log pool occupancy, warning when workers are about to queue on it.
pub fn log_pool_metrics(pool: &PgPool) {
    let health = PoolHealth::of(pool);
    debug!(
        subsystem = "db",
        component = "pool",
        size = health.size,
        idle = health.idle,
        in_use = health.in_use(),
        "Store pool occupancy"
    );
    if health.is_saturated() {
        warn!(
            subsystem = "db",
            component = "pool",
            size = health.size,
            "Store pool saturated; workers will wait for connections"
        );
    }
}
