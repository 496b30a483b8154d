//! # conduit-db
//!
//! Storage and queue layer for the conduit ingestion pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - Postgres repositories for jobs, raw records, entities and vectors (pgvector)
//! - A Postgres-backed broker for the tier-scoped queues (`FOR UPDATE SKIP LOCKED`)
//! - In-memory equivalents of all of the above, bundled as [`Stores::in_memory`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use conduit_db::Database;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/conduit").await?;
//!     db.migrate().await?;
//!     let stores = db.stores();
//!     Ok(())
//! }
//! ```

pub mod jobs;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod records;

use std::sync::Arc;

// Re-export core types
pub use conduit_core::*;

pub use jobs::PgJobRepository;
pub use memory::{
    InMemoryEntityStore, InMemoryJobRepository, InMemoryQueueBroker, InMemoryRawRecordStore,
    InMemoryVectorStore,
};
pub use pool::{
    create_pool, create_pool_with_config, log_pool_metrics, PoolConfig, PoolHealth, APPLICATION_NAME,
};
pub use queue::PgQueueBroker;
pub use records::{entity_id, PgEntityStore, PgRawRecordStore, PgVectorStore};

/// The full set of persistence collaborators the pipeline runs against.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobRepository>,
    pub raw_records: Arc<dyn RawRecordStore>,
    pub entities: Arc<dyn EntityStore>,
    pub vectors: Arc<dyn VectorStore>,
    pub queue: Arc<dyn QueueBroker>,
}

impl Stores {
    /// Process-local stores. Nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            jobs: Arc::new(InMemoryJobRepository::new()),
            raw_records: Arc::new(InMemoryRawRecordStore::new()),
            entities: Arc::new(InMemoryEntityStore::new()),
            vectors: Arc::new(InMemoryVectorStore::new()),
            queue: Arc::new(InMemoryQueueBroker::new()),
        }
    }
}

/// Combined database context with all repositories.
pub struct Database {
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub jobs: Arc<PgJobRepository>,
    pub raw_records: Arc<PgRawRecordStore>,
    pub entities: Arc<PgEntityStore>,
    pub vectors: Arc<PgVectorStore>,
    pub queue: Arc<PgQueueBroker>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            jobs: Arc::new(PgJobRepository::new(pool.clone())),
            raw_records: Arc::new(PgRawRecordStore::new(pool.clone())),
            entities: Arc::new(PgEntityStore::new(pool.clone())),
            vectors: Arc::new(PgVectorStore::new(pool.clone())),
            queue: Arc::new(PgQueueBroker::new(pool.clone())),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    /// Create with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Postgres-backed [`Stores`]. All handles share this database's pool
    /// and queue notifiers.
    pub fn stores(&self) -> Stores {
        Stores {
            jobs: self.jobs.clone(),
            raw_records: self.raw_records.clone(),
            entities: self.entities.clone(),
            vectors: self.vectors.clone(),
            queue: self.queue.clone(),
        }
    }
}
