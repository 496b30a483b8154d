//! Raw record, entity, and vector stores.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use conduit_core::{
    Entity, EntityStore, Error, MappedEntity, RawRecord, RawRecordStore, Result, Vector,
    VectorStore,
};

/// Stable entity id derived from its natural identity, so every store
/// assigns the same id to the same entity.
pub fn entity_id(entity_type: &str, natural_key: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        format!("{}:{}", entity_type, natural_key).as_bytes(),
    )
}

// =============================================================================
// RAW RECORDS
// =============================================================================

/// PostgreSQL implementation of RawRecordStore.
pub struct PgRawRecordStore {
    pool: Pool<Postgres>,
}

impl PgRawRecordStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RawRecordStore for PgRawRecordStore {
    async fn put(
        &self,
        job_id: Uuid,
        record_type: &str,
        key: &str,
        payload: JsonValue,
    ) -> Result<Uuid> {
        let row = sqlx::query(
            "INSERT INTO raw_records (id, job_id, record_type, key, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (job_id, record_type, key) DO UPDATE SET
                payload = EXCLUDED.payload
             RETURNING id",
        )
        .bind(Uuid::now_v7())
        .bind(job_id)
        .bind(record_type)
        .bind(key)
        .bind(payload)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.get("id"))
    }

    async fn get(&self, id: Uuid) -> Result<Option<RawRecord>> {
        let row = sqlx::query(
            "SELECT id, job_id, record_type, key, payload, created_at
             FROM raw_records WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| RawRecord {
            id: r.get("id"),
            job_id: r.get("job_id"),
            record_type: r.get("record_type"),
            key: r.get("key"),
            payload: r.get("payload"),
            created_at: r.get("created_at"),
        }))
    }

    async fn count_for_job(&self, job_id: Uuid) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM raw_records WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count.0)
    }
}

// =============================================================================
// ENTITIES
// =============================================================================

/// PostgreSQL implementation of EntityStore.
pub struct PgEntityStore {
    pool: Pool<Postgres>,
}

impl PgEntityStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_row(r: sqlx::postgres::PgRow) -> Entity {
        Entity {
            id: r.get("id"),
            entity_type: r.get("entity_type"),
            natural_key: r.get("natural_key"),
            fields: r.get("fields"),
            updated_at: r.get("updated_at"),
        }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn upsert(&self, entity: &MappedEntity) -> Result<Entity> {
        let row = sqlx::query(
            "INSERT INTO entities (id, entity_type, natural_key, fields, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (entity_type, natural_key) DO UPDATE SET
                fields = EXCLUDED.fields,
                updated_at = EXCLUDED.updated_at
             RETURNING id, entity_type, natural_key, fields, updated_at",
        )
        .bind(entity_id(&entity.entity_type, &entity.natural_key))
        .bind(&entity.entity_type)
        .bind(&entity.natural_key)
        .bind(&entity.fields)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(Self::parse_row(row))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, entity_type, natural_key, fields, updated_at FROM entities WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_row))
    }

    async fn get_by_key(&self, entity_type: &str, natural_key: &str) -> Result<Option<Entity>> {
        let row = sqlx::query(
            "SELECT id, entity_type, natural_key, fields, updated_at
             FROM entities WHERE entity_type = $1 AND natural_key = $2",
        )
        .bind(entity_type)
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(Self::parse_row))
    }

    async fn count(&self, entity_type: Option<&str>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entities WHERE ($1::text IS NULL OR entity_type = $1)",
        )
        .bind(entity_type)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count.0)
    }
}

// =============================================================================
// VECTORS
// =============================================================================

/// PostgreSQL + pgvector implementation of VectorStore.
pub struct PgVectorStore {
    pool: Pool<Postgres>,
}

impl PgVectorStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    async fn upsert(
        &self,
        table: &str,
        external_id: &str,
        vector: Vector,
        metadata: JsonValue,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO entity_vectors (table_name, external_id, embedding, metadata, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (table_name, external_id) DO UPDATE SET
                embedding = EXCLUDED.embedding,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(table)
        .bind(external_id)
        .bind(vector)
        .bind(metadata)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, table: &str, external_id: &str) -> Result<Option<Vector>> {
        let row = sqlx::query(
            "SELECT embedding FROM entity_vectors WHERE table_name = $1 AND external_id = $2",
        )
        .bind(table)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.map(|r| r.get::<Vector, _>("embedding")))
    }

    async fn count(&self, table: Option<&str>) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM entity_vectors WHERE ($1::text IS NULL OR table_name = $1)",
        )
        .bind(table)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(count.0)
    }
}
