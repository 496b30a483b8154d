//! Mapping of raw source records onto domain entities.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;

use conduit_core::{Error, MappedEntity, RawRecord, Result};

/// Maps one record type onto a domain entity.
pub trait EntityMapper: Send + Sync {
    /// Record type this mapper handles.
    fn record_type(&self) -> &str;

    fn map(&self, record: &RawRecord) -> Result<MappedEntity>;
}

/// Default mapper: entity type = record type, natural key from the payload's
/// `id` or `key` field, else the record key. The payload must be an object.
pub struct JsonMapper {
    record_type: String,
    entity_type: String,
}

impl JsonMapper {
    pub fn new(record_type: impl Into<String>) -> Self {
        let record_type = record_type.into();
        Self {
            entity_type: record_type.clone(),
            record_type,
        }
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self
    }

    /// Map a record whose type has no dedicated mapper.
    pub fn map_generic(record: &RawRecord) -> Result<MappedEntity> {
        Self::map_as(&record.record_type, record)
    }

    fn map_as(entity_type: &str, record: &RawRecord) -> Result<MappedEntity> {
        let JsonValue::Object(fields) = &record.payload else {
            return Err(Error::InvalidInput(format!(
                "{} record {} is not a JSON object",
                record.record_type, record.key
            )));
        };
        let natural_key = ["id", "key"]
            .iter()
            .find_map(|f| match fields.get(*f) {
                Some(JsonValue::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(JsonValue::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_else(|| record.key.clone());
        Ok(MappedEntity {
            entity_type: entity_type.to_string(),
            natural_key,
            fields: record.payload.clone(),
        })
    }
}

impl EntityMapper for JsonMapper {
    fn record_type(&self) -> &str {
        &self.record_type
    }

    fn map(&self, record: &RawRecord) -> Result<MappedEntity> {
        Self::map_as(&self.entity_type, record)
    }
}

/// Registry of mappers by record type, falling back to [`JsonMapper`].
#[derive(Default)]
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn EntityMapper>>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mapper: Arc<dyn EntityMapper>) {
        self.mappers.insert(mapper.record_type().to_string(), mapper);
    }

    pub fn has_mapper(&self, record_type: &str) -> bool {
        self.mappers.contains_key(record_type)
    }

    pub fn map(&self, record: &RawRecord) -> Result<MappedEntity> {
        match self.mappers.get(&record.record_type) {
            Some(mapper) => mapper.map(record),
            None => JsonMapper::map_generic(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn record(record_type: &str, key: &str, payload: JsonValue) -> RawRecord {
        RawRecord {
            id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            record_type: record_type.into(),
            key: key.into(),
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_natural_key_prefers_payload_id() {
        let mapped = JsonMapper::map_generic(&record("issues", "OPS-1", json!({"id": 10042}))).unwrap();
        assert_eq!(mapped.natural_key, "10042");
        assert_eq!(mapped.entity_type, "issues");

        let mapped = JsonMapper::map_generic(&record("issues", "OPS-1", json!({"summary": "x"}))).unwrap();
        assert_eq!(mapped.natural_key, "OPS-1");
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        let err = JsonMapper::map_generic(&record("commits", "a1", json!("raw"))).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_registry_uses_registered_mapper() {
        let mut registry = MapperRegistry::new();
        registry.register(Arc::new(
            JsonMapper::new("pull_requests").with_entity_type("pull_request"),
        ));
        assert!(registry.has_mapper("pull_requests"));

        let mapped = registry
            .map(&record("pull_requests", "acme/api#1", json!({"number": 1})))
            .unwrap();
        assert_eq!(mapped.entity_type, "pull_request");
        assert_eq!(mapped.natural_key, "acme/api#1");

        let fallback = registry.map(&record("reviews", "r1", json!({}))).unwrap();
        assert_eq!(fallback.entity_type, "reviews");
    }
}
