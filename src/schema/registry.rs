//! Schema registry
//!
//! The pipeline only needs `resolve(id)`; producers `register` the schema
//! they write with and frame payloads with the returned id.

use apache_avro::Schema;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{
    order_created, Result, SchemaError, SchemaVersion, LATEST_ORDER_CREATED_VERSION,
    ORDER_CREATED_SUBJECT,
};

/// Lookup and registration of writer schemas by id
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Fetch the schema a payload was written with
    async fn resolve(&self, id: i32) -> Result<Arc<SchemaVersion>>;

    /// Register a schema under a subject, returning its id.
    ///
    /// Registering a schema identical to an existing version of the subject
    /// returns that version instead of creating a new one.
    async fn register(&self, subject: &str, schema: Schema) -> Result<Arc<SchemaVersion>>;

    /// Fetch a specific version of a subject
    async fn version(&self, subject: &str, version: u32) -> Result<Arc<SchemaVersion>>;
}

#[derive(Default)]
struct RegistryState {
    by_id: HashMap<i32, Arc<SchemaVersion>>,
    by_subject: HashMap<String, Vec<Arc<SchemaVersion>>>,
    next_id: i32,
}

/// Registry kept in process memory
#[derive(Default)]
pub struct InMemorySchemaRegistry {
    state: RwLock<RegistryState>,
}

impl InMemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with every bundled `OrderCreated` version.
    ///
    /// Versions are registered in order, so version `n` gets id `n`.
    pub async fn with_bundled() -> Result<Self> {
        let registry = Self::new();
        for version in 1..=LATEST_ORDER_CREATED_VERSION {
            registry
                .register(ORDER_CREATED_SUBJECT, order_created(version)?)
                .await?;
        }
        Ok(registry)
    }
}

#[async_trait]
impl SchemaRegistry for InMemorySchemaRegistry {
    async fn resolve(&self, id: i32) -> Result<Arc<SchemaVersion>> {
        self.state
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or(SchemaError::UnknownSchemaId(id))
    }

    async fn register(&self, subject: &str, schema: Schema) -> Result<Arc<SchemaVersion>> {
        let mut state = self.state.write().await;

        if let Some(existing) = state
            .by_subject
            .get(subject)
            .and_then(|versions| versions.iter().find(|v| v.schema == schema))
        {
            debug!(subject, id = existing.id, "Schema already registered");
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let id = state.next_id;
        let version = state
            .by_subject
            .get(subject)
            .map_or(1, |versions| versions.len() as u32 + 1);

        let registered = Arc::new(SchemaVersion {
            id,
            subject: subject.to_string(),
            version,
            schema,
        });

        state.by_id.insert(id, registered.clone());
        state
            .by_subject
            .entry(subject.to_string())
            .or_default()
            .push(registered.clone());

        info!(subject, id, version, "Registered schema");
        Ok(registered)
    }

    async fn version(&self, subject: &str, version: u32) -> Result<Arc<SchemaVersion>> {
        self.state
            .read()
            .await
            .by_subject
            .get(subject)
            .and_then(|versions| versions.iter().find(|v| v.version == version))
            .cloned()
            .ok_or_else(|| SchemaError::VersionNotFound {
                subject: subject.to_string(),
                version,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bundled_ids_follow_versions() {
        let registry = InMemorySchemaRegistry::with_bundled().await.unwrap();

        let v1 = registry.version(ORDER_CREATED_SUBJECT, 1).await.unwrap();
        let v2 = registry.version(ORDER_CREATED_SUBJECT, 2).await.unwrap();
        assert_eq!(v1.id, 1);
        assert_eq!(v2.id, 2);
        assert_eq!(registry.resolve(2).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_register_identical_schema_is_idempotent() {
        let registry = InMemorySchemaRegistry::with_bundled().await.unwrap();
        let again = registry
            .register(ORDER_CREATED_SUBJECT, order_created(1).unwrap())
            .await
            .unwrap();
        assert_eq!(again.id, 1);
        assert_eq!(again.version, 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_id() {
        let registry = InMemorySchemaRegistry::new();
        assert!(matches!(
            registry.resolve(42).await,
            Err(SchemaError::UnknownSchemaId(42))
        ));
    }

    #[tokio::test]
    async fn test_subjects_are_versioned_independently() {
        let registry = InMemorySchemaRegistry::with_bundled().await.unwrap();
        let other = registry
            .register("other-value", order_created(2).unwrap())
            .await
            .unwrap();
        assert_eq!(other.version, 1);
        assert_eq!(other.id, 3);
    }
}
