//! Projection applier: routes a decoded projection to its collection store.

use std::sync::Arc;

use crate::projection::Projection;
use crate::storage::{CollectionRegistry, OpenError, StoreError};

/// Errors applying a projection.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Collection unavailable: {0}")]
    CollectionUnavailable(#[from] OpenError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Applies projections against the stores held by a registry.
pub struct ProjectionApplier {
    registry: Arc<CollectionRegistry>,
}

impl ProjectionApplier {
    pub fn new(registry: Arc<CollectionRegistry>) -> Self {
        Self { registry }
    }

    /// Apply `projection` as the event at `sequence`.
    ///
    /// The projection must already be structurally valid (see
    /// [`Projection::decode`]).
    pub fn apply(&self, sequence: u64, projection: &Projection) -> Result<(), ApplyError> {
        let store = self.registry.get_or_open(&projection.collection)?;
        let key = projection.key();
        store.apply(sequence, &key, projection.method, &projection.fields)?;

        log::debug!(
            "Applied {} '{}' to {} at sequence {sequence}",
            projection.method.as_str(),
            projection.event_name,
            projection.collection
        );
        Ok(())
    }

    pub fn registry(&self) -> &Arc<CollectionRegistry> {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RegistryConfig;
    use serde_json::{json, Value};
    use tempfile::tempdir;

    fn applier(dir: &std::path::Path) -> ProjectionApplier {
        ProjectionApplier::new(Arc::new(CollectionRegistry::new(
            RegistryConfig::for_testing(dir),
        )))
    }

    #[test]
    fn test_apply_creates_collection() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path());

        let projection = Projection::upsert("users")
            .with_primary("id", 42)
            .with_field("name", "Ann");
        applier.apply(5, &projection).unwrap();

        let store = applier.registry().lookup("users").unwrap().unwrap();
        assert_eq!(store.current_sequence().unwrap(), 5);
        assert_eq!(
            store.get(b"key-42").unwrap().map(Value::Object),
            Some(json!({"id": 42, "name": "Ann"}))
        );
    }

    #[test]
    fn test_same_primary_updates_same_record() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path());

        applier
            .apply(1, &Projection::upsert("users").with_primary("id", 1).with_field("a", 1))
            .unwrap();
        applier
            .apply(2, &Projection::upsert("users").with_primary("id", 1).with_field("b", 2))
            .unwrap();

        let store = applier.registry().lookup("users").unwrap().unwrap();
        assert_eq!(store.record_count().unwrap(), 1);
        assert_eq!(
            store.get(b"key-1").unwrap().map(Value::Object),
            Some(json!({"id": 1, "a": 1, "b": 2}))
        );
    }

    #[test]
    fn test_delete_by_primary() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path());

        applier
            .apply(1, &Projection::upsert("users").with_primary("id", 9).with_field("a", 1))
            .unwrap();
        applier
            .apply(2, &Projection::delete("users").with_primary("id", 9))
            .unwrap();

        let store = applier.registry().lookup("users").unwrap().unwrap();
        assert_eq!(store.record_count().unwrap(), 0);
        assert_eq!(store.current_sequence().unwrap(), 2);
    }

    #[test]
    fn test_invalid_collection_is_unavailable() {
        let dir = tempdir().unwrap();
        let applier = applier(dir.path());

        let result = applier.apply(1, &Projection::upsert("../escape").with_field("a", 1));
        assert!(matches!(
            result,
            Err(ApplyError::CollectionUnavailable(OpenError::InvalidName(_)))
        ));
    }
}
