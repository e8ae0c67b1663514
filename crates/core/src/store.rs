//! The object store contract. Implementations: `synop_store::MemStore`
//! (in memory) and `synop_kubehub::KubeStore` (a live cluster).

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject};
use serde_json::Value as Json;

use crate::{ObjectKey, StoreError};

/// Field manager recorded for every server-side apply.
pub const FIELD_MANAGER: &str = "synop";

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist.
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError>;

    /// List objects of a kind, optionally restricted to one namespace.
    async fn list(&self, resource: &ApiResource, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError>;

    /// Create an object; fails with `AlreadyExists` if the identity is taken.
    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError>;

    /// Apply a JSON merge patch to the object (status excluded). When the patch
    /// carries `metadata.resourceVersion` and it is stale, fails with `Conflict`.
    async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, StoreError>;

    /// Server-side apply `obj` to an existing object as the `synop` field
    /// manager: the fields it carries are set, lists of named entries merge
    /// entry by entry, fields set by others are kept. Same
    /// optimistic-concurrency rule as [`ObjectStore::patch`].
    async fn apply(&self, key: &ObjectKey, obj: &Json) -> Result<DynamicObject, StoreError>;

    /// Apply a JSON merge patch to the status subresource only; same
    /// optimistic-concurrency rule as [`ObjectStore::patch`].
    async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, StoreError>;

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;

    /// Whether the kind is served at all. Transient failures are surfaced.
    async fn is_served(&self, resource: &ApiResource) -> Result<bool, StoreError> {
        match self.list(resource, None).await {
            Ok(_) => Ok(true),
            Err(StoreError::KindNotServed(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Build the patch base pin for optimistic concurrency.
pub fn version_pin(obj: &DynamicObject) -> Json {
    match obj.metadata.resource_version.as_deref() {
        Some(rv) => serde_json::json!({ "metadata": { "resourceVersion": rv } }),
        None => Json::Object(Default::default()),
    }
}
