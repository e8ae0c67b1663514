//! Synop core types: object identity, step outcomes, errors and the
//! object store contract every other crate is written against.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use kube::core::{ApiResource, DynamicObject, Resource};
use serde::{de::DeserializeOwned, Serialize};

pub mod entity;
pub mod error;
pub mod naming;
pub mod owner;
pub mod patch;
pub mod store;

pub use entity::{HasSpec, HasStatus, Lifecycle, LifecycleState, NeedsReconcile};
pub use error::{ErrorClass, ReconcileError, StoreError};
pub use owner::set_owner;
pub use store::ObjectStore;

/// Identity of a stored object: its kind, scope and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectKey {
    pub resource: ApiResource,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(resource: ApiResource, namespace: Option<&str>, name: &str) -> Self {
        Self { resource, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Key for a statically typed kind (built-in or derived custom resource).
    pub fn of<K: Resource<DynamicType = ()>>(namespace: Option<&str>, name: &str) -> Self {
        Self::new(ApiResource::erase::<K>(&()), namespace, name)
    }

    /// Key addressing `obj`, whose kind is described by `resource`.
    pub fn for_object(resource: &ApiResource, obj: &DynamicObject) -> Self {
        Self {
            resource: resource.clone(),
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone().unwrap_or_default(),
        }
    }

    /// Key of a typed object; the object must carry a name.
    pub fn for_typed<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        let meta = obj.meta();
        Self::of::<K>(meta.namespace.as_deref(), meta.name.as_deref().unwrap_or_default())
    }

    /// Same scope and kind, different name.
    pub fn with_name(&self, name: &str) -> Self {
        Self { resource: self.resource.clone(), namespace: self.namespace.clone(), name: name.to_string() }
    }

    pub fn kind(&self) -> &str { &self.resource.kind }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.resource.kind, ns, self.name),
            None => write!(f, "{}/{}", self.resource.kind, self.name),
        }
    }
}

/// What a pipeline step asks for once it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Proceed to the next step.
    Continue,
    /// Stop here and run the whole pipeline again immediately.
    Requeue,
    /// Stop here and run again after the given delay.
    RequeueAfter(Duration),
    /// Stop here; only a change to the entity should trigger another run.
    Halt,
}

impl Outcome {
    pub fn is_continue(&self) -> bool { matches!(self, Outcome::Continue) }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Continue => "continue",
            Outcome::Requeue => "requeue",
            Outcome::RequeueAfter(_) => "requeue_after",
            Outcome::Halt => "halt",
        }
    }
}

/// Convert a typed object into the dynamic form the store speaks.
pub fn to_dynamic<K: Serialize>(obj: &K) -> Result<DynamicObject, StoreError> {
    let v = serde_json::to_value(obj).map_err(|e| StoreError::Codec(e.to_string()))?;
    serde_json::from_value(v).map_err(|e| StoreError::Codec(e.to_string()))
}

/// Decode a dynamic object into a typed one.
pub fn from_dynamic<K: DeserializeOwned>(obj: &DynamicObject) -> Result<K, StoreError> {
    let v = serde_json::to_value(obj).map_err(|e| StoreError::Codec(e.to_string()))?;
    serde_json::from_value(v).map_err(|e| StoreError::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;

    #[test]
    fn key_display_includes_scope() {
        let k = ObjectKey::of::<ConfigMap>(Some("matrix"), "hs");
        assert_eq!(k.to_string(), "ConfigMap/matrix/hs");
        assert_eq!(k.with_name("other").name, "other");
        assert_eq!(k.kind(), "ConfigMap");
    }

    #[test]
    fn typed_round_trip_through_dynamic() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("hs".into());
        cm.metadata.namespace = Some("matrix".into());
        cm.data = Some([("homeserver.yaml".to_string(), "server_name: x\n".to_string())].into());
        let dynamic = to_dynamic(&cm).unwrap();
        assert_eq!(dynamic.metadata.name.as_deref(), Some("hs"));
        assert_eq!(dynamic.data["data"]["homeserver.yaml"], "server_name: x\n");
        let back: ConfigMap = from_dynamic(&dynamic).unwrap();
        assert_eq!(back, cm);
    }
}
