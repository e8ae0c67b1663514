//! Synop kubehub: the [`ObjectStore`] contract over a live cluster, using
//! dynamic `Api<DynamicObject>` handles, server-side apply for child objects
//! and JSON merge patches for documents and statuses.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use serde_json::Value as Json;
use synop_core::{store::FIELD_MANAGER, ObjectKey, ObjectStore, StoreError};
use tracing::{debug, info};

/// Object store backed by the API server of the current kube context.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Connect using the default kubeconfig / in-cluster configuration.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client { &self.client }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<DynamicObject> {
        self.api(&key.resource, key.namespace.as_deref())
    }
}

/// Map a kube client error onto the store taxonomy.
pub fn map_kube_error(what: &str, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            404 => StoreError::NotFound(format!("{}: {}", what, resp.message)),
            409 if resp.reason == "AlreadyExists" => StoreError::AlreadyExists(format!("{}: {}", what, resp.message)),
            409 => StoreError::Conflict(format!("{}: {}", what, resp.message)),
            _ => StoreError::Transport(format!("{}: {} ({})", what, resp.message, resp.code)),
        },
        kube::Error::SerdeError(e) => StoreError::Codec(format!("{}: {}", what, e)),
        other => StoreError::Transport(format!("{}: {}", what, other)),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        self.api_for(key).get_opt(&key.name).await.map_err(|e| map_kube_error(&key.to_string(), e))
    }

    async fn list(&self, resource: &ApiResource, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let what = resource.kind.as_str();
        match self.api(resource, namespace).list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            // The list endpoint itself is missing: the kind is not served.
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                Err(StoreError::KindNotServed(format!("{}/{}", resource.api_version, resource.kind)))
            }
            Err(e) => Err(map_kube_error(what, e)),
        }
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let key = ObjectKey::for_object(resource, obj);
        let created = self
            .api_for(&key)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_error(&key.to_string(), e))?;
        counter!("kube_writes_total", 1u64, "verb" => "create");
        info!(object = %key, "kube: created");
        Ok(created)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, StoreError> {
        let patched = self
            .api_for(key)
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error(&key.to_string(), e))?;
        counter!("kube_writes_total", 1u64, "verb" => "patch");
        debug!(object = %key, rv = ?patched.metadata.resource_version, "kube: patched");
        Ok(patched)
    }

    async fn apply(&self, key: &ObjectKey, obj: &Json) -> Result<DynamicObject, StoreError> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = self
            .api_for(key)
            .patch(&key.name, &params, &Patch::Apply(obj))
            .await
            .map_err(|e| map_kube_error(&key.to_string(), e))?;
        counter!("kube_writes_total", 1u64, "verb" => "apply");
        debug!(object = %key, rv = ?applied.metadata.resource_version, "kube: applied");
        Ok(applied)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, StoreError> {
        let patched = self
            .api_for(key)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_kube_error(&key.to_string(), e))?;
        counter!("kube_writes_total", 1u64, "verb" => "patch_status");
        debug!(object = %key, rv = ?patched.metadata.resource_version, "kube: status patched");
        Ok(patched)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.api_for(key)
            .delete(&key.name, &DeleteParams::background())
            .await
            .map_err(|e| map_kube_error(&key.to_string(), e))?;
        counter!("kube_writes_total", 1u64, "verb" => "delete");
        Ok(())
    }
}

/// Resolve a GVK key (`v1/Kind` or `group/v1/Kind`) through discovery.
/// Returns the resource and whether it is namespaced.
pub async fn find_api_resource(client: Client, key: &str) -> Result<(ApiResource, bool)> {
    let gvk = parse_gvk_key(key)?;
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: "boom".into(), reason: reason.into(), code })
    }

    #[test]
    fn kube_errors_map_onto_store_taxonomy() {
        assert!(matches!(map_kube_error("x", api_err(404, "NotFound")), StoreError::NotFound(_)));
        assert!(matches!(map_kube_error("x", api_err(409, "AlreadyExists")), StoreError::AlreadyExists(_)));
        assert!(matches!(map_kube_error("x", api_err(409, "Conflict")), StoreError::Conflict(_)));
        assert!(matches!(map_kube_error("x", api_err(500, "InternalError")), StoreError::Transport(_)));
    }

    #[test]
    fn gvk_keys_parse() {
        let g = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((g.group.as_str(), g.version.as_str(), g.kind.as_str()), ("", "v1", "ConfigMap"));
        let g = parse_gvk_key("synapse.opdev.io/v1alpha1/Synapse").unwrap();
        assert_eq!(g.group, "synapse.opdev.io");
        assert!(parse_gvk_key("nope").is_err());
    }
}
