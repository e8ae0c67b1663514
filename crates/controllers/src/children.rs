//! Desired child objects. Every builder is a pure function of the owning
//! entity; the owner link is set here so cascading delete covers all of them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::RoleBinding;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject, GroupVersionKind, Resource};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as Json};
use synop_core::{set_owner, ReconcileError, StoreError};

pub const DATA_VOLUME_SIZE: &str = "5Gi";
pub const OPENSHIFT_SCC_CLUSTER_ROLE: &str = "system:openshift:scc:anyuid";

pub type Labels = BTreeMap<String, String>;

/// `{"app": <app>, "<app>_cr": <name>}`, used for metadata and selectors.
pub fn labels(app: &str, name: &str) -> Labels {
    [("app".to_string(), app.to_string()), (format!("{}_cr", app.replace('-', "_")), name.to_string())].into()
}

/// Metadata for a child of `owner` named `name`, in the owner's namespace.
pub fn child_meta<O>(owner: &O, name: &str, labels: &Labels) -> Result<ObjectMeta, ReconcileError>
where
    O: Resource<DynamicType = ()>,
{
    let mut meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: owner.meta().namespace.clone(),
        labels: Some(labels.clone()),
        ..Default::default()
    };
    set_owner(&mut meta, owner)?;
    Ok(meta)
}

fn typed<K: DeserializeOwned>(meta: ObjectMeta, body: Json) -> Result<K, ReconcileError> {
    let mut v = body;
    v["metadata"] = serde_json::to_value(meta).map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(serde_json::from_value(v).map_err(|e| StoreError::Codec(e.to_string()))?)
}

pub fn config_map(meta: ObjectMeta, key: &str, content: String) -> ConfigMap {
    ConfigMap { metadata: meta, data: Some([(key.to_string(), content)].into()), ..Default::default() }
}

pub fn service(meta: ObjectMeta, selector: &Labels, port_name: &str, port: i32) -> Result<Service, ReconcileError> {
    typed(meta, json!({
        "spec": {
            "type": "ClusterIP",
            "selector": selector,
            "ports": [{ "name": port_name, "port": port, "targetPort": port, "protocol": "TCP" }],
        }
    }))
}

pub fn persistent_volume_claim(meta: ObjectMeta) -> Result<PersistentVolumeClaim, ReconcileError> {
    typed(meta, json!({
        "spec": {
            "accessModes": ["ReadWriteOnce"],
            "volumeMode": "Filesystem",
            "resources": { "requests": { "storage": DATA_VOLUME_SIZE } },
        }
    }))
}

pub fn service_account(meta: ObjectMeta) -> ServiceAccount {
    ServiceAccount { metadata: meta, ..Default::default() }
}

/// Grants the `anyuid` SCC to the service account of the same name.
pub fn scc_role_binding(meta: ObjectMeta) -> Result<RoleBinding, ReconcileError> {
    let sa = meta.name.clone().unwrap_or_default();
    let ns = meta.namespace.clone().unwrap_or_default();
    typed(meta, json!({
        "roleRef": { "apiGroup": "rbac.authorization.k8s.io", "kind": "ClusterRole", "name": OPENSHIFT_SCC_CLUSTER_ROLE },
        "subjects": [{ "kind": "ServiceAccount", "name": sa, "namespace": ns }],
    }))
}

/// Single-replica Deployment running `pod_spec`, selected by `selector`.
pub fn deployment(meta: ObjectMeta, selector: &Labels, pod_spec: Json) -> Result<Deployment, ReconcileError> {
    typed(meta, json!({
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": selector },
            "template": {
                "metadata": { "labels": selector },
                "spec": pod_spec,
            }
        }
    }))
}

pub fn config_map_volume(name: &str, config_map: &str) -> Json {
    json!({ "name": name, "configMap": { "name": config_map } })
}

pub fn pvc_volume(name: &str, claim: &str) -> Json {
    json!({ "name": name, "persistentVolumeClaim": { "claimName": claim } })
}

pub fn mount(volume: &str, path: &str) -> Json {
    json!({ "name": volume, "mountPath": path })
}

/// The PostgresCluster kind served by the postgres operator.
pub fn postgres_cluster_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk("postgres-operator.crunchydata.com", "v1beta1", "PostgresCluster");
    ApiResource::from_gvk_with_plural(&gvk, "postgresclusters")
}

/// A PostgresCluster with one instance, a `synapse` user owning a `synapse`
/// database, and the init SQL taken from the ConfigMap of the same name.
pub fn postgres_cluster(meta: ObjectMeta) -> DynamicObject {
    let name = meta.name.clone().unwrap_or_default();
    let storage = json!({ "accessModes": ["ReadWriteOnce"], "resources": { "requests": { "storage": "1Gi" } } });
    let mut obj = DynamicObject::new(&name, &postgres_cluster_resource()).data(json!({
        "spec": {
            "postgresVersion": 14,
            "databaseInitSQL": { "name": name, "key": "init.sql" },
            "instances": [{ "name": "instance1", "dataVolumeClaimSpec": storage }],
            "backups": { "pgbackrest": { "repos": [{ "name": "repo1", "volume": { "volumeClaimSpec": storage } }] } },
            "users": [{ "name": "synapse", "databases": ["synapse"] }],
        }
    }));
    obj.metadata = meta;
    obj
}

pub const POSTGRES_INIT_SQL: &str = "CREATE DATABASE synapse WITH TEMPLATE=template0 LC_COLLATE='C' LC_CTYPE='C' ENCODING 'UTF8' OWNER synapse;\n";

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap as Owner;

    fn owner() -> Owner {
        let mut o = Owner::default();
        o.metadata.name = Some("hs".into());
        o.metadata.namespace = Some("matrix".into());
        o.metadata.uid = Some("uid-1".into());
        o
    }

    #[test]
    fn children_carry_owner_link_and_labels() {
        let l = labels("mautrix-signal", "ms");
        assert_eq!(l["mautrix_signal_cr"], "ms");
        let meta = child_meta(&owner(), "hs", &l).unwrap();
        assert_eq!(meta.namespace.as_deref(), Some("matrix"));
        assert_eq!(meta.owner_references.as_ref().unwrap()[0].uid, "uid-1");

        let pvc = persistent_volume_claim(meta.clone()).unwrap();
        let spec = serde_json::to_value(pvc.spec.unwrap()).unwrap();
        assert_eq!(spec["resources"]["requests"]["storage"], "5Gi");
        assert_eq!(spec["volumeMode"], "Filesystem");

        let svc = service(meta, &l, "http", 8008).unwrap();
        assert_eq!(svc.spec.unwrap().ports.unwrap()[0].port, 8008);
    }

    #[test]
    fn role_binding_targets_same_named_service_account() {
        let meta = child_meta(&owner(), "hs", &labels("synapse", "hs")).unwrap();
        let rb = scc_role_binding(meta).unwrap();
        assert_eq!(rb.role_ref.name, OPENSHIFT_SCC_CLUSTER_ROLE);
        let subject = &rb.subjects.unwrap()[0];
        assert_eq!((subject.name.as_str(), subject.namespace.as_deref()), ("hs", Some("matrix")));
    }

    #[test]
    fn postgres_cluster_points_at_its_init_sql() {
        let meta = child_meta(&owner(), "hs-pgsql", &labels("synapse", "hs")).unwrap();
        let pg = postgres_cluster(meta);
        assert_eq!(pg.types.as_ref().unwrap().kind, "PostgresCluster");
        assert_eq!(pg.data["spec"]["databaseInitSQL"]["name"], "hs-pgsql");
        assert_eq!(pg.metadata.namespace.as_deref(), Some("matrix"));
    }
}
