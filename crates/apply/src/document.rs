//! Read-modify-write of YAML documents stored under a ConfigMap data key.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::DynamicObject;
use metrics::counter;
use serde_json::json;
use serde_yaml::{Mapping, Value as Yaml};
use synop_core::{patch::merge_patch, store::version_pin, ObjectKey, ObjectStore, ReconcileError, StoreError};
use thiserror::Error;
use tracing::{debug, info};

use crate::{ensure, EnsureOutcome};

/// Structural problems with a stored document. None of these go away by
/// retrying.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("{object} has no data key {key}")]
    MissingArtifact { object: String, key: String },
    #[error("cannot parse {key}: {source}")]
    Parse { key: String, #[source] source: serde_yaml::Error },
    #[error("cannot serialize document: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("error parsing '{0}' section")]
    MissingSection(String),
    #[error("invalid value for '{path}': expected {expected}")]
    InvalidValue { path: String, expected: &'static str },
}

#[derive(Debug, Error)]
pub enum MutateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Document(#[from] DocumentError),
}

impl From<DocumentError> for ReconcileError {
    fn from(e: DocumentError) -> Self { ReconcileError::Document(e.to_string()) }
}

impl From<MutateError> for ReconcileError {
    fn from(e: MutateError) -> Self {
        match e {
            MutateError::Store(e) => ReconcileError::Store(e),
            MutateError::Document(e) => e.into(),
        }
    }
}

/// Parse the YAML document stored under `data[key]` of a ConfigMap-shaped object.
/// An empty document yields an empty mapping.
pub fn load_yaml_artifact(obj: &DynamicObject, key: &str) -> Result<Mapping, DocumentError> {
    let raw = obj.data.get("data").and_then(|d| d.get(key)).and_then(|v| v.as_str()).ok_or_else(|| DocumentError::MissingArtifact {
        object: obj.metadata.name.clone().unwrap_or_default(),
        key: key.to_string(),
    })?;
    parse_mapping(key, raw)
}

fn parse_mapping(key: &str, raw: &str) -> Result<Mapping, DocumentError> {
    match serde_yaml::from_str::<Yaml>(raw).map_err(|source| DocumentError::Parse { key: key.to_string(), source })? {
        Yaml::Mapping(m) => Ok(m),
        Yaml::Null => Ok(Mapping::new()),
        _ => Err(DocumentError::InvalidValue { path: key.to_string(), expected: "a mapping at the top level" }),
    }
}

/// Walk nested mappings along `path`. Every segment must already exist.
pub fn section_mut<'a>(tree: &'a mut Mapping, path: &[&str]) -> Result<&'a mut Mapping, DocumentError> {
    let mut cur = tree;
    for (i, seg) in path.iter().enumerate() {
        cur = cur
            .get_mut(*seg)
            .and_then(Yaml::as_mapping_mut)
            .ok_or_else(|| DocumentError::MissingSection(path[..=i].join("/")))?;
    }
    Ok(cur)
}

/// Apply `mutate` to the document at `data[artifact_key]` of the ConfigMap
/// `key` and write it back when its canonical form changed. Returns whether
/// a write happened.
///
/// `mutate` must be a pure function of `owner` and the tree. A stale read
/// surfaces as `StoreError::Conflict`; document errors are permanent.
pub async fn mutate_artifact<O, F>(
    store: &dyn ObjectStore,
    key: &ObjectKey,
    artifact_key: &str,
    owner: &O,
    mutate: F,
) -> Result<bool, MutateError>
where
    F: FnOnce(&O, &mut Mapping) -> Result<(), DocumentError>,
{
    let obj = store.get(key).await?.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
    let mut tree = load_yaml_artifact(&obj, artifact_key)?;
    let before = render_yaml(&tree)?;
    mutate(owner, &mut tree)?;
    let after = render_yaml(&tree)?;

    if before == after {
        counter!("artifact_noop", 1u64);
        debug!(object = %key, artifact = artifact_key, "document unchanged");
        return Ok(false);
    }

    let mut patch = json!({ "data": { artifact_key: after } });
    merge_patch(&mut patch, &version_pin(&obj));
    store.patch(key, &patch).await?;
    counter!("artifact_patched", 1u64);
    info!(object = %key, artifact = artifact_key, "document updated");
    Ok(true)
}

/// Converge a ConfigMap whose data is rewritten by document mutations after
/// creation: the data is written only when the ConfigMap is created, while
/// labels and owner links keep being converged.
pub async fn seed_config_map(store: &dyn ObjectStore, desired: &ConfigMap) -> Result<EnsureOutcome, StoreError> {
    let key = ObjectKey::for_typed(desired);
    if store.get(&key).await?.is_none() {
        return ensure(store, desired).await;
    }
    let meta_only = ConfigMap { metadata: desired.metadata.clone(), ..Default::default() };
    ensure(store, &meta_only).await
}

/// Copy the data of the user-provided ConfigMap `source` into a ConfigMap
/// described by `target`, with [`seed_config_map`] semantics. `NotFound` when
/// `source` does not exist.
pub async fn copy_config_map(store: &dyn ObjectStore, source: &ObjectKey, target: ObjectMeta) -> Result<EnsureOutcome, StoreError> {
    let src = store.get(source).await?.ok_or_else(|| StoreError::NotFound(source.to_string()))?;
    let data: Option<BTreeMap<String, String>> = match src.data.get("data") {
        Some(v) => Some(serde_json::from_value(v.clone()).map_err(|e| StoreError::Codec(e.to_string()))?),
        None => None,
    };
    seed_config_map(store, &ConfigMap { metadata: target, data, ..Default::default() }).await
}

/// Serialize a tree into the text stored in a ConfigMap.
pub fn render_yaml(tree: &Mapping) -> Result<String, DocumentError> {
    serde_yaml::to_string(tree).map_err(DocumentError::Serialize)
}

/// Parse document text (templates, user input) into a tree.
pub fn parse_yaml(key: &str, raw: &str) -> Result<Mapping, DocumentError> {
    parse_mapping(key, raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use synop_store::{MemStore, Op};

    fn seed_cm(store: &MemStore, name: &str, key: &str, doc: &str) -> ObjectKey {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.into());
        cm.metadata.namespace = Some("matrix".into());
        cm.data = Some([(key.to_string(), doc.to_string())].into());
        store.seed_typed(&cm).unwrap();
        ObjectKey::of::<ConfigMap>(Some("matrix"), name)
    }

    fn append_once(_: &(), tree: &mut Mapping) -> Result<(), DocumentError> {
        let files = tree.entry("app_service_config_files".into()).or_insert_with(|| Yaml::Sequence(vec![]));
        let seq = files.as_sequence_mut().ok_or(DocumentError::InvalidValue { path: "app_service_config_files".into(), expected: "a list" })?;
        let path = Yaml::from("/data-mautrixsignal/registration.yaml");
        if !seq.contains(&path) {
            seq.push(path);
        }
        Ok(())
    }

    #[tokio::test]
    async fn mutation_writes_once_then_settles() {
        let store = MemStore::new();
        let key = seed_cm(&store, "hs", "homeserver.yaml", "server_name: example.com\n");

        assert!(mutate_artifact(&store, &key, "homeserver.yaml", &(), append_once).await.unwrap());
        assert!(!mutate_artifact(&store, &key, "homeserver.yaml", &(), append_once).await.unwrap());
        assert_eq!(store.writes().patches, 1);

        let stored = store.peek::<ConfigMap>(Some("matrix"), "hs").unwrap();
        let tree = parse_yaml("homeserver.yaml", &stored.data.unwrap()["homeserver.yaml"]).unwrap();
        assert_eq!(tree["app_service_config_files"].as_sequence().unwrap().len(), 1);
        assert_eq!(tree["server_name"], Yaml::from("example.com"));
    }

    #[tokio::test]
    async fn malformed_and_missing_documents_are_document_errors() {
        let store = MemStore::new();
        let key = seed_cm(&store, "bad", "config.yaml", "homeserver: [unclosed\n");
        let err = mutate_artifact(&store, &key, "config.yaml", &(), |_, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, MutateError::Document(DocumentError::Parse { .. })), "err={err:?}");

        let err = mutate_artifact(&store, &key, "other.yaml", &(), |_, _| Ok(())).await.unwrap_err();
        assert!(matches!(err, MutateError::Document(DocumentError::MissingArtifact { .. })));
        assert_eq!(store.writes().total(), 0);
    }

    #[tokio::test]
    async fn conflict_on_write_is_a_store_error() {
        let store = MemStore::new();
        let key = seed_cm(&store, "hs", "homeserver.yaml", "server_name: a\n");
        store.fail_next(Op::Patch, "ConfigMap/matrix/hs", StoreError::Conflict("stale".into()));
        let err = mutate_artifact(&store, &key, "homeserver.yaml", &(), append_once).await.unwrap_err();
        assert!(matches!(err, MutateError::Store(StoreError::Conflict(_))));
    }

    #[test]
    fn section_mut_reports_the_missing_path() {
        let mut tree = parse_yaml("config.yaml", "homeserver:\n  address: x\nlogging: {}\n").unwrap();
        section_mut(&mut tree, &["homeserver"]).unwrap().insert("domain".into(), "example.com".into());
        assert_eq!(tree["homeserver"]["domain"], Yaml::from("example.com"));
        let err = section_mut(&mut tree, &["logging", "handlers"]).unwrap_err();
        assert_eq!(err.to_string(), "error parsing 'logging/handlers' section");
    }

    #[tokio::test]
    async fn copy_is_made_once_and_requires_the_source() {
        let store = MemStore::new();
        let source = seed_cm(&store, "user-input", "config.yaml", "homeserver: {}\n");
        let target = ObjectMeta { name: Some("ms".into()), namespace: Some("matrix".into()), ..Default::default() };

        assert_eq!(copy_config_map(&store, &source, target.clone()).await.unwrap(), EnsureOutcome::Created);
        assert_eq!(copy_config_map(&store, &source, target.clone()).await.unwrap(), EnsureOutcome::Unchanged);
        let copy = store.peek::<ConfigMap>(Some("matrix"), "ms").unwrap();
        assert_eq!(copy.data.unwrap()["config.yaml"], "homeserver: {}\n");

        let missing = source.with_name("absent");
        let other = ObjectMeta { name: Some("other".into()), namespace: Some("matrix".into()), ..Default::default() };
        assert!(copy_config_map(&store, &missing, other).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn seeded_data_survives_later_mutations() {
        let store = MemStore::new();
        let mut desired = ConfigMap::default();
        desired.metadata.name = Some("hs".into());
        desired.metadata.namespace = Some("matrix".into());
        desired.data = Some([("homeserver.yaml".to_string(), "server_name: a\n".to_string())].into());
        assert_eq!(seed_config_map(&store, &desired).await.unwrap(), EnsureOutcome::Created);

        let key = ObjectKey::for_typed(&desired);
        assert!(mutate_artifact(&store, &key, "homeserver.yaml", &(), append_once).await.unwrap());
        assert_eq!(seed_config_map(&store, &desired).await.unwrap(), EnsureOutcome::Unchanged);
        let stored = store.peek::<ConfigMap>(Some("matrix"), "hs").unwrap();
        assert!(stored.data.unwrap()["homeserver.yaml"].contains("app_service_config_files"));

        desired.metadata.labels = Some([("app".to_string(), "synapse".to_string())].into());
        assert_eq!(seed_config_map(&store, &desired).await.unwrap(), EnsureOutcome::Patched);
    }
}
