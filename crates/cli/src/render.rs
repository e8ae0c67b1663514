//! Dry-run rendering: load manifests into an in-memory store, drive every
//! entity found there to convergence, and report what the store holds.

use std::sync::Arc;

use anyhow::{anyhow, Context as _, Result};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::Deserialize;
use serde_json::Value as Json;
use synop_api::GROUP;
use synop_controllers::{Context, EntityKind, Reconciler};
use synop_core::ObjectKey;
use synop_engine::{drive, ControllerConfig, Directive};
use synop_store::MemStore;
use tracing::{debug, info};

/// Passes over the whole set of entities. Bridges and their Synapse each
/// react to the other, so one pass is not always enough.
const MAX_ROUNDS: usize = 4;

pub struct Rendered {
    pub directives: Vec<(ObjectKey, Directive)>,
    pub objects: Vec<Json>,
}

fn resource_of(obj: &DynamicObject) -> Result<ApiResource> {
    let types = obj.types.as_ref().ok_or_else(|| anyhow!("document without apiVersion/kind"))?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", types.api_version.as_str()),
    };
    Ok(ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, &types.kind)))
}

/// Every non-empty document of a multi-document YAML stream.
pub fn load_manifests(raw: &str, default_ns: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for (i, doc) in serde_yaml::Deserializer::from_str(raw).enumerate() {
        let value = serde_yaml::Value::deserialize(doc).with_context(|| format!("document {}", i))?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value)?;
        let mut obj: DynamicObject = serde_json::from_value(json).with_context(|| format!("document {} is not a kube object", i))?;
        if obj.metadata.namespace.is_none() {
            obj.metadata.namespace = Some(default_ns.to_string());
        }
        objects.push(obj);
    }
    Ok(objects)
}

/// Seed `objects` and reconcile the Synop entities among them.
pub async fn render(objects: &[DynamicObject], config: ControllerConfig, max_runs: usize) -> Result<Rendered> {
    let store = Arc::new(MemStore::new());
    let mut entities = Vec::new();
    for obj in objects {
        let resource = resource_of(obj)?;
        store.seed(&resource, obj)?;
        if resource.group == GROUP {
            let kind: EntityKind = resource.kind.parse().map_err(|e: String| anyhow!(e))?;
            entities.push((kind, ObjectKey::for_object(&resource, obj)));
        }
    }
    if entities.is_empty() {
        return Err(anyhow!("no Synapse, Heisenbridge or MautrixSignal in input"));
    }

    let ctx = Arc::new(Context::new(store.clone(), config));
    let mut directives = Vec::new();
    for round in 1..=MAX_ROUNDS {
        store.reset_calls();
        directives.clear();
        for (kind, key) in &entities {
            let reconciler = Reconciler::new(ctx.clone(), *kind);
            let (directive, runs) = drive(&reconciler, key, max_runs).await;
            debug!(object = %key, runs, directive = %directive, "rendered");
            directives.push((key.clone(), directive));
        }
        let writes = store.writes().total();
        info!(round, writes, "render round complete");
        if writes == 0 {
            break;
        }
    }
    Ok(Rendered { directives, objects: store.dump() })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
apiVersion: synapse.opdev.io/v1alpha1
kind: Synapse
metadata:
  name: hs
spec:
  homeserver:
    values:
      serverName: example.com
      reportStats: false
---
apiVersion: synapse.opdev.io/v1alpha1
kind: Heisenbridge
metadata:
  name: hb
spec:
  synapse:
    name: hs
"#;

    #[tokio::test]
    async fn renders_entities_and_children() {
        let objects = load_manifests(MANIFEST, "matrix").unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[1].metadata.namespace.as_deref(), Some("matrix"));

        let out = render(&objects, ControllerConfig::default(), 10).await.unwrap();
        assert!(out.directives.iter().all(|(_, d)| *d == Directive::Done), "{:?}", out.directives);
        let kinds: Vec<&str> = out.objects.iter().filter_map(|o| o["kind"].as_str()).collect();
        assert_eq!(kinds.iter().filter(|k| **k == "Deployment").count(), 2);
        assert!(kinds.contains(&"Service") && kinds.contains(&"ConfigMap"));

        let synapse = out.objects.iter().find(|o| o["kind"] == "Synapse").unwrap();
        assert_eq!(synapse["status"]["bridges"]["heisenbridge"]["name"], "hb");
        assert_eq!(synapse["status"]["state"], "RUNNING");
    }

    #[tokio::test]
    async fn input_without_entities_is_rejected() {
        let objects = load_manifests("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n---\n", "default").unwrap();
        assert!(render(&objects, ControllerConfig::default(), 10).await.is_err());
    }
}
