//! Synop apply: make the store hold a desired child object (`ensure`) and
//! edit configuration documents stored inside ConfigMaps (`document`).

#![forbid(unsafe_code)]

pub mod document;

use kube::core::{ApiResource, Resource};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use synop_core::{patch::{merge_patch, named_entries}, store::version_pin, to_dynamic, ObjectKey, ObjectStore, StoreError};
use tracing::{debug, info};

pub use document::{
    copy_config_map, load_yaml_artifact, mutate_artifact, parse_yaml, render_yaml, section_mut, seed_config_map, DocumentError,
    MutateError,
};

/// What `ensure` did to converge the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created,
    Patched,
    Unchanged,
}

/// Make the store hold `desired`: create it when absent, server-side apply
/// the managed fields when they diverge, do nothing otherwise. The type
/// parameter fixes the kind looked up.
///
/// Store failures, `Conflict` included, are returned unchanged.
pub async fn ensure<K>(store: &dyn ObjectStore, desired: &K) -> Result<EnsureOutcome, StoreError>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    ensure_dynamic(store, &ApiResource::erase::<K>(&()), desired).await
}

/// `ensure` for kinds without a Rust type; `resource` describes the kind.
pub async fn ensure_dynamic<T: Serialize>(store: &dyn ObjectStore, resource: &ApiResource, desired: &T) -> Result<EnsureOutcome, StoreError> {
    let obj = to_dynamic(desired)?;
    let key = ObjectKey::for_object(resource, &obj);
    if key.name.is_empty() {
        return Err(StoreError::Codec(format!("desired {} has no name", resource.kind)));
    }

    let Some(existing) = store.get(&key).await? else {
        store.create(resource, &obj).await?;
        counter!("ensure_created", 1u64, "kind" => resource.kind.clone());
        info!(object = %key, "ensure: created");
        return Ok(EnsureOutcome::Created);
    };

    let want = managed_view(serde_json::to_value(&obj).map_err(|e| StoreError::Codec(e.to_string()))?);
    let have = serde_json::to_value(&existing).map_err(|e| StoreError::Codec(e.to_string()))?;
    let diverged = divergence(&want, &have);
    if diverged.is_empty() {
        counter!("ensure_noop", 1u64, "kind" => resource.kind.clone());
        debug!(object = %key, "ensure: unchanged");
        return Ok(EnsureOutcome::Unchanged);
    }

    let mut body = want;
    if let Some(map) = body.as_object_mut() {
        map.insert("apiVersion".into(), Json::String(resource.api_version.clone()));
        map.insert("kind".into(), Json::String(resource.kind.clone()));
    }
    merge_patch(&mut body, &version_pin(&existing));
    store.apply(&key, &body).await?;
    counter!("ensure_patched", 1u64, "kind" => resource.kind.clone());
    info!(object = %key, paths = ?diverged, "ensure: applied");
    Ok(EnsureOutcome::Patched)
}

/// The fields an entity owns on a child: everything it sets, minus
/// server-owned metadata and status.
fn managed_view(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for server_owned in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(server_owned);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Whether `have` already carries every value of `want`. Fields only `have`
/// carries are not managed and are ignored.
pub fn is_subset(want: &Json, have: &Json) -> bool {
    divergence(want, have).is_empty()
}

/// Managed paths of `want` whose value `have` does not carry, such as
/// `spec.template.spec.containers[synapse].image`. Maps recurse on `want`'s
/// keys; lists of named entries pair entries by name and must hold the same
/// names; other lists compare element-wise; scalars by value.
pub fn divergence(want: &Json, have: &Json) -> Vec<String> {
    let mut out = Vec::new();
    diverging_paths(want, have, "", &mut out);
    out
}

fn diverging_paths(want: &Json, have: &Json, path: &str, out: &mut Vec<String>) {
    let at = |seg: &str| if path.is_empty() { seg.to_string() } else { format!("{}.{}", path, seg) };
    match (want, have) {
        (Json::Object(w), Json::Object(h)) => {
            for (k, wv) in w {
                match h.get(k) {
                    Some(hv) => diverging_paths(wv, hv, &at(k), out),
                    None if wv.is_null() || is_empty_container(wv) => {}
                    None => out.push(at(k)),
                }
            }
        }
        (Json::Array(w), Json::Array(h)) => match (named_entries(w), named_entries(h)) {
            (Some(wn), Some(hn)) if wn.len() == hn.len() => {
                for (name, wv) in wn.iter().zip(w) {
                    let entry = format!("{}[{}]", path, name);
                    match h.iter().find(|hv| hv.get("name").and_then(Json::as_str) == Some(*name)) {
                        Some(hv) => diverging_paths(wv, hv, &entry, out),
                        None => out.push(entry),
                    }
                }
            }
            _ if w.len() == h.len() => {
                for (i, (wv, hv)) in w.iter().zip(h).enumerate() {
                    diverging_paths(wv, hv, &format!("{}[{}]", path, i), out);
                }
            }
            _ => out.push(path.to_string()),
        },
        _ if want == have => {}
        _ => out.push(path.to_string()),
    }
}

fn is_empty_container(v: &Json) -> bool {
    match v {
        Json::Object(m) => m.is_empty(),
        Json::Array(a) => a.is_empty(),
        _ => false,
    }
}
