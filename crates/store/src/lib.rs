//! Synop in-RAM store: an [`ObjectStore`] with resource versions, JSON
//! merge-patch, server-side apply and status-subresource semantics, cascading delete through
//! owner links, plus a call log and write counters for assertions.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kube::core::{ApiResource, DynamicObject, Resource};
use serde::de::DeserializeOwned;
use serde_json::Value as Json;
use synop_core::{
    patch::{apply_merge, merge_patch},
    ObjectKey, ObjectStore, StoreError,
};
use tracing::debug;

type Slot = (String, String, String, String); // apiVersion, kind, namespace, name

/// Store operation, as recorded in the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    List,
    Create,
    Patch,
    Apply,
    PatchStatus,
    Delete,
}

/// One recorded call: the operation and the `Kind/ns/name` (or `Kind` for lists) it targeted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub target: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub creates: usize,
    pub patches: usize,
    pub applies: usize,
    pub status_patches: usize,
    pub deletes: usize,
}

impl WriteStats {
    pub fn total(&self) -> usize { self.creates + self.patches + self.applies + self.status_patches + self.deletes }
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<Slot, Json>,
    next_rv: u64,
    unserved: Vec<(String, String)>,
    injected: VecDeque<(Op, String, StoreError)>,
    calls: Vec<Call>,
    writes: WriteStats,
}

/// In-memory object store.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn slot(resource: &ApiResource, namespace: Option<&str>, name: &str) -> Slot {
    (resource.api_version.clone(), resource.kind.clone(), namespace.unwrap_or("").to_string(), name.to_string())
}

fn decode(v: &Json) -> Result<DynamicObject, StoreError> {
    serde_json::from_value(v.clone()).map_err(|e| StoreError::Codec(e.to_string()))
}

fn resource_version(v: &Json) -> Option<&str> {
    v.get("metadata").and_then(|m| m.get("resourceVersion")).and_then(|s| s.as_str())
}

fn uid_of(v: &Json) -> Option<&str> {
    v.get("metadata").and_then(|m| m.get("uid")).and_then(|s| s.as_str())
}

fn owned_by(v: &Json, owner_uid: &str) -> bool {
    v.get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .and_then(|r| r.as_array())
        .map(|refs| refs.iter().any(|r| r.get("uid").and_then(|u| u.as_str()) == Some(owner_uid)))
        .unwrap_or(false)
}

/// Strip fields a patch may not set directly.
fn sanitize_patch(patch: &Json) -> Json {
    let mut p = patch.clone();
    if let Some(meta) = p.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("resourceVersion");
        meta.remove("uid");
        meta.remove("creationTimestamp");
        meta.remove("name");
        meta.remove("namespace");
    }
    p
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn record(&mut self, op: Op, target: String) -> Result<(), StoreError> {
        self.calls.push(Call { op, target: target.clone() });
        if let Some(pos) = self.injected.iter().position(|(o, t, _)| *o == op && (t.is_empty() || target.starts_with(t.as_str()))) {
            if let Some((_, _, err)) = self.injected.remove(pos) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn check_served(&self, resource: &ApiResource) -> Result<(), StoreError> {
        if self.unserved.iter().any(|(av, k)| *av == resource.api_version && *k == resource.kind) {
            return Err(StoreError::KindNotServed(format!("{}/{}", resource.api_version, resource.kind)));
        }
        Ok(())
    }

    fn check_version(&self, key: &ObjectKey, current: &Json, patch: &Json) -> Result<(), StoreError> {
        if let Some(base) = resource_version(patch) {
            let cur = resource_version(current).unwrap_or("");
            if base != cur {
                return Err(StoreError::Conflict(format!("{}: resourceVersion {} is stale (current {})", key, base, cur)));
            }
        }
        Ok(())
    }

    fn insert_new(&mut self, resource: &ApiResource, obj: &DynamicObject) -> Result<Json, StoreError> {
        let name = obj.metadata.name.clone().ok_or_else(|| StoreError::Codec("object missing metadata.name".into()))?;
        let s = slot(resource, obj.metadata.namespace.as_deref(), &name);
        if self.objects.contains_key(&s) {
            return Err(StoreError::AlreadyExists(ObjectKey::for_object(resource, obj).to_string()));
        }
        let mut v = serde_json::to_value(obj).map_err(|e| StoreError::Codec(e.to_string()))?;
        let rv = self.bump();
        let map = v.as_object_mut().ok_or_else(|| StoreError::Codec("object is not a map".into()))?;
        map.insert("apiVersion".into(), Json::String(resource.api_version.clone()));
        map.insert("kind".into(), Json::String(resource.kind.clone()));
        let meta = map.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("resourceVersion".into(), Json::String(rv));
            meta.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
            meta.entry("creationTimestamp").or_insert_with(|| Json::String(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)));
        }
        self.objects.insert(s, v.clone());
        Ok(v)
    }

    /// Shared path of `patch` and `apply`: version check, then `merge` of the
    /// body minus status and identity fields.
    fn write_spec(&mut self, key: &ObjectKey, body: &Json, merge: fn(&mut Json, &Json)) -> Result<Json, StoreError> {
        self.check_served(&key.resource)?;
        let s = slot(&key.resource, key.namespace.as_deref(), &key.name);
        let current = self.objects.get(&s).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        self.check_version(key, &current, body)?;
        let mut body = sanitize_patch(body);
        if let Some(map) = body.as_object_mut() {
            map.remove("status");
            map.remove("apiVersion");
            map.remove("kind");
        }
        let mut next = current;
        merge(&mut next, &body);
        let rv = self.bump();
        next["metadata"]["resourceVersion"] = Json::String(rv);
        self.objects.insert(s, next.clone());
        Ok(next)
    }

    fn cascade(&mut self, owner_uid: &str) {
        let mut pending = vec![owner_uid.to_string()];
        while let Some(uid) = pending.pop() {
            let doomed: Vec<Slot> = self.objects.iter().filter(|(_, v)| owned_by(v, &uid)).map(|(k, _)| k.clone()).collect();
            for k in doomed {
                if let Some(v) = self.objects.remove(&k) {
                    if let Some(child_uid) = uid_of(&v) {
                        pending.push(child_uid.to_string());
                    }
                }
            }
        }
    }
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make every operation on this kind fail with `KindNotServed`.
    pub fn without_kind(self, resource: &ApiResource) -> Self {
        self.lock().unserved.push((resource.api_version.clone(), resource.kind.clone()));
        self
    }

    /// Fail the next `op` whose target starts with `target_prefix` (empty = any).
    pub fn fail_next(&self, op: Op, target_prefix: &str, err: StoreError) {
        self.lock().injected.push_back((op, target_prefix.to_string(), err));
    }

    /// Insert an object without recording a call or a write (fixture setup).
    pub fn seed(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let v = self.lock().insert_new(resource, obj)?;
        decode(&v)
    }

    /// Seed a typed object.
    pub fn seed_typed<K>(&self, obj: &K) -> Result<K, StoreError>
    where
        K: Resource<DynamicType = ()> + serde::Serialize + DeserializeOwned,
    {
        let dynamic = synop_core::to_dynamic(obj)?;
        let stored = self.seed(&ApiResource::erase::<K>(&()), &dynamic)?;
        synop_core::from_dynamic(&stored)
    }

    /// Read a typed object without recording a call.
    pub fn peek<K>(&self, namespace: Option<&str>, name: &str) -> Option<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let s = slot(&ApiResource::erase::<K>(&()), namespace, name);
        let v = self.lock().objects.get(&s).cloned()?;
        serde_json::from_value(v).ok()
    }

    /// Raw stored JSON for a key, without recording a call.
    pub fn peek_raw(&self, key: &ObjectKey) -> Option<Json> {
        let s = slot(&key.resource, key.namespace.as_deref(), &key.name);
        self.lock().objects.get(&s).cloned()
    }

    /// Every stored object, in key order.
    pub fn dump(&self) -> Vec<Json> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn count_of(&self, resource: &ApiResource) -> usize {
        self.lock().objects.keys().filter(|(av, k, _, _)| *av == resource.api_version && *k == resource.kind).count()
    }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }
    pub fn writes(&self) -> WriteStats { self.lock().writes }

    pub fn reset_calls(&self) {
        let mut inner = self.lock();
        inner.calls.clear();
        inner.writes = WriteStats::default();
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
        let mut inner = self.lock();
        inner.record(Op::Get, key.to_string())?;
        inner.check_served(&key.resource)?;
        let s = slot(&key.resource, key.namespace.as_deref(), &key.name);
        inner.objects.get(&s).map(decode).transpose()
    }

    async fn list(&self, resource: &ApiResource, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
        let mut inner = self.lock();
        inner.record(Op::List, resource.kind.clone())?;
        inner.check_served(resource)?;
        inner
            .objects
            .iter()
            .filter(|((av, k, ns, _), _)| *av == resource.api_version && *k == resource.kind && namespace.map(|n| n == ns.as_str()).unwrap_or(true))
            .map(|(_, v)| decode(v))
            .collect()
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        inner.record(Op::Create, ObjectKey::for_object(resource, obj).to_string())?;
        inner.check_served(resource)?;
        let v = inner.insert_new(resource, obj)?;
        inner.writes.creates += 1;
        debug!(kind = %resource.kind, name = ?obj.metadata.name, "memstore: created");
        decode(&v)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        inner.record(Op::Patch, key.to_string())?;
        let next = inner.write_spec(key, patch, merge_patch)?;
        inner.writes.patches += 1;
        decode(&next)
    }

    async fn apply(&self, key: &ObjectKey, obj: &Json) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        inner.record(Op::Apply, key.to_string())?;
        let next = inner.write_spec(key, obj, apply_merge)?;
        inner.writes.applies += 1;
        debug!(object = %key, "memstore: applied");
        decode(&next)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, StoreError> {
        let mut inner = self.lock();
        inner.record(Op::PatchStatus, key.to_string())?;
        inner.check_served(&key.resource)?;
        let s = slot(&key.resource, key.namespace.as_deref(), &key.name);
        let current = inner.objects.get(&s).cloned().ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        inner.check_version(key, &current, patch)?;
        let mut next = current;
        if let Some(status) = patch.get("status") {
            let slot_value = next.as_object_mut().map(|m| m.entry("status").or_insert(Json::Null));
            if let Some(target) = slot_value {
                merge_patch(target, status);
            }
        }
        let rv = inner.bump();
        next["metadata"]["resourceVersion"] = Json::String(rv);
        inner.objects.insert(s, next.clone());
        inner.writes.status_patches += 1;
        decode(&next)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.record(Op::Delete, key.to_string())?;
        inner.check_served(&key.resource)?;
        let s = slot(&key.resource, key.namespace.as_deref(), &key.name);
        let removed = inner.objects.remove(&s).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(uid) = uid_of(&removed) {
            let uid = uid.to_string();
            inner.cascade(&uid);
        }
        inner.writes.deletes += 1;
        Ok(())
    }
}
