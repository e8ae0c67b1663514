//! Status convergence: re-read, compare, patch only on difference.

use std::time::Duration;

use metrics::counter;
use serde_json::json;
use synop_core::{
    from_dynamic, patch::{merge_diff, merge_patch}, store::version_pin, HasStatus, Lifecycle, NeedsReconcile, ObjectKey,
    ObjectStore, Outcome, ReconcileError, StoreError,
};
use tracing::{debug, info, warn};

/// Result of [`commit_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCommit {
    /// Stored status already equals the candidate; nothing written.
    Unchanged,
    Patched,
    /// The entity no longer exists; nothing to converge.
    Gone,
}

impl StatusCommit {
    pub fn patched(&self) -> bool { matches!(self, StatusCommit::Patched) }
}

/// Fresh copy of an entity from the store.
pub async fn fetch_latest<E: HasStatus>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<Option<E>, StoreError> {
    match store.get(key).await? {
        Some(obj) => Ok(Some(from_dynamic(&obj)?)),
        None => Ok(None),
    }
}

/// Make the stored status of `entity` equal to `entity`'s in-memory status.
///
/// The stored copy is re-read first: the caller's copy may predate writes
/// made by earlier steps. Only the status subresource is patched, pinned to
/// the resource version just read.
pub async fn commit_status<E: HasStatus>(store: &dyn ObjectStore, entity: &E) -> Result<StatusCommit, StoreError> {
    let key = ObjectKey::for_typed(entity);
    let Some(current) = store.get(&key).await? else {
        debug!(object = %key, "status: entity gone");
        return Ok(StatusCommit::Gone);
    };
    let stored: E = from_dynamic(&current)?;
    let candidate = entity.status_or_default();
    if stored.status_or_default() == candidate {
        counter!("status_noop", 1u64, "kind" => key.kind().to_string());
        debug!(object = %key, "status: unchanged");
        return Ok(StatusCommit::Unchanged);
    }

    let from = current.data.get("status").cloned().unwrap_or_else(|| json!({}));
    let to = serde_json::to_value(&candidate).map_err(|e| StoreError::Codec(e.to_string()))?;
    let mut patch = json!({ "status": merge_diff(&from, &to) });
    merge_patch(&mut patch, &version_pin(&current));

    match store.patch_status(&key, &patch).await {
        Ok(_) => {
            counter!("status_patched", 1u64, "kind" => key.kind().to_string());
            info!(object = %key, "status: patched");
            Ok(StatusCommit::Patched)
        }
        Err(StoreError::NotFound(_)) => Ok(StatusCommit::Gone),
        Err(e) => Err(e),
    }
}

/// Read `key`, apply `update` to its status and commit. `Gone` when the entity
/// does not exist.
pub async fn update_status<E, F>(store: &dyn ObjectStore, key: &ObjectKey, update: F) -> Result<StatusCommit, StoreError>
where
    E: HasStatus,
    F: FnOnce(&mut E::Status),
{
    let Some(mut entity) = fetch_latest::<E>(store, key).await? else {
        return Ok(StatusCommit::Gone);
    };
    update(entity.status_mut());
    commit_status(store, &entity).await
}

/// Raise the "needs reconciliation" flag on another entity so its own
/// pipeline gets scheduled.
pub async fn mark_needs_reconcile<E>(store: &dyn ObjectStore, key: &ObjectKey) -> Result<StatusCommit, StoreError>
where
    E: HasStatus,
    E::Status: NeedsReconcile,
{
    let commit = update_status::<E, _>(store, key, |s| s.set_needs_reconcile(true)).await?;
    if commit.patched() {
        info!(object = %key, "flagged for reconciliation");
    }
    Ok(commit)
}

async fn record_failure<E>(store: &dyn ObjectStore, entity: &E, reason: &str) -> Result<(), ReconcileError>
where
    E: HasStatus,
    E::Status: Lifecycle,
{
    let mut failed = entity.clone();
    failed.status_mut().set_failed(reason);
    let key = ObjectKey::for_typed(entity);
    warn!(object = %key, reason, "entity failed");
    commit_status(store, &failed).await?;
    Ok(())
}

/// Record a permanent failure and stop; only a change to the entity helps.
pub async fn fail_and_halt<E>(store: &dyn ObjectStore, entity: &E, reason: &str) -> Result<Outcome, ReconcileError>
where
    E: HasStatus,
    E::Status: Lifecycle,
{
    record_failure(store, entity, reason).await?;
    Ok(Outcome::Halt)
}

/// Record a failure caused by an absent prerequisite and retry after `delay`.
pub async fn fail_and_retry<E>(store: &dyn ObjectStore, entity: &E, reason: &str, delay: Duration) -> Result<Outcome, ReconcileError>
where
    E: HasStatus,
    E::Status: Lifecycle,
{
    record_failure(store, entity, reason).await?;
    Ok(Outcome::RequeueAfter(delay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kube::core::{ApiResource, DynamicObject};
    use serde_json::Value as Json;
    use synop_api::{Synapse, SynapseSpec, SynapseStatus};
    use synop_core::LifecycleState;
    use synop_store::{MemStore, Op};

    fn synapse(status: Option<SynapseStatus>) -> Synapse {
        let mut s = Synapse::new("hs", SynapseSpec::default());
        s.metadata.namespace = Some("matrix".into());
        s.status = status;
        s
    }

    fn stored(store: &MemStore) -> SynapseStatus {
        store.peek::<Synapse>(Some("matrix"), "hs").and_then(|s| s.status).unwrap_or_default()
    }

    #[tokio::test]
    async fn identical_commits_write_once() {
        let store = MemStore::new();
        let seeded = store.seed_typed(&synapse(None)).unwrap();
        let mut next = seeded.clone();
        next.status_mut().homeserver_configuration.server_name = "example.com".into();

        assert_eq!(commit_status(&store, &next).await.unwrap(), StatusCommit::Patched);
        assert_eq!(commit_status(&store, &next).await.unwrap(), StatusCommit::Unchanged);
        assert_eq!(store.writes().status_patches, 1);
        assert_eq!(stored(&store).homeserver_configuration.server_name, "example.com");
    }

    #[tokio::test]
    async fn missing_entity_is_gone() {
        let store = MemStore::new();
        let key = ObjectKey::for_typed(&synapse(None));
        assert_eq!(commit_status(&store, &synapse(Some(SynapseStatus::default()))).await.unwrap(), StatusCommit::Gone);
        assert_eq!(mark_needs_reconcile::<Synapse>(&store, &key).await.unwrap(), StatusCommit::Gone);
        assert_eq!(store.writes().total(), 0);
    }

    #[tokio::test]
    async fn needs_reconcile_flag_is_the_only_change() {
        let store = MemStore::new();
        let mut status = SynapseStatus { state: LifecycleState::Running, ..Default::default() };
        status.homeserver_configuration.server_name = "example.com".into();
        let seeded = store.seed_typed(&synapse(Some(status.clone()))).unwrap();
        let key = ObjectKey::for_typed(&seeded);

        assert_eq!(mark_needs_reconcile::<Synapse>(&store, &key).await.unwrap(), StatusCommit::Patched);
        assert_eq!(stored(&store), SynapseStatus { needs_reconcile: true, ..status });
        assert_eq!(mark_needs_reconcile::<Synapse>(&store, &key).await.unwrap(), StatusCommit::Unchanged);
        assert_eq!(store.writes().status_patches, 1);
    }

    #[tokio::test]
    async fn failures_record_state_and_reason() {
        let store = MemStore::new();
        let s = store.seed_typed(&synapse(None)).unwrap();

        assert_eq!(fail_and_halt(&store, &s, "spec.homeserver must set one of configMap and values").await.unwrap(), Outcome::Halt);
        let status = stored(&store);
        assert_eq!(status.state, LifecycleState::Failed);
        assert_eq!(status.reason, "spec.homeserver must set one of configMap and values");

        let delay = Duration::from_secs(30);
        let outcome = fail_and_retry(&store, &s, "ConfigMap input does not exist in namespace matrix", delay).await.unwrap();
        assert_eq!(outcome, Outcome::RequeueAfter(delay));
        assert_eq!(stored(&store).reason, "ConfigMap input does not exist in namespace matrix");
    }

    /// Writes to the entity right after every read, so the version a commit
    /// pins is always stale.
    struct Racing(MemStore);

    #[async_trait]
    impl ObjectStore for Racing {
        async fn get(&self, key: &ObjectKey) -> Result<Option<DynamicObject>, StoreError> {
            let got = self.0.get(key).await?;
            if got.is_some() {
                self.0.patch(key, &json!({ "metadata": { "annotations": { "touched": "yes" } } })).await?;
            }
            Ok(got)
        }
        async fn list(&self, resource: &ApiResource, namespace: Option<&str>) -> Result<Vec<DynamicObject>, StoreError> {
            self.0.list(resource, namespace).await
        }
        async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject, StoreError> {
            self.0.create(resource, obj).await
        }
        async fn patch(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, StoreError> {
            self.0.patch(key, patch).await
        }
        async fn apply(&self, key: &ObjectKey, obj: &Json) -> Result<DynamicObject, StoreError> {
            self.0.apply(key, obj).await
        }
        async fn patch_status(&self, key: &ObjectKey, patch: &Json) -> Result<DynamicObject, StoreError> {
            self.0.patch_status(key, patch).await
        }
        async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
    }

    #[tokio::test]
    async fn stale_pinned_version_is_a_conflict() {
        let store = Racing(MemStore::new());
        let s = store.0.seed_typed(&synapse(None)).unwrap();
        let mut next = s.clone();
        next.status_mut().set_running();

        let err = commit_status(&store, &next).await.unwrap_err();
        assert!(err.is_conflict(), "err={:?}", err);
        assert_eq!(store.0.writes().status_patches, 0);
        assert!(store.0.calls().iter().any(|c| c.op == Op::PatchStatus));
    }
}
