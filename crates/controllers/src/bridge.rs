//! Steps shared by the bridge pipelines and the dependency scan run by
//! the Synapse pipeline.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::core::ApiResource;
use serde_yaml::Mapping;
use synop_api::{Bridge, BridgeLink, ConfigMapRef, Synapse};
use synop_apply::{copy_config_map, load_yaml_artifact, mutate_artifact, DocumentError};
use synop_core::{from_dynamic, naming::compute_namespace, HasStatus, Lifecycle, ObjectKey, ObjectStore, Outcome, ReconcileError, StoreError};
use synop_engine::{commit_status, fail_and_retry, fetch_latest, mark_needs_reconcile, StatusCommit};
use tracing::debug;

use crate::children::{self, Labels};
use crate::{after_commit, missing_config_map_reason, name_of, namespace_of, settle_mutation, Context};

/// Key of the Synapse a bridge points at.
pub(crate) fn synapse_key<B: Bridge>(bridge: &B) -> ObjectKey {
    let r = bridge.synapse_ref();
    ObjectKey::of::<Synapse>(Some(&r.resolve_namespace(&namespace_of(bridge))), &r.name)
}

pub(crate) fn missing_synapse_reason(key: &ObjectKey) -> String {
    format!("Synapse {} does not exist in namespace {}", key.name, key.namespace.as_deref().unwrap_or_default())
}

/// The Synapse referenced by `bridge`, or the outcome to return when it is absent.
pub(crate) async fn referenced_synapse<B>(ctx: &Context, bridge: &B) -> Result<Result<Synapse, Outcome>, ReconcileError>
where
    B: Bridge,
    B::Status: Lifecycle,
{
    let key = synapse_key(bridge);
    match fetch_latest::<Synapse>(ctx.store(), &key).await? {
        Some(s) => Ok(Ok(s)),
        None => {
            let outcome = fail_and_retry(ctx.store(), bridge, &missing_synapse_reason(&key), ctx.config.prereq_retry).await?;
            Ok(Err(outcome))
        }
    }
}

/// Flag the referenced Synapse so its pipeline picks this bridge up. A
/// Synapse already recording this bridge is left alone.
pub(crate) async fn trigger_synapse_reconciliation<B>(ctx: &Context, bridge: &B) -> Result<Outcome, ReconcileError>
where
    B: Bridge,
    B::Status: Lifecycle,
{
    let synapse = match referenced_synapse(ctx, bridge).await? {
        Ok(s) => s,
        Err(outcome) => return Ok(outcome),
    };
    let link = bridge.link(&synapse.status_or_default().bridges).clone();
    let key = synapse_key(bridge);
    if is_registered(&link, bridge) {
        debug!(synapse = %key, "bridge already registered");
        return Ok(Outcome::Continue);
    }
    match mark_needs_reconcile::<Synapse>(ctx.store(), &key).await? {
        StatusCommit::Gone => Ok(fail_and_retry(ctx.store(), bridge, &missing_synapse_reason(&key), ctx.config.prereq_retry).await?),
        _ => Ok(Outcome::Continue),
    }
}

/// Whether `link` records exactly this bridge, namespace included.
pub(crate) fn is_registered<B: Bridge>(link: &BridgeLink, bridge: &B) -> bool {
    link.enabled && link.name == name_of(bridge) && link.namespace == namespace_of(bridge)
}

/// All bridges of kind `B`, across namespaces. A kind that is not served
/// has no bridges.
pub(crate) async fn list_bridges<B: Bridge>(store: &dyn ObjectStore) -> Result<Vec<B>, StoreError> {
    let resource = ApiResource::erase::<B>(&());
    match store.list(&resource, None).await {
        Ok(items) => items.iter().map(from_dynamic).collect(),
        Err(StoreError::KindNotServed(what)) => {
            debug!(kind = %what, "bridge kind not served");
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

/// Whether `bridge` points at the Synapse `name` in `namespace`.
pub(crate) fn points_at<B: Bridge>(bridge: &B, name: &str, namespace: &str) -> bool {
    let r = bridge.synapse_ref();
    r.name == name && r.resolve_namespace(&namespace_of(bridge)) == namespace
}

/// Link to the last bridge of kind `B` pointing at the Synapse; a disabled
/// link when there is none.
pub(crate) async fn find_bridge<B: Bridge>(store: &dyn ObjectStore, name: &str, namespace: &str) -> Result<BridgeLink, StoreError> {
    let found = list_bridges::<B>(store).await?.into_iter().filter(|b| points_at(b, name, namespace)).last();
    Ok(found.map(|b| BridgeLink { enabled: true, name: name_of(&b), namespace: namespace_of(&b) }).unwrap_or_default())
}

/// Copy the user ConfigMap `input` into the bridge's own ConfigMap, named
/// after the bridge. A missing input fails the bridge and retries later.
pub(crate) async fn copy_input_config_map<B>(ctx: &Context, bridge: &B, input: &ConfigMapRef, labels: &Labels) -> Result<Outcome, ReconcileError>
where
    B: Bridge,
    B::Status: Lifecycle,
{
    let ns = compute_namespace(&namespace_of(bridge), input.namespace.as_deref());
    let source = ObjectKey::of::<ConfigMap>(Some(&ns), &input.name);
    let meta = children::child_meta(bridge, &name_of(bridge), labels)?;
    match copy_config_map(ctx.store(), &source, meta).await {
        Ok(_) => Ok(Outcome::Continue),
        Err(StoreError::NotFound(_)) => fail_and_retry(ctx.store(), bridge, &missing_config_map_reason(&input.name, &ns), ctx.config.prereq_retry).await,
        Err(e) => Err(e.into()),
    }
}

/// Rebuild the bridge's document `artifact` from the user's current input
/// with `configure` applied on top, so edits to the input reach the copy.
/// Writes only when the result differs from what is stored.
pub(crate) async fn configure_from_input<B>(
    ctx: &Context,
    bridge: &B,
    input: &ConfigMapRef,
    artifact: &str,
    configure: fn(&B, &mut Mapping) -> Result<(), DocumentError>,
) -> Result<Outcome, ReconcileError>
where
    B: Bridge,
    B::Status: Lifecycle,
{
    let ns = compute_namespace(&namespace_of(bridge), input.namespace.as_deref());
    let source = ObjectKey::of::<ConfigMap>(Some(&ns), &input.name);
    let Some(src) = ctx.store().get(&source).await? else {
        return fail_and_retry(ctx.store(), bridge, &missing_config_map_reason(&input.name, &ns), ctx.config.prereq_retry).await;
    };
    let result = match load_yaml_artifact(&src, artifact) {
        Ok(doc) => {
            mutate_artifact(ctx.store(), &config_map_key(bridge), artifact, bridge, |b, tree| {
                *tree = doc;
                configure(b, tree)
            })
            .await
        }
        Err(e) => Err(e.into()),
    };
    settle_mutation(ctx, bridge, result, &format!("cannot parse {}: ", artifact)).await
}

pub(crate) async fn set_status_running<B>(ctx: &Context, bridge: &B) -> Result<Outcome, ReconcileError>
where
    B: Bridge,
    B::Status: Lifecycle,
{
    let mut next = bridge.clone();
    next.status_mut().set_running();
    Ok(after_commit(commit_status(ctx.store(), &next).await?))
}

/// Key of the ConfigMap holding a bridge's configuration document.
pub(crate) fn config_map_key<B: Bridge>(bridge: &B) -> ObjectKey {
    ObjectKey::of::<ConfigMap>(Some(&namespace_of(bridge)), &name_of(bridge))
}
