//! Synop controllers: the convergence pipelines for `Synapse`,
//! `Heisenbridge` and `MautrixSignal` entities.
//!
//! Each run reads the entity, composes its step list from the current spec
//! and status, and runs it through the engine's executor. Children are
//! written only through `synop_apply`, statuses only through
//! `synop_engine::status`.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use kube::core::Resource;
use synop_apply::MutateError;
use synop_api::{Heisenbridge, MautrixSignal, Synapse};
use synop_core::{HasStatus, Lifecycle, ObjectKey, ObjectStore, Outcome, ReconcileError};
use synop_engine::{evaluate, fail_and_halt, ControllerConfig, Directive, Reconcile, StatusCommit};

mod bridge;
pub mod children;
pub mod heisenbridge;
pub mod mautrix_signal;
pub mod synapse;
pub mod templates;

/// Dependencies handed to every step.
pub struct Context {
    store: Arc<dyn ObjectStore>,
    pub config: ControllerConfig,
}

impl Context {
    pub fn new(store: Arc<dyn ObjectStore>, config: ControllerConfig) -> Self { Self { store, config } }

    pub fn store(&self) -> &dyn ObjectStore { self.store.as_ref() }
}

/// The entity kinds this crate reconciles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Synapse,
    Heisenbridge,
    MautrixSignal,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Synapse, EntityKind::Heisenbridge, EntityKind::MautrixSignal];

    pub fn key(&self, namespace: &str, name: &str) -> ObjectKey {
        match self {
            EntityKind::Synapse => ObjectKey::of::<Synapse>(Some(namespace), name),
            EntityKind::Heisenbridge => ObjectKey::of::<Heisenbridge>(Some(namespace), name),
            EntityKind::MautrixSignal => ObjectKey::of::<MautrixSignal>(Some(namespace), name),
        }
    }

    /// One pipeline pass for the entity at `key`.
    pub async fn reconcile(&self, ctx: &Context, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        match self {
            EntityKind::Synapse => synapse::reconcile(ctx, key).await,
            EntityKind::Heisenbridge => heisenbridge::reconcile(ctx, key).await,
            EntityKind::MautrixSignal => mautrix_signal::reconcile(ctx, key).await,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Synapse => "Synapse",
            EntityKind::Heisenbridge => "Heisenbridge",
            EntityKind::MautrixSignal => "MautrixSignal",
        };
        f.write_str(s)
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "synapse" | "synapses" | "syn" => Ok(EntityKind::Synapse),
            "heisenbridge" | "heisenbridges" => Ok(EntityKind::Heisenbridge),
            "mautrixsignal" | "mautrixsignals" | "mautrix-signal" => Ok(EntityKind::MautrixSignal),
            other => Err(format!("unknown kind: {} (expected synapse, heisenbridge or mautrixsignal)", other)),
        }
    }
}

/// Runs passes of one kind's pipeline; what a host runtime drives.
pub struct Reconciler {
    ctx: Arc<Context>,
    kind: EntityKind,
}

impl Reconciler {
    pub fn new(ctx: Arc<Context>, kind: EntityKind) -> Self { Self { ctx, kind } }
}

#[async_trait]
impl Reconcile for Reconciler {
    async fn reconcile_once(&self, key: &ObjectKey) -> Directive {
        evaluate(self.kind.reconcile(&self.ctx, key).await)
    }
}

/// A status write that changed something requires a fresh pass so later
/// steps see it; an entity that vanished stops the run.
pub(crate) fn after_commit(commit: StatusCommit) -> Outcome {
    match commit {
        StatusCommit::Unchanged => Outcome::Continue,
        StatusCommit::Patched => Outcome::Requeue,
        StatusCommit::Gone => Outcome::Halt,
    }
}

/// Route a document mutation result: store failures are retried, a
/// structurally invalid document halts the entity with `context` prefixed
/// to the reason.
pub(crate) async fn settle_mutation<E>(ctx: &Context, entity: &E, result: Result<bool, MutateError>, context: &str) -> Result<Outcome, ReconcileError>
where
    E: HasStatus,
    E::Status: Lifecycle,
{
    match result {
        Ok(_) => Ok(Outcome::Continue),
        Err(MutateError::Store(e)) => Err(e.into()),
        Err(MutateError::Document(e)) => fail_and_halt(ctx.store(), entity, &format!("{}{}", context, e)).await,
    }
}

pub(crate) fn missing_config_map_reason(name: &str, namespace: &str) -> String {
    format!("ConfigMap {} does not exist in namespace {}", name, namespace)
}

pub(crate) fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.meta().namespace.clone().unwrap_or_default()
}

pub(crate) fn name_of<K: Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_parse_from_cli_spellings() {
        assert_eq!("Synapse".parse::<EntityKind>().unwrap(), EntityKind::Synapse);
        assert_eq!("mautrix-signal".parse::<EntityKind>().unwrap(), EntityKind::MautrixSignal);
        assert!("matrix".parse::<EntityKind>().is_err());
        assert_eq!(EntityKind::Heisenbridge.key("matrix", "hb").to_string(), "Heisenbridge/matrix/hb");
    }
}
