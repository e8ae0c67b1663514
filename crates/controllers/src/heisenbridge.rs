//! The Heisenbridge pipeline.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde_json::json;
use serde_yaml::Mapping;
use synop_api::Heisenbridge;
use synop_apply::{ensure, mutate_artifact, seed_config_map, DocumentError};
use synop_core::{ObjectKey, Outcome, ReconcileError};
use synop_engine::{fetch_latest, run_pipeline, Step};
use tracing::debug;

use crate::bridge::{self, config_map_key, synapse_key};
use crate::children::{self, labels, Labels};
use crate::templates::{heisenbridge_registration, service_url, AppServiceTokens, HEISENBRIDGE_PORT, SYNAPSE_PORT};
use crate::{name_of, namespace_of, settle_mutation, Context};

pub const CONFIG_KEY: &str = "heisenbridge.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeisenbridgeStep {
    TriggerSynapse,
    CopyInputConfigMap,
    ConfigureConfigMap,
    DefaultConfigMap,
    Service,
    Deployment,
    SetRunning,
}

pub fn pipeline(h: &Heisenbridge) -> Vec<HeisenbridgeStep> {
    use HeisenbridgeStep::*;

    let mut steps = vec![TriggerSynapse];
    match h.spec.config_map {
        Some(_) => steps.extend([CopyInputConfigMap, ConfigureConfigMap]),
        None => steps.extend([DefaultConfigMap, ConfigureConfigMap]),
    }
    steps.extend([Service, Deployment, SetRunning]);
    steps
}

pub async fn reconcile(ctx: &Context, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
    let Some(h) = fetch_latest::<Heisenbridge>(ctx.store(), key).await? else {
        debug!(object = %key, "heisenbridge gone");
        return Ok(Outcome::Halt);
    };
    run_pipeline(&pipeline(&h), ctx, key).await
}

#[async_trait]
impl Step<Context> for HeisenbridgeStep {
    fn name(&self) -> &'static str {
        match self {
            HeisenbridgeStep::TriggerSynapse => "trigger_synapse_reconciliation",
            HeisenbridgeStep::CopyInputConfigMap => "copy_input_config_map",
            HeisenbridgeStep::ConfigureConfigMap => "configure_config_map",
            HeisenbridgeStep::DefaultConfigMap => "reconcile_config_map",
            HeisenbridgeStep::Service => "reconcile_service",
            HeisenbridgeStep::Deployment => "reconcile_deployment",
            HeisenbridgeStep::SetRunning => "set_status_running",
        }
    }

    async fn run(&self, ctx: &Context, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let Some(h) = fetch_latest::<Heisenbridge>(ctx.store(), key).await? else {
            return Ok(Outcome::Halt);
        };
        let h = &h;
        match self {
            HeisenbridgeStep::TriggerSynapse => bridge::trigger_synapse_reconciliation(ctx, h).await,
            HeisenbridgeStep::CopyInputConfigMap => match h.spec.config_map.as_ref() {
                Some(input) => bridge::copy_input_config_map(ctx, h, input, &heisenbridge_labels(h)).await,
                None => Ok(Outcome::Continue),
            },
            HeisenbridgeStep::ConfigureConfigMap => match h.spec.config_map.as_ref() {
                Some(input) => bridge::configure_from_input(ctx, h, input, CONFIG_KEY, configure_config_map).await,
                None => {
                    let result = mutate_artifact(ctx.store(), &config_map_key(h), CONFIG_KEY, h, configure_config_map).await;
                    settle_mutation(ctx, h, result, "cannot parse heisenbridge.yaml: ").await
                }
            },
            HeisenbridgeStep::DefaultConfigMap => {
                // Seeded: the tokens drawn here are written once.
                let meta = children::child_meta(h, &name_of(h), &heisenbridge_labels(h))?;
                let registration = heisenbridge_registration(&bridge_url(h), &AppServiceTokens::generate())?;
                seed_config_map(ctx.store(), &children::config_map(meta, CONFIG_KEY, registration)).await?;
                Ok(Outcome::Continue)
            }
            HeisenbridgeStep::Service => {
                let l = heisenbridge_labels(h);
                let meta = children::child_meta(h, &name_of(h), &l)?;
                ensure(ctx.store(), &children::service(meta, &l, "heisenbridge", HEISENBRIDGE_PORT)?).await?;
                Ok(Outcome::Continue)
            }
            HeisenbridgeStep::Deployment => {
                ensure(ctx.store(), &deployment(ctx, h)?).await?;
                Ok(Outcome::Continue)
            }
            HeisenbridgeStep::SetRunning => bridge::set_status_running(ctx, h).await,
        }
    }
}

pub fn heisenbridge_labels(h: &Heisenbridge) -> Labels {
    labels("heisenbridge", &name_of(h))
}

/// Address Synapse uses to reach the bridge.
pub fn bridge_url(h: &Heisenbridge) -> String {
    service_url(&name_of(h), &namespace_of(h), HEISENBRIDGE_PORT)
}

/// Point a user-provided registration at this bridge's Service.
pub fn configure_config_map(h: &Heisenbridge, registration: &mut Mapping) -> Result<(), DocumentError> {
    registration.insert("url".into(), bridge_url(h).into());
    Ok(())
}

/// `heisenbridge -c <registration> -l 0.0.0.0 [-v...] <synapse url>`
pub fn args(h: &Heisenbridge) -> Vec<String> {
    let synapse = synapse_key(h);
    let synapse_url = service_url(&synapse.name, synapse.namespace.as_deref().unwrap_or_default(), SYNAPSE_PORT);
    let mut args = vec!["-c".to_string(), format!("/data-heisenbridge/{}", CONFIG_KEY), "-l".to_string(), "0.0.0.0".to_string()];
    args.extend(std::iter::repeat("-v".to_string()).take(h.spec.verbose_level as usize));
    args.push(synapse_url);
    args
}

fn deployment(ctx: &Context, h: &Heisenbridge) -> Result<Deployment, ReconcileError> {
    let name = name_of(h);
    let l = heisenbridge_labels(h);
    let pod = json!({
        "containers": [{
            "name": "heisenbridge",
            "image": ctx.config.heisenbridge_image,
            "command": ["python", "-m", "heisenbridge"],
            "args": args(h),
            "ports": [{ "containerPort": HEISENBRIDGE_PORT }],
            "volumeMounts": [children::mount("data-heisenbridge", "/data-heisenbridge")],
        }],
        "volumes": [children::config_map_volume("data-heisenbridge", &name)],
    });
    children::deployment(children::child_meta(h, &name, &l)?, &l, pod)
}
