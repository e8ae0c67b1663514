//! The MautrixSignal pipeline: the bridge itself plus its `signald` daemon,
//! which shares a volume with the bridge for its control socket.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use serde_json::{json, Value as Json};
use serde_yaml::Mapping;
use synop_api::{MautrixSignal, Synapse, SynapseFacts};
use synop_apply::{ensure, section_mut, DocumentError};
use synop_core::{naming::child_name, HasStatus, ObjectKey, Outcome, ReconcileError};
use synop_engine::{commit_status, fetch_latest, run_pipeline, Step};
use tracing::{debug, info};

use crate::bridge::{self, synapse_key};
use crate::children::{self, labels, Labels};
use crate::templates::{
    mautrix_permissions, mautrix_signal_config, service_url, MautrixSignalTemplate, MAUTRIX_SIGNAL_LOG, MAUTRIX_SIGNAL_PORT,
    SIGNALD_SOCKET, SYNAPSE_PORT,
};
use crate::{after_commit, name_of, namespace_of, Context};

pub const CONFIG_KEY: &str = "config.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MautrixSignalStep {
    TriggerSynapse,
    BuildStatus,
    CopyInputConfigMap,
    ConfigureConfigMap,
    DefaultConfigMap,
    ServiceAccount,
    RoleBinding,
    SignaldPersistentVolumeClaim,
    SignaldDeployment,
    Service,
    PersistentVolumeClaim,
    Deployment,
    SetRunning,
}

pub fn pipeline(ms: &MautrixSignal) -> Vec<MautrixSignalStep> {
    use MautrixSignalStep::*;

    let mut steps = vec![TriggerSynapse, BuildStatus];
    match ms.spec.config_map {
        Some(_) => steps.extend([CopyInputConfigMap, ConfigureConfigMap]),
        None => steps.push(DefaultConfigMap),
    }
    if ms.status_or_default().is_openshift {
        steps.extend([ServiceAccount, RoleBinding]);
    }
    steps.extend([SignaldPersistentVolumeClaim, SignaldDeployment, Service, PersistentVolumeClaim, Deployment, SetRunning]);
    steps
}

pub async fn reconcile(ctx: &Context, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
    let Some(ms) = fetch_latest::<MautrixSignal>(ctx.store(), key).await? else {
        debug!(object = %key, "mautrix-signal gone");
        return Ok(Outcome::Halt);
    };
    run_pipeline(&pipeline(&ms), ctx, key).await
}

#[async_trait]
impl Step<Context> for MautrixSignalStep {
    fn name(&self) -> &'static str {
        match self {
            MautrixSignalStep::TriggerSynapse => "trigger_synapse_reconciliation",
            MautrixSignalStep::BuildStatus => "build_status",
            MautrixSignalStep::CopyInputConfigMap => "copy_input_config_map",
            MautrixSignalStep::ConfigureConfigMap => "configure_config_map",
            MautrixSignalStep::DefaultConfigMap => "reconcile_config_map",
            MautrixSignalStep::ServiceAccount => "reconcile_service_account",
            MautrixSignalStep::RoleBinding => "reconcile_role_binding",
            MautrixSignalStep::SignaldPersistentVolumeClaim => "reconcile_signald_pvc",
            MautrixSignalStep::SignaldDeployment => "reconcile_signald_deployment",
            MautrixSignalStep::Service => "reconcile_service",
            MautrixSignalStep::PersistentVolumeClaim => "reconcile_pvc",
            MautrixSignalStep::Deployment => "reconcile_deployment",
            MautrixSignalStep::SetRunning => "set_status_running",
        }
    }

    async fn run(&self, ctx: &Context, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let Some(ms) = fetch_latest::<MautrixSignal>(ctx.store(), key).await? else {
            return Ok(Outcome::Halt);
        };
        let ms = &ms;
        let l = mautrix_signal_labels(ms);
        match self {
            MautrixSignalStep::TriggerSynapse => bridge::trigger_synapse_reconciliation(ctx, ms).await,
            MautrixSignalStep::BuildStatus => build_status(ctx, ms).await,
            MautrixSignalStep::CopyInputConfigMap => match ms.spec.config_map.as_ref() {
                Some(input) => bridge::copy_input_config_map(ctx, ms, input, &l).await,
                None => Ok(Outcome::Continue),
            },
            MautrixSignalStep::ConfigureConfigMap => match ms.spec.config_map.as_ref() {
                Some(input) => bridge::configure_from_input(ctx, ms, input, CONFIG_KEY, configure_config_map).await,
                None => Ok(Outcome::Continue),
            },
            MautrixSignalStep::DefaultConfigMap => {
                let t = MautrixSignalTemplate { synapse_url: synapse_url(ms), bridge_url: bridge_url(ms), server_name: &server_name(ms) };
                let meta = children::child_meta(ms, &name_of(ms), &l)?;
                ensure(ctx.store(), &children::config_map(meta, CONFIG_KEY, mautrix_signal_config(&t)?)).await?;
                Ok(Outcome::Continue)
            }
            MautrixSignalStep::ServiceAccount => {
                ensure(ctx.store(), &children::service_account(children::child_meta(ms, &name_of(ms), &l)?)).await?;
                Ok(Outcome::Continue)
            }
            MautrixSignalStep::RoleBinding => {
                ensure(ctx.store(), &children::scc_role_binding(children::child_meta(ms, &name_of(ms), &l)?)?).await?;
                Ok(Outcome::Continue)
            }
            MautrixSignalStep::SignaldPersistentVolumeClaim => {
                let meta = children::child_meta(ms, &signald_name(ms), &signald_labels(ms))?;
                ensure(ctx.store(), &children::persistent_volume_claim(meta)?).await?;
                Ok(Outcome::Continue)
            }
            MautrixSignalStep::SignaldDeployment => {
                ensure(ctx.store(), &signald_deployment(ctx, ms)?).await?;
                Ok(Outcome::Continue)
            }
            MautrixSignalStep::Service => {
                let meta = children::child_meta(ms, &name_of(ms), &l)?;
                ensure(ctx.store(), &children::service(meta, &l, "mautrix-signal", MAUTRIX_SIGNAL_PORT)?).await?;
                Ok(Outcome::Continue)
            }
            MautrixSignalStep::PersistentVolumeClaim => {
                ensure(ctx.store(), &children::persistent_volume_claim(children::child_meta(ms, &name_of(ms), &l)?)?).await?;
                Ok(Outcome::Continue)
            }
            MautrixSignalStep::Deployment => {
                ensure(ctx.store(), &deployment(ctx, ms)?).await?;
                Ok(Outcome::Continue)
            }
            MautrixSignalStep::SetRunning => bridge::set_status_running(ctx, ms).await,
        }
    }
}

pub fn mautrix_signal_labels(ms: &MautrixSignal) -> Labels {
    labels("mautrix-signal", &name_of(ms))
}

/// Name of the signald PVC and Deployment.
pub fn signald_name(ms: &MautrixSignal) -> String {
    child_name(&name_of(ms), "signald")
}

fn signald_labels(ms: &MautrixSignal) -> Labels {
    labels("signald", &signald_name(ms))
}

fn server_name(ms: &MautrixSignal) -> String {
    ms.status_or_default().synapse.server_name
}

fn synapse_url(ms: &MautrixSignal) -> String {
    let key = synapse_key(ms);
    service_url(&key.name, key.namespace.as_deref().unwrap_or_default(), SYNAPSE_PORT)
}

fn bridge_url(ms: &MautrixSignal) -> String {
    service_url(&name_of(ms), &namespace_of(ms), MAUTRIX_SIGNAL_PORT)
}

/// Copy the facts the bridge needs from its Synapse. Until the Synapse has
/// published a server name there is nothing to configure the bridge with.
async fn build_status(ctx: &Context, ms: &MautrixSignal) -> Result<Outcome, ReconcileError> {
    let synapse: Synapse = match bridge::referenced_synapse(ctx, ms).await? {
        Ok(s) => s,
        Err(outcome) => return Ok(outcome),
    };
    let facts = synapse.status_or_default().homeserver_configuration;
    if facts.server_name.is_empty() {
        info!(synapse = %synapse_key(ms), "synapse has no server name yet");
        return Ok(Outcome::RequeueAfter(ctx.config.prereq_retry));
    }
    let mut next = ms.clone();
    let status = next.status_mut();
    status.synapse = SynapseFacts { server_name: facts.server_name };
    status.is_openshift = synapse.spec.is_openshift;
    Ok(after_commit(commit_status(ctx.store(), &next).await?))
}

fn set(section: &mut Mapping, key: &str, value: Json) -> Result<(), DocumentError> {
    let v = serde_yaml::to_value(value).map_err(DocumentError::Serialize)?;
    section.insert(key.into(), v);
    Ok(())
}

/// Rewrite the fields of a user-provided `config.yaml` that depend on where
/// the bridge and its Synapse run.
pub fn configure_config_map(ms: &MautrixSignal, config: &mut Mapping) -> Result<(), DocumentError> {
    let server = server_name(ms);

    let homeserver = section_mut(config, &["homeserver"])?;
    set(homeserver, "address", json!(synapse_url(ms)))?;
    set(homeserver, "domain", json!(server))?;

    set(section_mut(config, &["appservice"])?, "address", json!(bridge_url(ms)))?;
    set(section_mut(config, &["signal"])?, "socket_path", json!(SIGNALD_SOCKET))?;
    set(section_mut(config, &["bridge"])?, "permissions", mautrix_permissions(&server))?;
    set(section_mut(config, &["logging", "handlers", "file"])?, "filename", json!(MAUTRIX_SIGNAL_LOG))?;
    Ok(())
}

fn service_account_name(ms: &MautrixSignal, pod: &mut Json) {
    if ms.status_or_default().is_openshift {
        pod["serviceAccountName"] = json!(name_of(ms));
    }
}

fn signald_deployment(ctx: &Context, ms: &MautrixSignal) -> Result<Deployment, ReconcileError> {
    let name = signald_name(ms);
    let l = signald_labels(ms);
    let mut pod = json!({
        "containers": [{
            "name": "signald",
            "image": ctx.config.signald_image,
            "volumeMounts": [children::mount("signald", "/signald")],
        }],
        "volumes": [children::pvc_volume("signald", &name)],
    });
    service_account_name(ms, &mut pod);
    children::deployment(children::child_meta(ms, &name, &l)?, &l, pod)
}

/// The bridge reads its config from `/input`, keeps a writable copy and the
/// generated `registration.yaml` under `/data`, and talks to signald through
/// the socket in `/signald`.
fn deployment(ctx: &Context, ms: &MautrixSignal) -> Result<Deployment, ReconcileError> {
    let name = name_of(ms);
    let l = mautrix_signal_labels(ms);
    let mounts = json!([
        children::mount("config", "/input"),
        children::mount("data", "/data"),
        children::mount("signald", "/signald"),
    ]);
    let mut pod = json!({
        "initContainers": [{
            "name": "generate-registration",
            "image": ctx.config.mautrix_signal_image,
            "command": ["sh", "-c"],
            "args": [format!(
                "cp /input/{0} /data/{0} && python3 -m mautrix_signal -g -c /data/{0} -r /data/registration.yaml",
                CONFIG_KEY
            )],
            "volumeMounts": mounts,
        }],
        "containers": [{
            "name": "mautrix-signal",
            "image": ctx.config.mautrix_signal_image,
            "command": ["python3", "-m", "mautrix_signal", "-c", format!("/data/{}", CONFIG_KEY)],
            "ports": [{ "containerPort": MAUTRIX_SIGNAL_PORT }],
            "volumeMounts": mounts,
        }],
        "volumes": [
            children::config_map_volume("config", &name),
            children::pvc_volume("data", &name),
            children::pvc_volume("signald", &signald_name(ms)),
        ],
    });
    service_account_name(ms, &mut pod);
    children::deployment(children::child_meta(ms, &name, &l)?, &l, pod)
}

#[cfg(test)]
mod tests {
    use super::*;
    use synop_api::{MautrixSignalSpec, SynapseRef};

    fn mautrix_signal() -> MautrixSignal {
        let mut ms = MautrixSignal::new("ms", MautrixSignalSpec { synapse: SynapseRef { name: "hs".into(), namespace: None }, config_map: None });
        ms.metadata.namespace = Some("matrix".into());
        ms.status_mut().synapse.server_name = "example.com".into();
        ms
    }

    const USER_CONFIG: &str = "\
homeserver:
  address: https://matrix.example.com
  domain: wrong
appservice:
  address: http://localhost:29328
  port: 29328
signal:
  socket_path: /var/run/signald/signald.sock
bridge:
  permissions:
    '*': relay
logging:
  handlers:
    file:
      filename: ./mautrix-signal.log
";

    #[test]
    fn user_config_is_pointed_at_the_cluster() {
        let mut doc = synop_apply::parse_yaml(CONFIG_KEY, USER_CONFIG).unwrap();
        configure_config_map(&mautrix_signal(), &mut doc).unwrap();
        assert_eq!(doc["homeserver"]["address"].as_str(), Some("http://hs.matrix.svc.cluster.local:8008"));
        assert_eq!(doc["homeserver"]["domain"].as_str(), Some("example.com"));
        assert_eq!(doc["appservice"]["address"].as_str(), Some("http://ms.matrix.svc.cluster.local:29328"));
        assert_eq!(doc["appservice"]["port"].as_i64(), Some(29328));
        assert_eq!(doc["signal"]["socket_path"].as_str(), Some(SIGNALD_SOCKET));
        assert_eq!(doc["bridge"]["permissions"]["example.com"].as_str(), Some("user"));
        assert_eq!(doc["logging"]["handlers"]["file"]["filename"].as_str(), Some(MAUTRIX_SIGNAL_LOG));
    }

    #[test]
    fn missing_sections_are_named() {
        let mut doc = synop_apply::parse_yaml(CONFIG_KEY, "homeserver: {}\n").unwrap();
        let err = configure_config_map(&mautrix_signal(), &mut doc).unwrap_err();
        assert_eq!(err.to_string(), "error parsing 'appservice' section");

        let mut doc = synop_apply::parse_yaml(CONFIG_KEY, &USER_CONFIG.replace("  handlers:\n    file:\n      filename: ./mautrix-signal.log\n", "  version: 1\n")).unwrap();
        let err = configure_config_map(&mautrix_signal(), &mut doc).unwrap_err();
        assert_eq!(err.to_string(), "error parsing 'logging/handlers' section");
    }

    #[test]
    fn pipeline_adds_openshift_steps_from_status() {
        use MautrixSignalStep::*;
        let mut ms = mautrix_signal();
        assert!(!pipeline(&ms).contains(&RoleBinding));
        ms.status_mut().is_openshift = true;
        let steps = pipeline(&ms);
        assert!(steps.contains(&ServiceAccount) && steps.contains(&RoleBinding));
        assert_eq!(steps.last(), Some(&SetRunning));
        assert_eq!(signald_name(&ms), "ms-signald");
    }
}
