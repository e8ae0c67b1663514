//! The Synapse pipeline: homeserver configuration, optional managed
//! PostgreSQL, bridge registration and the homeserver workload.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde_json::json;
use serde_yaml::{Mapping, Value as Yaml};
use synop_api::{
    BridgesStatus, DatabaseConnectionInfo, Heisenbridge, HomeserverConfiguration, MautrixSignal, Synapse,
    SynapseHomeserverValues,
};
use synop_apply::{copy_config_map, ensure, ensure_dynamic, load_yaml_artifact, mutate_artifact, seed_config_map, DocumentError};
use synop_core::{
    from_dynamic,
    naming::{child_name, compute_namespace},
    HasStatus, Lifecycle, NeedsReconcile, ObjectKey, Outcome, ReconcileError, StoreError,
};
use synop_engine::{commit_status, fail_and_halt, fail_and_retry, fetch_latest, run_pipeline, Step};
use tracing::{debug, info};

use crate::bridge::find_bridge;
use crate::children::{self, labels, Labels};
use crate::templates::{homeserver_yaml, SYNAPSE_PORT};
use crate::{after_commit, missing_config_map_reason, name_of, namespace_of, settle_mutation, Context};

pub const HOMESERVER_KEY: &str = "homeserver.yaml";
pub const HEISENBRIDGE_REGISTRATION: &str = "/data-heisenbridge/heisenbridge.yaml";
pub const MAUTRIX_SIGNAL_REGISTRATION: &str = "/data-mautrixsignal/registration.yaml";
pub const POSTGRES_OPERATOR_MISSING: &str = "Cannot create PostgreSQL instance for synapse. Postgres-operator is not installed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynapseStep {
    RejectHomeserverSource,
    ParseInputConfigMap,
    CopyInputConfigMap,
    SetHomeserverConfiguration,
    ReconcileConfigMap,
    UpdateBridgesStatus,
    RequirePostgresOperator,
    ReconcilePostgresConfigMap,
    ReconcilePostgresCluster,
    UpdateStatusWithPostgresInfo,
    ConfigureDatabase,
    RegisterHeisenbridge,
    RegisterMautrixSignal,
    ServiceAccount,
    RoleBinding,
    Service,
    PersistentVolumeClaim,
    Deployment,
    SetRunning,
}

/// Steps for the current spec and status of `s`.
pub fn pipeline(s: &Synapse) -> Vec<SynapseStep> {
    use SynapseStep::*;

    let hs = &s.spec.homeserver;
    let mut steps = match (&hs.config_map, &hs.values) {
        (Some(_), None) => vec![ParseInputConfigMap, CopyInputConfigMap],
        (None, Some(_)) => vec![SetHomeserverConfiguration, ReconcileConfigMap],
        _ => return vec![RejectHomeserverSource],
    };
    steps.push(UpdateBridgesStatus);
    if s.spec.create_new_postgresql {
        steps.extend([RequirePostgresOperator, ReconcilePostgresConfigMap, ReconcilePostgresCluster, UpdateStatusWithPostgresInfo, ConfigureDatabase]);
    }
    let status = s.status_or_default();
    if status.bridges.heisenbridge.enabled {
        steps.push(RegisterHeisenbridge);
    }
    if status.bridges.mautrix_signal.enabled {
        steps.push(RegisterMautrixSignal);
    }
    if s.spec.is_openshift {
        steps.extend([ServiceAccount, RoleBinding]);
    }
    steps.extend([Service, PersistentVolumeClaim, Deployment, SetRunning]);
    steps
}

/// One pass over the Synapse at `key`.
pub async fn reconcile(ctx: &Context, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
    let Some(s) = fetch_latest::<Synapse>(ctx.store(), key).await? else {
        debug!(object = %key, "synapse gone");
        return Ok(Outcome::Halt);
    };
    run_pipeline(&pipeline(&s), ctx, key).await
}

#[async_trait]
impl Step<Context> for SynapseStep {
    fn name(&self) -> &'static str {
        match self {
            SynapseStep::RejectHomeserverSource => "reject_homeserver_source",
            SynapseStep::ParseInputConfigMap => "parse_input_config_map",
            SynapseStep::CopyInputConfigMap => "copy_input_config_map",
            SynapseStep::SetHomeserverConfiguration => "set_status_homeserver_configuration",
            SynapseStep::ReconcileConfigMap => "reconcile_config_map",
            SynapseStep::UpdateBridgesStatus => "update_status_bridges",
            SynapseStep::RequirePostgresOperator => "require_postgres_operator",
            SynapseStep::ReconcilePostgresConfigMap => "reconcile_postgres_config_map",
            SynapseStep::ReconcilePostgresCluster => "reconcile_postgres_cluster",
            SynapseStep::UpdateStatusWithPostgresInfo => "update_status_with_postgres_infos",
            SynapseStep::ConfigureDatabase => "update_config_map_for_postgres",
            SynapseStep::RegisterHeisenbridge => "update_config_map_for_heisenbridge",
            SynapseStep::RegisterMautrixSignal => "update_config_map_for_mautrix_signal",
            SynapseStep::ServiceAccount => "reconcile_service_account",
            SynapseStep::RoleBinding => "reconcile_role_binding",
            SynapseStep::Service => "reconcile_service",
            SynapseStep::PersistentVolumeClaim => "reconcile_pvc",
            SynapseStep::Deployment => "reconcile_deployment",
            SynapseStep::SetRunning => "set_status_running",
        }
    }

    async fn run(&self, ctx: &Context, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let Some(s) = fetch_latest::<Synapse>(ctx.store(), key).await? else {
            return Ok(Outcome::Halt);
        };
        let s = &s;
        match self {
            SynapseStep::RejectHomeserverSource => reject_homeserver_source(ctx, s).await,
            SynapseStep::ParseInputConfigMap => parse_input_config_map(ctx, s).await,
            SynapseStep::CopyInputConfigMap => copy_input_config_map(ctx, s).await,
            SynapseStep::SetHomeserverConfiguration => set_homeserver_configuration(ctx, s).await,
            SynapseStep::ReconcileConfigMap => reconcile_config_map(ctx, s).await,
            SynapseStep::UpdateBridgesStatus => update_bridges_status(ctx, s).await,
            SynapseStep::RequirePostgresOperator => require_postgres_operator(ctx, s).await,
            SynapseStep::ReconcilePostgresConfigMap => {
                let meta = children::child_meta(s, &postgres_name(s), &synapse_labels(s))?;
                ensure(ctx.store(), &children::config_map(meta, "init.sql", children::POSTGRES_INIT_SQL.to_string())).await?;
                Ok(Outcome::Continue)
            }
            SynapseStep::ReconcilePostgresCluster => {
                let meta = children::child_meta(s, &postgres_name(s), &synapse_labels(s))?;
                ensure_dynamic(ctx.store(), &children::postgres_cluster_resource(), &children::postgres_cluster(meta)).await?;
                Ok(Outcome::Continue)
            }
            SynapseStep::UpdateStatusWithPostgresInfo => update_status_with_postgres_info(ctx, s).await,
            SynapseStep::ConfigureDatabase => {
                let result = mutate_artifact(ctx.store(), &config_map_key(s), HOMESERVER_KEY, s, database_section).await;
                settle_mutation(ctx, s, result, "cannot configure database in homeserver.yaml: ").await
            }
            SynapseStep::RegisterHeisenbridge => register_app_service(ctx, s, HEISENBRIDGE_REGISTRATION).await,
            SynapseStep::RegisterMautrixSignal => register_app_service(ctx, s, MAUTRIX_SIGNAL_REGISTRATION).await,
            SynapseStep::ServiceAccount => {
                let meta = children::child_meta(s, &name_of(s), &synapse_labels(s))?;
                ensure(ctx.store(), &children::service_account(meta)).await?;
                Ok(Outcome::Continue)
            }
            SynapseStep::RoleBinding => {
                let meta = children::child_meta(s, &name_of(s), &synapse_labels(s))?;
                ensure(ctx.store(), &children::scc_role_binding(meta)?).await?;
                Ok(Outcome::Continue)
            }
            SynapseStep::Service => {
                let l = synapse_labels(s);
                let meta = children::child_meta(s, &name_of(s), &l)?;
                ensure(ctx.store(), &children::service(meta, &l, "synapse-unsecure", SYNAPSE_PORT)?).await?;
                Ok(Outcome::Continue)
            }
            SynapseStep::PersistentVolumeClaim => {
                let meta = children::child_meta(s, &name_of(s), &synapse_labels(s))?;
                ensure(ctx.store(), &children::persistent_volume_claim(meta)?).await?;
                Ok(Outcome::Continue)
            }
            SynapseStep::Deployment => {
                ensure(ctx.store(), &deployment(ctx, s)?).await?;
                Ok(Outcome::Continue)
            }
            SynapseStep::SetRunning => {
                let mut next = s.clone();
                let status = next.status_mut();
                status.set_needs_reconcile(false);
                status.set_running();
                Ok(after_commit(commit_status(ctx.store(), &next).await?))
            }
        }
    }
}

pub fn synapse_labels(s: &Synapse) -> Labels {
    labels("synapse", &name_of(s))
}

/// Name shared by the PostgresCluster and its init ConfigMap.
pub fn postgres_name(s: &Synapse) -> String {
    child_name(&name_of(s), "pgsql")
}

/// Secret written by the postgres operator for the `synapse` user.
pub fn postgres_secret_name(s: &Synapse) -> String {
    child_name(&postgres_name(s), "pguser-synapse")
}

fn config_map_key(s: &Synapse) -> ObjectKey {
    ObjectKey::of::<ConfigMap>(Some(&namespace_of(s)), &name_of(s))
}

async fn reject_homeserver_source(ctx: &Context, s: &Synapse) -> Result<Outcome, ReconcileError> {
    let reason = if s.spec.homeserver.config_map.is_some() {
        "spec.homeserver must set only one of configMap and values"
    } else {
        "spec.homeserver must set one of configMap and values"
    };
    fail_and_halt(ctx.store(), s, reason).await
}

/// Input ConfigMap of a Synapse configured from a user ConfigMap: its key and
/// resolved namespace.
fn input_config_map(s: &Synapse) -> Option<(ObjectKey, String)> {
    let r = s.spec.homeserver.config_map.as_ref()?;
    let ns = compute_namespace(&namespace_of(s), r.namespace.as_deref());
    Some((ObjectKey::of::<ConfigMap>(Some(&ns), &r.name), ns))
}

/// `server_name` and `report_stats` of a user-provided homeserver.yaml.
pub fn homeserver_facts(doc: &Mapping) -> Result<HomeserverConfiguration, String> {
    let server_name = doc
        .get("server_name")
        .ok_or("missing server_name key in homeserver.yaml")?
        .as_str()
        .ok_or("error converting server_name to string")?;
    let report_stats = doc
        .get("report_stats")
        .ok_or("missing report_stats key in homeserver.yaml")?
        .as_bool()
        .ok_or("error converting report_stats to bool")?;
    Ok(HomeserverConfiguration { server_name: server_name.to_string(), report_stats })
}

async fn parse_input_config_map(ctx: &Context, s: &Synapse) -> Result<Outcome, ReconcileError> {
    let Some((key, ns)) = input_config_map(s) else {
        return Ok(Outcome::Continue);
    };
    let Some(obj) = ctx.store().get(&key).await? else {
        return fail_and_retry(ctx.store(), s, &missing_config_map_reason(&key.name, &ns), ctx.config.prereq_retry).await;
    };
    let facts = load_yaml_artifact(&obj, HOMESERVER_KEY).map_err(|e| e.to_string()).and_then(|doc| homeserver_facts(&doc));
    let facts = match facts {
        Ok(f) => f,
        Err(reason) => return fail_and_halt(ctx.store(), s, &reason).await,
    };
    info!(object = %key, server_name = %facts.server_name, report_stats = facts.report_stats, "loaded homeserver.yaml");
    let mut next = s.clone();
    next.status_mut().homeserver_configuration = facts;
    Ok(after_commit(commit_status(ctx.store(), &next).await?))
}

/// Copy the user's ConfigMap, then keep the copy's homeserver.yaml in step
/// with later edits to the input.
async fn copy_input_config_map(ctx: &Context, s: &Synapse) -> Result<Outcome, ReconcileError> {
    let Some((key, ns)) = input_config_map(s) else {
        return Ok(Outcome::Continue);
    };
    let meta = children::child_meta(s, &name_of(s), &synapse_labels(s))?;
    let missing = || missing_config_map_reason(&key.name, &ns);
    match copy_config_map(ctx.store(), &key, meta).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => return fail_and_retry(ctx.store(), s, &missing(), ctx.config.prereq_retry).await,
        Err(e) => return Err(e.into()),
    }
    let Some(source) = ctx.store().get(&key).await? else {
        return fail_and_retry(ctx.store(), s, &missing(), ctx.config.prereq_retry).await;
    };
    let result = match load_yaml_artifact(&source, HOMESERVER_KEY) {
        Ok(input) => {
            mutate_artifact(ctx.store(), &config_map_key(s), HOMESERVER_KEY, s, |s, hs| {
                rebase_on_input(s, &input, hs);
                Ok(())
            })
            .await
        }
        Err(e) => Err(e.into()),
    };
    settle_mutation(ctx, s, result, "cannot copy homeserver.yaml: ").await
}

/// Replace the generated homeserver.yaml with the user's `input`, keeping
/// what this pipeline writes on top of it: the managed `database` section
/// and the bridge registrations.
pub fn rebase_on_input(s: &Synapse, input: &Mapping, homeserver: &mut Mapping) {
    let mut next = input.clone();
    if s.spec.create_new_postgresql {
        if let Some(db) = homeserver.get("database") {
            next.insert("database".into(), db.clone());
        }
    }
    if let Some(files) = homeserver.get("app_service_config_files").and_then(Yaml::as_sequence) {
        for path in [HEISENBRIDGE_REGISTRATION, MAUTRIX_SIGNAL_REGISTRATION] {
            if files.contains(&Yaml::from(path)) {
                add_app_service(&mut next, path);
            }
        }
    }
    *homeserver = next;
}

async fn set_homeserver_configuration(ctx: &Context, s: &Synapse) -> Result<Outcome, ReconcileError> {
    let Some(values) = s.spec.homeserver.values.as_ref() else {
        return Ok(Outcome::Continue);
    };
    let mut next = s.clone();
    next.status_mut().homeserver_configuration = HomeserverConfiguration { server_name: values.server_name.clone(), report_stats: values.report_stats };
    Ok(after_commit(commit_status(ctx.store(), &next).await?))
}

/// Seed homeserver.yaml from the template, then re-assert the keys the
/// values own so a changed spec reaches the document.
async fn reconcile_config_map(ctx: &Context, s: &Synapse) -> Result<Outcome, ReconcileError> {
    let Some(values) = s.spec.homeserver.values.as_ref() else {
        return Ok(Outcome::Continue);
    };
    let meta = children::child_meta(s, &name_of(s), &synapse_labels(s))?;
    let cm = children::config_map(meta, HOMESERVER_KEY, homeserver_yaml(&values.server_name, values.report_stats)?);
    seed_config_map(ctx.store(), &cm).await?;
    let result = mutate_artifact(ctx.store(), &config_map_key(s), HOMESERVER_KEY, values, homeserver_values).await;
    settle_mutation(ctx, s, result, "cannot update homeserver.yaml: ").await
}

/// Write `server_name` and `report_stats` from the spec values.
pub fn homeserver_values(values: &SynapseHomeserverValues, homeserver: &mut Mapping) -> Result<(), DocumentError> {
    homeserver.insert("server_name".into(), values.server_name.as_str().into());
    homeserver.insert("report_stats".into(), values.report_stats.into());
    Ok(())
}

/// Recompute which bridges point at this Synapse. Flags of bridges that
/// disappeared are cleared.
async fn update_bridges_status(ctx: &Context, s: &Synapse) -> Result<Outcome, ReconcileError> {
    let (name, ns) = (name_of(s), namespace_of(s));
    let bridges = BridgesStatus {
        heisenbridge: find_bridge::<Heisenbridge>(ctx.store(), &name, &ns).await?,
        mautrix_signal: find_bridge::<MautrixSignal>(ctx.store(), &name, &ns).await?,
    };
    let mut next = s.clone();
    next.status_mut().bridges = bridges;
    Ok(after_commit(commit_status(ctx.store(), &next).await?))
}

async fn require_postgres_operator(ctx: &Context, s: &Synapse) -> Result<Outcome, ReconcileError> {
    if ctx.store().is_served(&children::postgres_cluster_resource()).await? {
        return Ok(Outcome::Continue);
    }
    fail_and_halt(ctx.store(), s, POSTGRES_OPERATOR_MISSING).await
}

/// Connection facts from the operator-generated Secret. The password is
/// stored base64-encoded.
pub fn database_info(secret: &Secret) -> Result<DatabaseConnectionInfo, ReconcileError> {
    let data = secret.data.clone().unwrap_or_default();
    let field = |k: &str| {
        data.get(k)
            .map(|v| String::from_utf8_lossy(&v.0).into_owned())
            .ok_or_else(|| ReconcileError::MissingPrerequisite(format!("missing {} in PostgreSQL Secret", k)))
    };
    let host = field("host")?;
    let port = field("port")?;
    field("dbname")?;
    let user = field("user")?;
    let password = field("password")?;
    Ok(DatabaseConnectionInfo {
        connection_url: format!("{}:{}", host, port),
        database_name: "synapse".to_string(),
        user,
        password: STANDARD.encode(password),
        state: "READY".to_string(),
    })
}

async fn update_status_with_postgres_info(ctx: &Context, s: &Synapse) -> Result<Outcome, ReconcileError> {
    let key = ObjectKey::of::<Secret>(Some(&namespace_of(s)), &postgres_secret_name(s));
    let Some(obj) = ctx.store().get(&key).await? else {
        info!(object = %key, "waiting for the postgres operator to publish credentials");
        return Ok(Outcome::RequeueAfter(ctx.config.prereq_retry));
    };
    let secret: Secret = from_dynamic(&obj)?;
    let mut next = s.clone();
    next.status_mut().database_connection_info = database_info(&secret)?;
    Ok(after_commit(commit_status(ctx.store(), &next).await?))
}

fn invalid(path: &str, expected: &'static str) -> DocumentError {
    DocumentError::InvalidValue { path: path.to_string(), expected }
}

/// Point the `database` section of homeserver.yaml at the managed cluster.
pub fn database_section(s: &Synapse, homeserver: &mut Mapping) -> Result<(), DocumentError> {
    let info = s.status_or_default().database_connection_info;
    if info.user.is_empty() {
        return Err(invalid("status.databaseConnectionInfo.user", "a database user"));
    }
    if info.database_name.is_empty() {
        return Err(invalid("status.databaseConnectionInfo.databaseName", "a database name"));
    }
    let password = STANDARD
        .decode(info.password.as_bytes())
        .ok()
        .and_then(|raw| String::from_utf8(raw).ok())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| invalid("status.databaseConnectionInfo.password", "a base64-encoded password"))?;
    let (host, port) = info
        .connection_url
        .split_once(':')
        .ok_or_else(|| invalid("status.databaseConnectionInfo.connectionURL", "host:port"))?;
    let port: i64 = port.parse().map_err(|_| invalid("status.databaseConnectionInfo.connectionURL", "a numeric port"))?;

    let section = serde_yaml::to_value(json!({
        "name": "psycopg2",
        "args": {
            "user": info.user,
            "password": password,
            "database": info.database_name,
            "host": host,
            "port": port,
            "cp_min": 5,
            "cp_max": 10,
        }
    }))
    .map_err(DocumentError::Serialize)?;
    homeserver.insert("database".into(), section);
    Ok(())
}

/// Add `path` to `app_service_config_files` unless already listed. A missing
/// or malformed list is replaced.
pub fn add_app_service(homeserver: &mut Mapping, path: &str) {
    let entry = Yaml::from(path);
    match homeserver.get_mut("app_service_config_files").and_then(Yaml::as_sequence_mut) {
        Some(files) if files.contains(&entry) => {}
        Some(files) => files.push(entry),
        None => {
            homeserver.insert("app_service_config_files".into(), Yaml::Sequence(vec![entry]));
        }
    }
}

async fn register_app_service(ctx: &Context, s: &Synapse, path: &'static str) -> Result<Outcome, ReconcileError> {
    let result = mutate_artifact(ctx.store(), &config_map_key(s), HOMESERVER_KEY, s, |_, hs| {
        add_app_service(hs, path);
        Ok(())
    })
    .await;
    settle_mutation(ctx, s, result, "cannot register app service in homeserver.yaml: ").await
}

fn deployment(ctx: &Context, s: &Synapse) -> Result<k8s_openapi::api::apps::v1::Deployment, ReconcileError> {
    let name = name_of(s);
    let l = synapse_labels(s);
    let bridges = s.status_or_default().bridges;

    let mut volumes = vec![children::config_map_volume("homeserver", &name), children::pvc_volume("data-pv", &name)];
    let mut mounts = vec![children::mount("homeserver", "/data-homeserver"), children::mount("data-pv", "/data")];
    if bridges.heisenbridge.enabled {
        volumes.push(children::config_map_volume("data-heisenbridge", &bridges.heisenbridge.name));
        mounts.push(children::mount("data-heisenbridge", "/data-heisenbridge"));
    }
    if bridges.mautrix_signal.enabled {
        volumes.push(children::pvc_volume("data-mautrixsignal", &bridges.mautrix_signal.name));
        mounts.push(children::mount("data-mautrixsignal", "/data-mautrixsignal"));
    }

    let mut pod = json!({
        "containers": [{
            "name": "synapse",
            "image": ctx.config.synapse_image,
            "env": [{ "name": "SYNAPSE_CONFIG_PATH", "value": format!("/data-homeserver/{}", HOMESERVER_KEY) }],
            "ports": [{ "containerPort": SYNAPSE_PORT }],
            "volumeMounts": mounts,
        }],
        "volumes": volumes,
    });
    if s.spec.is_openshift {
        pod["serviceAccountName"] = json!(name);
    }
    children::deployment(children::child_meta(s, &name, &l)?, &l, pod)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use synop_api::{BridgeLink, ConfigMapRef, SynapseHomeserver, SynapseSpec, SynapseStatus};

    fn synapse(spec: SynapseSpec) -> Synapse {
        let mut s = Synapse::new("hs", spec);
        s.metadata.namespace = Some("matrix".into());
        s
    }

    fn values() -> SynapseHomeserver {
        SynapseHomeserver { values: Some(SynapseHomeserverValues { server_name: "example.com".into(), report_stats: false }), config_map: None }
    }

    #[test]
    fn pipeline_follows_spec_and_status() {
        use SynapseStep::*;
        let mut s = synapse(SynapseSpec { homeserver: values(), ..Default::default() });
        assert_eq!(
            pipeline(&s),
            vec![SetHomeserverConfiguration, ReconcileConfigMap, UpdateBridgesStatus, Service, PersistentVolumeClaim, Deployment, SetRunning]
        );

        s.spec.create_new_postgresql = true;
        s.spec.is_openshift = true;
        s.status = Some(SynapseStatus::default());
        s.status_mut().bridges.mautrix_signal = BridgeLink { enabled: true, name: "ms".into(), namespace: "matrix".into() };
        let steps = pipeline(&s);
        assert!(steps.contains(&RequirePostgresOperator) && steps.contains(&ConfigureDatabase));
        assert!(steps.contains(&RegisterMautrixSignal) && !steps.contains(&RegisterHeisenbridge));
        assert!(steps.contains(&RoleBinding));

        s.spec.homeserver.config_map = Some(ConfigMapRef { name: "input".into(), namespace: None });
        assert_eq!(pipeline(&s), vec![RejectHomeserverSource]);
        s.spec.homeserver = SynapseHomeserver::default();
        assert_eq!(pipeline(&s), vec![RejectHomeserverSource]);
    }

    #[test]
    fn homeserver_facts_require_typed_keys() {
        let doc = |raw: &str| synop_apply::parse_yaml(HOMESERVER_KEY, raw).unwrap();
        let facts = homeserver_facts(&doc("server_name: example.com\nreport_stats: true\n")).unwrap();
        assert_eq!((facts.server_name.as_str(), facts.report_stats), ("example.com", true));
        assert_eq!(homeserver_facts(&doc("report_stats: true\n")).unwrap_err(), "missing server_name key in homeserver.yaml");
        assert_eq!(homeserver_facts(&doc("server_name: 12\nreport_stats: true\n")).unwrap_err(), "error converting server_name to string");
        assert_eq!(homeserver_facts(&doc("server_name: a\nreport_stats: 'yes'\n")).unwrap_err(), "error converting report_stats to bool");
    }

    #[test]
    fn secret_becomes_connection_info() {
        let mut secret = Secret::default();
        let data = [("host", "pg.matrix.svc"), ("port", "5432"), ("dbname", "synapse"), ("user", "synapse"), ("password", "s3cret")];
        secret.data = Some(data.iter().map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec()))).collect());
        let info = database_info(&secret).unwrap();
        assert_eq!(info.connection_url, "pg.matrix.svc:5432");
        assert_eq!(info.password, STANDARD.encode("s3cret"));
        assert_eq!(info.state, "READY");

        secret.data.as_mut().unwrap().remove("user");
        let err = database_info(&secret).unwrap_err();
        assert!(err.to_string().contains("missing user in PostgreSQL Secret"));
    }

    #[test]
    fn database_section_is_derived_from_status() {
        let mut s = synapse(SynapseSpec::default());
        s.status_mut().database_connection_info = DatabaseConnectionInfo {
            connection_url: "pg:5432".into(),
            database_name: "synapse".into(),
            user: "synapse".into(),
            password: STANDARD.encode("s3cret"),
            state: "READY".into(),
        };
        let mut hs = synop_apply::parse_yaml(HOMESERVER_KEY, "database:\n  name: sqlite3\n").unwrap();
        database_section(&s, &mut hs).unwrap();
        let db = &hs["database"];
        assert_eq!(db["name"].as_str(), Some("psycopg2"));
        assert_eq!(db["args"]["password"].as_str(), Some("s3cret"));
        assert_eq!(db["args"]["port"].as_i64(), Some(5432));
        assert_eq!((db["args"]["cp_min"].as_i64(), db["args"]["cp_max"].as_i64()), (Some(5), Some(10)));

        s.status_mut().database_connection_info.connection_url = "pg".into();
        assert!(database_section(&s, &mut hs).is_err());
    }

    #[test]
    fn values_own_server_name_and_report_stats() {
        let mut hs = synop_apply::parse_yaml(HOMESERVER_KEY, &homeserver_yaml("example.com", false).unwrap()).unwrap();
        let values = SynapseHomeserverValues { server_name: "new.example.org".into(), report_stats: true };
        homeserver_values(&values, &mut hs).unwrap();
        assert_eq!(hs["server_name"].as_str(), Some("new.example.org"));
        assert_eq!(hs["report_stats"].as_bool(), Some(true));
        assert_eq!(hs["media_store_path"].as_str(), Some("/data/media_store"));
    }

    #[test]
    fn rebase_keeps_managed_database_and_registrations() {
        let mut s = synapse(SynapseSpec { create_new_postgresql: true, ..Default::default() });
        let stored = "server_name: old.org\ndatabase:\n  name: psycopg2\napp_service_config_files:\n- /user/extra.yaml\n- /data-heisenbridge/heisenbridge.yaml\n";
        let input = synop_apply::parse_yaml(HOMESERVER_KEY, "server_name: new.org\ndatabase:\n  name: sqlite3\n").unwrap();

        let mut hs = synop_apply::parse_yaml(HOMESERVER_KEY, stored).unwrap();
        rebase_on_input(&s, &input, &mut hs);
        assert_eq!(hs["server_name"].as_str(), Some("new.org"));
        assert_eq!(hs["database"]["name"].as_str(), Some("psycopg2"));
        let files = hs["app_service_config_files"].as_sequence().unwrap();
        assert_eq!(files, &vec![Yaml::from(HEISENBRIDGE_REGISTRATION)]);

        s.spec.create_new_postgresql = false;
        let mut hs = synop_apply::parse_yaml(HOMESERVER_KEY, stored).unwrap();
        rebase_on_input(&s, &input, &mut hs);
        assert_eq!(hs["database"]["name"].as_str(), Some("sqlite3"));
    }

    #[test]
    fn app_service_registration_is_idempotent() {
        let mut hs = synop_apply::parse_yaml(HOMESERVER_KEY, "app_service_config_files: not-a-list\n").unwrap();
        add_app_service(&mut hs, HEISENBRIDGE_REGISTRATION);
        add_app_service(&mut hs, MAUTRIX_SIGNAL_REGISTRATION);
        add_app_service(&mut hs, HEISENBRIDGE_REGISTRATION);
        let files = hs["app_service_config_files"].as_sequence().unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].as_str(), Some(HEISENBRIDGE_REGISTRATION));
    }
}
