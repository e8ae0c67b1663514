//! Synop custom resources (`synapse.opdev.io/v1alpha1`).
//!
//! Each kind splits into a user-owned `spec` and an engine-owned `status`.
//! Status types derive `PartialEq`: the status writer relies on structural
//! equality to decide whether a write is needed.

#![forbid(unsafe_code)]

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use synop_core::{naming::compute_namespace, HasSpec, HasStatus, Lifecycle, LifecycleState, NeedsReconcile};

pub const GROUP: &str = "synapse.opdev.io";

/// Reference to a ConfigMap, optionally in another namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConfigMapRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference from a bridge to the Synapse it attaches to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SynapseRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl SynapseRef {
    /// Namespace of the referenced Synapse, defaulting to the bridge's own.
    pub fn resolve_namespace(&self, bridge_ns: &str) -> String {
        compute_namespace(bridge_ns, self.namespace.as_deref())
    }
}

// ---- Synapse ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "synapse.opdev.io", version = "v1alpha1", kind = "Synapse", namespaced)]
#[kube(status = "SynapseStatus", shortname = "syn")]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct SynapseSpec {
    pub homeserver: SynapseHomeserver,
    /// Provision a PostgresCluster through the postgres operator.
    #[serde(default, rename = "createNewPostgreSQL")]
    pub create_new_postgresql: bool,
    #[serde(default)]
    pub is_openshift: bool,
}

/// Exactly one of `config_map` and `values` is expected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynapseHomeserver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<SynapseHomeserverValues>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynapseHomeserverValues {
    pub server_name: String,
    pub report_stats: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynapseStatus {
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub needs_reconcile: bool,
    #[serde(default)]
    pub homeserver_configuration: HomeserverConfiguration,
    #[serde(default)]
    pub database_connection_info: DatabaseConnectionInfo,
    #[serde(default)]
    pub bridges: BridgesStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HomeserverConfiguration {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub report_stats: bool,
}

/// Connection facts derived from the database Secret. The password is kept
/// base64-encoded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConnectionInfo {
    /// `host:port`
    #[serde(default, rename = "connectionURL")]
    pub connection_url: String,
    #[serde(default)]
    pub database_name: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BridgesStatus {
    #[serde(default)]
    pub heisenbridge: BridgeLink,
    #[serde(default, rename = "mautrixsignal")]
    pub mautrix_signal: BridgeLink,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeLink {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

// ---- Heisenbridge ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "synapse.opdev.io", version = "v1alpha1", kind = "Heisenbridge", namespaced)]
#[kube(status = "HeisenbridgeStatus")]
#[serde(rename_all = "camelCase")]
pub struct HeisenbridgeSpec {
    pub synapse: SynapseRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapRef>,
    /// Number of `-v` flags passed to heisenbridge.
    #[serde(default)]
    pub verbose_level: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeisenbridgeStatus {
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default)]
    pub reason: String,
}

// ---- MautrixSignal ----

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "synapse.opdev.io", version = "v1alpha1", kind = "MautrixSignal", namespaced)]
#[kube(status = "MautrixSignalStatus")]
#[serde(rename_all = "camelCase")]
pub struct MautrixSignalSpec {
    pub synapse: SynapseRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MautrixSignalStatus {
    #[serde(default)]
    pub state: LifecycleState,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub is_openshift: bool,
    #[serde(default)]
    pub synapse: SynapseFacts,
}

/// Facts copied from the Synapse a bridge is attached to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynapseFacts {
    #[serde(default)]
    pub server_name: String,
}

// ---- capabilities ----

macro_rules! entity_capabilities {
    ($kind:ty, $spec:ty, $status:ty) => {
        impl HasSpec for $kind {
            type Spec = $spec;
            fn spec(&self) -> &$spec { &self.spec }
        }

        impl HasStatus for $kind {
            type Status = $status;
            fn status(&self) -> Option<&$status> { self.status.as_ref() }
            fn status_mut(&mut self) -> &mut $status { self.status.get_or_insert_with(Default::default) }
        }

        impl Lifecycle for $status {
            fn state(&self) -> LifecycleState { self.state }
            fn reason(&self) -> &str { &self.reason }
            fn set_state(&mut self, state: LifecycleState, reason: String) {
                self.state = state;
                self.reason = reason;
            }
        }
    };
}

entity_capabilities!(Synapse, SynapseSpec, SynapseStatus);
entity_capabilities!(Heisenbridge, HeisenbridgeSpec, HeisenbridgeStatus);
entity_capabilities!(MautrixSignal, MautrixSignalSpec, MautrixSignalStatus);

impl NeedsReconcile for SynapseStatus {
    fn needs_reconcile(&self) -> bool { self.needs_reconcile }
    fn set_needs_reconcile(&mut self, value: bool) { self.needs_reconcile = value; }
}

/// Bridges reference a Synapse through `spec.synapse`.
pub trait Bridge: HasStatus {
    fn synapse_ref(&self) -> &SynapseRef;

    /// The slot of a Synapse status recording bridges of this kind.
    fn link<'a>(&self, bridges: &'a BridgesStatus) -> &'a BridgeLink;
}

impl Bridge for Heisenbridge {
    fn synapse_ref(&self) -> &SynapseRef { &self.spec().synapse }
    fn link<'a>(&self, bridges: &'a BridgesStatus) -> &'a BridgeLink { &bridges.heisenbridge }
}

impl Bridge for MautrixSignal {
    fn synapse_ref(&self) -> &SynapseRef { &self.spec().synapse }
    fn link<'a>(&self, bridges: &'a BridgesStatus) -> &'a BridgeLink { &bridges.mautrix_signal }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn synapse_spec_uses_wire_names() {
        let s: Synapse = serde_json::from_value(serde_json::json!({
            "apiVersion": "synapse.opdev.io/v1alpha1",
            "kind": "Synapse",
            "metadata": { "name": "hs", "namespace": "matrix" },
            "spec": {
                "homeserver": { "values": { "serverName": "example.com", "reportStats": true } },
                "createNewPostgreSQL": true
            }
        }))
        .unwrap();
        assert!(s.spec.create_new_postgresql);
        assert!(!s.spec.is_openshift);
        assert_eq!(s.spec.homeserver.values.as_ref().unwrap().server_name, "example.com");
        assert!(s.status.is_none());
    }

    #[test]
    fn status_capabilities_default_and_mutate() {
        let mut s = Synapse::new("hs", SynapseSpec::default());
        assert_eq!(s.status_or_default(), SynapseStatus::default());
        s.status_mut().set_failed("boom");
        assert_eq!(s.status().unwrap().state(), LifecycleState::Failed);
        assert_eq!(s.status().unwrap().reason(), "boom");
        s.status_mut().set_needs_reconcile(true);
        s.status_mut().set_running();
        let st = s.status().unwrap();
        assert_eq!((st.state, st.reason.as_str(), st.needs_reconcile), (LifecycleState::Running, "", true));

        let wire = serde_json::to_value(st).unwrap();
        assert_eq!(wire["databaseConnectionInfo"]["connectionURL"], "");
        assert!(wire["bridges"].get("mautrixsignal").is_some());
    }

    #[test]
    fn crds_are_generated() {
        assert_eq!(Synapse::crd().spec.names.kind, "Synapse");
        assert_eq!(MautrixSignal::crd().spec.group, GROUP);
        assert_eq!(Heisenbridge::crd().spec.names.plural, "heisenbridges");
    }
}
