//! Capabilities an entity kind exposes to the generic reconcilers, so they
//! never need to know which concrete kind they are working on.

use kube::core::Resource;
use schemars::JsonSchema;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// User intent.
pub trait HasSpec {
    type Spec;
    fn spec(&self) -> &Self::Spec;
}

/// Engine-derived facts. `Status` equality is structural: two statuses are
/// the same exactly when every field compares equal.
pub trait HasStatus: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Status: PartialEq + Default + Clone + Serialize + DeserializeOwned + Send + Sync;

    fn status(&self) -> Option<&Self::Status>;
    fn status_mut(&mut self) -> &mut Self::Status;

    fn status_or_default(&self) -> Self::Status { self.status().cloned().unwrap_or_default() }
}

/// Lifecycle tag exposed on every entity status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Pending,
    Running,
    Failed,
}

pub trait Lifecycle {
    fn state(&self) -> LifecycleState;
    fn reason(&self) -> &str;
    fn set_state(&mut self, state: LifecycleState, reason: String);

    fn set_running(&mut self) { self.set_state(LifecycleState::Running, String::new()) }
    fn set_failed(&mut self, reason: impl Into<String>) where Self: Sized { self.set_state(LifecycleState::Failed, reason.into()) }
}

/// Statuses carrying the "needs reconciliation" flag raised by dependents.
pub trait NeedsReconcile {
    fn needs_reconcile(&self) -> bool;
    fn set_needs_reconcile(&mut self, value: bool);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_state_uses_upper_case_tags() {
        assert_eq!(serde_json::to_value(LifecycleState::Running).unwrap(), "RUNNING");
        assert_eq!(serde_json::from_value::<LifecycleState>("FAILED".into()).unwrap(), LifecycleState::Failed);
        assert_eq!(LifecycleState::default(), LifecycleState::Pending);
    }
}
