//! Synop engine: runs convergence pipelines for one entity at a time and
//! turns their outcome into a retry instruction for the host runtime.
//!
//! Steps never keep state between runs; everything durable lives in the
//! store, so a pipeline can be re-run from scratch at any point.

#![forbid(unsafe_code)]

pub mod status;

use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::runtime::controller::Action;
use metrics::{counter, histogram};
use synop_core::{ObjectKey, Outcome, ReconcileError};
use tracing::{debug, info, warn};

pub use status::{commit_status, fail_and_halt, fail_and_retry, fetch_latest, mark_needs_reconcile, update_status, StatusCommit};

/// Delay used by hosts for runs that ended in an error.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Runtime knobs shared by all controllers, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Fixed delay before retrying when a referenced object is absent.
    pub prereq_retry: Duration,
    pub synapse_image: String,
    pub heisenbridge_image: String,
    pub mautrix_signal_image: String,
    pub signald_image: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            prereq_retry: Duration::from_secs(30),
            synapse_image: "matrixdotorg/synapse:v1.60.0".into(),
            heisenbridge_image: "hif1/heisenbridge:1.14".into(),
            mautrix_signal_image: "dock.mau.dev/mautrix/signal:v0.4.2".into(),
            signald_image: "docker.io/signald/signald:0.23.0".into(),
        }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `SYNOP_PREREQ_RETRY_SECS` and the
    /// `SYNOP_*_IMAGE` variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let prereq_retry = match get("SYNOP_PREREQ_RETRY_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    warn!(value = %raw, "SYNOP_PREREQ_RETRY_SECS is not a number of seconds; using default");
                    d.prereq_retry
                }
            },
            None => d.prereq_retry,
        };
        let image = |key: &str, default: String| get(key).filter(|s| !s.is_empty()).unwrap_or(default);
        Self {
            prereq_retry,
            synapse_image: image("SYNOP_SYNAPSE_IMAGE", d.synapse_image),
            heisenbridge_image: image("SYNOP_HEISENBRIDGE_IMAGE", d.heisenbridge_image),
            mautrix_signal_image: image("SYNOP_MAUTRIX_SIGNAL_IMAGE", d.mautrix_signal_image),
            signald_image: image("SYNOP_SIGNALD_IMAGE", d.signald_image),
        }
    }
}

/// One convergence step of an entity's pipeline.
#[async_trait]
pub trait Step<C: Sync>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &C, key: &ObjectKey) -> Result<Outcome, ReconcileError>;
}

/// Run `steps` in order, stopping at the first one that does not return
/// `Continue`. Returns `Continue` when every step did.
pub async fn run_pipeline<C, S>(steps: &[S], ctx: &C, key: &ObjectKey) -> Result<Outcome, ReconcileError>
where
    C: Sync,
    S: Step<C>,
{
    let started = Instant::now();
    let result = run_steps(steps, ctx, key).await;
    let took_ms = started.elapsed().as_secs_f64() * 1000.0;
    histogram!("pipeline_run_ms", took_ms);
    match &result {
        Ok(outcome) => debug!(object = %key, outcome = outcome.label(), took_ms, "pipeline finished"),
        Err(e) => warn!(object = %key, error = %e, class = ?e.class(), took_ms, "pipeline failed"),
    }
    result
}

async fn run_steps<C, S>(steps: &[S], ctx: &C, key: &ObjectKey) -> Result<Outcome, ReconcileError>
where
    C: Sync,
    S: Step<C>,
{
    for step in steps {
        let outcome = match step.run(ctx, key).await {
            Ok(o) => o,
            Err(e) => {
                counter!("pipeline_step_total", 1u64, "step" => step.name(), "outcome" => "error");
                warn!(object = %key, step = step.name(), error = %e, "step failed");
                return Err(e);
            }
        };
        counter!("pipeline_step_total", 1u64, "step" => step.name(), "outcome" => outcome.label());
        if !outcome.is_continue() {
            info!(object = %key, step = step.name(), outcome = outcome.label(), "pipeline stopped");
            return Ok(outcome);
        }
        debug!(object = %key, step = step.name(), "step converged");
    }
    Ok(Outcome::Continue)
}

/// Retry instruction handed to the host runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Wait for the next change to the entity.
    Done,
    RequeueNow,
    RequeueAfter(Duration),
    /// Retry, with the error recorded.
    RequeueWithError(String),
}

/// Map a pipeline result onto a [`Directive`]. `Halt` and a fully converged
/// pipeline both wait for the next change; errors are always retried.
pub fn evaluate(result: Result<Outcome, ReconcileError>) -> Directive {
    match result {
        Ok(Outcome::Continue) | Ok(Outcome::Halt) => Directive::Done,
        Ok(Outcome::Requeue) => Directive::RequeueNow,
        Ok(Outcome::RequeueAfter(d)) => Directive::RequeueAfter(d),
        Err(e) => Directive::RequeueWithError(e.to_string()),
    }
}

impl Directive {
    /// The `kube::runtime` controller action a host returns for this directive.
    pub fn into_action(self) -> Action {
        match self {
            Directive::Done => Action::await_change(),
            Directive::RequeueNow => Action::requeue(Duration::ZERO),
            Directive::RequeueAfter(d) => Action::requeue(d),
            Directive::RequeueWithError(_) => Action::requeue(ERROR_BACKOFF),
        }
    }
}

impl std::fmt::Display for Directive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Directive::Done => write!(f, "done"),
            Directive::RequeueNow => write!(f, "requeue"),
            Directive::RequeueAfter(d) => write!(f, "requeue after {}s", d.as_secs()),
            Directive::RequeueWithError(e) => write!(f, "requeue with error: {}", e),
        }
    }
}

/// Something that can run one pipeline pass for an entity.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile_once(&self, key: &ObjectKey) -> Directive;
}

/// Re-run passes while they ask for an immediate requeue, at most `max_runs`
/// times. Returns the last directive and the number of passes made.
pub async fn drive(reconciler: &dyn Reconcile, key: &ObjectKey, max_runs: usize) -> (Directive, usize) {
    let mut runs = 0;
    loop {
        let directive = reconciler.reconcile_once(key).await;
        runs += 1;
        if directive != Directive::RequeueNow || runs >= max_runs {
            return (directive, runs);
        }
    }
}
