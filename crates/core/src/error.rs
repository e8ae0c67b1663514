//! Error taxonomy shared by the store, the reconcilers and the pipeline.

use thiserror::Error;

/// Failures reported by an [`crate::ObjectStore`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    /// The write was based on a stale resource version.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The kind is not served by the control plane (e.g. its CRD is not installed).
    #[error("kind not served: {0}")]
    KindNotServed(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("codec: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }

    /// Store failures are retried by re-running the step from a fresh read,
    /// except for payloads the store could not encode or decode.
    pub fn is_retryable(&self) -> bool { !matches!(self, StoreError::Codec(_)) }
}

/// Coarse classification driving how a failure is reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Store unreachable, conflicts: retry with the error recorded.
    Transient,
    /// A referenced object is absent and may appear later: retry after a fixed delay.
    MissingPrerequisite,
    /// Retrying cannot help: record the reason and halt.
    Misconfiguration,
}

/// Error returned by pipeline steps.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("document: {0}")]
    Document(String),
    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),
    #[error("misconfigured: {0}")]
    Misconfigured(String),
}

impl ReconcileError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Store(e) if e.is_retryable() => ErrorClass::Transient,
            ReconcileError::Store(_) => ErrorClass::Misconfiguration,
            ReconcileError::Document(_) | ReconcileError::Misconfigured(_) => ErrorClass::Misconfiguration,
            ReconcileError::MissingPrerequisite(_) => ErrorClass::MissingPrerequisite,
        }
    }
}
