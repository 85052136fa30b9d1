//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::client::CommandError;

/// Requeue delay after a failed pass.
pub const REQUEUE_ON_ERROR: Duration = Duration::from_secs(5);
/// Requeue delay while a rollout has not converged.
pub const REQUEUE_ON_REFRESH: Duration = Duration::from_secs(1);
/// Periodic resync for converged clusters.
pub const REQUEUE_RESYNC: Duration = Duration::from_secs(60);

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Remote store call failed for a named object
    #[error("{action} {kind} {name}: {source}")]
    Store {
        action: &'static str,
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },

    /// Write kept hitting stale versions
    #[error("{kind} {name}: gave up after {attempts} conflicting writes")]
    ConflictRetriesExhausted {
        kind: &'static str,
        name: String,
        attempts: u32,
    },

    /// A spec field name the resource does not know. This is a programming defect.
    #[error("{kind} has no spec field {field:?}")]
    InvalidSpecField { kind: &'static str, field: String },

    /// Missing required field in resource
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// Validation error in resource spec
    #[error("Validation error: {0}")]
    Validation(String),

    /// Referenced KeeperCluster does not exist
    #[error("KeeperCluster {0} not found")]
    KeeperNotFound(String),

    /// Management command failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Per-replica failures of one pass
    #[error("{}", ReplicaFailures(.0))]
    Replicas(Vec<ReplicaFailure>),

    /// Independent steps of one pass that failed
    #[error("{}", StepFailures(.0))]
    Steps(Vec<Error>),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Server configuration could not be rendered
    #[error("Configuration rendering error: {0}")]
    Render(#[from] serde_yaml::Error),
}

/// One replica's failure within a pass.
#[derive(Debug)]
pub struct ReplicaFailure {
    pub replica: String,
    pub error: Error,
}

struct ReplicaFailures<'a>(&'a [ReplicaFailure]);

impl fmt::Display for ReplicaFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} replica(s) failed:", self.0.len())?;
        for failure in self.0 {
            write!(f, " [replica {}: {}]", failure.replica, failure.error)?;
        }
        Ok(())
    }
}

struct StepFailures<'a>(&'a [Error]);

impl fmt::Display for StepFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} step(s) failed:", self.0.len())?;
        for error in self.0 {
            write!(f, " [{error}]")?;
        }
        Ok(())
    }
}

fn kube_is_retryable(e: &kube::Error) -> bool {
    // Retry on network errors, rate limiting, conflicts and server errors
    matches!(
        e,
        kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
    ) || matches!(e, kube::Error::Service(_) | kube::Error::HyperError(_))
}

/// Whether a store error is an optimistic-concurrency conflict.
///
/// Creating an object that already exists also answers 409, with reason
/// `AlreadyExists`; that is not a stale write and is not retried.
pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(api_err) if api_err.code == 409 && api_err.reason != "AlreadyExists")
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(e)) => e.code == 404,
            Error::Store {
                source: kube::Error::Api(e),
                ..
            } => e.code == 404,
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) | Error::Store { source: e, .. } => kube_is_retryable(e),
            Error::ConflictRetriesExhausted { .. } | Error::KeeperNotFound(_) => true,
            Error::Command(_) => true,
            Error::Replicas(failures) => failures.iter().any(|f| f.error.is_retryable()),
            Error::Steps(errors) => errors.iter().any(Error::is_retryable),
            Error::InvalidSpecField { .. }
            | Error::Validation(_)
            | Error::MissingField(_)
            | Error::Serialization(_)
            | Error::Render(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            REQUEUE_ON_ERROR
        } else {
            // Needs a spec change or a fix; the next watch event brings us back
            Duration::from_secs(3600)
        }
    }

    /// Kubernetes event reason for surfacing this error.
    pub fn event_reason(&self) -> &'static str {
        match self {
            Error::Store { action: "create", .. } => "FailedCreate",
            Error::Store { action: "delete", .. } => "FailedDelete",
            Error::Store { .. } | Error::ConflictRetriesExhausted { .. } => "FailedUpdate",
            _ => "ReconcileFailed",
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
