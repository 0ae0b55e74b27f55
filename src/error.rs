use std::io::Error as IoError;
use std::time::Duration;

use indicatif::style::TemplateError;

use fluvio_command::CommandError;
use fluvio_helm::HelmError;

/// The types of errors that can occur while managing Cilium on a cluster
#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    /// An error occurred inside one of the feature controllers
    #[error("Feature operation failed")]
    Feature(#[from] FeatureError),

    /// An error occurred while tearing features down
    #[error("Teardown failed")]
    Teardown(#[from] TeardownError),

    /// An error surfaced directly by the cluster backend
    #[error("Backend request failed")]
    Backend(#[from] BackendError),
}

/// Errors surfaced by the cluster backend.
///
/// The taxonomy matters more than the payload: `is_retryable()` decides
/// whether the convergence waiter keeps polling, and `is_not_found()` lets
/// read and delete paths treat a missing object as ordinary state.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// The addressed object does not exist on the cluster
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// A failure that is expected to clear on its own, safe to poll through
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// The cluster rejected the request; retrying the same input cannot help
    #[error("Backend rejected request: {0}")]
    Rejected(String),

    /// An error with the helm client
    #[error("Helm client error")]
    Helm(#[from] HelmError),

    /// A subprocess invocation failed
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Input/output error
    #[error(transparent)]
    Io(#[from] IoError),

    /// The backend returned a payload that could not be parsed
    #[error("Malformed backend response")]
    Json(#[from] serde_json::Error),
}

impl BackendError {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the convergence waiter may poll through this error.
    ///
    /// Only `NotFound` and `Transient` qualify. Everything else is final and
    /// must stop a poll loop immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Transient(_))
    }
}

/// Errors from the per-feature controllers
#[derive(thiserror::Error, Debug)]
pub enum FeatureError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The feature was applied but did not report healthy within the wait
    /// window. The applied release is left in place.
    #[error("Feature did not converge within {elapsed:?}")]
    ConvergenceTimeout {
        elapsed: Duration,
        last: Option<Box<BackendError>>,
    },

    /// The operation was cancelled before it could finish
    #[error("Operation cancelled")]
    Cancelled,

    /// A delete's ordered teardown failed partway
    #[error(transparent)]
    Teardown(Box<TeardownError>),

    /// Missing a required config option
    #[error("Missing required config option {0}")]
    MissingRequiredConfig(String),

    /// A `--set`-style override that is not of the form `key=value`
    #[error("Invalid helm override {0:?}, expected key=value")]
    InvalidOverride(String),

    #[error("Progress rendering error")]
    Progress(#[from] TemplateError),
}

/// Errors from the teardown orchestrator
#[derive(thiserror::Error, Debug)]
pub enum TeardownError {
    /// The plan was rejected at construction time
    #[error("Invalid teardown plan: {0}")]
    InvalidPlan(String),

    /// A step's action failed; no later step was attempted
    #[error("Teardown step '{step}' failed")]
    StepFailed {
        step: String,
        #[source]
        source: BackendError,
    },

    /// A step's drain precondition did not hold within the shared deadline
    #[error("Teardown step '{step}' did not drain within {elapsed:?}")]
    DrainTimeout { step: String, elapsed: Duration },

    #[error("Teardown cancelled")]
    Cancelled,

    #[error("Progress rendering error")]
    Progress(#[from] TemplateError),
}
