//! Per-feature resource controllers.
//!
//! Every managed Cilium feature gets one controller with the same
//! create/read/update/delete surface. Controllers own no client state; they
//! borrow a [`ClusterContext`] and express everything through the backend
//! facade.

mod clustermesh;
mod config;
mod connect;
mod hubble;
mod install;
mod kubeproxy;

use std::time::Duration;

use async_trait::async_trait;

pub use clustermesh::{ClusterMeshFeature, ClusterMeshSpec, ClusterMeshSpecBuilder};
pub use config::{ConfigEntry, ConfigFeature, ConfigKeySpec, ConfigKeySpecBuilder};
pub use connect::{ConnectFeature, ConnectSpec, ConnectSpecBuilder, ConnectionMode};
pub use hubble::{HubbleFeature, HubbleSpec, HubbleSpecBuilder};
pub use install::{CaMaterial, InstallFeature, InstallSpec, InstallSpecBuilder, InstallStatus};
pub use kubeproxy::{KubeProxyFeature, KubeProxySpec, KubeProxySpecBuilder};

use crate::backend::{ClusterBackend, ComponentHealth};
use crate::error::FeatureError;
use crate::wait::{self, WaitOptions};
use crate::{ClusterContext, FeatureIdentity, FeatureKind};

/// What a read observed for a managed feature.
///
/// `Absent` is a normal answer, not an error: it tells the caller to drop the
/// feature from its records rather than to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadState<T> {
    /// The feature is not on the cluster (or no longer qualifies as present)
    Absent,
    /// The feature is on the cluster, with its observed state
    Present(T),
}

impl<T> ReadState<T> {
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Absent => None,
            Self::Present(value) => Some(value),
        }
    }
}

/// The management surface shared by all feature controllers.
///
/// `read` and `delete` take the previously applied desired state because some
/// features are addressed by fields of it (the config key, the daemonset
/// being parked); only those identifying fields are consulted.
#[async_trait]
pub trait FeatureController {
    type Desired;
    type Observed;

    fn kind(&self) -> FeatureKind;

    /// Applies the feature and returns what the cluster reports afterwards
    async fn create(&self, desired: &Self::Desired) -> Result<Self::Observed, FeatureError>;

    /// Observes the feature as it currently exists on the cluster
    async fn read(&self, desired: &Self::Desired)
    -> Result<ReadState<Self::Observed>, FeatureError>;

    /// Re-applies the feature with changed desired state
    async fn update(&self, desired: &Self::Desired) -> Result<Self::Observed, FeatureError>;

    /// Removes the feature; a feature that is already gone is not an error
    async fn delete(&self, desired: &Self::Desired) -> Result<(), FeatureError>;
}

/// Splits `key=value` override strings into pairs
pub(crate) fn split_set_values(raw: &[String]) -> Result<Vec<(String, String)>, FeatureError> {
    raw.iter()
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| FeatureError::InvalidOverride(entry.clone()))
        })
        .collect()
}

/// Polls the feature's health until it reports healthy or `deadline` passes.
///
/// A timed-out wait leaves whatever was applied in place; the error carries
/// the last probe failure for diagnostics.
pub(crate) async fn await_converged<B: ClusterBackend>(
    ctx: &ClusterContext<B>,
    id: FeatureIdentity,
    deadline: Duration,
) -> Result<(), FeatureError> {
    let backend = ctx.backend();
    let opts = WaitOptions::new(ctx.poll_interval(), deadline);

    let outcome = wait::converge(
        move || {
            let id = id.clone();
            async move {
                let health = backend.status(&id).await?;
                Ok(matches!(health, ComponentHealth::Healthy))
            }
        },
        opts,
        ctx.cancel_token(),
    )
    .await;

    if outcome.healthy {
        return Ok(());
    }
    if outcome.cancelled {
        return Err(FeatureError::Cancelled);
    }
    if outcome.is_fatal() {
        // is_fatal() guarantees the error is present
        if let Some(err) = outcome.last_error {
            return Err(err.into());
        }
    }
    Err(FeatureError::ConvergenceTimeout {
        elapsed: outcome.elapsed,
        last: outcome.last_error.map(Box::new),
    })
}

/// Read-side health probe: a short bounded poll that collapses anything that
/// never reaches healthy into `Absent`.
pub(crate) async fn read_component<B: ClusterBackend>(
    ctx: &ClusterContext<B>,
    id: FeatureIdentity,
    deadline: Duration,
) -> Result<ReadState<ComponentHealth>, FeatureError> {
    match ctx.backend().status(&id).await {
        Ok(ComponentHealth::Absent) => return Ok(ReadState::Absent),
        Ok(ComponentHealth::Healthy) => return Ok(ReadState::Present(ComponentHealth::Healthy)),
        Ok(_) => {}
        Err(err) if err.is_retryable() => {}
        Err(err) => return Err(err.into()),
    }
    match await_converged(ctx, id, deadline).await {
        Ok(()) => Ok(ReadState::Present(ComponentHealth::Healthy)),
        Err(FeatureError::ConvergenceTimeout { .. }) => Ok(ReadState::Absent),
        Err(other) => Err(other),
    }
}
