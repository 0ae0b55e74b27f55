//! The seam between feature controllers and the cluster.
//!
//! Controllers only ever talk to [`ClusterBackend`]. The production
//! implementation ([`HelmBackend`]) drives `helm` and `kubectl`; tests swap in
//! a recording double.

mod helm;

#[cfg(test)]
pub(crate) mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use semver::Version;

pub use helm::HelmBackend;

use crate::FeatureIdentity;
use crate::error::BackendError;

/// Addresses one helm release on the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRef {
    pub namespace: String,
    pub name: String,
}

impl ReleaseRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// How an upgrade combines desired values with the values already on the
/// release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Let helm decide (no merge flag on the upgrade)
    Unspecified,
    /// Reset to chart defaults, then layer the previous release values on top
    ResetThenReuse,
    /// Keep the previous release values as the base
    Reuse,
    /// Discard the previous release values entirely
    Reset,
}

impl MergeMode {
    /// Collapses the three desired-state flags into one mode.
    ///
    /// Reset always wins over reuse when both are requested, and the plain
    /// reset/reuse pair wins over reset-then-reuse.
    pub fn from_flags(reset: bool, reuse: bool, reset_then_reuse: bool) -> Self {
        if reset {
            Self::Reset
        } else if reuse {
            Self::Reuse
        } else if reset_then_reuse {
            Self::ResetThenReuse
        } else {
            Self::Unspecified
        }
    }

    /// The helm CLI flag for this mode, if it has one
    pub fn as_flag(&self) -> Option<&'static str> {
        match self {
            Self::Unspecified => None,
            Self::ResetThenReuse => Some("--reset-then-reuse-values"),
            Self::Reuse => Some("--reuse-values"),
            Self::Reset => Some("--reset-values"),
        }
    }
}

/// Everything needed for one chart install or upgrade
#[derive(Debug, Clone)]
pub struct ApplyParams {
    pub release: ReleaseRef,
    /// Chart reference, e.g. `cilium/cilium`
    pub chart: String,
    /// Chart repository URL backing the chart reference
    pub repository: String,
    pub version: Option<Version>,
    /// `--set`-style overrides, already split into pairs
    pub set_values: Vec<(String, String)>,
    /// Inline values YAML, passed to helm as a values file
    pub values_yaml: Option<String>,
    /// Only meaningful for upgrades
    pub merge: MergeMode,
}

/// Coarse health of one feature's workloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Nothing matching the feature exists on the cluster
    Absent,
    /// Present but not yet (or no longer) fully ready
    Converging,
    /// Fully ready
    Healthy,
    /// Present and not expected to become ready without intervention
    Degraded(String),
}

/// Phase of a namespace that still exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespacePhase {
    Active,
    Terminating,
}

/// Readiness counters of a daemonset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSetStatus {
    pub desired: u32,
    pub ready: u32,
}

/// The two daemonset mutations used to park and restore kube-proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSetPatch {
    /// Pin the daemonset to a node selector no node satisfies
    PinToNonExistingNode,
    /// Remove that pin again
    ClearNodeSelector,
}

/// Facade over the cluster: helm releases plus the handful of raw Kubernetes
/// objects the feature controllers need.
///
/// Errors follow the [`BackendError`] taxonomy; in particular a missing
/// object is reported as `NotFound` rather than as success-with-empty-data,
/// so callers decide what absence means in their context.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn install(&self, params: &ApplyParams) -> Result<(), BackendError>;
    async fn upgrade(&self, params: &ApplyParams) -> Result<(), BackendError>;
    async fn uninstall(&self, release: &ReleaseRef) -> Result<(), BackendError>;

    /// Point-in-time health of the workloads behind a feature
    async fn status(&self, id: &FeatureIdentity) -> Result<ComponentHealth, BackendError>;

    /// User-supplied values of an installed release, as YAML
    async fn release_values(&self, release: &ReleaseRef) -> Result<String, BackendError>;
    /// App version of an installed release
    async fn release_version(&self, release: &ReleaseRef) -> Result<String, BackendError>;

    /// Raw data of a secret, `None` when it does not exist
    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, BackendError>;

    /// Number of pods currently matching a label selector
    async fn pod_count(&self, namespace: &str, selector: &str) -> Result<usize, BackendError>;

    /// Phase of a namespace, `None` when it does not exist
    async fn namespace_phase(&self, namespace: &str)
    -> Result<Option<NamespacePhase>, BackendError>;
    async fn delete_namespace(&self, namespace: &str) -> Result<(), BackendError>;

    /// Readiness of a daemonset, `None` when it does not exist
    async fn daemonset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaemonSetStatus>, BackendError>;
    async fn patch_daemonset(
        &self,
        namespace: &str,
        name: &str,
        patch: DaemonSetPatch,
    ) -> Result<(), BackendError>;

    /// Data of a config map, `None` when it does not exist
    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, BackendError>;
    async fn set_config_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), BackendError>;
    async fn remove_config_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), BackendError>;

    /// Rolling restart of a workload, e.g. `daemonset/cilium`
    async fn restart_rollout(&self, namespace: &str, workload: &str) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_mode_reset_wins_over_reuse() {
        assert_eq!(MergeMode::from_flags(true, true, false), MergeMode::Reset);
        assert_eq!(MergeMode::from_flags(true, true, true), MergeMode::Reset);
        assert_eq!(MergeMode::from_flags(true, false, false), MergeMode::Reset);
    }

    #[test]
    fn test_merge_mode_plain_flags() {
        assert_eq!(MergeMode::from_flags(false, true, false), MergeMode::Reuse);
        assert_eq!(MergeMode::from_flags(false, true, true), MergeMode::Reuse);
        assert_eq!(
            MergeMode::from_flags(false, false, true),
            MergeMode::ResetThenReuse
        );
        assert_eq!(
            MergeMode::from_flags(false, false, false),
            MergeMode::Unspecified
        );
    }

    #[test]
    fn test_merge_mode_flags_map_to_helm_args() {
        assert_eq!(MergeMode::Reset.as_flag(), Some("--reset-values"));
        assert_eq!(MergeMode::Reuse.as_flag(), Some("--reuse-values"));
        assert_eq!(
            MergeMode::ResetThenReuse.as_flag(),
            Some("--reset-then-reuse-values")
        );
        assert_eq!(MergeMode::Unspecified.as_flag(), None);
    }
}
