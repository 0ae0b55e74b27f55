//! Functionality for installing, managing, and deleting Cilium on a
//! Kubernetes cluster.
//!
//! Each Cilium feature (the chart install itself, cluster mesh, Hubble
//! telemetry, single agent config keys, kube-proxy replacement) is managed by
//! its own controller with a create/read/update/delete surface, all sharing
//! one [`ClusterContext`] handle.
//!
//! # Example
//!
//! To install Cilium with the default chart settings:
//!
//! ```no_run
//! use cilium_cluster::{ClusterContext, ClusterError, FeatureController, HelmBackend};
//! use cilium_cluster::{InstallFeature, InstallSpec};
//! # async fn example() -> Result<(), ClusterError> {
//! let ctx = ClusterContext::new(HelmBackend::new()?);
//! let spec = InstallSpec::builder().build()?;
//! let status = InstallFeature::new(&ctx).create(&spec).await?;
//! println!("installed cilium {}", status.version);
//! # Ok(())
//! # }
//! ```

#![deny(rustdoc::broken_intra_doc_links)]

mod backend;
mod error;
mod features;
mod progress;
mod render;
mod teardown;
mod wait;

pub use backend::{
    ApplyParams, ClusterBackend, ComponentHealth, DaemonSetPatch, DaemonSetStatus, HelmBackend,
    MergeMode, NamespacePhase, ReleaseRef,
};
pub use error::{BackendError, ClusterError, FeatureError, TeardownError};
pub use features::{
    CaMaterial, ClusterMeshFeature, ClusterMeshSpec, ClusterMeshSpecBuilder, ConfigEntry,
    ConfigFeature, ConfigKeySpec, ConfigKeySpecBuilder, ConnectFeature, ConnectSpec,
    ConnectSpecBuilder, ConnectionMode, FeatureController, HubbleFeature, HubbleSpec,
    HubbleSpecBuilder, InstallFeature, InstallSpec, InstallSpecBuilder, InstallStatus,
    KubeProxyFeature, KubeProxySpec, KubeProxySpecBuilder, ReadState,
};
pub use teardown::{DrainCondition, Teardown, TeardownAction, TeardownPlan, TeardownStep};
pub use wait::{ConvergenceOutcome, WaitOptions, converge};

pub use fluvio_helm::HelmError;

pub(crate) const DEFAULT_NAMESPACE: &str = "kube-system";
pub(crate) const DEFAULT_RELEASE_NAME: &str = "cilium";
pub(crate) const DEFAULT_CHART: &str = "cilium/cilium";
pub(crate) const DEFAULT_REPOSITORY: &str = "https://helm.cilium.io";
pub(crate) const CONFIG_MAP_NAME: &str = "cilium-config";
pub(crate) const CA_SECRET_NAME: &str = "cilium-ca";
pub(crate) const AGENT_WORKLOAD: &str = "daemonset/cilium";
pub(crate) const RELAY_POD_SELECTOR: &str = "k8s-app=hubble-relay";
pub(crate) const TEST_NAMESPACE: &str = "cilium-test";

pub(crate) mod defaults {
    use std::time::Duration;

    use once_cell::sync::Lazy;

    fn env_secs(name: &str, default: u64) -> Duration {
        let secs = std::env::var(name)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(default);
        Duration::from_secs(secs)
    }

    /// Pause between convergence polls
    pub(crate) static POLL_INTERVAL: Lazy<Duration> =
        Lazy::new(|| env_secs("CILIUM_CLUSTER_POLL_INTERVAL", 2));

    /// Wait budget for the chart install to report healthy
    pub(crate) static MAX_INSTALL_WAIT: Lazy<Duration> =
        Lazy::new(|| env_secs("CILIUM_CLUSTER_INSTALL_WAIT", 120));

    /// Wait budget for the cluster mesh API server
    pub(crate) static MAX_MESH_WAIT: Lazy<Duration> =
        Lazy::new(|| env_secs("CILIUM_CLUSTER_MESH_WAIT", 120));

    /// Wait budget for Hubble relay
    pub(crate) static MAX_HUBBLE_WAIT: Lazy<Duration> =
        Lazy::new(|| env_secs("CILIUM_CLUSTER_HUBBLE_WAIT", 60));

    /// Wait budget for read-side status probes
    pub(crate) static MAX_STATUS_WAIT: Lazy<Duration> =
        Lazy::new(|| env_secs("CILIUM_CLUSTER_STATUS_WAIT", 20));

    /// Shared wait budget for a whole teardown
    pub(crate) static MAX_TEARDOWN_WAIT: Lazy<Duration> =
        Lazy::new(|| env_secs("CILIUM_CLUSTER_TEARDOWN_WAIT", 300));
}

pub use common::*;

mod common {

    use std::fmt;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::backend::{ClusterBackend, ReleaseRef};
    use crate::progress::ProgressBarFactory;

    /// The feature kinds this crate knows how to manage
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum FeatureKind {
        /// The Cilium chart release itself
        Install,
        /// Cluster mesh API server enablement
        ClusterMeshEnable,
        /// Connection of this cluster to mesh peers
        ClusterMeshConnect,
        /// Hubble relay and UI
        Hubble,
        /// A single agent config key
        ConfigKey,
        /// kube-proxy parked in favor of Cilium's replacement
        KubeProxyFree,
    }

    impl fmt::Display for FeatureKind {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let name = match self {
                Self::Install => "install",
                Self::ClusterMeshEnable => "clustermesh",
                Self::ClusterMeshConnect => "clustermesh-connect",
                Self::Hubble => "hubble",
                Self::ConfigKey => "config",
                Self::KubeProxyFree => "kubeproxy-free",
            };
            f.write_str(name)
        }
    }

    /// Identifies one managed feature instance on one cluster
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    pub struct FeatureIdentity {
        pub kind: FeatureKind,
        pub namespace: String,
        pub release: String,
    }

    impl fmt::Display for FeatureIdentity {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.release)
        }
    }

    use crate::defaults::POLL_INTERVAL;

    /// Shared handle for everything that talks to one cluster.
    ///
    /// Holds the backend, the target namespace and release name, the
    /// cancellation token every wait loop observes, and rendering options.
    /// Controllers borrow this rather than owning client state of their own.
    #[derive(Debug)]
    pub struct ClusterContext<B> {
        backend: B,
        namespace: String,
        release: String,
        hide_spinner: bool,
        poll_interval: Duration,
        cancel: CancellationToken,
    }

    impl<B: ClusterBackend> ClusterContext<B> {
        /// Creates a context targeting the default namespace and release
        pub fn new(backend: B) -> Self {
            Self {
                backend,
                namespace: crate::DEFAULT_NAMESPACE.to_owned(),
                release: crate::DEFAULT_RELEASE_NAME.to_owned(),
                hide_spinner: false,
                poll_interval: *POLL_INTERVAL,
                cancel: CancellationToken::new(),
            }
        }

        /// Targets a different namespace
        pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
            self.namespace = namespace.into();
            self
        }

        /// Targets a different helm release name
        pub fn with_release(mut self, release: impl Into<String>) -> Self {
            self.release = release.into();
            self
        }

        /// Suppresses spinner rendering, plain prints only
        pub fn with_hide_spinner(mut self, hide: bool) -> Self {
            self.hide_spinner = hide;
            self
        }

        /// Overrides the pause between convergence polls
        pub fn with_poll_interval(mut self, interval: Duration) -> Self {
            self.poll_interval = interval;
            self
        }

        /// Installs an externally owned cancellation token
        pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
            self.cancel = cancel;
            self
        }

        pub fn backend(&self) -> &B {
            &self.backend
        }

        pub fn namespace(&self) -> &str {
            &self.namespace
        }

        pub fn release(&self) -> &str {
            &self.release
        }

        /// Token observed by every wait loop started through this context
        pub fn cancel_token(&self) -> &CancellationToken {
            &self.cancel
        }

        pub fn release_ref(&self) -> ReleaseRef {
            ReleaseRef::new(&self.namespace, &self.release)
        }

        pub fn identity(&self, kind: FeatureKind) -> FeatureIdentity {
            FeatureIdentity {
                kind,
                namespace: self.namespace.clone(),
                release: self.release.clone(),
            }
        }

        pub(crate) fn poll_interval(&self) -> Duration {
            self.poll_interval
        }

        pub(crate) fn pb_factory(&self) -> ProgressBarFactory {
            ProgressBarFactory::new(self.hide_spinner)
        }
    }
}
