//! Parking kube-proxy so Cilium's eBPF replacement handles service traffic.
//!
//! The daemonset itself stays on the cluster; its pods are evicted by
//! pinning it to a node selector no node satisfies, and brought back by
//! removing that pin.

use async_trait::async_trait;
use derive_builder::Builder;
use tracing::instrument;

use crate::backend::{ClusterBackend, DaemonSetPatch, DaemonSetStatus};
use crate::error::{BackendError, FeatureError};
use crate::{ClusterContext, FeatureKind};

use super::{FeatureController, ReadState};

/// Desired state: the named daemonset parked
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(private, name = "build_impl"))]
pub struct KubeProxySpec {
    /// Daemonset to park
    #[builder(setter(into), default = "\"kube-proxy\".to_string()")]
    pub daemonset: String,

    /// Namespace the daemonset lives in
    #[builder(setter(into), default = "crate::DEFAULT_NAMESPACE.to_string()")]
    pub namespace: String,
}

impl KubeProxySpec {
    pub fn builder() -> KubeProxySpecBuilder {
        KubeProxySpecBuilder::default()
    }
}

impl KubeProxySpecBuilder {
    pub fn build(&self) -> Result<KubeProxySpec, FeatureError> {
        let spec = self
            .build_impl()
            .map_err(|err| FeatureError::MissingRequiredConfig(err.to_string()))?;
        Ok(spec)
    }
}

/// Controller for the kube-proxy parking feature
pub struct KubeProxyFeature<'a, B> {
    ctx: &'a ClusterContext<B>,
}

impl<'a, B: ClusterBackend> KubeProxyFeature<'a, B> {
    pub fn new(ctx: &'a ClusterContext<B>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl<B: ClusterBackend> FeatureController for KubeProxyFeature<'_, B> {
    type Desired = KubeProxySpec;
    type Observed = DaemonSetStatus;

    fn kind(&self) -> FeatureKind {
        FeatureKind::KubeProxyFree
    }

    #[instrument(skip(self, desired), fields(daemonset = %desired.daemonset))]
    async fn create(&self, desired: &KubeProxySpec) -> Result<DaemonSetStatus, FeatureError> {
        let backend = self.ctx.backend();
        let status = backend
            .daemonset(&desired.namespace, &desired.daemonset)
            .await?
            .ok_or_else(|| {
                FeatureError::Backend(BackendError::not_found(format!(
                    "daemonset {}",
                    desired.daemonset
                )))
            })?;
        backend
            .patch_daemonset(
                &desired.namespace,
                &desired.daemonset,
                DaemonSetPatch::PinToNonExistingNode,
            )
            .await?;
        Ok(status)
    }

    /// The feature "exists" only while the daemonset has zero ready pods.
    /// A daemonset that is gone, or running again, collapses to `Absent`.
    async fn read(
        &self,
        desired: &KubeProxySpec,
    ) -> Result<ReadState<DaemonSetStatus>, FeatureError> {
        let status = self
            .ctx
            .backend()
            .daemonset(&desired.namespace, &desired.daemonset)
            .await?;
        match status {
            Some(status) if status.ready == 0 => Ok(ReadState::Present(status)),
            _ => Ok(ReadState::Absent),
        }
    }

    #[instrument(skip(self, desired), fields(daemonset = %desired.daemonset))]
    async fn update(&self, desired: &KubeProxySpec) -> Result<DaemonSetStatus, FeatureError> {
        self.create(desired).await
    }

    #[instrument(skip(self, desired), fields(daemonset = %desired.daemonset))]
    async fn delete(&self, desired: &KubeProxySpec) -> Result<(), FeatureError> {
        let backend = self.ctx.backend();
        let status = backend
            .daemonset(&desired.namespace, &desired.daemonset)
            .await?;
        if status.is_none() {
            // nothing to restore
            return Ok(());
        }
        backend
            .patch_daemonset(
                &desired.namespace,
                &desired.daemonset,
                DaemonSetPatch::ClearNodeSelector,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::mock::MockBackend;

    use super::*;

    fn test_ctx(backend: MockBackend) -> ClusterContext<MockBackend> {
        ClusterContext::new(backend).with_hide_spinner(true)
    }

    fn spec() -> KubeProxySpec {
        KubeProxySpec::builder().build().expect("should build")
    }

    #[test]
    fn test_spec_defaults() {
        let spec = spec();
        assert_eq!(spec.daemonset, "kube-proxy");
        assert_eq!(spec.namespace, "kube-system");
    }

    #[fluvio_future::test]
    async fn test_create_pins_existing_daemonset() {
        let backend = MockBackend::new().with_daemonset(
            "kube-system",
            "kube-proxy",
            DaemonSetStatus {
                desired: 3,
                ready: 3,
            },
        );
        let ctx = test_ctx(backend);

        let status = KubeProxyFeature::new(&ctx)
            .create(&spec())
            .await
            .expect("create should succeed");
        assert_eq!(status.ready, 3);

        let calls = ctx.backend().calls();
        assert!(calls.contains(
            &"patch_daemonset:kube-system/kube-proxy:PinToNonExistingNode".to_owned()
        ));
    }

    #[fluvio_future::test]
    async fn test_create_fails_when_daemonset_missing() {
        let ctx = test_ctx(MockBackend::new());

        let err = KubeProxyFeature::new(&ctx)
            .create(&spec())
            .await
            .expect_err("create should fail");
        assert!(matches!(
            err,
            FeatureError::Backend(BackendError::NotFound { .. })
        ));
        let calls = ctx.backend().calls();
        assert!(calls.iter().all(|call| !call.starts_with("patch_daemonset:")));
    }

    #[fluvio_future::test]
    async fn test_read_is_present_while_parked() {
        let backend = MockBackend::new().with_daemonset(
            "kube-system",
            "kube-proxy",
            DaemonSetStatus {
                desired: 0,
                ready: 0,
            },
        );
        let ctx = test_ctx(backend);

        let state = KubeProxyFeature::new(&ctx)
            .read(&spec())
            .await
            .expect("read should succeed");
        assert!(!state.is_absent());
    }

    #[fluvio_future::test]
    async fn test_read_collapses_running_proxy_to_absent() {
        let backend = MockBackend::new().with_daemonset(
            "kube-system",
            "kube-proxy",
            DaemonSetStatus {
                desired: 3,
                ready: 2,
            },
        );
        let ctx = test_ctx(backend);

        let state = KubeProxyFeature::new(&ctx)
            .read(&spec())
            .await
            .expect("read should succeed");
        assert!(state.is_absent());
    }

    #[fluvio_future::test]
    async fn test_read_of_missing_daemonset_is_absent() {
        let ctx = test_ctx(MockBackend::new());

        let state = KubeProxyFeature::new(&ctx)
            .read(&spec())
            .await
            .expect("read should succeed");
        assert!(state.is_absent());
    }

    #[fluvio_future::test]
    async fn test_delete_restores_node_selector() {
        let backend = MockBackend::new().with_daemonset(
            "kube-system",
            "kube-proxy",
            DaemonSetStatus {
                desired: 0,
                ready: 0,
            },
        );
        let ctx = test_ctx(backend);

        KubeProxyFeature::new(&ctx)
            .delete(&spec())
            .await
            .expect("delete should succeed");

        let calls = ctx.backend().calls();
        assert!(calls
            .contains(&"patch_daemonset:kube-system/kube-proxy:ClearNodeSelector".to_owned()));
    }

    #[fluvio_future::test]
    async fn test_delete_of_missing_daemonset_is_not_an_error() {
        let ctx = test_ctx(MockBackend::new());

        KubeProxyFeature::new(&ctx)
            .delete(&spec())
            .await
            .expect("delete should succeed");

        let calls = ctx.backend().calls();
        assert!(calls.iter().all(|call| !call.starts_with("patch_daemonset:")));
    }
}
