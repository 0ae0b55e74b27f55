//! Cluster mesh enablement: the clustermesh API server deployed through
//! chart values on the existing release.

use std::time::Duration;

use async_trait::async_trait;
use derive_builder::Builder;
use tracing::instrument;

use crate::backend::{ApplyParams, ClusterBackend, ComponentHealth, MergeMode};
use crate::defaults::{MAX_MESH_WAIT, MAX_STATUS_WAIT};
use crate::error::FeatureError;
use crate::{ClusterContext, DEFAULT_CHART, DEFAULT_REPOSITORY, FeatureKind};

use super::{FeatureController, ReadState, await_converged, read_component};

/// Desired state of cluster mesh on an installed release
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(private, name = "build_impl"))]
pub struct ClusterMeshSpec {
    /// Service type exposing the clustermesh API server
    #[builder(setter(into), default = "\"NodePort\".to_string()")]
    pub service_type: String,

    /// Whether external (non-Kubernetes) workloads may join the mesh
    #[builder(default = "false")]
    pub enable_external_workloads: bool,

    /// Whether the kvstoremesh sidecar is enabled
    #[builder(default = "false")]
    pub enable_kv_store_mesh: bool,

    /// Whether apply blocks until the API server reports healthy
    #[builder(default = "true")]
    pub wait: bool,

    /// Override of the default wait budget
    #[builder(setter(strip_option), default)]
    pub wait_timeout: Option<Duration>,
}

impl ClusterMeshSpec {
    pub fn builder() -> ClusterMeshSpecBuilder {
        ClusterMeshSpecBuilder::default()
    }
}

impl ClusterMeshSpecBuilder {
    pub fn build(&self) -> Result<ClusterMeshSpec, FeatureError> {
        let spec = self
            .build_impl()
            .map_err(|err| FeatureError::MissingRequiredConfig(err.to_string()))?;
        Ok(spec)
    }
}

/// Controller for cluster mesh enablement
pub struct ClusterMeshFeature<'a, B> {
    ctx: &'a ClusterContext<B>,
}

impl<'a, B: ClusterBackend> ClusterMeshFeature<'a, B> {
    pub fn new(ctx: &'a ClusterContext<B>) -> Self {
        Self { ctx }
    }

    fn enable_params(&self, desired: &ClusterMeshSpec) -> ApplyParams {
        ApplyParams {
            release: self.ctx.release_ref(),
            chart: DEFAULT_CHART.to_owned(),
            repository: DEFAULT_REPOSITORY.to_owned(),
            version: None,
            set_values: vec![
                ("clustermesh.useAPIServer".to_owned(), "true".to_owned()),
                (
                    "clustermesh.apiserver.service.type".to_owned(),
                    desired.service_type.clone(),
                ),
                (
                    "externalWorkloads.enabled".to_owned(),
                    desired.enable_external_workloads.to_string(),
                ),
                (
                    "clustermesh.apiserver.kvstoremesh.enabled".to_owned(),
                    desired.enable_kv_store_mesh.to_string(),
                ),
            ],
            values_yaml: None,
            merge: MergeMode::Reuse,
        }
    }

    fn disable_params(&self) -> ApplyParams {
        ApplyParams {
            release: self.ctx.release_ref(),
            chart: DEFAULT_CHART.to_owned(),
            repository: DEFAULT_REPOSITORY.to_owned(),
            version: None,
            set_values: vec![("clustermesh.useAPIServer".to_owned(), "false".to_owned())],
            values_yaml: None,
            merge: MergeMode::Reuse,
        }
    }

    async fn apply(&self, desired: &ClusterMeshSpec) -> Result<ComponentHealth, FeatureError> {
        let params = self.enable_params(desired);
        self.ctx.backend().upgrade(&params).await?;
        if desired.wait {
            let deadline = desired.wait_timeout.unwrap_or(*MAX_MESH_WAIT);
            await_converged(
                self.ctx,
                self.ctx.identity(FeatureKind::ClusterMeshEnable),
                deadline,
            )
            .await?;
        }
        Ok(ComponentHealth::Healthy)
    }
}

#[async_trait]
impl<B: ClusterBackend> FeatureController for ClusterMeshFeature<'_, B> {
    type Desired = ClusterMeshSpec;
    type Observed = ComponentHealth;

    fn kind(&self) -> FeatureKind {
        FeatureKind::ClusterMeshEnable
    }

    #[instrument(skip(self, desired), fields(service_type = %desired.service_type))]
    async fn create(&self, desired: &ClusterMeshSpec) -> Result<ComponentHealth, FeatureError> {
        self.apply(desired).await
    }

    async fn read(
        &self,
        _desired: &ClusterMeshSpec,
    ) -> Result<ReadState<ComponentHealth>, FeatureError> {
        read_component(
            self.ctx,
            self.ctx.identity(FeatureKind::ClusterMeshEnable),
            *MAX_STATUS_WAIT,
        )
        .await
    }

    #[instrument(skip(self, desired), fields(service_type = %desired.service_type))]
    async fn update(&self, desired: &ClusterMeshSpec) -> Result<ComponentHealth, FeatureError> {
        self.apply(desired).await
    }

    #[instrument(skip(self, _desired))]
    async fn delete(&self, _desired: &ClusterMeshSpec) -> Result<(), FeatureError> {
        let params = self.disable_params();
        self.ctx.backend().upgrade(&params).await?;
        Ok(())
    }
}
