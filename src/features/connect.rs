//! Connecting this cluster's mesh to its peers.
//!
//! Peer clusters are addressed by kubeconfig context name; the connection is
//! expressed as chart values on the local release, so the same apply and
//! status paths as every other feature carry it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use derive_builder::Builder;
use tracing::instrument;

use crate::backend::{ApplyParams, ClusterBackend, ComponentHealth, MergeMode};
use crate::defaults::{MAX_MESH_WAIT, MAX_STATUS_WAIT};
use crate::error::FeatureError;
use crate::{ClusterContext, DEFAULT_CHART, DEFAULT_REPOSITORY, FeatureKind};

use super::{FeatureController, ReadState, await_converged, read_component};

/// How tunnels between the connected clusters are established
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    /// Only this cluster connects to the destinations
    Unicast,
    /// Both sides connect to each other
    #[default]
    Bidirectional,
    /// Every cluster in the set connects to every other
    Mesh,
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unicast => "unicast",
            Self::Bidirectional => "bidirectional",
            Self::Mesh => "mesh",
        };
        f.write_str(name)
    }
}

/// Desired state of a mesh connection
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(private, name = "build_impl"))]
pub struct ConnectSpec {
    /// Kubeconfig context names of the clusters to connect to
    #[builder(setter(into))]
    pub destination_contexts: Vec<String>,

    /// Tunnel establishment mode
    #[builder(default)]
    pub connection_mode: ConnectionMode,

    /// Whether apply blocks until the mesh reports healthy
    #[builder(default = "true")]
    pub wait: bool,

    /// Override of the default wait budget
    #[builder(setter(strip_option), default)]
    pub wait_timeout: Option<Duration>,
}

impl ConnectSpec {
    pub fn builder() -> ConnectSpecBuilder {
        ConnectSpecBuilder::default()
    }
}

impl ConnectSpecBuilder {
    pub fn build(&self) -> Result<ConnectSpec, FeatureError> {
        let spec = self
            .build_impl()
            .map_err(|err| FeatureError::MissingRequiredConfig(err.to_string()))?;
        if spec.destination_contexts.is_empty() {
            return Err(FeatureError::MissingRequiredConfig(
                "destination_contexts".to_string(),
            ));
        }
        Ok(spec)
    }
}

/// Controller for mesh connections
pub struct ConnectFeature<'a, B> {
    ctx: &'a ClusterContext<B>,
}

impl<'a, B: ClusterBackend> ConnectFeature<'a, B> {
    pub fn new(ctx: &'a ClusterContext<B>) -> Self {
        Self { ctx }
    }

    fn connect_params(&self, desired: &ConnectSpec) -> ApplyParams {
        let mut set_values = vec![
            ("clustermesh.config.enabled".to_owned(), "true".to_owned()),
            (
                "clustermesh.connectionMode".to_owned(),
                desired.connection_mode.to_string(),
            ),
        ];
        for (index, context) in desired.destination_contexts.iter().enumerate() {
            set_values.push((
                format!("clustermesh.config.clusters[{index}].name"),
                context.clone(),
            ));
        }
        ApplyParams {
            release: self.ctx.release_ref(),
            chart: DEFAULT_CHART.to_owned(),
            repository: DEFAULT_REPOSITORY.to_owned(),
            version: None,
            set_values,
            values_yaml: None,
            merge: MergeMode::Reuse,
        }
    }

    fn disconnect_params(&self) -> ApplyParams {
        ApplyParams {
            release: self.ctx.release_ref(),
            chart: DEFAULT_CHART.to_owned(),
            repository: DEFAULT_REPOSITORY.to_owned(),
            version: None,
            set_values: vec![("clustermesh.config.enabled".to_owned(), "false".to_owned())],
            values_yaml: None,
            merge: MergeMode::Reuse,
        }
    }

    async fn apply(&self, desired: &ConnectSpec) -> Result<ComponentHealth, FeatureError> {
        let params = self.connect_params(desired);
        self.ctx.backend().upgrade(&params).await?;
        if desired.wait {
            let deadline = desired.wait_timeout.unwrap_or(*MAX_MESH_WAIT);
            await_converged(
                self.ctx,
                self.ctx.identity(FeatureKind::ClusterMeshConnect),
                deadline,
            )
            .await?;
        }
        Ok(ComponentHealth::Healthy)
    }
}

#[async_trait]
impl<B: ClusterBackend> FeatureController for ConnectFeature<'_, B> {
    type Desired = ConnectSpec;
    type Observed = ComponentHealth;

    fn kind(&self) -> FeatureKind {
        FeatureKind::ClusterMeshConnect
    }

    #[instrument(skip(self, desired), fields(mode = %desired.connection_mode, peers = desired.destination_contexts.len()))]
    async fn create(&self, desired: &ConnectSpec) -> Result<ComponentHealth, FeatureError> {
        self.apply(desired).await
    }

    async fn read(
        &self,
        _desired: &ConnectSpec,
    ) -> Result<ReadState<ComponentHealth>, FeatureError> {
        read_component(
            self.ctx,
            self.ctx.identity(FeatureKind::ClusterMeshConnect),
            *MAX_STATUS_WAIT,
        )
        .await
    }

    #[instrument(skip(self, desired), fields(mode = %desired.connection_mode))]
    async fn update(&self, desired: &ConnectSpec) -> Result<ComponentHealth, FeatureError> {
        self.apply(desired).await
    }

    #[instrument(skip(self, _desired))]
    async fn delete(&self, _desired: &ConnectSpec) -> Result<(), FeatureError> {
        let params = self.disconnect_params();
        self.ctx.backend().upgrade(&params).await?;
        Ok(())
    }
}
