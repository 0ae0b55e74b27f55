//! The Cilium chart release itself, the feature everything else depends on.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use colored::Colorize;
use derive_builder::Builder;
use semver::Version;
use tracing::{debug, instrument};

use crate::backend::{ApplyParams, ClusterBackend, MergeMode};
use crate::defaults::{MAX_INSTALL_WAIT, MAX_TEARDOWN_WAIT};
use crate::error::FeatureError;
use crate::teardown::{Teardown, TeardownPlan};
use crate::{CA_SECRET_NAME, ClusterContext, DEFAULT_CHART, DEFAULT_REPOSITORY, FeatureKind};

use super::hubble;
use super::{FeatureController, ReadState, await_converged, split_set_values};

fn default_chart_version() -> Version {
    Version::new(1, 17, 3)
}

/// Desired state of the Cilium chart release
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(private, name = "build_impl"))]
pub struct InstallSpec {
    /// Chart version to install
    #[builder(setter(into), default = "default_chart_version()")]
    pub version: Version,

    /// Chart repository URL
    #[builder(setter(into), default = "DEFAULT_REPOSITORY.to_string()")]
    pub repository: String,

    /// `key=value` helm overrides
    #[builder(default)]
    pub set_values: Vec<String>,

    /// Inline helm values YAML
    #[builder(setter(into, strip_option), default)]
    pub values_yaml: Option<String>,

    /// On upgrade, keep the previous release values as the base
    #[builder(default = "false")]
    pub reuse_values: bool,

    /// On upgrade, discard the previous release values
    #[builder(default = "false")]
    pub reset_values: bool,

    /// On upgrade, reset to chart defaults then layer previous values on top
    #[builder(default = "true")]
    pub reset_then_reuse_values: bool,

    /// Whether apply blocks until the agent and operator report healthy
    #[builder(default = "true")]
    pub wait: bool,

    /// Override of the default wait budget
    #[builder(setter(strip_option), default)]
    pub wait_timeout: Option<Duration>,
}

impl InstallSpec {
    pub fn builder() -> InstallSpecBuilder {
        InstallSpecBuilder::default()
    }

    fn merge_mode(&self) -> MergeMode {
        MergeMode::from_flags(
            self.reset_values,
            self.reuse_values,
            self.reset_then_reuse_values,
        )
    }
}

impl InstallSpecBuilder {
    /// Validates all builder options and constructs an `InstallSpec`
    pub fn build(&self) -> Result<InstallSpec, FeatureError> {
        let spec = self
            .build_impl()
            .map_err(|err| FeatureError::MissingRequiredConfig(err.to_string()))?;
        Ok(spec)
    }

    /// A builder helper for conditionally setting options
    pub fn with_if<F>(&mut self, cond: bool, f: F) -> &mut Self
    where
        F: Fn(&mut Self) -> &mut Self,
    {
        if cond { f(self) } else { self }
    }
}

/// Certificate authority material generated by the chart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaMaterial {
    /// Base64-encoded certificate
    pub cert: String,
    /// Base64-encoded private key
    pub key: String,
}

impl CaMaterial {
    /// Extracts the CA pair from the secret's data, if both halves are there
    pub(crate) fn from_secret(data: &BTreeMap<String, String>) -> Option<Self> {
        let cert = data.get("ca.crt")?.clone();
        let key = data.get("ca.key")?.clone();
        Some(Self { cert, key })
    }
}

/// What the cluster reports about an installed release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallStatus {
    /// App version of the installed release
    pub version: String,
    /// User-supplied release values, as YAML
    pub helm_values: String,
    /// CA material, when the chart generated it
    pub ca: Option<CaMaterial>,
}

/// Controller for the Cilium chart release
pub struct InstallFeature<'a, B> {
    ctx: &'a ClusterContext<B>,
}

impl<'a, B: ClusterBackend> InstallFeature<'a, B> {
    pub fn new(ctx: &'a ClusterContext<B>) -> Self {
        Self { ctx }
    }

    fn apply_params(&self, desired: &InstallSpec) -> Result<ApplyParams, FeatureError> {
        Ok(ApplyParams {
            release: self.ctx.release_ref(),
            chart: DEFAULT_CHART.to_owned(),
            repository: desired.repository.clone(),
            version: Some(desired.version.clone()),
            set_values: split_set_values(&desired.set_values)?,
            values_yaml: desired.values_yaml.clone(),
            merge: desired.merge_mode(),
        })
    }

    async fn wait_if_requested(&self, desired: &InstallSpec) -> Result<(), FeatureError> {
        if !desired.wait {
            return Ok(());
        }
        let deadline = desired.wait_timeout.unwrap_or(*MAX_INSTALL_WAIT);
        await_converged(self.ctx, self.ctx.identity(FeatureKind::Install), deadline).await
    }

    /// Reads the release back: version, values, and best-effort CA material.
    ///
    /// A missing or momentarily unreadable CA secret is tolerated; the chart
    /// only generates one under some configurations.
    async fn observe(&self) -> Result<InstallStatus, FeatureError> {
        let backend = self.ctx.backend();
        let release = self.ctx.release_ref();

        let version = backend.release_version(&release).await?;
        let helm_values = backend.release_values(&release).await?;
        let ca = match backend.secret(self.ctx.namespace(), CA_SECRET_NAME).await {
            Ok(Some(data)) => CaMaterial::from_secret(&data),
            Ok(None) => None,
            Err(err) if err.is_retryable() => {
                debug!(%err, "could not read CA secret, leaving it unset");
                None
            }
            Err(err) => return Err(err.into()),
        };

        Ok(InstallStatus {
            version,
            helm_values,
            ca,
        })
    }
}

#[async_trait]
impl<B: ClusterBackend> FeatureController for InstallFeature<'_, B> {
    type Desired = InstallSpec;
    type Observed = InstallStatus;

    fn kind(&self) -> FeatureKind {
        FeatureKind::Install
    }

    #[instrument(skip(self, desired), fields(version = %desired.version))]
    async fn create(&self, desired: &InstallSpec) -> Result<InstallStatus, FeatureError> {
        let pb = self.ctx.pb_factory().create()?;
        pb.set_message("📦 Installing cilium chart");

        let params = self.apply_params(desired)?;
        self.ctx.backend().install(&params).await?;
        pb.set_message("🕓 Waiting for cilium to become ready");
        self.wait_if_requested(desired).await?;

        let status = self.observe().await?;
        pb.println(format!(
            "✅ {}",
            format!("Cilium {} installed", status.version).bold()
        ));
        pb.finish_and_clear();
        Ok(status)
    }

    async fn read(&self, _desired: &InstallSpec) -> Result<ReadState<InstallStatus>, FeatureError> {
        let release = self.ctx.release_ref();
        match self.ctx.backend().release_version(&release).await {
            Ok(_) => Ok(ReadState::Present(self.observe().await?)),
            Err(err) if err.is_not_found() => Ok(ReadState::Absent),
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self, desired), fields(version = %desired.version))]
    async fn update(&self, desired: &InstallSpec) -> Result<InstallStatus, FeatureError> {
        let pb = self.ctx.pb_factory().create()?;
        pb.set_message("📦 Upgrading cilium chart");

        let params = self.apply_params(desired)?;
        self.ctx.backend().upgrade(&params).await?;
        pb.set_message("🕓 Waiting for cilium to become ready");
        self.wait_if_requested(desired).await?;

        let status = self.observe().await?;
        pb.println(format!(
            "✅ {}",
            format!("Cilium {} upgraded", status.version).bold()
        ));
        pb.finish_and_clear();
        Ok(status)
    }

    /// Removes the release through the ordered teardown: Hubble off, relay
    /// pods drained, test namespace gone, then uninstall.
    #[instrument(skip(self, desired))]
    async fn delete(&self, desired: &InstallSpec) -> Result<(), FeatureError> {
        let plan = TeardownPlan::base_uninstall(
            self.ctx.release_ref(),
            hubble::disable_params(self.ctx),
            desired.wait,
        );
        let deadline = desired.wait_timeout.unwrap_or(*MAX_TEARDOWN_WAIT);
        Teardown::new(self.ctx)
            .run(&plan, deadline)
            .await
            .map_err(|err| match err {
                crate::error::TeardownError::Cancelled => FeatureError::Cancelled,
                other => FeatureError::Teardown(Box::new(other)),
            })?;
        Ok(())
    }
}
