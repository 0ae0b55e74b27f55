//! Hubble telemetry: the relay deployment and optionally the UI, toggled
//! through chart values on the existing release.

use std::time::Duration;

use async_trait::async_trait;
use derive_builder::Builder;
use tracing::instrument;

use crate::backend::{ApplyParams, ClusterBackend, ComponentHealth, MergeMode};
use crate::defaults::{MAX_HUBBLE_WAIT, MAX_STATUS_WAIT};
use crate::error::FeatureError;
use crate::wait::{self, WaitOptions};
use crate::{ClusterContext, DEFAULT_CHART, DEFAULT_REPOSITORY, FeatureKind, RELAY_POD_SELECTOR};

use super::{FeatureController, ReadState, await_converged, read_component};

/// Desired state of Hubble on an installed release
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(private, name = "build_impl"))]
pub struct HubbleSpec {
    /// Whether the Hubble UI is deployed alongside the relay
    #[builder(default = "false")]
    pub ui: bool,

    /// Whether apply blocks until the relay reports healthy
    #[builder(default = "true")]
    pub wait: bool,

    /// Override of the default wait budget
    #[builder(setter(strip_option), default)]
    pub wait_timeout: Option<Duration>,
}

impl HubbleSpec {
    pub fn builder() -> HubbleSpecBuilder {
        HubbleSpecBuilder::default()
    }
}

impl HubbleSpecBuilder {
    pub fn build(&self) -> Result<HubbleSpec, FeatureError> {
        let spec = self
            .build_impl()
            .map_err(|err| FeatureError::MissingRequiredConfig(err.to_string()))?;
        Ok(spec)
    }
}

/// Chart values that turn Hubble on
fn enable_params<B: ClusterBackend>(ctx: &ClusterContext<B>, ui: bool) -> ApplyParams {
    ApplyParams {
        release: ctx.release_ref(),
        chart: DEFAULT_CHART.to_owned(),
        repository: DEFAULT_REPOSITORY.to_owned(),
        version: None,
        set_values: vec![
            ("hubble.relay.enabled".to_owned(), "true".to_owned()),
            ("hubble.ui.enabled".to_owned(), ui.to_string()),
        ],
        values_yaml: None,
        merge: MergeMode::Reuse,
    }
}

/// Chart values that turn Hubble off, shared with the install teardown
pub(crate) fn disable_params<B: ClusterBackend>(ctx: &ClusterContext<B>) -> ApplyParams {
    ApplyParams {
        release: ctx.release_ref(),
        chart: DEFAULT_CHART.to_owned(),
        repository: DEFAULT_REPOSITORY.to_owned(),
        version: None,
        set_values: vec![
            ("hubble.relay.enabled".to_owned(), "false".to_owned()),
            ("hubble.ui.enabled".to_owned(), "false".to_owned()),
        ],
        values_yaml: None,
        merge: MergeMode::Reuse,
    }
}

/// Controller for Hubble telemetry
pub struct HubbleFeature<'a, B> {
    ctx: &'a ClusterContext<B>,
}

impl<'a, B: ClusterBackend> HubbleFeature<'a, B> {
    pub fn new(ctx: &'a ClusterContext<B>) -> Self {
        Self { ctx }
    }

    async fn apply(&self, desired: &HubbleSpec) -> Result<ComponentHealth, FeatureError> {
        let params = enable_params(self.ctx, desired.ui);
        self.ctx.backend().upgrade(&params).await?;
        if desired.wait {
            let deadline = desired.wait_timeout.unwrap_or(*MAX_HUBBLE_WAIT);
            await_converged(self.ctx, self.ctx.identity(FeatureKind::Hubble), deadline).await?;
        }
        Ok(ComponentHealth::Healthy)
    }

    /// Polls until no relay pods remain after the disable upgrade
    async fn drain_relay(&self, deadline: Duration) -> Result<(), FeatureError> {
        let backend = self.ctx.backend();
        let namespace = self.ctx.namespace().to_owned();
        let opts = WaitOptions::new(self.ctx.poll_interval(), deadline);

        let outcome = wait::converge(
            move || {
                let namespace = namespace.clone();
                async move {
                    let count = backend.pod_count(&namespace, RELAY_POD_SELECTOR).await?;
                    Ok(count == 0)
                }
            },
            opts,
            self.ctx.cancel_token(),
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
}

#[async_trait]
impl<B: ClusterBackend> FeatureController for HubbleFeature<'_, B> {
    type Desired = HubbleSpec;
    type Observed = ComponentHealth;

    fn kind(&self) -> FeatureKind {
        FeatureKind::Hubble
    }

    #[instrument(skip(self, desired), fields(ui = desired.ui))]
    async fn create(&self, desired: &HubbleSpec) -> Result<ComponentHealth, FeatureError> {
        self.apply(desired).await
    }

    async fn read(&self, _desired: &HubbleSpec) -> Result<ReadState<ComponentHealth>, FeatureError> {
        read_component(
            self.ctx,
            self.ctx.identity(FeatureKind::Hubble),
            *MAX_STATUS_WAIT,
        )
        .await
    }

    #[instrument(skip(self, desired), fields(ui = desired.ui))]
    async fn update(&self, desired: &HubbleSpec) -> Result<ComponentHealth, FeatureError> {
        self.apply(desired).await
    }

    /// Disables Hubble and waits for the relay pods to terminate, so a
    /// following uninstall never races their finalizers.
    #[instrument(skip(self, desired))]
    async fn delete(&self, desired: &HubbleSpec) -> Result<(), FeatureError> {
        let params = disable_params(self.ctx);
        self.ctx.backend().upgrade(&params).await?;
        if desired.wait {
            let deadline = desired.wait_timeout.unwrap_or(*MAX_HUBBLE_WAIT);
            self.drain_relay(deadline).await?;
        }
        Ok(())
    }
}
