//! Ordered feature teardown.
//!
//! Uninstalling the Cilium release while dependents (Hubble relay, test
//! workloads) are still running wedges their finalizers. A [`TeardownPlan`]
//! makes the ordering explicit: dependent steps run and drain first, the
//! release uninstall is always last, and the whole run shares one deadline.

use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::backend::{ApplyParams, ClusterBackend, ReleaseRef};
use crate::error::TeardownError;
use crate::wait::{self, WaitOptions};
use crate::{ClusterContext, RELAY_POD_SELECTOR, TEST_NAMESPACE};

/// What one teardown step does to the cluster
#[derive(Debug, Clone)]
pub enum TeardownAction {
    /// Turn a dependent feature off via a chart upgrade
    Disable(ApplyParams),
    /// Delete a whole namespace
    DeleteNamespace(String),
    /// Uninstall the release everything else depends on
    Uninstall(ReleaseRef),
}

/// Observable condition a step must reach before the next step may run
#[derive(Debug, Clone)]
pub enum DrainCondition {
    /// No pods matching the selector remain
    PodsGone { namespace: String, selector: String },
    /// The namespace is fully gone, not merely terminating
    NamespaceTerminated(String),
}

/// One step of a teardown plan
#[derive(Debug, Clone)]
pub struct TeardownStep {
    label: String,
    action: TeardownAction,
    precondition: Option<DrainCondition>,
}

impl TeardownStep {
    pub fn new(label: impl Into<String>, action: TeardownAction) -> Self {
        Self {
            label: label.into(),
            action,
            precondition: None,
        }
    }

    /// Requires `condition` to hold before the step after this one runs
    pub fn drain(mut self, condition: DrainCondition) -> Self {
        self.precondition = Some(condition);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// A validated, ordered list of teardown steps.
///
/// Construction enforces the one structural rule: exactly one uninstall step,
/// and it comes last. A plan that violates this cannot be built, so it can
/// never be executed.
#[derive(Debug, Clone)]
pub struct TeardownPlan {
    steps: Vec<TeardownStep>,
}

impl TeardownPlan {
    pub fn new(dependents: Vec<TeardownStep>, root: TeardownStep) -> Result<Self, TeardownError> {
        if !matches!(root.action, TeardownAction::Uninstall(_)) {
            return Err(TeardownError::InvalidPlan(
                "final step must uninstall the release".into(),
            ));
        }
        if let Some(step) = dependents
            .iter()
            .find(|step| matches!(step.action, TeardownAction::Uninstall(_)))
        {
            return Err(TeardownError::InvalidPlan(format!(
                "step '{}' uninstalls the release before dependents are drained",
                step.label
            )));
        }
        let mut steps = dependents;
        steps.push(root);
        Ok(Self { steps })
    }

    /// The standard plan for removing a Cilium release: disable Hubble and
    /// drain its relay pods, delete the connectivity-test namespace and wait
    /// for it to terminate, then uninstall.
    ///
    /// With `drain` false the disable and wait phases are skipped and only
    /// the destructive steps remain.
    pub fn base_uninstall(
        release: ReleaseRef,
        hubble_disable: ApplyParams,
        drain: bool,
    ) -> Self {
        let mut dependents = Vec::new();
        if drain {
            dependents.push(
                TeardownStep::new("disable hubble", TeardownAction::Disable(hubble_disable))
                    .drain(DrainCondition::PodsGone {
                        namespace: release.namespace.clone(),
                        selector: RELAY_POD_SELECTOR.to_owned(),
                    }),
            );
        }
        let mut delete_ns = TeardownStep::new(
            "delete connectivity test namespace",
            TeardownAction::DeleteNamespace(TEST_NAMESPACE.to_owned()),
        );
        if drain {
            delete_ns = delete_ns.drain(DrainCondition::NamespaceTerminated(
                TEST_NAMESPACE.to_owned(),
            ));
        }
        dependents.push(delete_ns);

        let root = TeardownStep::new("uninstall release", TeardownAction::Uninstall(release));
        // ordering is ours, so the validation cannot fail here
        Self {
            steps: {
                let mut steps = dependents;
                steps.push(root);
                steps
            },
        }
    }

    pub fn steps(&self) -> &[TeardownStep] {
        &self.steps
    }
}

/// Executes a [`TeardownPlan`] against one cluster.
///
/// Steps run strictly in order. After each step's action, its drain
/// precondition (if any) is polled with whatever remains of the shared
/// deadline; a failed action or an exhausted deadline aborts the run with
/// every later step untouched.
pub struct Teardown<'a, B> {
    ctx: &'a ClusterContext<B>,
}

impl<'a, B: ClusterBackend> Teardown<'a, B> {
    pub fn new(ctx: &'a ClusterContext<B>) -> Self {
        Self { ctx }
    }

    #[instrument(skip(self, plan), fields(steps = plan.steps().len()))]
    pub async fn run(&self, plan: &TeardownPlan, deadline: Duration) -> Result<(), TeardownError> {
        let pb = self.ctx.pb_factory().create()?;
        let backend = self.ctx.backend();
        let started = Instant::now();

        for step in plan.steps() {
            pb.set_message(format!("🗑️  {}", step.label));
            debug!(step = %step.label, "running teardown step");

            match &step.action {
                TeardownAction::Disable(params) => {
                    backend
                        .upgrade(params)
                        .await
                        .map_err(|source| TeardownError::StepFailed {
                            step: step.label.clone(),
                            source,
                        })?;
                }
                TeardownAction::DeleteNamespace(namespace) => {
                    backend.delete_namespace(namespace).await.map_err(|source| {
                        TeardownError::StepFailed {
                            step: step.label.clone(),
                            source,
                        }
                    })?;
                }
                TeardownAction::Uninstall(release) => {
                    backend
                        .uninstall(release)
                        .await
                        .map_err(|source| TeardownError::StepFailed {
                            step: step.label.clone(),
                            source,
                        })?;
                }
            }

            if let Some(condition) = &step.precondition {
                let remaining = deadline.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(TeardownError::DrainTimeout {
                        step: step.label.clone(),
                        elapsed: started.elapsed(),
                    });
                }
                self.await_drained(step, condition, remaining).await?;
            }
            pb.println(format!("✅ {}", step.label));
        }

        pb.finish_and_clear();
        Ok(())
    }

    async fn await_drained(
        &self,
        step: &TeardownStep,
        condition: &DrainCondition,
        remaining: Duration,
    ) -> Result<(), TeardownError> {
        let backend = self.ctx.backend();
        let opts = WaitOptions::new(self.ctx.poll_interval(), remaining);

        let outcome = wait::converge(
            move || {
                let condition = condition.clone();
                async move {
                    match condition {
                        DrainCondition::PodsGone {
                            namespace,
                            selector,
                        } => {
                            let count = backend.pod_count(&namespace, &selector).await?;
                            Ok(count == 0)
                        }
                        DrainCondition::NamespaceTerminated(namespace) => {
                            let phase = backend.namespace_phase(&namespace).await?;
                            Ok(phase.is_none())
                        }
                    }
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
            return Err(TeardownError::Cancelled);
        }
        if let Some(err) = outcome.last_error {
            if !err.is_retryable() {
                return Err(TeardownError::StepFailed {
                    step: step.label.clone(),
                    source: err,
                });
            }
        }
        Err(TeardownError::DrainTimeout {
            step: step.label.clone(),
            elapsed: outcome.elapsed,
        })
    }
}
