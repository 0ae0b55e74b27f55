//! Single agent config keys, managed directly in the `cilium-config` map.

use async_trait::async_trait;
use derive_builder::Builder;
use tracing::{debug, instrument};

use crate::backend::ClusterBackend;
use crate::error::FeatureError;
use crate::{AGENT_WORKLOAD, CONFIG_MAP_NAME, ClusterContext, FeatureKind};

use super::{FeatureController, ReadState};

/// Desired state of one agent config key
#[derive(Builder, Debug, Clone)]
#[builder(build_fn(private, name = "build_impl"))]
pub struct ConfigKeySpec {
    /// Key in the agent config map
    #[builder(setter(into))]
    pub key: String,

    /// Value the key must hold
    #[builder(setter(into))]
    pub value: String,

    /// Whether the agent is restarted after the change so it takes effect
    #[builder(default = "true")]
    pub restart: bool,
}

impl ConfigKeySpec {
    pub fn builder() -> ConfigKeySpecBuilder {
        ConfigKeySpecBuilder::default()
    }
}

impl ConfigKeySpecBuilder {
    pub fn build(&self) -> Result<ConfigKeySpec, FeatureError> {
        let spec = self
            .build_impl()
            .map_err(|err| FeatureError::MissingRequiredConfig(err.to_string()))?;
        Ok(spec)
    }
}

/// What the config map holds for a managed key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

/// Controller for a single agent config key
pub struct ConfigFeature<'a, B> {
    ctx: &'a ClusterContext<B>,
}

impl<'a, B: ClusterBackend> ConfigFeature<'a, B> {
    pub fn new(ctx: &'a ClusterContext<B>) -> Self {
        Self { ctx }
    }

    async fn apply(&self, desired: &ConfigKeySpec) -> Result<ConfigEntry, FeatureError> {
        let backend = self.ctx.backend();
        backend
            .set_config_entry(
                self.ctx.namespace(),
                CONFIG_MAP_NAME,
                &desired.key,
                &desired.value,
            )
            .await?;
        if desired.restart {
            backend
                .restart_rollout(self.ctx.namespace(), AGENT_WORKLOAD)
                .await?;
        }
        Ok(ConfigEntry {
            key: desired.key.clone(),
            value: desired.value.clone(),
        })
    }
}

#[async_trait]
impl<B: ClusterBackend> FeatureController for ConfigFeature<'_, B> {
    type Desired = ConfigKeySpec;
    type Observed = ConfigEntry;

    fn kind(&self) -> FeatureKind {
        FeatureKind::ConfigKey
    }

    #[instrument(skip(self, desired), fields(key = %desired.key))]
    async fn create(&self, desired: &ConfigKeySpec) -> Result<ConfigEntry, FeatureError> {
        self.apply(desired).await
    }

    /// A missing map, a missing key, or a drifted value all collapse to
    /// `Absent`: the key is no longer what this record manages.
    async fn read(
        &self,
        desired: &ConfigKeySpec,
    ) -> Result<ReadState<ConfigEntry>, FeatureError> {
        let data = self
            .ctx
            .backend()
            .config_map(self.ctx.namespace(), CONFIG_MAP_NAME)
            .await?;
        let Some(data) = data else {
            return Ok(ReadState::Absent);
        };
        match data.get(&desired.key) {
            Some(value) if *value == desired.value => Ok(ReadState::Present(ConfigEntry {
                key: desired.key.clone(),
                value: value.clone(),
            })),
            Some(value) => {
                debug!(key = %desired.key, %value, "config key drifted");
                Ok(ReadState::Absent)
            }
            None => Ok(ReadState::Absent),
        }
    }

    #[instrument(skip(self, desired), fields(key = %desired.key))]
    async fn update(&self, desired: &ConfigKeySpec) -> Result<ConfigEntry, FeatureError> {
        self.apply(desired).await
    }

    #[instrument(skip(self, desired), fields(key = %desired.key))]
    async fn delete(&self, desired: &ConfigKeySpec) -> Result<(), FeatureError> {
        let backend = self.ctx.backend();
        let data = backend
            .config_map(self.ctx.namespace(), CONFIG_MAP_NAME)
            .await?;
        let present = data
            .as_ref()
            .is_some_and(|data| data.contains_key(&desired.key));
        if !present {
            // already gone
            return Ok(());
        }
        backend
            .remove_config_entry(self.ctx.namespace(), CONFIG_MAP_NAME, &desired.key)
            .await?;
        if desired.restart {
            backend
                .restart_rollout(self.ctx.namespace(), AGENT_WORKLOAD)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::backend::mock::MockBackend;

    use super::*;

    fn test_ctx(backend: MockBackend) -> ClusterContext<MockBackend> {
        ClusterContext::new(backend).with_hide_spinner(true)
    }

    fn spec(key: &str, value: &str, restart: bool) -> ConfigKeySpec {
        ConfigKeySpec::builder()
            .key(key)
            .value(value)
            .restart(restart)
            .build()
            .expect("should build")
    }

    #[test]
    fn test_spec_requires_key_and_value() {
        let err = ConfigKeySpec::builder()
            .key("debug")
            .build()
            .expect_err("missing value should reject");
        assert!(matches!(err, FeatureError::MissingRequiredConfig(_)));
    }

    #[fluvio_future::test]
    async fn test_create_sets_key_and_restarts_agent() {
        let ctx = test_ctx(MockBackend::new());

        let entry = ConfigFeature::new(&ctx)
            .create(&spec("debug", "true", true))
            .await
            .expect("create should succeed");
        assert_eq!(entry.key, "debug");
        assert_eq!(entry.value, "true");

        let calls = ctx.backend().calls();
        assert!(calls.contains(&"set_config:debug=true".to_owned()));
        assert!(
            calls.contains(&format!("restart:kube-system:{AGENT_WORKLOAD}"))
        );
    }

    #[fluvio_future::test]
    async fn test_create_without_restart_skips_rollout() {
        let ctx = test_ctx(MockBackend::new());

        ConfigFeature::new(&ctx)
            .create(&spec("debug", "true", false))
            .await
            .expect("create should succeed");

        let calls = ctx.backend().calls();
        assert!(calls.iter().all(|call| !call.starts_with("restart:")));
    }

    #[fluvio_future::test]
    async fn test_read_matches_value() {
        let backend = MockBackend::new().with_config_map(
            "kube-system",
            CONFIG_MAP_NAME,
            BTreeMap::from([("debug".to_owned(), "true".to_owned())]),
        );
        let ctx = test_ctx(backend);

        let state = ConfigFeature::new(&ctx)
            .read(&spec("debug", "true", true))
            .await
            .expect("read should succeed");
        assert_eq!(
            state.into_option(),
            Some(ConfigEntry {
                key: "debug".to_owned(),
                value: "true".to_owned(),
            })
        );
    }

    #[fluvio_future::test]
    async fn test_read_of_drifted_value_is_absent() {
        let backend = MockBackend::new().with_config_map(
            "kube-system",
            CONFIG_MAP_NAME,
            BTreeMap::from([("debug".to_owned(), "false".to_owned())]),
        );
        let ctx = test_ctx(backend);

        let state = ConfigFeature::new(&ctx)
            .read(&spec("debug", "true", true))
            .await
            .expect("read should succeed");
        assert!(state.is_absent());
    }

    #[fluvio_future::test]
    async fn test_read_of_missing_map_is_absent() {
        let ctx = test_ctx(MockBackend::new());

        let state = ConfigFeature::new(&ctx)
            .read(&spec("debug", "true", true))
            .await
            .expect("read should succeed");
        assert!(state.is_absent());
    }

    #[fluvio_future::test]
    async fn test_delete_removes_key() {
        let backend = MockBackend::new().with_config_map(
            "kube-system",
            CONFIG_MAP_NAME,
            BTreeMap::from([("debug".to_owned(), "true".to_owned())]),
        );
        let ctx = test_ctx(backend);

        ConfigFeature::new(&ctx)
            .delete(&spec("debug", "true", true))
            .await
            .expect("delete should succeed");

        let calls = ctx.backend().calls();
        assert!(calls.contains(&"remove_config:debug".to_owned()));
    }

    #[fluvio_future::test]
    async fn test_delete_of_missing_key_is_not_an_error() {
        let ctx = test_ctx(MockBackend::new());

        ConfigFeature::new(&ctx)
            .delete(&spec("debug", "true", true))
            .await
            .expect("delete of a missing key should succeed");

        let calls = ctx.backend().calls();
        assert!(calls.iter().all(|call| !call.starts_with("remove_config:")));
        assert!(calls.iter().all(|call| !call.starts_with("restart:")));
    }
}
