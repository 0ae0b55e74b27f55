//! Recording backend double used by controller and teardown tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::FeatureIdentity;
use crate::error::BackendError;

use super::{
    ApplyParams, ClusterBackend, ComponentHealth, DaemonSetPatch, DaemonSetStatus, NamespacePhase,
    ReleaseRef,
};

/// In-memory backend that records every call and replays scripted answers.
///
/// Scripted queues (`status`, `pod_count`, `namespace_phase`) are consumed
/// front to back; when a queue runs dry the default answer repeats.
pub(crate) struct MockBackend {
    calls: Mutex<Vec<String>>,
    status_script: Mutex<VecDeque<Result<ComponentHealth, BackendError>>>,
    status_default: Mutex<ComponentHealth>,
    release_version: Mutex<Option<String>>,
    release_values: Mutex<String>,
    secrets: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    pod_counts: Mutex<VecDeque<usize>>,
    namespace_phases: Mutex<VecDeque<Option<NamespacePhase>>>,
    daemonsets: Mutex<BTreeMap<String, DaemonSetStatus>>,
    config_maps: Mutex<BTreeMap<String, BTreeMap<String, String>>>,
    fail_install: Mutex<Option<BackendError>>,
    fail_upgrade: Mutex<Option<BackendError>>,
    fail_pod_count: Mutex<Option<BackendError>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            status_script: Mutex::new(VecDeque::new()),
            status_default: Mutex::new(ComponentHealth::Healthy),
            release_version: Mutex::new(None),
            release_values: Mutex::new(String::new()),
            secrets: Mutex::new(BTreeMap::new()),
            pod_counts: Mutex::new(VecDeque::new()),
            namespace_phases: Mutex::new(VecDeque::new()),
            daemonsets: Mutex::new(BTreeMap::new()),
            config_maps: Mutex::new(BTreeMap::new()),
            fail_install: Mutex::new(None),
            fail_upgrade: Mutex::new(None),
            fail_pod_count: Mutex::new(None),
        }
    }
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub(crate) fn with_release(self, version: &str, values: &str) -> Self {
        *self.release_version.lock().unwrap() = Some(version.to_owned());
        *self.release_values.lock().unwrap() = values.to_owned();
        self
    }

    pub(crate) fn with_secret(
        self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Self {
        self.secrets
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{name}"), data);
        self
    }

    pub(crate) fn with_daemonset(
        self,
        namespace: &str,
        name: &str,
        status: DaemonSetStatus,
    ) -> Self {
        self.daemonsets
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{name}"), status);
        self
    }

    pub(crate) fn with_config_map(
        self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Self {
        self.config_maps
            .lock()
            .unwrap()
            .insert(format!("{namespace}/{name}"), data);
        self
    }

    pub(crate) fn script_status(
        self,
        answers: Vec<Result<ComponentHealth, BackendError>>,
    ) -> Self {
        self.status_script.lock().unwrap().extend(answers);
        self
    }

    pub(crate) fn default_status(self, health: ComponentHealth) -> Self {
        *self.status_default.lock().unwrap() = health;
        self
    }

    pub(crate) fn script_pod_counts(self, counts: Vec<usize>) -> Self {
        self.pod_counts.lock().unwrap().extend(counts);
        self
    }

    pub(crate) fn script_namespace_phases(self, phases: Vec<Option<NamespacePhase>>) -> Self {
        self.namespace_phases.lock().unwrap().extend(phases);
        self
    }

    pub(crate) fn fail_next_install(self, err: BackendError) -> Self {
        *self.fail_install.lock().unwrap() = Some(err);
        self
    }

    pub(crate) fn fail_next_upgrade(self, err: BackendError) -> Self {
        *self.fail_upgrade.lock().unwrap() = Some(err);
        self
    }

    pub(crate) fn fail_next_pod_count(self, err: BackendError) -> Self {
        *self.fail_pod_count.lock().unwrap() = Some(err);
        self
    }

    fn apply_summary(prefix: &str, params: &ApplyParams) -> String {
        let merge = params.merge.as_flag().unwrap_or("default");
        let mut sets: Vec<String> = params
            .set_values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        sets.sort();
        format!("{prefix}:{}:{merge}:{}", params.release.name, sets.join(","))
    }
}

#[async_trait]
impl ClusterBackend for MockBackend {
    async fn install(&self, params: &ApplyParams) -> Result<(), BackendError> {
        self.record(Self::apply_summary("install", params));
        if let Some(err) = self.fail_install.lock().unwrap().take() {
            return Err(err);
        }
        Ok(())
    }

    async fn upgrade(&self, params: &ApplyParams) -> Result<(), BackendError> {
        self.record(Self::apply_summary("upgrade", params));
        if let Some(err) = self.fail_upgrade.lock().unwrap().take() {
            return Err(err);
        }
        Ok(())
    }

    async fn uninstall(&self, release: &ReleaseRef) -> Result<(), BackendError> {
        self.record(format!("uninstall:{}", release.name));
        Ok(())
    }

    async fn status(&self, id: &FeatureIdentity) -> Result<ComponentHealth, BackendError> {
        self.record(format!("status:{}", id.kind));
        if let Some(answer) = self.status_script.lock().unwrap().pop_front() {
            return answer;
        }
        Ok(self.status_default.lock().unwrap().clone())
    }

    async fn release_values(&self, release: &ReleaseRef) -> Result<String, BackendError> {
        self.record(format!("release_values:{}", release.name));
        Ok(self.release_values.lock().unwrap().clone())
    }

    async fn release_version(&self, release: &ReleaseRef) -> Result<String, BackendError> {
        self.record(format!("release_version:{}", release.name));
        self.release_version
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BackendError::not_found(format!("release {}", release.name)))
    }

    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, BackendError> {
        self.record(format!("secret:{namespace}/{name}"));
        Ok(self
            .secrets
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned())
    }

    async fn pod_count(&self, namespace: &str, selector: &str) -> Result<usize, BackendError> {
        self.record(format!("pods:{namespace}:{selector}"));
        if let Some(err) = self.fail_pod_count.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.pod_counts.lock().unwrap().pop_front().unwrap_or(0))
    }

    async fn namespace_phase(
        &self,
        namespace: &str,
    ) -> Result<Option<NamespacePhase>, BackendError> {
        self.record(format!("namespace_phase:{namespace}"));
        Ok(self
            .namespace_phases
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(None))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), BackendError> {
        self.record(format!("delete_namespace:{namespace}"));
        Ok(())
    }

    async fn daemonset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaemonSetStatus>, BackendError> {
        self.record(format!("daemonset:{namespace}/{name}"));
        Ok(self
            .daemonsets
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .copied())
    }

    async fn patch_daemonset(
        &self,
        namespace: &str,
        name: &str,
        patch: DaemonSetPatch,
    ) -> Result<(), BackendError> {
        self.record(format!("patch_daemonset:{namespace}/{name}:{patch:?}"));
        Ok(())
    }

    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, BackendError> {
        self.record(format!("config_map:{namespace}/{name}"));
        Ok(self
            .config_maps
            .lock()
            .unwrap()
            .get(&format!("{namespace}/{name}"))
            .cloned())
    }

    async fn set_config_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), BackendError> {
        self.record(format!("set_config:{key}={value}"));
        self.config_maps
            .lock()
            .unwrap()
            .entry(format!("{namespace}/{name}"))
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn remove_config_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), BackendError> {
        self.record(format!("remove_config:{key}"));
        let mut maps = self.config_maps.lock().unwrap();
        if let Some(data) = maps.get_mut(&format!("{namespace}/{name}")) {
            data.remove(key);
        }
        Ok(())
    }

    async fn restart_rollout(&self, namespace: &str, workload: &str) -> Result<(), BackendError> {
        self.record(format!("restart:{namespace}:{workload}"));
        Ok(())
    }
}
