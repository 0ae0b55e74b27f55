//! Production backend: helm releases through `fluvio_helm`, everything else
//! through `kubectl` subprocesses.

use std::collections::BTreeMap;
use std::io::Write;
use std::process::Command;

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, instrument};

use fluvio_command::CommandExt;
use fluvio_helm::{HelmClient, InstallArg, UninstallArg};

use async_trait::async_trait;

use crate::FeatureIdentity;
use crate::FeatureKind;
use crate::error::BackendError;

use super::{
    ApplyParams, ClusterBackend, ComponentHealth, DaemonSetPatch, DaemonSetStatus, NamespacePhase,
    ReleaseRef,
};

const AGENT_DAEMONSET: &str = "cilium";
const OPERATOR_DEPLOYMENT: &str = "cilium-operator";
const MESH_DEPLOYMENT: &str = "clustermesh-apiserver";
const RELAY_DEPLOYMENT: &str = "hubble-relay";
const KUBE_PROXY_DAEMONSET: &str = "kube-proxy";

/// One entry of `helm list --output json`
#[derive(Debug, serde::Deserialize)]
struct ReleaseListItem {
    name: String,
    app_version: String,
}

const PIN_PATCH: &str = r#"{"spec":{"template":{"spec":{"nodeSelector":{"non-existing":"true"}}}}}"#;
const UNPIN_PATCH: &str = r#"[{"op":"remove","path":"/spec/template/spec/nodeSelector/non-existing"}]"#;

/// Talks to the cluster selected by the ambient kubeconfig
#[derive(Debug)]
pub struct HelmBackend {
    helm_client: HelmClient,
}

impl HelmBackend {
    pub fn new() -> Result<Self, BackendError> {
        let helm_client = HelmClient::new()?;
        Ok(Self { helm_client })
    }

    /// Registers the chart repository so `<alias>/<chart>` references resolve
    fn ensure_repo(&self, params: &ApplyParams) -> Result<(), BackendError> {
        let Some((alias, _)) = params.chart.split_once('/') else {
            // local or OCI chart reference, nothing to register
            return Ok(());
        };
        let mut cmd = Command::new("helm");
        cmd.arg("repo");
        cmd.arg("add");
        cmd.arg("--force-update");
        cmd.arg(alias);
        cmd.arg(&params.repository);
        cmd.result()?;
        Ok(())
    }

    /// Writes inline values YAML to a temp file helm can read.
    ///
    /// The file must stay alive until the helm invocation returns.
    fn values_file(&self, params: &ApplyParams) -> Result<Option<NamedTempFile>, BackendError> {
        let Some(yaml) = params.values_yaml.as_deref() else {
            return Ok(None);
        };
        // reject malformed YAML here, before helm produces a cryptic error
        serde_yaml::from_str::<serde_yaml::Value>(yaml)
            .map_err(|err| BackendError::Rejected(format!("invalid values YAML: {err}")))?;
        let mut file = NamedTempFile::new()?;
        file.write_all(yaml.as_bytes())?;
        Ok(Some(file))
    }

    /// Runs a read-only `kubectl` query, returning stdout.
    ///
    /// Failures on the read path are classified transient: the poll loops
    /// retry them, and anything persistent surfaces as a timeout with this
    /// error attached.
    fn kubectl_read(&self, args: &[&str]) -> Result<String, BackendError> {
        let mut cmd = Command::new("kubectl");
        cmd.args(args);
        match cmd.result() {
            Ok(output) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Err(err) => Err(BackendError::Transient(err.to_string())),
        }
    }

    /// Runs a mutating `kubectl` command. Failures here are final.
    fn kubectl_write(&self, args: &[&str]) -> Result<(), BackendError> {
        let mut cmd = Command::new("kubectl");
        cmd.args(args);
        cmd.result()?;
        Ok(())
    }

    /// `kubectl get ... --ignore-not-found -o json`, `None` on empty output
    fn get_json(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
    ) -> Result<Option<Value>, BackendError> {
        let out = self.kubectl_read(&[
            "get",
            kind,
            name,
            "--namespace",
            namespace,
            "--ignore-not-found",
            "--output",
            "json",
        ])?;
        if out.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&out)?;
        Ok(Some(value))
    }

    fn deployment_health(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ComponentHealth, BackendError> {
        let Some(value) = self.get_json(namespace, "deployment", name)? else {
            return Ok(ComponentHealth::Absent);
        };
        let available = value["status"]["availableReplicas"].as_u64().unwrap_or(0);
        if available > 0 {
            Ok(ComponentHealth::Healthy)
        } else {
            Ok(ComponentHealth::Converging)
        }
    }

    fn daemonset_health(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ComponentHealth, BackendError> {
        let Some(status) = self.daemonset_status(namespace, name)? else {
            return Ok(ComponentHealth::Absent);
        };
        if status.desired > 0 && status.ready == status.desired {
            Ok(ComponentHealth::Healthy)
        } else {
            Ok(ComponentHealth::Converging)
        }
    }

    fn daemonset_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaemonSetStatus>, BackendError> {
        let Some(value) = self.get_json(namespace, "daemonset", name)? else {
            return Ok(None);
        };
        let desired = value["status"]["desiredNumberScheduled"]
            .as_u64()
            .unwrap_or(0) as u32;
        let ready = value["status"]["numberReady"].as_u64().unwrap_or(0) as u32;
        Ok(Some(DaemonSetStatus { desired, ready }))
    }

    fn data_map(value: &Value) -> BTreeMap<String, String> {
        match value.get("data") {
            Some(data) => serde_json::from_value(data.clone()).unwrap_or_default(),
            None => BTreeMap::new(),
        }
    }
}

#[async_trait]
impl ClusterBackend for HelmBackend {
    #[instrument(skip(self, params), fields(release = %params.release.name))]
    async fn install(&self, params: &ApplyParams) -> Result<(), BackendError> {
        self.ensure_repo(params)?;
        let values_file = self.values_file(params)?;

        let mut args = InstallArg::new(&params.release.name, &params.chart)
            .namespace(&params.release.namespace)
            .opts(params.set_values.clone());
        if let Some(file) = &values_file {
            args = args.values(vec![file.path().to_path_buf()]);
        }
        args = if let Some(version) = &params.version {
            args.version(version.to_string())
        } else {
            args
        };

        self.helm_client.install(&args)?;
        debug!(chart = %params.chart, "chart installed");
        Ok(())
    }

    /// Upgrades go through the helm CLI directly: the merge-mode flags are
    /// not exposed by the helm client crate.
    #[instrument(skip(self, params), fields(release = %params.release.name))]
    async fn upgrade(&self, params: &ApplyParams) -> Result<(), BackendError> {
        self.ensure_repo(params)?;
        let values_file = self.values_file(params)?;

        let mut cmd = Command::new("helm");
        cmd.arg("upgrade");
        cmd.arg(&params.release.name);
        cmd.arg(&params.chart);
        cmd.arg("--namespace");
        cmd.arg(&params.release.namespace);
        if let Some(version) = &params.version {
            cmd.arg("--version");
            cmd.arg(version.to_string());
        }
        if let Some(flag) = params.merge.as_flag() {
            cmd.arg(flag);
        }
        for (key, value) in &params.set_values {
            cmd.arg("--set");
            cmd.arg(format!("{key}={value}"));
        }
        if let Some(file) = &values_file {
            cmd.arg("--values");
            cmd.arg(file.path());
        }
        cmd.result()?;
        debug!(chart = %params.chart, "chart upgraded");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn uninstall(&self, release: &ReleaseRef) -> Result<(), BackendError> {
        let uninstall = UninstallArg::new(release.name.to_owned())
            .namespace(release.namespace.to_owned())
            .ignore_not_found();
        self.helm_client.uninstall(uninstall)?;
        Ok(())
    }

    async fn status(&self, id: &FeatureIdentity) -> Result<ComponentHealth, BackendError> {
        match id.kind {
            FeatureKind::Install => {
                match self.daemonset_health(&id.namespace, AGENT_DAEMONSET)? {
                    ComponentHealth::Healthy => {
                        // agent pods up; the operator must be available too
                        match self.deployment_health(&id.namespace, OPERATOR_DEPLOYMENT)? {
                            ComponentHealth::Healthy => Ok(ComponentHealth::Healthy),
                            _ => Ok(ComponentHealth::Converging),
                        }
                    }
                    other => Ok(other),
                }
            }
            FeatureKind::ClusterMeshEnable | FeatureKind::ClusterMeshConnect => {
                self.deployment_health(&id.namespace, MESH_DEPLOYMENT)
            }
            FeatureKind::Hubble => self.deployment_health(&id.namespace, RELAY_DEPLOYMENT),
            FeatureKind::ConfigKey => {
                let present = self
                    .config_map(&id.namespace, crate::CONFIG_MAP_NAME)
                    .await?
                    .is_some();
                if present {
                    Ok(ComponentHealth::Healthy)
                } else {
                    Ok(ComponentHealth::Absent)
                }
            }
            FeatureKind::KubeProxyFree => {
                match self.daemonset_status(&id.namespace, KUBE_PROXY_DAEMONSET)? {
                    None => Ok(ComponentHealth::Absent),
                    Some(status) if status.ready == 0 => Ok(ComponentHealth::Healthy),
                    Some(_) => Ok(ComponentHealth::Converging),
                }
            }
        }
    }

    async fn release_values(&self, release: &ReleaseRef) -> Result<String, BackendError> {
        let mut cmd = Command::new("helm");
        cmd.args([
            "get",
            "values",
            &release.name,
            "--namespace",
            &release.namespace,
            "--output",
            "yaml",
        ]);
        match cmd.result() {
            Ok(output) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Err(err) => Err(BackendError::Transient(err.to_string())),
        }
    }

    async fn release_version(&self, release: &ReleaseRef) -> Result<String, BackendError> {
        let mut cmd = Command::new("helm");
        cmd.args([
            "list",
            "--namespace",
            &release.namespace,
            "--filter",
            &format!("^{}$", release.name),
            "--output",
            "json",
        ]);
        let out = match cmd.result() {
            Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(err) => return Err(BackendError::Transient(err.to_string())),
        };
        let releases: Vec<ReleaseListItem> = serde_json::from_str(&out)?;
        let Some(entry) = releases.into_iter().find(|item| item.name == release.name) else {
            return Err(BackendError::not_found(format!(
                "release {}",
                release.name
            )));
        };
        Ok(entry.app_version)
    }

    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, BackendError> {
        let Some(value) = self.get_json(namespace, "secret", name)? else {
            return Ok(None);
        };
        Ok(Some(Self::data_map(&value)))
    }

    async fn pod_count(&self, namespace: &str, selector: &str) -> Result<usize, BackendError> {
        let out = self.kubectl_read(&[
            "get",
            "pods",
            "--namespace",
            namespace,
            "--selector",
            selector,
            "--output",
            "json",
        ])?;
        let value: Value = serde_json::from_str(&out)?;
        let count = value["items"].as_array().map(|items| items.len()).unwrap_or(0);
        Ok(count)
    }

    async fn namespace_phase(
        &self,
        namespace: &str,
    ) -> Result<Option<NamespacePhase>, BackendError> {
        let out = self.kubectl_read(&[
            "get",
            "namespace",
            namespace,
            "--ignore-not-found",
            "--output",
            "json",
        ])?;
        if out.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&out)?;
        let phase = match value["status"]["phase"].as_str() {
            Some("Terminating") => NamespacePhase::Terminating,
            _ => NamespacePhase::Active,
        };
        Ok(Some(phase))
    }

    async fn delete_namespace(&self, namespace: &str) -> Result<(), BackendError> {
        self.kubectl_write(&[
            "delete",
            "namespace",
            namespace,
            "--ignore-not-found=true",
            "--wait=false",
        ])
    }

    async fn daemonset(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DaemonSetStatus>, BackendError> {
        self.daemonset_status(namespace, name)
    }

    async fn patch_daemonset(
        &self,
        namespace: &str,
        name: &str,
        patch: DaemonSetPatch,
    ) -> Result<(), BackendError> {
        match patch {
            DaemonSetPatch::PinToNonExistingNode => self.kubectl_write(&[
                "patch",
                "daemonset",
                name,
                "--namespace",
                namespace,
                "--type",
                "strategic",
                "--patch",
                PIN_PATCH,
            ]),
            DaemonSetPatch::ClearNodeSelector => self.kubectl_write(&[
                "patch",
                "daemonset",
                name,
                "--namespace",
                namespace,
                "--type",
                "json",
                "--patch",
                UNPIN_PATCH,
            ]),
        }
    }

    async fn config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, BackendError> {
        let Some(value) = self.get_json(namespace, "configmap", name)? else {
            return Ok(None);
        };
        Ok(Some(Self::data_map(&value)))
    }

    async fn set_config_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), BackendError> {
        let patch = serde_json::json!({ "data": { key: value } }).to_string();
        self.kubectl_write(&[
            "patch",
            "configmap",
            name,
            "--namespace",
            namespace,
            "--type",
            "merge",
            "--patch",
            &patch,
        ])
    }

    async fn remove_config_entry(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<(), BackendError> {
        // JSON-pointer escaping for the key segment
        let escaped = key.replace('~', "~0").replace('/', "~1");
        let patch = format!(r#"[{{"op":"remove","path":"/data/{escaped}"}}]"#);
        self.kubectl_write(&[
            "patch",
            "configmap",
            name,
            "--namespace",
            namespace,
            "--type",
            "json",
            "--patch",
            &patch,
        ])
    }

    async fn restart_rollout(&self, namespace: &str, workload: &str) -> Result<(), BackendError> {
        self.kubectl_write(&["rollout", "restart", workload, "--namespace", namespace])
    }
}
