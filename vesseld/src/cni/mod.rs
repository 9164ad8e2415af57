/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! CNI plugin driver.
//!
//! Plugin binaries from the configured bin directory are executed per the
//! CNI contract: configuration on stdin, identity through `CNI_*` variables,
//! result JSON on stdout. Setup runs the chain forward threading
//! `prevResult`; teardown runs it in reverse and tolerates failure.

use proto::cri::PortMapping;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

pub mod config;
pub mod watcher;

use config::NetworkConfig;

/// Interface name given to the pod-facing veth end.
const POD_INTERFACE: &str = "eth0";

pub(crate) type Result<T> = std::result::Result<T, CniError>;

#[derive(Debug, Error)]
pub enum CniError {
    #[error("cannot read cni conf '{dir}': {message}")]
    ConfDir { dir: String, message: String },
    #[error("malformed cni conf '{path}': {message}")]
    BadConfig { path: String, message: String },
    #[error("no cni network config found in '{dir}'")]
    NoNetworkConfig { dir: String },
    #[error("cni network is not ready")]
    NotReady,
    #[error("cni plugin '{plugin}' failed: {message}")]
    Plugin { plugin: String, message: String },
    #[error("cni plugin '{plugin}' returned a malformed result: {message}")]
    BadResult { plugin: String, message: String },
}

/// Inputs for one sandbox network attachment.
#[derive(Clone, Debug)]
pub struct PodNetwork<'a> {
    pub pod_name: &'a str,
    pub pod_namespace: &'a str,
    pub id: &'a str,
    pub net_ns_path: &'a str,
    pub port_mappings: &'a [PortMapping],
}

#[derive(Debug)]
pub struct Cni {
    bin_dir: PathBuf,
    conf_dir: PathBuf,
    max_conf_num: usize,
    networks: RwLock<Vec<NetworkConfig>>,
}

impl Cni {
    pub fn new(bin_dir: PathBuf, conf_dir: PathBuf, max_conf_num: usize) -> Self {
        Self {
            bin_dir,
            conf_dir,
            max_conf_num,
            networks: RwLock::new(vec![]),
        }
    }

    pub fn conf_dir(&self) -> &Path {
        &self.conf_dir
    }

    /// Reload network configurations from the conf directory. Returns true
    /// when the loaded set changed.
    pub fn reload(&self) -> Result<bool> {
        let loaded = config::load(&self.conf_dir, self.max_conf_num)?;
        let mut networks = self.networks.write().expect("cni networks lock");
        let changed = networks.len() != loaded.len()
            || networks
                .iter()
                .zip(loaded.iter())
                .any(|(a, b)| a.source != b.source || a.modified != b.modified);
        *networks = loaded;
        Ok(changed)
    }

    /// Ready iff at least one network configuration is loaded.
    pub fn status(&self) -> Result<()> {
        if self.networks.read().expect("cni networks lock").is_empty() {
            return Err(CniError::NotReady);
        }
        Ok(())
    }

    fn primary_network(&self) -> Result<NetworkConfig> {
        self.networks
            .read()
            .expect("cni networks lock")
            .first()
            .cloned()
            .ok_or(CniError::NotReady)
    }

    /// Attach the sandbox to the primary network. Returns the pod IP.
    pub async fn setup(&self, pod: &PodNetwork<'_>) -> Result<String> {
        let network = self.primary_network()?;
        let mut prev_result: Option<Value> = None;

        for plugin in &network.plugins {
            let result = self
                .invoke(&network, plugin, "ADD", pod, prev_result.take())
                .await?;
            prev_result = Some(result);
        }

        let result = prev_result.unwrap_or(Value::Null);
        parse_pod_ip(&result).ok_or_else(|| CniError::BadResult {
            plugin: network.name.clone(),
            message: format!("no pod ip in result: {result}"),
        })
    }

    /// Detach the sandbox. Plugins run in reverse; failures are logged and
    /// swallowed, teardown must not block sandbox removal.
    pub async fn teardown(&self, pod: &PodNetwork<'_>) {
        let Ok(network) = self.primary_network() else {
            warn!("cni teardown for '{}' with no loaded network", pod.id);
            return;
        };
        for plugin in network.plugins.iter().rev() {
            if let Err(e) =
                self.invoke(&network, plugin, "DEL", pod, None).await
            {
                warn!("cni teardown of '{}' failed: {e}", pod.id);
            }
        }
    }

    async fn invoke(
        &self,
        network: &NetworkConfig,
        plugin: &Value,
        command: &str,
        pod: &PodNetwork<'_>,
        prev_result: Option<Value>,
    ) -> Result<Value> {
        let plugin_type = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CniError::BadConfig {
                path: network.source.display().to_string(),
                message: "plugin without a type".to_string(),
            })?
            .to_string();

        // Per-invocation stdin: the plugin conf plus chain context.
        let mut conf = plugin.clone();
        conf["cniVersion"] = json!(network.cni_version);
        conf["name"] = json!(network.name);
        if !pod.port_mappings.is_empty() {
            conf["runtimeConfig"] = json!({
                "portMappings": pod
                    .port_mappings
                    .iter()
                    .map(|m| {
                        json!({
                            "hostPort": m.host_port,
                            "containerPort": m.container_port,
                            "protocol": protocol_name(m.protocol),
                            "hostIP": m.host_ip,
                        })
                    })
                    .collect::<Vec<_>>(),
            });
        }
        if let Some(prev) = prev_result {
            conf["prevResult"] = prev;
        }

        let cni_args = format!(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE={};K8S_POD_NAME={};K8S_POD_INFRA_CONTAINER_ID={}",
            pod.pod_namespace, pod.pod_name, pod.id
        );

        let binary = self.bin_dir.join(&plugin_type);
        debug!("cni {command} via '{}' for '{}'", binary.display(), pod.id);

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", pod.id)
            .env("CNI_NETNS", pod.net_ns_path)
            .env("CNI_IFNAME", POD_INTERFACE)
            .env("CNI_ARGS", cni_args)
            .env("CNI_PATH", &self.bin_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CniError::Plugin {
                plugin: plugin_type.clone(),
                message: format!("failed to spawn '{}': {e}", binary.display()),
            })?;

        let stdin_payload =
            serde_json::to_vec(&conf).map_err(|e| CniError::Plugin {
                plugin: plugin_type.clone(),
                message: format!("failed to encode conf: {e}"),
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&stdin_payload).await.map_err(|e| {
                CniError::Plugin {
                    plugin: plugin_type.clone(),
                    message: format!("failed to write conf: {e}"),
                }
            })?;
        }

        let output = child.wait_with_output().await.map_err(|e| {
            CniError::Plugin {
                plugin: plugin_type.clone(),
                message: e.to_string(),
            }
        })?;

        if !output.status.success() {
            // Plugins report structured errors on stdout.
            let detail = serde_json::from_slice::<Value>(&output.stdout)
                .ok()
                .and_then(|v| {
                    v.get("msg").and_then(Value::as_str).map(str::to_string)
                })
                .unwrap_or_else(|| {
                    String::from_utf8_lossy(&output.stderr).to_string()
                });
            return Err(CniError::Plugin {
                plugin: plugin_type,
                message: detail,
            });
        }

        if command == "DEL" || output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&output.stdout).map_err(|e| CniError::BadResult {
            plugin: plugin_type,
            message: e.to_string(),
        })
    }
}

fn protocol_name(protocol: i32) -> &'static str {
    match proto::cri::Protocol::try_from(protocol) {
        Ok(proto::cri::Protocol::Udp) => "udp",
        Ok(proto::cri::Protocol::Sctp) => "sctp",
        _ => "tcp",
    }
}

/// Extract the primary pod IP from a CNI result: the first IPv4 address,
/// else the first address of any family.
fn parse_pod_ip(result: &Value) -> Option<String> {
    let ips = result.get("ips")?.as_array()?;
    let strip = |address: &str| {
        address.split('/').next().unwrap_or(address).to_string()
    };
    for ip in ips {
        let address = ip.get("address").and_then(Value::as_str)?;
        let is_v4 = ip
            .get("version")
            .and_then(Value::as_str)
            .map(|v| v == "4")
            .unwrap_or_else(|| !address.contains(':'));
        if is_v4 {
            return Some(strip(address));
        }
    }
    ips.first()
        .and_then(|ip| ip.get("address").and_then(Value::as_str))
        .map(strip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pod_ip_prefers_ipv4() {
        let result = json!({
            "ips": [
                {"version": "6", "address": "fd00::5/64"},
                {"version": "4", "address": "10.88.0.5/16"},
            ],
        });
        assert_eq!(parse_pod_ip(&result), Some("10.88.0.5".to_string()));
    }

    #[test]
    fn test_parse_pod_ip_without_version_field() {
        let result = json!({
            "ips": [{"address": "10.88.0.7/16"}],
        });
        assert_eq!(parse_pod_ip(&result), Some("10.88.0.7".to_string()));
    }

    #[test]
    fn test_parse_pod_ip_missing() {
        assert_eq!(parse_pod_ip(&json!({})), None);
        assert_eq!(parse_pod_ip(&json!({"ips": []})), None);
    }

    #[test]
    fn test_status_follows_loaded_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cni = Cni::new(
            PathBuf::from("/opt/cni/bin"),
            dir.path().to_path_buf(),
            1,
        );
        assert!(matches!(cni.status(), Err(CniError::NotReady)));

        std::fs::write(
            dir.path().join("10-test.conf"),
            r#"{"cniVersion":"0.3.1","name":"testnet","type":"loopback"}"#,
        )
        .expect("write");
        assert!(cni.reload().expect("reload"));
        cni.status().expect("ready");

        // Unchanged directory reports no change.
        assert!(!cni.reload().expect("reload"));
    }
}
