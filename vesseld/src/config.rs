/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Daemon configuration.
//!
//! Loaded from a TOML file, with flag overrides applied by the binary. A
//! second per-namespace `config.toml` under the root directory is merged on
//! top when the daemon serves a namespace other than the default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The engine namespace kubelets conventionally use.
pub const DEFAULT_NAMESPACE: &str = "k8s.io";

pub(crate) type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config '{path}': {source}")]
    Read { path: String, source: std::io::Error },
    #[error("malformed config '{path}': {source}")]
    Parse { path: String, source: toml::de::Error },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine gRPC socket.
    pub socket_path: PathBuf,
    /// Namespace every engine request is scoped to.
    pub namespace: String,
    /// Snapshotter hosting image layers and container rootfs.
    pub snapshotter: String,
    /// Engine state root, used to report the image filesystem path.
    pub root_dir: PathBuf,
    /// OCI runtime the engine launches tasks with.
    pub runtime_type: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/containerd/containerd.sock"),
            namespace: DEFAULT_NAMESPACE.to_string(),
            snapshotter: "overlayfs".to_string(),
            root_dir: PathBuf::from("/var/lib/containerd"),
            runtime_type: "io.containerd.runc.v2".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Persistent state: sandbox and container directories.
    pub root_dir: PathBuf,
    /// Ephemeral state: sockets and stdio FIFOs.
    pub state_dir: PathBuf,
    /// CRI socket served to the kubelet.
    pub socket_path: PathBuf,
    /// Optional TCP listener, only bound when `disable_tcp_service` is off.
    pub tcp_server_address: String,
    pub disable_tcp_service: bool,
    pub stream_server_address: String,
    pub stream_server_port: u16,
    pub stream_idle_timeout_secs: u64,
    pub stats_collect_period_secs: u64,
    pub sandbox_image: String,
    pub max_container_log_line_size: usize,
    pub max_concurrent_pulls: usize,
    pub enable_selinux: bool,
    pub disable_cgroup: bool,
    pub restrict_oom_score_adj: bool,
    pub network_plugin_bin_dir: PathBuf,
    pub network_plugin_conf_dir: PathBuf,
    pub network_plugin_max_conf_num: usize,
    /// Conf template rendered with the pod CIDR from the kubelet; empty
    /// disables template handling.
    pub network_plugin_conf_template: String,
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/vesseld"),
            state_dir: PathBuf::from("/run/vesseld"),
            socket_path: PathBuf::from("/run/vesseld/vesseld.sock"),
            tcp_server_address: "127.0.0.1:10010".to_string(),
            disable_tcp_service: true,
            stream_server_address: "127.0.0.1".to_string(),
            stream_server_port: 0,
            stream_idle_timeout_secs: 4 * 60 * 60,
            stats_collect_period_secs: 10,
            sandbox_image: "registry.k8s.io/pause:3.9".to_string(),
            max_container_log_line_size: 16 * 1024,
            max_concurrent_pulls: 3,
            enable_selinux: false,
            disable_cgroup: false,
            restrict_oom_score_adj: false,
            network_plugin_bin_dir: PathBuf::from("/opt/cni/bin"),
            network_plugin_conf_dir: PathBuf::from("/etc/cni/net.d"),
            network_plugin_max_conf_num: 1,
            network_plugin_conf_template: String::new(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Load from `path` on top of the defaults, then merge the
    /// per-namespace override file if one exists for a non-default
    /// namespace.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut value = toml::Table::new();
        if let Some(path) = path {
            value = read_table(path)?;
        }

        let config: Config = parse_table(path, value.clone())?;
        if config.engine.namespace == DEFAULT_NAMESPACE {
            return Ok(config);
        }

        let override_path = config
            .namespace_root()
            .join("config.toml");
        if !override_path.exists() {
            return Ok(config);
        }
        let overrides = read_table(&override_path)?;
        let merged = merge_tables(value, overrides);
        parse_table(Some(&override_path), merged)
    }

    fn namespace_root(&self) -> PathBuf {
        self.root_dir.join("namespaces").join(&self.engine.namespace)
    }

    pub fn sandbox_root(&self, id: &str) -> PathBuf {
        self.root_dir.join("sandboxes").join(id)
    }

    pub fn sandbox_hosts_path(&self, id: &str) -> PathBuf {
        self.sandbox_root(id).join("hosts")
    }

    pub fn sandbox_resolv_path(&self, id: &str) -> PathBuf {
        self.sandbox_root(id).join("resolv.conf")
    }

    pub fn sandbox_shm_path(&self, id: &str) -> PathBuf {
        self.sandbox_root(id).join("shm")
    }

    pub fn container_root(&self, id: &str) -> PathBuf {
        self.root_dir.join("containers").join(id)
    }

    /// Scratch directory for exec session stdio.
    pub fn container_exec_dir(&self, id: &str) -> PathBuf {
        self.container_root(id).join("exec")
    }

    /// Directory holding the stdio FIFOs of a container task.
    pub fn container_io_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join("io").join(id)
    }

    pub fn netns_dir(&self) -> PathBuf {
        PathBuf::from(crate::netns::NETNS_RUN_DIR)
    }

    /// Mountpoint of the image filesystem: the snapshotter root inside the
    /// engine state directory.
    pub fn image_fs_path(&self) -> PathBuf {
        self.engine.root_dir.join(format!(
            "io.containerd.snapshotter.v1.{}",
            self.engine.snapshotter
        ))
    }
}

fn read_table(path: &Path) -> Result<toml::Table> {
    let content =
        std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    content.parse::<toml::Table>().map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

fn parse_table(path: Option<&Path>, table: toml::Table) -> Result<Config> {
    toml::Value::Table(table).try_into().map_err(|source| ConfigError::Parse {
        path: path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<defaults>".to_string()),
        source,
    })
}

/// Right-biased recursive table merge.
fn merge_tables(mut base: toml::Table, overrides: toml::Table) -> toml::Table {
    for (key, value) in overrides {
        match (base.get_mut(&key), value) {
            (
                Some(toml::Value::Table(base_table)),
                toml::Value::Table(override_table),
            ) => {
                let merged =
                    merge_tables(base_table.clone(), override_table);
                let _ = base.insert(key, toml::Value::Table(merged));
            }
            (_, value) => {
                let _ = base.insert(key, value);
            }
        }
    }
    base
}
