/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! CNI network configuration loading.

use super::{CniError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// File name used when rendering the conf template on pod CIDR updates.
pub const RENDERED_CONF_NAME: &str = "10-vessel.conflist";

/// A loaded network configuration: an ordered plugin chain plus enough
/// provenance to detect staleness.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub name: String,
    pub cni_version: String,
    pub plugins: Vec<Value>,
    pub source: PathBuf,
    pub modified: Option<SystemTime>,
}

/// Load the highest-priority network configurations from `conf_dir`.
/// Files sort lexicographically, `.conflist` and `.conf`/`.json` alike, and
/// at most `max_conf_num` configurations are returned.
pub fn load(conf_dir: &Path, max_conf_num: usize) -> Result<Vec<NetworkConfig>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(conf_dir)
        .map_err(|e| CniError::ConfDir {
            dir: conf_dir.display().to_string(),
            message: e.to_string(),
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("conf") | Some("conflist") | Some("json")
            )
        })
        .collect();
    paths.sort();

    let mut configs = Vec::new();
    for path in paths {
        if configs.len() >= max_conf_num {
            break;
        }
        match parse_file(&path) {
            Ok(config) => configs.push(config),
            Err(e) => {
                tracing::warn!("skipping cni conf '{}': {e}", path.display());
            }
        }
    }
    if configs.is_empty() {
        return Err(CniError::NoNetworkConfig {
            dir: conf_dir.display().to_string(),
        });
    }
    Ok(configs)
}

fn parse_file(path: &Path) -> Result<NetworkConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CniError::ConfDir {
        dir: path.display().to_string(),
        message: e.to_string(),
    })?;
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    let value: Value =
        serde_json::from_str(&content).map_err(|e| CniError::BadConfig {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    let name = value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_string();
    let cni_version = value
        .get("cniVersion")
        .and_then(Value::as_str)
        .unwrap_or("0.3.1")
        .to_string();

    let plugins = if path.extension().and_then(|e| e.to_str()) == Some("conflist")
    {
        value
            .get("plugins")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| CniError::BadConfig {
                path: path.display().to_string(),
                message: "conflist without a plugins array".to_string(),
            })?
    } else {
        // A bare conf is a chain of one.
        vec![value]
    };
    if plugins.is_empty() {
        return Err(CniError::BadConfig {
            path: path.display().to_string(),
            message: "empty plugin chain".to_string(),
        });
    }

    Ok(NetworkConfig {
        name,
        cni_version,
        plugins,
        source: path.to_path_buf(),
        modified,
    })
}

/// Render the configured conf template with the kubelet-provided pod CIDR
/// and install it into the conf directory.
pub fn render_template(
    template_path: &Path,
    conf_dir: &Path,
    pod_cidr: &str,
) -> Result<PathBuf> {
    let template =
        std::fs::read_to_string(template_path).map_err(|e| CniError::ConfDir {
            dir: template_path.display().to_string(),
            message: e.to_string(),
        })?;
    let rendered = template.replace("{{.PodCIDR}}", pod_cidr);
    let target = conf_dir.join(RENDERED_CONF_NAME);
    std::fs::create_dir_all(conf_dir).map_err(|e| CniError::ConfDir {
        dir: conf_dir.display().to_string(),
        message: e.to_string(),
    })?;
    std::fs::write(&target, rendered).map_err(|e| CniError::ConfDir {
        dir: target.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_prefers_lexicographic_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("20-b.conf"),
            r#"{"cniVersion":"0.3.1","name":"b","type":"bridge"}"#,
        )
        .expect("write");
        std::fs::write(
            dir.path().join("10-a.conflist"),
            r#"{"cniVersion":"0.4.0","name":"a","plugins":[{"type":"bridge"},{"type":"portmap"}]}"#,
        )
        .expect("write");

        let configs = load(dir.path(), 1).expect("load");
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "a");
        assert_eq!(configs[0].cni_version, "0.4.0");
        assert_eq!(configs[0].plugins.len(), 2);
    }

    #[test]
    fn test_load_wraps_bare_conf() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("10-a.conf"),
            r#"{"cniVersion":"0.3.1","name":"single","type":"bridge"}"#,
        )
        .expect("write");

        let configs = load(dir.path(), 1).expect("load");
        assert_eq!(configs[0].plugins.len(), 1);
        assert_eq!(configs[0].plugins[0]["type"], "bridge");
    }

    #[test]
    fn test_load_empty_dir_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            load(dir.path(), 1),
            Err(CniError::NoNetworkConfig { .. })
        ));
    }

    #[test]
    fn test_load_skips_malformed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("10-bad.conf"), "not json").expect("write");
        std::fs::write(
            dir.path().join("20-good.conf"),
            r#"{"cniVersion":"0.3.1","name":"good","type":"bridge"}"#,
        )
        .expect("write");

        let configs = load(dir.path(), 1).expect("load");
        assert_eq!(configs[0].name, "good");
    }

    #[test]
    fn test_render_template_substitutes_pod_cidr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join("template.conflist");
        std::fs::write(
            &template,
            r#"{"cniVersion":"0.3.1","name":"pod","plugins":[{"type":"bridge","ipam":{"subnet":"{{.PodCIDR}}"}}]}"#,
        )
        .expect("write");

        let conf_dir = dir.path().join("net.d");
        let rendered = render_template(&template, &conf_dir, "10.64.0.0/16")
            .expect("render");
        let content = std::fs::read_to_string(rendered).expect("read");
        assert!(content.contains("10.64.0.0/16"));
        assert!(!content.contains("{{.PodCIDR}}"));
    }
}
