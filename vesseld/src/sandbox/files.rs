/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Sandbox filesystem setup: /etc/hosts, /etc/resolv.conf and /dev/shm.

use super::host_ipc;
use crate::config::Config;
use crate::cri::{CriError, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use proto::cri::PodSandboxConfig;
use std::path::Path;
use tracing::warn;

const HOST_HOSTS: &str = "/etc/hosts";
const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const HOST_DEV_SHM: &str = "/dev/shm";

/// Size of the sandbox /dev/shm tmpfs.
const DEFAULT_SHM_SIZE: u64 = 64 * 1024 * 1024;

/// The resolver gives up past this many search domains.
const MAX_DNS_SEARCHES: usize = 6;

/// Generate the sandbox files under its root directory. The shm tmpfs is
/// only mounted for pods with their own IPC namespace; host-IPC pods use
/// the host's /dev/shm, which must exist.
pub(crate) fn setup_sandbox_files(
    config: &Config,
    id: &str,
    sandbox_config: &PodSandboxConfig,
) -> Result<()> {
    let hosts_path = config.sandbox_hosts_path(id);
    std::fs::copy(HOST_HOSTS, &hosts_path).map_err(|e| {
        CriError::io(format!("copy hosts to '{}'", hosts_path.display()), e)
    })?;

    let resolv_path = config.sandbox_resolv_path(id);
    let resolv_content = sandbox_config
        .dns_config
        .as_ref()
        .map(|dns| parse_dns_options(&dns.servers, &dns.searches, &dns.options))
        .transpose()?
        .unwrap_or_default();
    if resolv_content.is_empty() {
        std::fs::copy(HOST_RESOLV_CONF, &resolv_path).map_err(|e| {
            CriError::io(
                format!("copy resolv.conf to '{}'", resolv_path.display()),
                e,
            )
        })?;
    } else {
        std::fs::write(&resolv_path, resolv_content).map_err(|e| {
            CriError::io(
                format!("write resolv.conf to '{}'", resolv_path.display()),
                e,
            )
        })?;
    }

    if host_ipc(sandbox_config) {
        if !Path::new(HOST_DEV_SHM).exists() {
            return Err(CriError::precondition(format!(
                "host {HOST_DEV_SHM} is not available for host ipc"
            )));
        }
    } else {
        let shm_path = config.sandbox_shm_path(id);
        std::fs::create_dir_all(&shm_path).map_err(|e| {
            CriError::io(format!("create shm '{}'", shm_path.display()), e)
        })?;
        mount(
            Some("shm"),
            &shm_path,
            Some("tmpfs"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(format!("mode=1777,size={DEFAULT_SHM_SIZE}").as_str()),
        )
        .map_err(|e| {
            CriError::io(
                format!("mount shm at '{}'", shm_path.display()),
                std::io::Error::other(e),
            )
        })?;
    }
    Ok(())
}

/// Unmount the sandbox shm. File removal is left to the sandbox root
/// directory teardown; each step logs and continues.
pub(crate) fn cleanup_sandbox_files(
    config: &Config,
    id: &str,
    sandbox_config: &PodSandboxConfig,
) {
    if host_ipc(sandbox_config) {
        return;
    }
    let shm_path = config.sandbox_shm_path(id);
    if !shm_path.exists() {
        return;
    }
    match umount2(&shm_path, MntFlags::MNT_DETACH) {
        Ok(()) | Err(nix::Error::EINVAL) | Err(nix::Error::ENOENT) => {}
        Err(e) => warn!("failed to unmount '{}': {e}", shm_path.display()),
    }
}

/// Render resolv.conf content from the sandbox DNS config. Empty input
/// yields empty content and the caller falls back to the host file.
pub(crate) fn parse_dns_options(
    servers: &[String],
    searches: &[String],
    options: &[String],
) -> Result<String> {
    if searches.len() > MAX_DNS_SEARCHES {
        return Err(CriError::invalid(format!(
            "DNSConfig.Searches has more than {MAX_DNS_SEARCHES} domains"
        )));
    }
    let mut content = String::new();
    if !searches.is_empty() {
        content.push_str(&format!("search {}\n", searches.join(" ")));
    }
    if !servers.is_empty() {
        content.push_str(&format!("nameserver {}\n", servers.join("\nnameserver ")));
    }
    if !options.is_empty() {
        content.push_str(&format!("options {}\n", options.join(" ")));
    }
    Ok(content)
}
