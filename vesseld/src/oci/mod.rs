/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! OCI runtime spec assembly.
//!
//! Each lifecycle path collects its decisions into a params struct and one
//! builder emits the full spec, so the result can be snapshotted into the
//! container metadata and asserted in tests.

use oci_spec::runtime::{Mount, MountBuilder};
use oci_spec::OciSpecError;
use proto::cri::SeLinuxOption;
use thiserror::Error;

pub mod capabilities;
pub mod container_spec;
pub mod sandbox_spec;

pub use container_spec::{build_container_spec, ContainerSpecParams};
pub use sandbox_spec::{build_sandbox_spec, SandboxSpecParams};

/// Rootfs path inside the bundle, always relative.
pub const RELATIVE_ROOTFS: &str = "rootfs";

/// OOM score adjustment pinned on every pause task.
pub const POD_OOM_SCORE_ADJ: i32 = -998;

/// Default CPU shares granted to a pause task.
pub const POD_DEFAULT_CPU_SHARES: u64 = 2;

/// Apparmor profile name applied for `runtime/default`.
pub const DEFAULT_APPARMOR_PROFILE: &str = "vessel-default";

pub(crate) type Result<T> = std::result::Result<T, OciError>;

#[derive(Debug, Error)]
pub enum OciError {
    #[error("image has neither an entrypoint nor a cmd")]
    EmptyEntrypoint,
    #[error("no process args: container config and image config are both empty")]
    EmptyProcessArgs,
    #[error("unknown apparmor profile '{profile}'")]
    BadApparmorProfile { profile: String },
    #[error("unknown capability '{name}'")]
    UnknownCapability { name: String },
    #[error("cannot resolve device '{path}': {message}")]
    BadDevice { path: String, message: String },
    #[error(transparent)]
    Spec(#[from] OciSpecError),
}

/// Masked paths applied to unprivileged containers.
pub(crate) const DEFAULT_MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/asound",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
];

/// Read-only paths applied to unprivileged containers.
pub(crate) const DEFAULT_READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// The default mount set. `/run` is deliberately absent: the kubelet owns
/// everything below it through explicit mounts.
pub(crate) fn default_mounts(cgroup_readonly: bool) -> Result<Vec<Mount>> {
    let cgroup_options = if cgroup_readonly {
        vec!["nosuid", "noexec", "nodev", "relatime", "ro"]
    } else {
        vec!["nosuid", "noexec", "nodev", "relatime"]
    };
    let mounts = vec![
        MountBuilder::default()
            .destination("/proc")
            .typ("proc")
            .source("proc")
            .build()?,
        MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs")
            .source("tmpfs")
            .options(owned(&["nosuid", "strictatime", "mode=755", "size=65536k"]))
            .build()?,
        MountBuilder::default()
            .destination("/dev/pts")
            .typ("devpts")
            .source("devpts")
            .options(owned(&[
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
                "gid=5",
            ]))
            .build()?,
        MountBuilder::default()
            .destination("/dev/mqueue")
            .typ("mqueue")
            .source("mqueue")
            .options(owned(&["nosuid", "noexec", "nodev"]))
            .build()?,
        MountBuilder::default()
            .destination("/sys")
            .typ("sysfs")
            .source("sysfs")
            .options(owned(&["nosuid", "noexec", "nodev", "ro"]))
            .build()?,
        MountBuilder::default()
            .destination("/sys/fs/cgroup")
            .typ("cgroup")
            .source("cgroup")
            .options(cgroup_options.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .build()?,
    ];
    Ok(mounts)
}

pub(crate) fn owned(options: &[&str]) -> Vec<String> {
    options.iter().map(|s| s.to_string()).collect()
}

/// Join process and mount labels from SELinux options. Both labels are
/// derived together; when SELinux is disabled both stay empty.
pub(crate) fn selinux_labels(
    enabled: bool,
    options: Option<&SeLinuxOption>,
) -> (String, String) {
    if !enabled {
        return (String::new(), String::new());
    }
    let Some(options) = options else {
        return (String::new(), String::new());
    };
    if options.user.is_empty() && options.r#type.is_empty() {
        return (String::new(), String::new());
    }
    let process = format!(
        "{}:{}:{}:{}",
        options.user, options.role, options.r#type, options.level
    );
    (process.clone(), process)
}

/// Environment assembly: the image config provides the base, the container
/// config wins on conflicts.
pub(crate) fn merge_env(image_env: &[String], overrides: &[(String, String)]) -> Vec<String> {
    let mut env: Vec<String> = image_env.to_vec();
    for (key, value) in overrides {
        let prefix = format!("{key}=");
        if let Some(existing) = env.iter_mut().find(|e| e.starts_with(&prefix)) {
            *existing = format!("{key}={value}");
        } else {
            env.push(format!("{key}={value}"));
        }
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_env_overrides_image_values() {
        let image_env = vec![
            "PATH=/usr/bin".to_string(),
            "LANG=C".to_string(),
        ];
        let overrides = vec![
            ("PATH".to_string(), "/opt/bin".to_string()),
            ("EXTRA".to_string(), "1".to_string()),
        ];
        assert_eq!(
            merge_env(&image_env, &overrides),
            vec![
                "PATH=/opt/bin".to_string(),
                "LANG=C".to_string(),
                "EXTRA=1".to_string(),
            ]
        );
    }

    #[test]
    fn test_selinux_labels_travel_together() {
        let options = SeLinuxOption {
            user: "system_u".to_string(),
            role: "system_r".to_string(),
            r#type: "svirt_lxc_net_t".to_string(),
            level: "s0:c4,c5".to_string(),
        };
        let (process, mount) = selinux_labels(true, Some(&options));
        assert_eq!(process, "system_u:system_r:svirt_lxc_net_t:s0:c4,c5");
        assert_eq!(process, mount);

        let (process, mount) = selinux_labels(false, Some(&options));
        assert!(process.is_empty() && mount.is_empty());
    }

    #[test]
    fn test_default_mounts_leave_out_run() {
        let mounts = default_mounts(true).expect("mounts");
        assert!(mounts
            .iter()
            .all(|m| m.destination().to_string_lossy() != "/run"));
        let cgroup = mounts
            .iter()
            .find(|m| m.destination().to_string_lossy() == "/sys/fs/cgroup")
            .expect("cgroup mount");
        assert!(cgroup
            .options()
            .as_ref()
            .expect("options")
            .contains(&"ro".to_string()));
    }
}
