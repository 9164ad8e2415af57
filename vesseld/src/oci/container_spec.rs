/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! OCI spec for workload containers.

use super::{
    capabilities, default_mounts, merge_env, selinux_labels,
    DEFAULT_APPARMOR_PROFILE, DEFAULT_MASKED_PATHS, DEFAULT_READONLY_PATHS,
    OciError, Result, RELATIVE_ROOTFS,
};
use oci_spec::image::ImageConfiguration;
use oci_spec::runtime::{
    LinuxBuilder, LinuxCapabilitiesBuilder, LinuxCpuBuilder,
    LinuxDeviceBuilder, LinuxDeviceCgroupBuilder, LinuxDeviceType,
    LinuxMemoryBuilder, LinuxNamespace, LinuxNamespaceBuilder,
    LinuxNamespaceType, LinuxResources, LinuxResourcesBuilder, Mount,
    MountBuilder, ProcessBuilder, RootBuilder, Spec, SpecBuilder, UserBuilder,
};
use proto::cri::{
    ContainerConfig, LinuxContainerResources, MountPropagation, NamespaceMode,
    PodSandboxConfig,
};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Apparmor profile value selecting the generated default profile.
const APPARMOR_RUNTIME_DEFAULT: &str = "runtime/default";
/// Prefix selecting a profile preloaded on the host.
const APPARMOR_LOCALHOST_PREFIX: &str = "localhost/";

pub struct ContainerSpecParams<'a> {
    pub id: &'a str,
    pub config: &'a ContainerConfig,
    pub sandbox_config: &'a PodSandboxConfig,
    pub image_config: &'a ImageConfiguration,
    pub sandbox_pid: u32,
    /// Fully merged bind mounts: image volumes, sandbox files, user mounts.
    pub mounts: &'a [proto::cri::Mount],
    pub disable_cgroup: bool,
    pub enable_selinux: bool,
    pub restrict_oom_score_adj: bool,
}

pub fn build_container_spec(params: &ContainerSpecParams<'_>) -> Result<Spec> {
    let ContainerSpecParams {
        id,
        config,
        sandbox_config,
        image_config,
        sandbox_pid,
        mounts,
        disable_cgroup,
        enable_selinux,
        restrict_oom_score_adj,
    } = params;

    let image = image_config.config();
    let security = config
        .linux
        .as_ref()
        .and_then(|linux| linux.security_context.as_ref());
    let privileged = security.map(|sc| sc.privileged).unwrap_or(false);

    // Process arguments: the container command wins over the image
    // entrypoint, the container args win over the image cmd.
    let entrypoint = image
        .as_ref()
        .and_then(|c| c.entrypoint().clone())
        .unwrap_or_default();
    let cmd = image.as_ref().and_then(|c| c.cmd().clone()).unwrap_or_default();
    let args = if !config.command.is_empty() {
        let mut args = config.command.clone();
        args.extend(config.args.iter().cloned());
        args
    } else if !config.args.is_empty() {
        let mut args = entrypoint;
        args.extend(config.args.iter().cloned());
        args
    } else {
        let mut args = entrypoint;
        args.extend(cmd);
        args
    };
    if args.is_empty() {
        return Err(OciError::EmptyProcessArgs);
    }

    let image_env = image
        .as_ref()
        .and_then(|c| c.env().clone())
        .unwrap_or_default();
    let overrides: Vec<(String, String)> = config
        .envs
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.clone()))
        .collect();
    let mut env = merge_env(&image_env, &overrides);
    if config.tty && !env.iter().any(|e| e.starts_with("TERM=")) {
        env.push("TERM=xterm".to_string());
    }

    let cwd = if !config.working_dir.is_empty() {
        config.working_dir.clone()
    } else {
        image
            .as_ref()
            .and_then(|c| c.working_dir().clone())
            .filter(|dir| !dir.is_empty())
            .unwrap_or_else(|| "/".to_string())
    };

    // User identity from the security context.
    let mut user_builder = UserBuilder::default();
    if let Some(run_as_user) = security.and_then(|sc| sc.run_as_user.as_ref()) {
        user_builder = user_builder.uid(run_as_user.value as u32);
        let gid = security
            .and_then(|sc| sc.run_as_group.as_ref())
            .map(|g| g.value as u32)
            .unwrap_or(0);
        user_builder = user_builder.gid(gid);
    }
    if let Some(username) =
        security.map(|sc| sc.run_as_username.as_str()).filter(|u| !u.is_empty())
    {
        user_builder = user_builder.username(username);
    }
    let supplemental: Vec<u32> = security
        .map(|sc| sc.supplemental_groups.iter().map(|g| *g as u32).collect())
        .unwrap_or_default();
    if !supplemental.is_empty() {
        user_builder = user_builder.additional_gids(supplemental);
    }
    let user = user_builder.build()?;

    let caps = if privileged {
        capabilities::all()
    } else {
        let (add, drop) = security
            .and_then(|sc| sc.capabilities.as_ref())
            .map(|c| (c.add_capabilities.clone(), c.drop_capabilities.clone()))
            .unwrap_or_default();
        capabilities::compute(&add, &drop)?
    };
    let linux_capabilities = LinuxCapabilitiesBuilder::default()
        .bounding(caps.clone())
        .effective(caps.clone())
        .inheritable(caps.clone())
        .permitted(caps.clone())
        .ambient(caps)
        .build()?;

    let apparmor = apparmor_profile(
        security.map(|sc| sc.apparmor_profile.as_str()).unwrap_or(""),
        privileged,
    )?;

    let (process_label, mount_label) = selinux_labels(
        *enable_selinux,
        security.and_then(|sc| sc.selinux_options.as_ref()),
    );

    let resources = config.linux.as_ref().and_then(|l| l.resources.as_ref());
    let mut oom_score_adj =
        resources.map(|r| r.oom_score_adj).unwrap_or_default() as i32;
    if *restrict_oom_score_adj && oom_score_adj < 0 {
        oom_score_adj = 0;
    }

    let mut process_builder = ProcessBuilder::default()
        .terminal(config.tty)
        .user(user)
        .args(args)
        .env(env)
        .cwd(cwd)
        .capabilities(linux_capabilities)
        .no_new_privileges(
            security.map(|sc| sc.no_new_privs).unwrap_or(false),
        )
        .oom_score_adj(oom_score_adj);
    if let Some(profile) = apparmor {
        process_builder = process_builder.apparmor_profile(profile);
    }
    if !process_label.is_empty() {
        process_builder = process_builder.selinux_label(process_label);
    }
    let process = process_builder.build()?;

    // Join the pause task's network, IPC and UTS namespaces through its
    // pid; the PID namespace stays per-container unless configured
    // otherwise.
    let ns_options = security.and_then(|sc| sc.namespace_options.as_ref());
    let sandbox_ns = |kind: &str| format!("/proc/{sandbox_pid}/ns/{kind}");
    let mut namespaces: Vec<LinuxNamespace> = vec![
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Mount)
            .build()?,
    ];
    let host_network = ns_options
        .map(|o| o.network() == NamespaceMode::Node)
        .unwrap_or(false);
    if !host_network {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Network)
                .path(PathBuf::from(sandbox_ns("net")))
                .build()?,
        );
    }
    let host_ipc =
        ns_options.map(|o| o.ipc() == NamespaceMode::Node).unwrap_or(false);
    if !host_ipc {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Ipc)
                .path(PathBuf::from(sandbox_ns("ipc")))
                .build()?,
        );
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Uts)
                .path(PathBuf::from(sandbox_ns("uts")))
                .build()?,
        );
    }
    match ns_options.map(|o| o.pid()).unwrap_or(NamespaceMode::Container) {
        NamespaceMode::Node => {}
        NamespaceMode::Pod => namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Pid)
                .path(PathBuf::from(sandbox_ns("pid")))
                .build()?,
        ),
        _ => namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Pid)
                .build()?,
        ),
    }

    let mut all_mounts = default_mounts(!privileged)?;
    all_mounts.extend(bind_mounts(mounts, *enable_selinux)?);

    let devices = if privileged {
        host_devices()?
    } else {
        config
            .devices
            .iter()
            .map(|d| resolve_device(&d.host_path, &d.container_path))
            .collect::<Result<Vec<_>>>()?
    };

    let mut linux_builder = LinuxBuilder::default().namespaces(namespaces);
    if !devices.is_empty() {
        linux_builder = linux_builder.devices(devices);
    }
    if !privileged {
        let masked = security
            .map(|sc| sc.masked_paths.clone())
            .filter(|paths| !paths.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_MASKED_PATHS.iter().map(|s| s.to_string()).collect()
            });
        let readonly = security
            .map(|sc| sc.readonly_paths.clone())
            .filter(|paths| !paths.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_READONLY_PATHS.iter().map(|s| s.to_string()).collect()
            });
        linux_builder =
            linux_builder.masked_paths(masked).readonly_paths(readonly);
    }
    if !mount_label.is_empty() {
        linux_builder = linux_builder.mount_label(mount_label);
    }
    if !disable_cgroup {
        linux_builder = linux_builder
            .resources(build_resources(resources, privileged)?);
        let cgroup_parent = sandbox_config
            .linux
            .as_ref()
            .map(|l| l.cgroup_parent.as_str())
            .unwrap_or("");
        if !cgroup_parent.is_empty() {
            linux_builder = linux_builder
                .cgroups_path(PathBuf::from(cgroup_parent).join(id));
        }
    }

    let readonly_rootfs =
        security.map(|sc| sc.readonly_rootfs).unwrap_or(false);

    let spec = SpecBuilder::default()
        .root(
            RootBuilder::default()
                .path(RELATIVE_ROOTFS)
                .readonly(readonly_rootfs)
                .build()?,
        )
        .process(process)
        .mounts(all_mounts)
        .linux(linux_builder.build()?)
        .build()?;
    Ok(spec)
}

/// Resolve the CRI apparmor field. `None` leaves the profile unset.
fn apparmor_profile(profile: &str, privileged: bool) -> Result<Option<String>> {
    if privileged || profile.is_empty() {
        return Ok(None);
    }
    if profile == APPARMOR_RUNTIME_DEFAULT {
        return Ok(Some(DEFAULT_APPARMOR_PROFILE.to_string()));
    }
    if let Some(name) = profile.strip_prefix(APPARMOR_LOCALHOST_PREFIX) {
        if !name.is_empty() {
            return Ok(Some(name.to_string()));
        }
    }
    Err(OciError::BadApparmorProfile { profile: profile.to_string() })
}

/// Resource fields from the CRI resources message. Shared by create and
/// `UpdateContainerResources`, which re-emits the engine-side spec.
pub fn build_resources(
    resources: Option<&LinuxContainerResources>,
    privileged: bool,
) -> Result<LinuxResources> {
    let mut builder = LinuxResourcesBuilder::default().devices(vec![
        LinuxDeviceCgroupBuilder::default()
            .allow(privileged)
            .access("rwm")
            .build()?,
    ]);

    if let Some(resources) = resources {
        let mut cpu = LinuxCpuBuilder::default();
        let mut has_cpu = false;
        if resources.cpu_shares > 0 {
            cpu = cpu.shares(resources.cpu_shares as u64);
            has_cpu = true;
        }
        if resources.cpu_period > 0 {
            cpu = cpu.period(resources.cpu_period as u64);
            has_cpu = true;
        }
        if resources.cpu_quota > 0 {
            cpu = cpu.quota(resources.cpu_quota);
            has_cpu = true;
        }
        if !resources.cpuset_cpus.is_empty() {
            cpu = cpu.cpus(resources.cpuset_cpus.clone());
            has_cpu = true;
        }
        if !resources.cpuset_mems.is_empty() {
            cpu = cpu.mems(resources.cpuset_mems.clone());
            has_cpu = true;
        }
        if has_cpu {
            builder = builder.cpu(cpu.build()?);
        }
        if resources.memory_limit_in_bytes > 0 {
            builder = builder.memory(
                LinuxMemoryBuilder::default()
                    .limit(resources.memory_limit_in_bytes)
                    .build()?,
            );
        }
    }
    Ok(builder.build()?)
}

/// Convert CRI bind mounts into OCI mounts. User-supplied entries arrive
/// last in `mounts` and therefore win on duplicate destinations.
fn bind_mounts(
    mounts: &[proto::cri::Mount],
    enable_selinux: bool,
) -> Result<Vec<Mount>> {
    let mut result = Vec::with_capacity(mounts.len());
    for mount in mounts {
        let mut options = vec!["rbind".to_string()];
        options.push(
            match MountPropagation::try_from(mount.propagation)
                .unwrap_or(MountPropagation::PropagationPrivate)
            {
                MountPropagation::PropagationPrivate => "rprivate",
                MountPropagation::PropagationBidirectional => "rshared",
                MountPropagation::PropagationHostToContainer => "rslave",
            }
            .to_string(),
        );
        options.push(if mount.readonly { "ro" } else { "rw" }.to_string());
        if mount.selinux_relabel && !enable_selinux {
            // Relabeling is a host policy concern; without SELinux the
            // request is meaningless.
            warn!(
                "ignoring selinux relabel for '{}': selinux disabled",
                mount.container_path
            );
        }
        result.push(
            MountBuilder::default()
                .destination(mount.container_path.clone())
                .typ("bind")
                .source(mount.host_path.clone())
                .options(options)
                .build()?,
        );
    }
    Ok(result)
}

fn resolve_device(
    host_path: &str,
    container_path: &str,
) -> Result<oci_spec::runtime::LinuxDevice> {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};

    let metadata =
        std::fs::metadata(host_path).map_err(|e| OciError::BadDevice {
            path: host_path.to_string(),
            message: e.to_string(),
        })?;
    let file_type = metadata.file_type();
    let typ = if file_type.is_block_device() {
        LinuxDeviceType::B
    } else if file_type.is_char_device() {
        LinuxDeviceType::C
    } else {
        return Err(OciError::BadDevice {
            path: host_path.to_string(),
            message: "not a device node".to_string(),
        });
    };
    let rdev = metadata.rdev();
    let device = LinuxDeviceBuilder::default()
        .path(if container_path.is_empty() {
            host_path.to_string()
        } else {
            container_path.to_string()
        })
        .typ(typ)
        .major(nix::sys::stat::major(rdev) as i64)
        .minor(nix::sys::stat::minor(rdev) as i64)
        .file_mode(metadata.mode())
        .build()?;
    Ok(device)
}

/// Host device nodes handed to privileged containers: the direct children
/// of /dev plus one directory level, skipping pseudo trees the default
/// mounts already provide.
fn host_devices() -> Result<Vec<oci_spec::runtime::LinuxDevice>> {
    let mut devices = Vec::new();
    collect_devices(Path::new("/dev"), 0, &mut devices);
    Ok(devices)
}

fn collect_devices(
    dir: &Path,
    depth: usize,
    devices: &mut Vec<oci_spec::runtime::LinuxDevice>,
) {
    const SKIPPED: &[&str] = &["pts", "shm", "mqueue", "fd"];
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else { continue };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            let name = entry.file_name();
            let skip = name
                .to_str()
                .map(|n| SKIPPED.contains(&n))
                .unwrap_or(true);
            if depth == 0 && !skip {
                collect_devices(&path, depth + 1, devices);
            }
            continue;
        }
        if let Ok(device) =
            resolve_device(&path.display().to_string(), "")
        {
            devices.push(device);
        }
    }
}
