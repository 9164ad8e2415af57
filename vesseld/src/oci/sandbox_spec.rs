/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! OCI spec for the pause container.

use super::{
    default_mounts, selinux_labels, OciError, Result, POD_DEFAULT_CPU_SHARES,
    POD_OOM_SCORE_ADJ, RELATIVE_ROOTFS,
};
use oci_spec::image::ImageConfiguration;
use oci_spec::runtime::{
    LinuxBuilder, LinuxCpuBuilder, LinuxNamespace, LinuxNamespaceBuilder,
    LinuxNamespaceType, LinuxResourcesBuilder, ProcessBuilder, RootBuilder,
    Spec, SpecBuilder,
};
use proto::cri::{NamespaceMode, PodSandboxConfig};
use std::path::PathBuf;

pub struct SandboxSpecParams<'a> {
    pub id: &'a str,
    pub config: &'a PodSandboxConfig,
    pub image_config: &'a ImageConfiguration,
    /// Path of the allocated network namespace; empty for host-network.
    pub net_ns_path: &'a str,
    pub disable_cgroup: bool,
    pub enable_selinux: bool,
    pub restrict_oom_score_adj: bool,
}

pub fn build_sandbox_spec(params: &SandboxSpecParams<'_>) -> Result<Spec> {
    let SandboxSpecParams {
        id,
        config,
        image_config,
        net_ns_path,
        disable_cgroup,
        enable_selinux,
        restrict_oom_score_adj,
    } = params;

    let image = image_config.config();
    let entrypoint = image
        .as_ref()
        .and_then(|c| c.entrypoint().clone())
        .unwrap_or_default();
    let cmd = image.as_ref().and_then(|c| c.cmd().clone()).unwrap_or_default();
    if entrypoint.is_empty() {
        // The pause image must carry its own entrypoint.
        return Err(OciError::EmptyEntrypoint);
    }
    let mut args = entrypoint;
    args.extend(cmd);

    let env = image
        .as_ref()
        .and_then(|c| c.env().clone())
        .unwrap_or_default();
    let cwd = image
        .as_ref()
        .and_then(|c| c.working_dir().clone())
        .filter(|dir| !dir.is_empty())
        .unwrap_or_else(|| "/".to_string());

    let security = config
        .linux
        .as_ref()
        .and_then(|linux| linux.security_context.as_ref());
    let ns_options = security.and_then(|sc| sc.namespace_options.as_ref());
    let host_network = ns_options
        .map(|o| o.network() == NamespaceMode::Node)
        .unwrap_or(false);
    let host_pid =
        ns_options.map(|o| o.pid() == NamespaceMode::Node).unwrap_or(false);
    let host_ipc =
        ns_options.map(|o| o.ipc() == NamespaceMode::Node).unwrap_or(false);

    let (process_label, mount_label) = selinux_labels(
        *enable_selinux,
        security.and_then(|sc| sc.selinux_options.as_ref()),
    );

    let oom_score_adj = if *restrict_oom_score_adj {
        0
    } else {
        POD_OOM_SCORE_ADJ
    };

    let mut process_builder = ProcessBuilder::default()
        .terminal(false)
        .args(args)
        .env(env)
        .cwd(cwd)
        .no_new_privileges(true)
        .oom_score_adj(oom_score_adj);
    if !process_label.is_empty() {
        process_builder = process_builder.selinux_label(process_label);
    }
    let process = process_builder.build()?;

    // All namespaces are fresh by default; removing one makes the pause
    // task inherit it from the host.
    let mut namespaces: Vec<LinuxNamespace> = vec![
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Mount)
            .build()?,
        LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Uts)
            .build()?,
    ];
    if !host_network {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Network)
                .path(PathBuf::from(net_ns_path))
                .build()?,
        );
    }
    if !host_pid {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Pid)
                .build()?,
        );
    }
    if !host_ipc {
        namespaces.push(
            LinuxNamespaceBuilder::default()
                .typ(LinuxNamespaceType::Ipc)
                .build()?,
        );
    }

    let mut linux_builder = LinuxBuilder::default().namespaces(namespaces);
    if !mount_label.is_empty() {
        linux_builder = linux_builder.mount_label(mount_label);
    }
    if let Some(sysctls) = config.linux.as_ref().map(|l| &l.sysctls) {
        if !sysctls.is_empty() {
            linux_builder = linux_builder.sysctl(sysctls.clone());
        }
    }
    if !disable_cgroup {
        linux_builder = linux_builder.resources(
            LinuxResourcesBuilder::default()
                .cpu(
                    LinuxCpuBuilder::default()
                        .shares(POD_DEFAULT_CPU_SHARES)
                        .build()?,
                )
                .build()?,
        );
        let cgroup_parent = config
            .linux
            .as_ref()
            .map(|l| l.cgroup_parent.as_str())
            .unwrap_or("");
        if !cgroup_parent.is_empty() {
            linux_builder = linux_builder
                .cgroups_path(PathBuf::from(cgroup_parent).join(id));
        }
    }

    let spec = SpecBuilder::default()
        .root(
            RootBuilder::default()
                .path(RELATIVE_ROOTFS)
                .readonly(true)
                .build()?,
        )
        .process(process)
        .hostname(config.hostname.clone())
        .mounts(default_mounts(true)?)
        .linux(linux_builder.build()?)
        .build()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{ConfigBuilder, ImageConfigurationBuilder};
    use proto::cri::{
        LinuxPodSandboxConfig, LinuxSandboxSecurityContext, NamespaceOption,
        PodSandboxMetadata,
    };

    fn image_config_for_tests() -> ImageConfiguration {
        ImageConfigurationBuilder::default()
            .config(
                ConfigBuilder::default()
                    .entrypoint(vec!["/pause".to_string()])
                    .env(vec!["PATH=/usr/bin".to_string()])
                    .build()
                    .expect("image config"),
            )
            .build()
            .expect("image configuration")
    }

    fn sandbox_config_for_tests() -> PodSandboxConfig {
        PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: "sandbox".to_string(),
                uid: "uid".to_string(),
                namespace: "default".to_string(),
                attempt: 0,
            }),
            hostname: "pod-host".to_string(),
            linux: Some(LinuxPodSandboxConfig {
                cgroup_parent: "/kube/pods".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn params<'a>(
        config: &'a PodSandboxConfig,
        image: &'a ImageConfiguration,
        net_ns: &'a str,
    ) -> SandboxSpecParams<'a> {
        SandboxSpecParams {
            id: "sb-1",
            config,
            image_config: image,
            net_ns_path: net_ns,
            disable_cgroup: false,
            enable_selinux: false,
            restrict_oom_score_adj: false,
        }
    }

    #[test]
    fn test_pause_root_is_relative_and_readonly() {
        let config = sandbox_config_for_tests();
        let image = image_config_for_tests();
        let spec = build_sandbox_spec(&params(&config, &image, "/var/run/netns/sb-1"))
            .expect("spec");

        let root = spec.root().as_ref().expect("root");
        assert_eq!(root.path().to_string_lossy(), "rootfs");
        assert_eq!(root.readonly(), &Some(true));
        assert_eq!(spec.hostname().as_deref(), Some("pod-host"));
    }

    #[test]
    fn test_netns_path_is_attached() {
        let config = sandbox_config_for_tests();
        let image = image_config_for_tests();
        let spec = build_sandbox_spec(&params(&config, &image, "/var/run/netns/sb-1"))
            .expect("spec");

        let namespaces = spec
            .linux()
            .as_ref()
            .expect("linux")
            .namespaces()
            .clone()
            .expect("namespaces");
        let net = namespaces
            .iter()
            .find(|ns| ns.typ() == LinuxNamespaceType::Network)
            .expect("network namespace");
        assert_eq!(
            net.path().as_ref().expect("path").to_string_lossy(),
            "/var/run/netns/sb-1"
        );
    }

    #[test]
    fn test_host_modes_remove_namespaces() {
        let mut config = sandbox_config_for_tests();
        config.linux = Some(LinuxPodSandboxConfig {
            security_context: Some(LinuxSandboxSecurityContext {
                namespace_options: Some(NamespaceOption {
                    network: NamespaceMode::Node as i32,
                    pid: NamespaceMode::Node as i32,
                    ipc: NamespaceMode::Node as i32,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        let image = image_config_for_tests();
        let spec =
            build_sandbox_spec(&params(&config, &image, "")).expect("spec");

        let namespaces = spec
            .linux()
            .as_ref()
            .expect("linux")
            .namespaces()
            .clone()
            .expect("namespaces");
        for typ in [
            LinuxNamespaceType::Network,
            LinuxNamespaceType::Pid,
            LinuxNamespaceType::Ipc,
        ] {
            assert!(
                !namespaces.iter().any(|ns| ns.typ() == typ),
                "{typ:?} should be removed for host mode"
            );
        }
    }

    #[test]
    fn test_cgroup_path_under_parent() {
        let config = sandbox_config_for_tests();
        let image = image_config_for_tests();
        let spec = build_sandbox_spec(&params(&config, &image, "/ns")).expect("spec");

        let linux = spec.linux().as_ref().expect("linux");
        assert_eq!(
            linux
                .cgroups_path()
                .as_ref()
                .expect("cgroups path")
                .to_string_lossy(),
            "/kube/pods/sb-1"
        );
        let shares = linux
            .resources()
            .as_ref()
            .expect("resources")
            .cpu()
            .as_ref()
            .expect("cpu")
            .shares();
        assert_eq!(shares, &Some(POD_DEFAULT_CPU_SHARES));
    }

    #[test]
    fn test_disable_cgroup_omits_path_and_resources() {
        let config = sandbox_config_for_tests();
        let image = image_config_for_tests();
        let mut p = params(&config, &image, "/ns");
        p.disable_cgroup = true;
        let spec = build_sandbox_spec(&p).expect("spec");

        let linux = spec.linux().as_ref().expect("linux");
        assert!(linux.cgroups_path().is_none());
        assert!(linux.resources().is_none());
    }

    #[test]
    fn test_missing_entrypoint_is_error() {
        let config = sandbox_config_for_tests();
        let image = ImageConfigurationBuilder::default()
            .build()
            .expect("image configuration");
        assert!(matches!(
            build_sandbox_spec(&params(&config, &image, "/ns")),
            Err(OciError::EmptyEntrypoint)
        ));
    }
}
