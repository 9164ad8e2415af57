/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! RunPodSandbox: allocate everything a pod needs, in order, with an undo
//! stack rewound on any failure.

use super::files::{cleanup_sandbox_files, setup_sandbox_files};
use super::{host_ipc, host_network, host_pid, UNTRUSTED_WORKLOAD_ANNOTATION};
use crate::cni::PodNetwork;
use crate::cri::{CriError, CriService, Result, SANDBOX_METADATA_LABEL};
use crate::engine::{NewEngineContainer, TaskIo};
use crate::names::{generate_id, make_sandbox_name};
use crate::netns;
use crate::oci::{build_sandbox_spec, SandboxSpecParams};
use crate::store::sandbox::{Sandbox, SandboxMetadata};
use crate::store::unix_nanos;
use proto::cri::PodSandboxConfig;
use std::collections::HashMap;
use tracing::{info, warn};

/// Everything allocated so far, so a failure can rewind in reverse order.
/// Each release step tolerates NotFound; the name reservation goes last.
#[derive(Default)]
struct Allocated {
    name: Option<String>,
    image_lease: Option<String>,
    net_ns_path: Option<String>,
    cni: bool,
    root_dir: bool,
    files: bool,
    snapshot: bool,
    engine_container: bool,
    task: bool,
}

impl CriService {
    pub(crate) async fn run_pod_sandbox(
        &self,
        config: PodSandboxConfig,
        runtime_handler: String,
    ) -> Result<String> {
        validate_sandbox_config(&config)?;
        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| CriError::invalid("sandbox config has no metadata"))?;

        let id = generate_id();
        let name = make_sandbox_name(&metadata);
        info!("running sandbox '{name}' as '{id}'");

        let mut allocated = Allocated::default();
        match self
            .run_pod_sandbox_steps(&id, &name, &config, &runtime_handler, &mut allocated)
            .await
        {
            Ok(sandbox) => {
                // The store insert is the commit point; nothing to unwind
                // after it.
                self.sandbox_store.add(sandbox)?;
                Ok(id)
            }
            Err(e) => {
                warn!("run sandbox '{name}' failed, rolling back: {e}");
                self.rollback_run_pod_sandbox(&id, &config, &allocated).await;
                Err(e)
            }
        }
    }

    async fn run_pod_sandbox_steps(
        &self,
        id: &str,
        name: &str,
        config: &PodSandboxConfig,
        runtime_handler: &str,
        allocated: &mut Allocated,
    ) -> Result<Sandbox> {
        // Admission: the name reservation serializes concurrent runs of
        // the same pod.
        self.sandbox_names.reserve(name, id)?;
        allocated.name = Some(name.to_string());

        let image = self.ensure_image(&self.config.sandbox_image).await?;
        self.image_store.lease(&image.id).map_err(|_| {
            CriError::precondition(format!(
                "sandbox image '{}' is being removed",
                self.config.sandbox_image
            ))
        })?;
        allocated.image_lease = Some(image.id.clone());

        let mut net_ns_path = String::new();
        let mut pod_ip = String::new();
        if !host_network(config) {
            let ns_path = netns::create(&self.config.netns_dir(), id)?;
            net_ns_path = ns_path.display().to_string();
            allocated.net_ns_path = Some(net_ns_path.clone());

            let metadata = config.metadata.as_ref().expect("validated metadata");
            pod_ip = self
                .cni
                .setup(&PodNetwork {
                    pod_name: &metadata.name,
                    pod_namespace: &metadata.namespace,
                    id,
                    net_ns_path: &net_ns_path,
                    port_mappings: &config.port_mappings,
                })
                .await?;
            allocated.cni = true;
        }

        // Pause rootfs is a read-only view of the image's layer chain.
        let rootfs = self.engine.view_snapshot(id, &image.chain_id).await?;
        allocated.snapshot = true;

        let spec = build_sandbox_spec(&SandboxSpecParams {
            id,
            config,
            image_config: &image.config,
            net_ns_path: &net_ns_path,
            disable_cgroup: self.config.disable_cgroup,
            enable_selinux: self.config.enable_selinux,
            restrict_oom_score_adj: self.config.restrict_oom_score_adj,
        })?;
        let spec_json = serde_json::to_vec(&spec)
            .map_err(|e| CriError::internal(format!("serialize sandbox spec: {e}")))?;

        let root_dir = self.config.sandbox_root(id);
        std::fs::create_dir_all(&root_dir).map_err(|e| {
            CriError::io(format!("create sandbox root '{}'", root_dir.display()), e)
        })?;
        allocated.root_dir = true;
        setup_sandbox_files(&self.config, id, config)?;
        allocated.files = true;

        let metadata = SandboxMetadata {
            id: id.to_string(),
            name: name.to_string(),
            config: config.clone(),
            net_ns_path: net_ns_path.clone(),
            image_ref: image.id.clone(),
            runtime_handler: runtime_handler.to_string(),
            created_at: unix_nanos(),
        };
        let mut labels = HashMap::new();
        let _ = labels.insert(
            SANDBOX_METADATA_LABEL.to_string(),
            crate::recovery::encode_metadata(&metadata)?,
        );
        self.engine
            .create_container(NewEngineContainer {
                id: id.to_string(),
                image_ref: self.config.sandbox_image.clone(),
                snapshot_key: id.to_string(),
                spec_json,
                labels,
            })
            .await?;
        allocated.engine_container = true;

        // The pause task runs with null stdio.
        let task_pid =
            self.engine.create_task(id, &rootfs, &TaskIo::default()).await?;
        allocated.task = true;
        self.engine.start_task(id).await?;

        let mut sandbox = Sandbox::new(metadata, task_pid);
        sandbox.ip = pod_ip;
        Ok(sandbox)
    }

    async fn rollback_run_pod_sandbox(
        &self,
        id: &str,
        config: &PodSandboxConfig,
        allocated: &Allocated,
    ) {
        if allocated.task {
            match self.engine.delete_task(id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("rollback: delete task '{id}': {e}"),
            }
        }
        if allocated.engine_container {
            match self.engine.delete_container(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("rollback: delete container '{id}': {e}"),
            }
        }
        if allocated.files {
            cleanup_sandbox_files(&self.config, id, config);
        }
        if allocated.root_dir {
            if let Err(e) = std::fs::remove_dir_all(self.config.sandbox_root(id))
            {
                warn!("rollback: remove sandbox root '{id}': {e}");
            }
        }
        if allocated.snapshot {
            match self.engine.remove_snapshot(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("rollback: remove snapshot '{id}': {e}"),
            }
        }
        if allocated.cni {
            let metadata = config.metadata.clone().unwrap_or_default();
            let net_ns_path =
                allocated.net_ns_path.clone().unwrap_or_default();
            self.cni
                .teardown(&PodNetwork {
                    pod_name: &metadata.name,
                    pod_namespace: &metadata.namespace,
                    id,
                    net_ns_path: &net_ns_path,
                    port_mappings: &config.port_mappings,
                })
                .await;
        }
        if let Some(ns_path) = &allocated.net_ns_path {
            if let Err(e) = netns::remove(std::path::Path::new(ns_path)) {
                warn!("rollback: remove netns '{ns_path}': {e}");
            }
        }
        if let Some(image_id) = &allocated.image_lease {
            if let Err(e) = self.image_store.unlease(image_id) {
                warn!("rollback: unlease image '{image_id}': {e}");
            }
        }
        if let Some(name) = &allocated.name {
            self.sandbox_names.release_by_name(name);
        }
    }
}

/// Admission checks that must fail before anything is allocated.
fn validate_sandbox_config(config: &PodSandboxConfig) -> Result<()> {
    let untrusted = config
        .annotations
        .get(UNTRUSTED_WORKLOAD_ANNOTATION)
        .map(|v| v == "true")
        .unwrap_or(false);
    if untrusted
        && (host_network(config) || host_pid(config) || host_ipc(config))
    {
        return Err(CriError::invalid(
            "untrusted workload cannot request host access",
        ));
    }
    if let Some(dns) = &config.dns_config {
        // Surface DNS errors before allocation rather than from file setup.
        let _ = super::files::parse_dns_options(
            &dns.servers,
            &dns.searches,
            &dns.options,
        )?;
    }
    Ok(())
}
