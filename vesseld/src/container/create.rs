/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! CreateContainer.

use crate::cri::{CriError, CriService, Result, CONTAINER_METADATA_LABEL};
use crate::engine::{NewEngineContainer, TaskState};
use crate::names::{generate_id, make_container_name};
use crate::oci::{build_container_spec, ContainerSpecParams};
use crate::sandbox::host_ipc;
use crate::store::container::{Container, ContainerMetadata};
use crate::store::image::Image;
use crate::store::unix_nanos;
use crate::store::StoreError;
use proto::cri::{ContainerConfig, Mount, PodSandboxConfig};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::io;

#[derive(Default)]
struct Allocated {
    name: Option<String>,
    image_lease: Option<String>,
    root_dir: bool,
    io: Option<Arc<io::ContainerIo>>,
    snapshot: bool,
    engine_container: bool,
}

impl CriService {
    pub(crate) async fn create_container(
        &self,
        sandbox_id: &str,
        config: ContainerConfig,
        sandbox_config: PodSandboxConfig,
    ) -> Result<String> {
        let sandbox = self.sandbox_store.get(sandbox_id)?;
        let task = self.engine.get_task(sandbox_id).await.map_err(|_| {
            CriError::precondition(format!(
                "sandbox '{sandbox_id}' has no running pause task"
            ))
        })?;
        if task.state != TaskState::Running {
            return Err(CriError::precondition(format!(
                "sandbox '{sandbox_id}' is not running"
            )));
        }
        let sandbox_pid = task.pid;

        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| CriError::invalid("container config has no metadata"))?;
        let sandbox_metadata = sandbox
            .metadata
            .config
            .metadata
            .clone()
            .ok_or_else(|| CriError::internal("sandbox without metadata"))?;

        let id = generate_id();
        let name = make_container_name(&metadata, &sandbox_metadata);
        info!("creating container '{name}' as '{id}' in sandbox '{sandbox_id}'");

        let mut allocated = Allocated::default();
        match self
            .create_container_steps(
                &id,
                &name,
                sandbox_id,
                sandbox_pid,
                &config,
                &sandbox_config,
                &mut allocated,
            )
            .await
        {
            Ok(container) => {
                self.container_store.add(container)?;
                Ok(id)
            }
            Err(e) => {
                warn!("create container '{name}' failed, rolling back: {e}");
                self.rollback_create_container(&id, &allocated).await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_container_steps(
        &self,
        id: &str,
        name: &str,
        sandbox_id: &str,
        sandbox_pid: u32,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
        allocated: &mut Allocated,
    ) -> Result<Container> {
        self.container_names.reserve(name, id)?;
        allocated.name = Some(name.to_string());

        // Resolve the image locally; create never pulls. Taking the lease
        // is what makes create-vs-remove linearizable: losing the race
        // reads as the image being gone.
        let reference = config
            .image
            .as_ref()
            .map(|spec| spec.image.as_str())
            .unwrap_or_default();
        let image = self.local_resolve(reference)?.ok_or_else(|| {
            StoreError::ImageNotFound { image_id: reference.to_string() }
        })?;
        self.image_store.lease(&image.id).map_err(|_| {
            StoreError::ImageNotFound { image_id: reference.to_string() }
        })?;
        allocated.image_lease = Some(image.id.clone());

        let root_dir = self.config.container_root(id);
        std::fs::create_dir_all(&root_dir).map_err(|e| {
            CriError::io(
                format!("create container root '{}'", root_dir.display()),
                e,
            )
        })?;
        allocated.root_dir = true;

        let mounts =
            self.generate_container_mounts(id, sandbox_id, config, sandbox_config, &image)?;

        let spec = build_container_spec(&ContainerSpecParams {
            id,
            config,
            sandbox_config,
            image_config: &image.config,
            sandbox_pid,
            mounts: &mounts,
            disable_cgroup: self.config.disable_cgroup,
            enable_selinux: self.config.enable_selinux,
            restrict_oom_score_adj: self.config.restrict_oom_score_adj,
        })?;
        let spec_json = serde_json::to_vec(&spec).map_err(|e| {
            CriError::internal(format!("serialize container spec: {e}"))
        })?;

        let log_path = container_log_path(config, sandbox_config);
        let container_io = Arc::new(
            io::ContainerIo::new(
                &self.config.container_io_dir(id),
                log_path.as_deref(),
                config.stdin,
                self.config.max_container_log_line_size,
            )
            .await
            .map_err(|e| CriError::internal(e.to_string()))?,
        );
        allocated.io = Some(Arc::clone(&container_io));

        let metadata = ContainerMetadata {
            id: id.to_string(),
            name: name.to_string(),
            sandbox_id: sandbox_id.to_string(),
            config: config.clone(),
            image_ref: image.id.clone(),
            log_path,
            spec,
            created_at: unix_nanos(),
        };
        let mut labels = HashMap::new();
        let _ = labels.insert(
            CONTAINER_METADATA_LABEL.to_string(),
            crate::recovery::encode_metadata(&metadata)?,
        );

        // Writable snapshot on top of the image's layer chain.
        let _ = self.engine.prepare_snapshot(id, &image.chain_id).await?;
        allocated.snapshot = true;

        self.engine
            .create_container(NewEngineContainer {
                id: id.to_string(),
                image_ref: reference.to_string(),
                snapshot_key: id.to_string(),
                spec_json,
                labels,
            })
            .await?;
        allocated.engine_container = true;

        Ok(Container::new(metadata, Some(container_io)))
    }

    async fn rollback_create_container(&self, id: &str, allocated: &Allocated) {
        if allocated.engine_container {
            match self.engine.delete_container(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("rollback: delete container '{id}': {e}"),
            }
        }
        if allocated.snapshot {
            match self.engine.remove_snapshot(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("rollback: remove snapshot '{id}': {e}"),
            }
        }
        if let Some(container_io) = &allocated.io {
            container_io.close();
        }
        if allocated.root_dir {
            if let Err(e) =
                std::fs::remove_dir_all(self.config.container_root(id))
            {
                warn!("rollback: remove container root '{id}': {e}");
            }
        }
        if let Some(image_id) = &allocated.image_lease {
            if let Err(e) = self.image_store.unlease(image_id) {
                warn!("rollback: unlease image '{image_id}': {e}");
            }
        }
        if let Some(name) = &allocated.name {
            self.container_names.release_by_name(name);
        }
    }

    /// Resolve a reference against the local image store only: verbatim
    /// first, then in normalized form. `None` means absent.
    pub(crate) fn local_resolve(
        &self,
        reference: &str,
    ) -> Result<Option<Image>> {
        if reference.is_empty() {
            return Err(CriError::invalid("container config has no image"));
        }
        if let Some(image) = self.image_store.resolve(reference) {
            return Ok(Some(image));
        }
        let Ok(parsed) = crate::image::refs::ImageReference::parse(reference)
        else {
            return Ok(None);
        };
        Ok(self.image_store.resolve(&parsed.pull_name()))
    }

    /// Bind mounts in override order: image volumes first, then the
    /// sandbox files, with user mounts last so they win on duplicate
    /// destinations.
    fn generate_container_mounts(
        &self,
        id: &str,
        sandbox_id: &str,
        config: &ContainerConfig,
        sandbox_config: &PodSandboxConfig,
        image: &Image,
    ) -> Result<Vec<Mount>> {
        let mut mounts: Vec<Mount> = Vec::new();
        let user_destinations: Vec<&str> = config
            .mounts
            .iter()
            .map(|m| m.container_path.as_str())
            .collect();

        if let Some(volumes) =
            image.config.config().as_ref().and_then(|c| c.volumes().clone())
        {
            for destination in &volumes {
                if user_destinations.contains(&destination.as_str()) {
                    continue;
                }
                let host_path = self
                    .config
                    .container_root(id)
                    .join("volumes")
                    .join(volume_dir_name(destination));
                std::fs::create_dir_all(&host_path).map_err(|e| {
                    CriError::io(
                        format!("create volume dir '{}'", host_path.display()),
                        e,
                    )
                })?;
                mounts.push(Mount {
                    container_path: destination.clone(),
                    host_path: host_path.display().to_string(),
                    ..Default::default()
                });
            }
        }

        mounts.push(Mount {
            container_path: "/etc/hosts".to_string(),
            host_path: self
                .config
                .sandbox_hosts_path(sandbox_id)
                .display()
                .to_string(),
            ..Default::default()
        });
        mounts.push(Mount {
            container_path: "/etc/resolv.conf".to_string(),
            host_path: self
                .config
                .sandbox_resolv_path(sandbox_id)
                .display()
                .to_string(),
            ..Default::default()
        });
        let shm_path = if host_ipc(sandbox_config) {
            PathBuf::from("/dev/shm")
        } else {
            self.config.sandbox_shm_path(sandbox_id)
        };
        mounts.push(Mount {
            container_path: "/dev/shm".to_string(),
            host_path: shm_path.display().to_string(),
            ..Default::default()
        });

        mounts.extend(config.mounts.iter().cloned());
        Ok(mounts)
    }
}

fn container_log_path(
    config: &ContainerConfig,
    sandbox_config: &PodSandboxConfig,
) -> Option<PathBuf> {
    if config.log_path.is_empty() || sandbox_config.log_directory.is_empty() {
        return None;
    }
    Some(PathBuf::from(&sandbox_config.log_directory).join(&config.log_path))
}

fn volume_dir_name(destination: &str) -> String {
    destination.trim_matches('/').replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_log_path_requires_both_parts() {
        let mut config = ContainerConfig::default();
        let mut sandbox_config = PodSandboxConfig::default();
        assert_eq!(container_log_path(&config, &sandbox_config), None);

        config.log_path = "app_0.log".to_string();
        assert_eq!(container_log_path(&config, &sandbox_config), None);

        sandbox_config.log_directory = "/var/log/pods/pod-1".to_string();
        assert_eq!(
            container_log_path(&config, &sandbox_config),
            Some(PathBuf::from("/var/log/pods/pod-1/app_0.log"))
        );
    }

    #[test]
    fn test_volume_dir_name_flattens_path() {
        assert_eq!(volume_dir_name("/var/lib/data"), "var_lib_data");
        assert_eq!(volume_dir_name("/cache"), "cache");
    }
}
