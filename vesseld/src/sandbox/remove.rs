/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! RemovePodSandbox.

use crate::cni::PodNetwork;
use crate::cri::{CriError, CriService, Result};
use crate::engine::TaskState;
use crate::netns;
use crate::store::StoreError;
use std::path::Path;
use tracing::{info, warn};

impl CriService {
    /// Remove a fully-stopped sandbox and everything it owns. Removing an
    /// unknown sandbox is success, so the kubelet can retry blindly.
    pub(crate) async fn remove_pod_sandbox(&self, id: &str) -> Result<()> {
        let sandbox = match self.sandbox_store.get(id) {
            Ok(sandbox) => sandbox,
            Err(StoreError::SandboxNotFound { .. }) => {
                warn!("remove of unknown sandbox '{id}'");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match self.engine.get_task(id).await {
            Ok(status) if status.state != TaskState::Stopped => {
                return Err(CriError::precondition(format!(
                    "sandbox container '{id}' is not fully stopped"
                )));
            }
            Ok(_) | Err(_) => {}
        }

        // Cascade: the sandbox owns its containers.
        for container in self.container_store.list() {
            if container.metadata.sandbox_id == id {
                self.remove_container(container.id()).await?;
            }
        }

        // CNI teardown is normally done by stop; repeat it here only while
        // the pinned netns still exists, and treat failure as best-effort.
        let net_ns_path = sandbox.metadata.net_ns_path.clone();
        if !net_ns_path.is_empty() && Path::new(&net_ns_path).exists() {
            let metadata =
                sandbox.metadata.config.metadata.clone().unwrap_or_default();
            self.cni
                .teardown(&PodNetwork {
                    pod_name: &metadata.name,
                    pod_namespace: &metadata.namespace,
                    id,
                    net_ns_path: &net_ns_path,
                    port_mappings: &sandbox.metadata.config.port_mappings,
                })
                .await;
            if let Err(e) = netns::remove(Path::new(&net_ns_path)) {
                warn!("failed to remove netns of sandbox '{id}': {e}");
            }
        }

        match self.engine.delete_task(id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to delete pause task '{id}': {e}"),
        }
        match self.engine.remove_snapshot(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        super::files::cleanup_sandbox_files(
            &self.config,
            id,
            &sandbox.metadata.config,
        );
        let root_dir = self.config.sandbox_root(id);
        if let Err(e) = std::fs::remove_dir_all(&root_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(CriError::io(
                    format!("remove sandbox root '{}'", root_dir.display()),
                    e,
                ));
            }
        }

        match self.engine.delete_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self.image_store.unlease(&sandbox.metadata.image_ref) {
            warn!("failed to unlease sandbox image for '{id}': {e}");
        }
        self.sandbox_store.delete(id);
        self.sandbox_names.release_by_name(&sandbox.metadata.name);
        info!("removed sandbox '{id}'");
        Ok(())
    }
}
