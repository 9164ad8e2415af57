/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! RemoveContainer.

use crate::cri::{CriError, CriService, Result};
use crate::store::StoreError;
use proto::cri::ContainerState;
use tracing::{info, warn};

impl CriService {
    /// Remove a CREATED or EXITED container. Removing an unknown container
    /// is success so repeated calls converge.
    pub(crate) async fn remove_container(&self, id: &str) -> Result<()> {
        let container = match self.container_store.get(id) {
            Ok(container) => container,
            Err(StoreError::ContainerNotFound { .. }) => {
                warn!("remove of unknown container '{id}'");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match container.state() {
            ContainerState::ContainerCreated
            | ContainerState::ContainerExited => {}
            state => {
                return Err(CriError::precondition(format!(
                    "container '{id}' is in state {state:?}, stop it first"
                )))
            }
        }

        if let Some(io) = &container.io {
            io.close();
        }

        // The exit handler normally deletes the task; tolerate whatever is
        // left over from crashes.
        match self.engine.delete_task(id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to delete task of '{id}': {e}"),
        }
        match self.engine.delete_container(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        match self.engine.remove_snapshot(id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let root_dir = self.config.container_root(id);
        if let Err(e) = std::fs::remove_dir_all(&root_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(CriError::io(
                    format!("remove container root '{}'", root_dir.display()),
                    e,
                ));
            }
        }
        let io_dir = self.config.container_io_dir(id);
        if let Err(e) = std::fs::remove_dir_all(&io_dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove io dir '{}': {e}", io_dir.display());
            }
        }

        if let Err(e) = self.image_store.unlease(&container.metadata.image_ref)
        {
            warn!("failed to unlease image of '{id}': {e}");
        }
        self.container_store.delete(id);
        self.container_names.release_by_name(&container.metadata.name);
        info!("removed container '{id}'");
        Ok(())
    }
}
