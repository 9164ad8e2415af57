/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! StartContainer.

use crate::cri::{CriError, CriService, Result};
use crate::engine::TaskIo;
use crate::store::unix_nanos;
use proto::cri::ContainerState;
use tracing::{info, warn};

impl CriService {
    /// Start is only legal from CREATED. On failure the container stays
    /// CREATED so a later start can be attempted.
    pub(crate) async fn start_container(&self, id: &str) -> Result<()> {
        let container = self.container_store.get(id)?;
        if container.state() != ContainerState::ContainerCreated {
            return Err(CriError::precondition(format!(
                "container '{id}' is in state {:?}, expected created",
                container.state()
            )));
        }

        let io = container
            .io
            .as_ref()
            .ok_or_else(|| CriError::internal(format!(
                "container '{id}' has no io attached"
            )))?;
        let task_io = TaskIo {
            stdin: io
                .stdin_path()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            stdout: io.stdout_path().display().to_string(),
            stderr: io.stderr_path().display().to_string(),
            terminal: container.metadata.config.tty,
        };

        let rootfs = self.engine.snapshot_mounts(id).await?;
        let pid = match self.engine.create_task(id, &rootfs, &task_io).await {
            Ok(pid) => pid,
            Err(e) => {
                return Err(e.into());
            }
        };
        if let Err(e) = self.engine.start_task(id).await {
            // Unwind the created task so the next start attempt is clean.
            match self.engine.delete_task(id).await {
                Ok(_) => {}
                Err(cleanup) if cleanup.is_not_found() => {}
                Err(cleanup) => {
                    warn!("failed to delete task of '{id}' after start failure: {cleanup}")
                }
            }
            return Err(e.into());
        }

        self.container_store.update(id, |container| {
            container.status.pid = pid;
            container.status.started_at = unix_nanos();
        })?;
        info!("started container '{id}'");
        Ok(())
    }
}
