/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! StopPodSandbox.

use crate::cni::PodNetwork;
use crate::cri::{CriService, Result};
use crate::engine::TaskState;
use crate::netns;
use crate::store::sandbox::SandboxState;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Grace period granted to each workload container when its sandbox stops.
const SANDBOX_STOP_CONTAINER_TIMEOUT: i64 = 10;

/// How long to wait for the pause task to disappear after SIGKILL.
const PAUSE_KILL_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

const SIGKILL: u32 = 9;

impl CriService {
    pub(crate) async fn stop_pod_sandbox(&self, id: &str) -> Result<()> {
        let sandbox = self.sandbox_store.get(id)?;

        // Stop all workload containers first, logging failures rather than
        // aborting the sandbox stop.
        for container in self.container_store.list() {
            if container.metadata.sandbox_id != id {
                continue;
            }
            if let Err(e) = self
                .stop_container(container.id(), SANDBOX_STOP_CONTAINER_TIMEOUT)
                .await
            {
                warn!(
                    "failed to stop container '{}' in sandbox '{id}': {e}",
                    container.id()
                );
            }
        }

        // Detach from the network while the netns still exists.
        let net_ns_path = sandbox.metadata.net_ns_path.clone();
        if !net_ns_path.is_empty() {
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

        // The pause task gets no grace period.
        match self.engine.kill_task(id, SIGKILL, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() || e.is_process_already_finished() => {}
            Err(e) => return Err(e.into()),
        }
        self.wait_pause_task_stopped(id).await?;

        self.sandbox_store.update(id, |sandbox| {
            sandbox.state = SandboxState::NotReady;
            sandbox.task_pid = 0;
        })?;
        info!("stopped sandbox '{id}'");
        Ok(())
    }

    async fn wait_pause_task_stopped(&self, id: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + PAUSE_KILL_TIMEOUT;
        loop {
            match self.engine.get_task(id).await {
                Ok(status) if status.state == TaskState::Stopped => {
                    return Ok(())
                }
                Ok(_) => {}
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(crate::cri::CriError::internal(format!(
                    "timed out waiting for sandbox '{id}' pause task to stop"
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
