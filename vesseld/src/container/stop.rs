/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! StopContainer.
//!
//! The authoritative EXITED transition is made by the event monitor when
//! the task-exit event arrives; this path only signals the process and
//! waits for the store to reflect the exit.

use crate::cri::{CriError, CriService, Result};
use crate::store::container::Container;
use crate::store::StoreError;
use nix::sys::signal::Signal;
use proto::cri::ContainerState;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Fixed cap on waiting for SIGKILL to take effect.
const KILL_TIMEOUT: Duration = Duration::from_secs(120);

/// Poll interval while waiting for the exit transition.
const STOP_CHECK_POLL_INTERVAL: Duration = Duration::from_millis(100);

impl CriService {
    /// Stop a running container with a grace period. Stopping a container
    /// that is not running is success without state change.
    pub(crate) async fn stop_container(&self, id: &str, timeout: i64) -> Result<()> {
        let container = self.container_store.get(id)?;
        if container.state() != ContainerState::ContainerRunning {
            info!(
                "container to stop '{id}' is not running, state {:?}",
                container.state()
            );
            return Ok(());
        }

        if timeout > 0 {
            let signal = self.stop_signal(&container);
            info!(
                "stopping container '{id}' with {} ({timeout}s grace)",
                signal.as_str()
            );
            match self.engine.kill_task(id, signal as u32, true).await {
                Ok(()) => {}
                Err(e)
                    if e.is_not_found()
                        || e.is_process_already_finished() => {}
                Err(e) => return Err(e.into()),
            }
            if self
                .wait_container_stop(id, Duration::from_secs(timeout as u64))
                .await
                .is_ok()
            {
                return Ok(());
            }
            warn!("container '{id}' did not exit within {timeout}s, killing");
        }

        match self.engine.kill_task(id, Signal::SIGKILL as u32, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() || e.is_process_already_finished() => {}
            Err(e) => return Err(e.into()),
        }
        self.wait_container_stop(id, KILL_TIMEOUT).await.map_err(|_| {
            CriError::internal(format!(
                "timed out waiting for container '{id}' to stop after SIGKILL"
            ))
        })
    }

    /// Stop signal from the image config, defaulting to SIGTERM. The image
    /// may legitimately be gone already; that also means SIGTERM.
    fn stop_signal(&self, container: &Container) -> Signal {
        let Ok(image) = self.image_store.get(&container.metadata.image_ref)
        else {
            return Signal::SIGTERM;
        };
        let Some(name) =
            image.config.config().as_ref().and_then(|c| c.stop_signal().clone())
        else {
            return Signal::SIGTERM;
        };
        match Signal::from_str(&name) {
            Ok(signal) => signal,
            Err(_) => {
                warn!("unparseable stop signal '{name}', using SIGTERM");
                Signal::SIGTERM
            }
        }
    }

    /// Poll the store until the monitor records the exit. A container
    /// removed mid-wait counts as stopped.
    async fn wait_container_stop(
        &self,
        id: &str,
        timeout: Duration,
    ) -> std::result::Result<(), ()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.container_store.get(id) {
                Ok(container)
                    if container.state() == ContainerState::ContainerExited =>
                {
                    return Ok(())
                }
                Ok(_) => {}
                Err(StoreError::ContainerNotFound { .. }) => {
                    warn!("container '{id}' was removed during stop");
                    return Ok(());
                }
                Err(_) => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(());
            }
            tokio::time::sleep(STOP_CHECK_POLL_INTERVAL).await;
        }
    }
}
