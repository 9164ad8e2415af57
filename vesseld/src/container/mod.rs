/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Container lifecycle.

use crate::cri::{CriError, CriService, Result};
use proto::cri::ContainerState;

pub mod io;

mod create;
mod remove;
mod start;
mod stats;
mod status;
mod stop;
mod update;

impl CriService {
    /// Re-open the container log file after external rotation. No state
    /// machine change.
    pub(crate) async fn reopen_container_log(&self, id: &str) -> Result<()> {
        let container = self.container_store.get(id)?;
        if container.state() != ContainerState::ContainerRunning {
            return Err(CriError::precondition(format!(
                "container '{id}' is not running, cannot reopen log"
            )));
        }
        let log = container
            .io
            .as_ref()
            .and_then(|io| io.log())
            .ok_or_else(|| {
                CriError::precondition(format!("container '{id}' has no log"))
            })?;
        log.reopen().await.map_err(|e| CriError::internal(e.to_string()))
    }
}
