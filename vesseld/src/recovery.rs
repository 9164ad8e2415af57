/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Crash recovery.
//!
//! Sandboxes and containers persist their metadata as a versioned JSON
//! envelope in an engine container label. At startup the label set is the
//! source of truth for membership; the engine's task table is only probed
//! to recompute the runtime state. Name collisions in the persisted data
//! mean the state is corrupt, and the daemon refuses to serve it.

use crate::container::io::ContainerIo;
use crate::cri::{
    CriError, CriService, Result, CONTAINER_METADATA_LABEL,
    SANDBOX_METADATA_LABEL,
};
use crate::engine::TaskState;
use crate::store::container::{Container, ContainerMetadata};
use crate::store::sandbox::{Sandbox, SandboxMetadata, SandboxState};
use crate::store::unix_nanos;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Current version of the persisted metadata envelope.
const METADATA_VERSION: &str = "v1";

const UNKNOWN_EXIT_CODE: i32 = 255;

#[derive(Serialize, Deserialize)]
struct Versioned<T> {
    version: String,
    #[serde(flatten)]
    metadata: T,
}

/// Wrap metadata in the versioned envelope for the engine label.
pub(crate) fn encode_metadata<T: Serialize>(metadata: &T) -> Result<String> {
    serde_json::to_string(&Versioned {
        version: METADATA_VERSION.to_string(),
        metadata,
    })
    .map_err(|e| CriError::internal(format!("encode metadata: {e}")))
}

fn decode_metadata<T: DeserializeOwned>(payload: &str) -> Result<T> {
    let versioned: Versioned<T> =
        serde_json::from_str(payload).map_err(|e| {
            CriError::internal(format!("malformed metadata label: {e}"))
        })?;
    if versioned.version != METADATA_VERSION {
        return Err(CriError::internal(format!(
            "unsupported metadata version '{}'",
            versioned.version
        )));
    }
    Ok(versioned.metadata)
}

impl CriService {
    /// Rebuild the stores from engine state. Must complete before the gRPC
    /// surface starts accepting traffic.
    pub async fn recover(&self) -> Result<()> {
        let engine_containers = self.engine.list_containers().await?;

        let mut sandboxes: Vec<SandboxMetadata> = Vec::new();
        let mut containers: Vec<ContainerMetadata> = Vec::new();
        for record in &engine_containers {
            if let Some(payload) = record.labels.get(SANDBOX_METADATA_LABEL) {
                sandboxes.push(decode_metadata(payload)?);
            } else if let Some(payload) =
                record.labels.get(CONTAINER_METADATA_LABEL)
            {
                containers.push(decode_metadata(payload)?);
            }
        }
        info!(
            "recovering {} sandboxes and {} containers",
            sandboxes.len(),
            containers.len()
        );

        for metadata in sandboxes {
            self.recover_sandbox(metadata).await?;
        }
        for metadata in containers {
            self.recover_container(metadata).await?;
        }
        Ok(())
    }

    async fn recover_sandbox(&self, metadata: SandboxMetadata) -> Result<()> {
        let id = metadata.id.clone();
        let name = metadata.name.clone();

        let (state, task_pid) = match self.engine.get_task(&id).await {
            Ok(status) if status.state == TaskState::Running => {
                (SandboxState::Ready, status.pid)
            }
            _ => (SandboxState::NotReady, 0),
        };

        if !metadata.net_ns_path.is_empty()
            && !Path::new(&metadata.net_ns_path).exists()
        {
            warn!(
                "netns '{}' of sandbox '{id}' is gone",
                metadata.net_ns_path
            );
        }

        // Collisions in persisted names mean the label set lies; refuse
        // to serve from it.
        self.sandbox_names.reserve(&name, &id).map_err(|e| {
            CriError::internal(format!(
                "persisted sandbox state is inconsistent: {e}"
            ))
        })?;
        if let Err(e) = self.image_store.lease(&metadata.image_ref) {
            // The image store starts empty after a restart; the reference
            // count rebuilds as images are listed again.
            warn!("cannot re-lease sandbox image '{}': {e}", metadata.image_ref);
        }

        let mut sandbox = Sandbox::new(metadata, task_pid);
        sandbox.state = state;
        self.sandbox_store.add(sandbox)?;
        info!("recovered sandbox '{id}'");
        Ok(())
    }

    async fn recover_container(&self, metadata: ContainerMetadata) -> Result<()> {
        let id = metadata.id.clone();
        let name = metadata.name.clone();

        if self.sandbox_store.get(&metadata.sandbox_id).is_err() {
            warn!(
                "skipping container '{id}': sandbox '{}' was not recovered",
                metadata.sandbox_id
            );
            return Ok(());
        }

        self.container_names.reserve(&name, &id).map_err(|e| {
            CriError::internal(format!(
                "persisted container state is inconsistent: {e}"
            ))
        })?;

        let mut container = match self.engine.get_task(&id).await {
            Ok(status) => {
                // Task survives: reattach stdio, with the log file opened
                // in append mode so rotation history is preserved.
                let io = ContainerIo::new(
                    &self.config.container_io_dir(&id),
                    metadata.log_path.as_deref(),
                    metadata.config.stdin,
                    self.config.max_container_log_line_size,
                )
                .await
                .map_err(|e| CriError::internal(e.to_string()))?;
                let mut container =
                    Container::new(metadata, Some(Arc::new(io)));
                match status.state {
                    TaskState::Running => {
                        container.status.pid = status.pid;
                        container.status.started_at =
                            container.metadata.created_at;
                    }
                    TaskState::Created => {}
                    _ => {
                        container.status.started_at =
                            container.metadata.created_at;
                        container.status.finished_at = if status.exited_at > 0
                        {
                            status.exited_at
                        } else {
                            unix_nanos()
                        };
                        container.status.exit_code =
                            status.exit_status as i32;
                    }
                }
                container
            }
            Err(e) if e.is_not_found() => {
                let mut container = Container::new(metadata, None);
                container.status.started_at = container.metadata.created_at;
                container.status.finished_at = unix_nanos();
                container.status.exit_code = UNKNOWN_EXIT_CODE;
                container
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) =
            self.image_store.lease(&container.metadata.image_ref)
        {
            warn!(
                "cannot re-lease image '{}' of container '{id}': {e}",
                container.metadata.image_ref
            );
        }
        container.message = String::new();
        self.container_store.add(container)?;
        info!("recovered container '{id}'");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::cri::PodSandboxConfig;

    #[test]
    fn test_metadata_round_trip() {
        let metadata = SandboxMetadata {
            id: "sb-1".to_string(),
            name: "pod_default_uid_0".to_string(),
            config: PodSandboxConfig::default(),
            net_ns_path: "/var/run/netns/sb-1".to_string(),
            image_ref: "sha256:pause".to_string(),
            runtime_handler: String::new(),
            created_at: 42,
        };
        let encoded = encode_metadata(&metadata).expect("encode");
        assert!(encoded.contains("\"version\":\"v1\""));

        let decoded: SandboxMetadata =
            decode_metadata(&encoded).expect("decode");
        assert_eq!(decoded.id, "sb-1");
        assert_eq!(decoded.net_ns_path, "/var/run/netns/sb-1");
        assert_eq!(decoded.created_at, 42);
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let payload = r#"{"version":"v9","id":"x"}"#;
        let result: Result<SandboxMetadata> = decode_metadata(payload);
        assert!(result.is_err());
    }
}
