/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Catalog of live containers.

use super::{Result, StoreError};
use crate::container::io::ContainerIo;
use oci_spec::runtime::Spec;
use proto::cri::{ContainerConfig, ContainerState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// Exit reason recorded when the task was killed by the kernel OOM killer.
pub const OOM_EXIT_REASON: &str = "OOMKilled";

/// Persisted identity and configuration of a container; serialized into the
/// engine container label and read back by recovery. The OCI spec snapshot
/// travels with it so `ExecSync` after a restart still sees the process
/// environment the container was created with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub id: String,
    pub name: String,
    pub sandbox_id: String,
    pub config: ContainerConfig,
    /// Resolved image id the container was created from.
    pub image_ref: String,
    pub log_path: Option<PathBuf>,
    pub spec: Spec,
    pub created_at: i64,
}

/// Mutable runtime status. The state machine is encoded in the timestamps:
/// `finished_at > 0` iff EXITED, otherwise `started_at > 0` iff RUNNING,
/// otherwise CREATED. EXITED is monotone because `finished_at` is never
/// cleared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerStatus {
    pub pid: u32,
    pub started_at: i64,
    pub finished_at: i64,
    pub exit_code: i32,
}

impl ContainerStatus {
    pub fn state(&self) -> ContainerState {
        if self.finished_at > 0 {
            ContainerState::ContainerExited
        } else if self.started_at > 0 {
            ContainerState::ContainerRunning
        } else {
            ContainerState::ContainerCreated
        }
    }
}

#[derive(Clone, Debug)]
pub struct Container {
    pub metadata: ContainerMetadata,
    pub status: ContainerStatus,
    /// Reason the container is in its current state, e.g. "OOMKilled".
    pub reason: String,
    pub message: String,
    /// Stdio pumps; absent once the container is removed or when recovery
    /// found the task gone.
    pub io: Option<Arc<ContainerIo>>,
}

impl Container {
    pub fn new(metadata: ContainerMetadata, io: Option<Arc<ContainerIo>>) -> Self {
        Self {
            metadata,
            status: ContainerStatus::default(),
            reason: String::new(),
            message: String::new(),
            io,
        }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn state(&self) -> ContainerState {
        self.status.state()
    }
}

type Cache = HashMap<String, Arc<RwLock<Container>>>;

/// The container store owns all containers known to the daemon.
#[derive(Debug, Default)]
pub struct ContainerStore {
    cache: RwLock<Cache>,
}

impl ContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, container: Container) -> Result<()> {
        let mut cache = self.cache.write().expect("container store lock");
        if cache.contains_key(container.id()) {
            return Err(StoreError::ContainerExists {
                container_id: container.id().to_string(),
            });
        }
        let _ = cache.insert(
            container.id().to_string(),
            Arc::new(RwLock::new(container)),
        );
        Ok(())
    }

    /// Get returns a snapshot copy of the container.
    pub fn get(&self, container_id: &str) -> Result<Container> {
        let cache = self.cache.read().expect("container store lock");
        let Some(entry) = cache.get(container_id) else {
            return Err(StoreError::ContainerNotFound {
                container_id: container_id.to_string(),
            });
        };
        let container = entry.read().expect("container entry lock").clone();
        Ok(container)
    }

    /// List returns snapshot copies of all containers.
    pub fn list(&self) -> Vec<Container> {
        let cache = self.cache.read().expect("container store lock");
        cache
            .values()
            .map(|entry| entry.read().expect("container entry lock").clone())
            .collect()
    }

    /// Update applies `f` under the per-entity lock. All state transitions
    /// flow through here, which is what serializes a `StopContainer` kill
    /// against the event monitor's exit handling.
    pub fn update<F>(&self, container_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Container),
    {
        let entry = {
            let cache = self.cache.read().expect("container store lock");
            let Some(entry) = cache.get(container_id) else {
                return Err(StoreError::ContainerNotFound {
                    container_id: container_id.to_string(),
                });
            };
            Arc::clone(entry)
        };
        let mut container = entry.write().expect("container entry lock");
        f(&mut container);
        Ok(())
    }

    /// Delete is idempotent.
    pub fn delete(&self, container_id: &str) {
        let mut cache = self.cache.write().expect("container store lock");
        let _ = cache.remove(container_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::unix_nanos;

    pub(crate) fn container_for_tests(id: &str, sandbox_id: &str) -> Container {
        Container::new(
            ContainerMetadata {
                id: id.to_string(),
                name: format!("{id}_sandbox_default_uid_0"),
                sandbox_id: sandbox_id.to_string(),
                config: ContainerConfig::default(),
                image_ref: "sha256:test".to_string(),
                log_path: None,
                spec: Spec::default(),
                created_at: unix_nanos(),
            },
            None,
        )
    }

    #[test]
    fn test_state_machine_from_timestamps() {
        let mut status = ContainerStatus::default();
        assert_eq!(status.state(), ContainerState::ContainerCreated);

        status.started_at = unix_nanos();
        assert_eq!(status.state(), ContainerState::ContainerRunning);

        status.finished_at = unix_nanos();
        assert_eq!(status.state(), ContainerState::ContainerExited);

        // EXITED is monotone even if started_at is cleared afterwards.
        status.started_at = 0;
        assert_eq!(status.state(), ContainerState::ContainerExited);
    }

    #[test]
    fn test_add_get_delete() {
        let store = ContainerStore::new();
        store.add(container_for_tests("c-1", "sb-1")).expect("add");
        assert_eq!(store.get("c-1").expect("get").id(), "c-1");

        store.delete("c-1");
        assert!(matches!(
            store.get("c-1"),
            Err(StoreError::ContainerNotFound { container_id }) if container_id == "c-1"
        ));
    }

    #[test]
    fn test_add_duplicate_is_error() {
        let store = ContainerStore::new();
        store.add(container_for_tests("c-1", "sb-1")).expect("add");
        assert!(matches!(
            store.add(container_for_tests("c-1", "sb-1")),
            Err(StoreError::ContainerExists { container_id }) if container_id == "c-1"
        ));
    }

    #[test]
    fn test_update_transitions_state() {
        let store = ContainerStore::new();
        store.add(container_for_tests("c-1", "sb-1")).expect("add");

        store
            .update("c-1", |container| {
                container.status.pid = 7;
                container.status.started_at = unix_nanos();
            })
            .expect("update");
        assert_eq!(
            store.get("c-1").expect("get").state(),
            ContainerState::ContainerRunning
        );

        store
            .update("c-1", |container| {
                container.status.finished_at = unix_nanos();
                container.status.exit_code = 137;
                container.reason = OOM_EXIT_REASON.to_string();
            })
            .expect("update");

        let got = store.get("c-1").expect("get");
        assert_eq!(got.state(), ContainerState::ContainerExited);
        assert_eq!(got.status.exit_code, 137);
        assert_eq!(got.reason, OOM_EXIT_REASON);
    }

    #[test]
    fn test_update_missing_is_error() {
        let store = ContainerStore::new();
        assert!(store.update("missing", |_| {}).is_err());
    }
}
