/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Catalog of live pod sandboxes.

use super::{Result, StoreError};
use proto::cri::{PodSandboxConfig, PodSandboxState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Persisted identity and configuration of a sandbox. This is what gets
/// serialized into the engine container label and read back by recovery.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxMetadata {
    pub id: String,
    pub name: String,
    pub config: PodSandboxConfig,
    /// Path of the network namespace; empty for host-network pods.
    pub net_ns_path: String,
    /// Resolved id of the sandbox (pause) image.
    pub image_ref: String,
    pub runtime_handler: String,
    pub created_at: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SandboxState {
    Ready,
    NotReady,
}

impl From<SandboxState> for PodSandboxState {
    fn from(state: SandboxState) -> Self {
        match state {
            SandboxState::Ready => PodSandboxState::SandboxReady,
            SandboxState::NotReady => PodSandboxState::SandboxNotready,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Sandbox {
    pub metadata: SandboxMetadata,
    pub state: SandboxState,
    /// Pid of the pause task, 0 once it has exited.
    pub task_pid: u32,
    /// Primary pod IP reported by CNI setup; empty for host-network pods
    /// and after a daemon restart.
    pub ip: String,
}

impl Sandbox {
    pub fn new(metadata: SandboxMetadata, task_pid: u32) -> Self {
        Self { metadata, state: SandboxState::Ready, task_pid, ip: String::new() }
    }

    pub fn id(&self) -> &str {
        &self.metadata.id
    }
}

type Cache = HashMap<String, Arc<RwLock<Sandbox>>>;

/// The sandbox store owns all sandboxes known to the daemon. Removing a
/// sandbox from here is the last step of `RemovePodSandbox`.
#[derive(Debug, Default)]
pub struct SandboxStore {
    cache: RwLock<Cache>,
}

impl SandboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sandbox: Sandbox) -> Result<()> {
        let mut cache = self.cache.write().expect("sandbox store lock");
        if cache.contains_key(sandbox.id()) {
            return Err(StoreError::SandboxExists {
                sandbox_id: sandbox.id().to_string(),
            });
        }
        let _ = cache.insert(
            sandbox.id().to_string(),
            Arc::new(RwLock::new(sandbox)),
        );
        Ok(())
    }

    /// Get returns a snapshot copy of the sandbox.
    pub fn get(&self, sandbox_id: &str) -> Result<Sandbox> {
        let cache = self.cache.read().expect("sandbox store lock");
        let Some(entry) = cache.get(sandbox_id) else {
            return Err(StoreError::SandboxNotFound {
                sandbox_id: sandbox_id.to_string(),
            });
        };
        let sandbox = entry.read().expect("sandbox entry lock").clone();
        Ok(sandbox)
    }

    /// List returns snapshot copies of all sandboxes.
    pub fn list(&self) -> Vec<Sandbox> {
        let cache = self.cache.read().expect("sandbox store lock");
        cache
            .values()
            .map(|entry| entry.read().expect("sandbox entry lock").clone())
            .collect()
    }

    /// Update applies `f` under the per-entity lock. Two updates of the same
    /// sandbox are serialized; updates of different sandboxes are not.
    pub fn update<F>(&self, sandbox_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Sandbox),
    {
        let entry = {
            let cache = self.cache.read().expect("sandbox store lock");
            let Some(entry) = cache.get(sandbox_id) else {
                return Err(StoreError::SandboxNotFound {
                    sandbox_id: sandbox_id.to_string(),
                });
            };
            Arc::clone(entry)
        };
        let mut sandbox = entry.write().expect("sandbox entry lock");
        f(&mut sandbox);
        Ok(())
    }

    /// Delete is idempotent.
    pub fn delete(&self, sandbox_id: &str) {
        let mut cache = self.cache.write().expect("sandbox store lock");
        let _ = cache.remove(sandbox_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::unix_nanos;

    fn sandbox_for_tests(id: &str) -> Sandbox {
        Sandbox::new(
            SandboxMetadata {
                id: id.to_string(),
                name: format!("{id}_default_uid_0"),
                config: PodSandboxConfig::default(),
                net_ns_path: String::new(),
                image_ref: "sha256:pause".to_string(),
                runtime_handler: String::new(),
                created_at: unix_nanos(),
            },
            42,
        )
    }

    #[test]
    fn test_add_get() {
        let store = SandboxStore::new();
        store.add(sandbox_for_tests("sb-1")).expect("add");

        let got = store.get("sb-1").expect("get");
        assert_eq!(got.id(), "sb-1");
        assert_eq!(got.state, SandboxState::Ready);
    }

    #[test]
    fn test_add_duplicate_is_error() {
        let store = SandboxStore::new();
        store.add(sandbox_for_tests("sb-1")).expect("add");
        assert!(matches!(
            store.add(sandbox_for_tests("sb-1")),
            Err(StoreError::SandboxExists { sandbox_id }) if sandbox_id == "sb-1"
        ));
    }

    #[test]
    fn test_get_missing_is_error() {
        let store = SandboxStore::new();
        assert!(matches!(
            store.get("missing"),
            Err(StoreError::SandboxNotFound { sandbox_id }) if sandbox_id == "missing"
        ));
    }

    #[test]
    fn test_update_is_visible_to_readers() {
        let store = SandboxStore::new();
        store.add(sandbox_for_tests("sb-1")).expect("add");

        store
            .update("sb-1", |sandbox| {
                sandbox.state = SandboxState::NotReady;
                sandbox.task_pid = 0;
            })
            .expect("update");

        let got = store.get("sb-1").expect("get");
        assert_eq!(got.state, SandboxState::NotReady);
        assert_eq!(got.task_pid, 0);
    }

    #[test]
    fn test_list_returns_snapshots() {
        let store = SandboxStore::new();
        store.add(sandbox_for_tests("sb-1")).expect("add");
        store.add(sandbox_for_tests("sb-2")).expect("add");

        let mut listed = store.list();
        listed.sort_by(|a, b| a.metadata.id.cmp(&b.metadata.id));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id(), "sb-1");

        // Mutating the listed copy must not touch the store.
        let mut copy = listed.remove(0);
        copy.state = SandboxState::NotReady;
        assert_eq!(store.get("sb-1").expect("get").state, SandboxState::Ready);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = SandboxStore::new();
        store.add(sandbox_for_tests("sb-1")).expect("add");
        store.delete("sb-1");
        store.delete("sb-1");
        assert!(store.get("sb-1").is_err());
    }
}
