/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Seam to the OCI engine.
//!
//! The daemon consumes the engine's content store, image store, snapshotter,
//! task service and event bus strictly through [`Engine`]. The production
//! implementation speaks gRPC to containerd; tests run against the in-memory
//! fake in [`testing`].

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;

mod containerd;
#[doc(hidden)]
pub mod testing;

pub use containerd::Containerd;

pub(crate) type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("'{resource}' not found in the engine")]
    NotFound { resource: String },
    #[error("'{resource}' already exists in the engine")]
    AlreadyExists { resource: String },
    #[error("engine is unreachable: {message}")]
    Unavailable { message: String },
    #[error("engine rejected the request: {message}")]
    Rejected { message: String },
    #[error("engine request failed: {message}")]
    Failed { message: String },
    #[error("malformed engine payload: {message}")]
    Malformed { message: String },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound { .. })
    }

    /// True for the runc shim's "process already finished" rejection, which
    /// stop paths treat the same as NotFound.
    pub fn is_process_already_finished(&self) -> bool {
        matches!(
            self,
            EngineError::Rejected { message } if message.contains("process already finished")
        )
    }

    pub(crate) fn from_status(resource: &str, status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::NotFound => EngineError::NotFound {
                resource: resource.to_string(),
            },
            tonic::Code::AlreadyExists => EngineError::AlreadyExists {
                resource: resource.to_string(),
            },
            tonic::Code::Unavailable => EngineError::Unavailable {
                message: status.message().to_string(),
            },
            tonic::Code::FailedPrecondition => EngineError::Rejected {
                message: status.message().to_string(),
            },
            _ => EngineError::Failed {
                message: format!("{resource}: {}", status.message()),
            },
        }
    }
}

/// A content descriptor, as the engine image store records it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: i64,
}

/// A reference entry in the engine image store.
#[derive(Clone, Debug)]
pub struct EngineImage {
    pub name: String,
    pub target: Descriptor,
}

/// A mount line returned by the snapshotter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mount {
    pub mount_type: String,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

/// Usage numbers for one snapshot key.
#[derive(Clone, Debug, Default)]
pub struct SnapshotUsage {
    pub key: String,
    pub size: u64,
    pub inodes: u64,
}

/// A container record in the engine, as needed for recovery.
#[derive(Clone, Debug, Default)]
pub struct EngineContainer {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Everything the engine needs to create a container record.
#[derive(Clone, Debug)]
pub struct NewEngineContainer {
    pub id: String,
    pub image_ref: String,
    pub snapshot_key: String,
    pub spec_json: Vec<u8>,
    pub labels: HashMap<String, String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Unknown,
    Created,
    Running,
    Stopped,
    Paused,
}

/// Point-in-time task status.
#[derive(Clone, Copy, Debug)]
pub struct TaskStatus {
    pub state: TaskState,
    pub pid: u32,
    pub exit_status: u32,
    pub exited_at: i64,
}

/// Terminal status of a task or exec process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExitStatus {
    pub exit_status: u32,
    pub exited_at: i64,
}

/// Stdio endpoints handed to the engine when starting a task or exec
/// process. Empty strings leave the stream unattached.
#[derive(Clone, Debug, Default)]
pub struct TaskIo {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

/// Per-task resource usage sampled from the engine.
#[derive(Clone, Debug, Default)]
pub struct TaskMetrics {
    pub id: String,
    pub timestamp: i64,
    pub cpu_usage_core_nanos: u64,
    pub memory_working_set_bytes: u64,
}

/// Decoded event bus envelope. Everything the monitor does not recognize
/// arrives as `Other` and is ignored.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    TaskExit {
        container_id: String,
        /// Process id within the task; equals `container_id` for init.
        id: String,
        pid: u32,
        exit_status: u32,
        exited_at: i64,
    },
    TaskOom { container_id: String },
    Other,
}

#[async_trait]
pub trait Engine: Send + Sync + 'static {
    async fn version(&self) -> Result<String>;

    // Image distribution.
    async fn pull_image(&self, reference: &str) -> Result<()>;
    async fn get_image(&self, name: &str) -> Result<Option<EngineImage>>;
    async fn create_image(&self, name: &str, target: &Descriptor) -> Result<()>;
    async fn delete_image(&self, name: &str, sync: bool) -> Result<()>;
    async fn read_content(&self, digest: &str) -> Result<Vec<u8>>;

    // Snapshots.
    async fn prepare_snapshot(&self, key: &str, parent: &str) -> Result<Vec<Mount>>;
    async fn view_snapshot(&self, key: &str, parent: &str) -> Result<Vec<Mount>>;
    async fn remove_snapshot(&self, key: &str) -> Result<()>;
    async fn snapshot_mounts(&self, key: &str) -> Result<Vec<Mount>>;
    async fn list_snapshot_usage(&self) -> Result<Vec<SnapshotUsage>>;

    // Containers.
    async fn create_container(&self, container: NewEngineContainer) -> Result<()>;
    async fn update_container_spec(&self, id: &str, spec_json: Vec<u8>) -> Result<()>;
    async fn list_containers(&self) -> Result<Vec<EngineContainer>>;
    async fn delete_container(&self, id: &str) -> Result<()>;

    // Tasks.
    async fn create_task(&self, id: &str, rootfs: &[Mount], io: &TaskIo) -> Result<u32>;
    async fn start_task(&self, id: &str) -> Result<()>;
    async fn kill_task(&self, id: &str, signal: u32, all: bool) -> Result<()>;
    async fn delete_task(&self, id: &str) -> Result<ExitStatus>;
    async fn get_task(&self, id: &str) -> Result<TaskStatus>;
    async fn update_task_resources(&self, id: &str, resources_json: Vec<u8>) -> Result<()>;
    async fn task_metrics(&self, ids: &[String]) -> Result<Vec<TaskMetrics>>;

    // Exec processes.
    async fn create_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        process_spec_json: Vec<u8>,
        io: &TaskIo,
    ) -> Result<()>;
    async fn start_exec(&self, container_id: &str, exec_id: &str) -> Result<u32>;
    async fn kill_exec(&self, container_id: &str, exec_id: &str, signal: u32) -> Result<()>;
    async fn wait_exec(&self, container_id: &str, exec_id: &str) -> Result<ExitStatus>;
    async fn delete_exec(&self, container_id: &str, exec_id: &str) -> Result<()>;

    /// Subscribe to the ordered event bus. The receiver closing signals a
    /// lost connection; callers reconnect by subscribing again.
    async fn subscribe_events(&self) -> Result<mpsc::Receiver<EngineEvent>>;
}
