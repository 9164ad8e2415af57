/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! containerd-backed [`Engine`] implementation.
//!
//! One gRPC channel is shared by all service clients; every request carries
//! the configured namespace.

use super::{
    Descriptor, Engine, EngineContainer, EngineError, EngineEvent, EngineImage,
    ExitStatus, Mount, NewEngineContainer, Result, SnapshotUsage, TaskIo,
    TaskMetrics, TaskState, TaskStatus,
};
use async_trait::async_trait;
use containerd_client::services::v1::container::Runtime as ContainerRuntime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::events_client::EventsClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    ListSnapshotsRequest, MountsRequest, PrepareSnapshotRequest,
    RemoveSnapshotRequest, UsageRequest, ViewSnapshotRequest,
};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::transfer_client::TransferClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateImageRequest, CreateTaskRequest,
    DeleteContainerRequest, DeleteImageRequest, DeleteProcessRequest,
    DeleteTaskRequest, ExecProcessRequest, GetImageRequest, GetRequest, Image,
    KillRequest, ListContainersRequest, MetricsRequest, ReadContentRequest,
    StartRequest, SubscribeRequest, TransferRequest, UpdateContainerRequest,
    UpdateImageRequest, UpdateTaskRequest, WaitRequest,
};
use containerd_client::types::transfer::{
    ImageStore, OciRegistry, UnpackConfiguration,
};
use containerd_client::types::{v1, Platform};
use containerd_client::{connect, to_any, with_namespace};
use prost::Message;
use std::path::Path;
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{trace, warn};

/// Type url the runc shim expects for OCI runtime spec payloads.
const SPEC_TYPE_URL: &str =
    "types.containerd.io/opencontainers/runtime-spec/1/Spec";
const PROCESS_TYPE_URL: &str =
    "types.containerd.io/opencontainers/runtime-spec/1/Process";
const RESOURCES_TYPE_URL: &str =
    "types.containerd.io/opencontainers/runtime-spec/1/LinuxResources";

const TASK_EXIT_TOPIC: &str = "/tasks/exit";
const TASK_OOM_TOPIC: &str = "/tasks/oom";

/// Buffer between the event pump and the monitor.
const EVENT_CHANNEL_CAPACITY: usize = 128;

#[derive(Clone, Debug)]
pub struct Containerd {
    channel: Channel,
    namespace: String,
    snapshotter: String,
    runtime_type: String,
}

impl Containerd {
    pub async fn connect(
        socket_path: &Path,
        namespace: &str,
        snapshotter: &str,
        runtime_type: &str,
    ) -> Result<Self> {
        let channel =
            connect(socket_path).await.map_err(|e| EngineError::Unavailable {
                message: format!(
                    "failed to connect to {}: {e}",
                    socket_path.display()
                ),
            })?;
        Ok(Self {
            channel,
            namespace: namespace.to_string(),
            snapshotter: snapshotter.to_string(),
            runtime_type: runtime_type.to_string(),
        })
    }

    fn platform() -> Platform {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            arch => arch,
        }
        .to_string();
        Platform {
            os: "linux".to_string(),
            architecture,
            variant: String::new(),
            os_version: String::new(),
        }
    }
}

fn ts_nanos(ts: Option<prost_types::Timestamp>) -> i64 {
    ts.map(|t| t.seconds.saturating_mul(1_000_000_000) + i64::from(t.nanos))
        .unwrap_or_default()
}

fn to_engine_mounts(mounts: Vec<containerd_client::types::Mount>) -> Vec<Mount> {
    mounts
        .into_iter()
        .map(|m| Mount {
            mount_type: m.r#type,
            source: m.source,
            target: m.target,
            options: m.options,
        })
        .collect()
}

fn to_containerd_mounts(mounts: &[Mount]) -> Vec<containerd_client::types::Mount> {
    mounts
        .iter()
        .map(|m| containerd_client::types::Mount {
            r#type: m.mount_type.clone(),
            source: m.source.clone(),
            target: m.target.clone(),
            options: m.options.clone(),
        })
        .collect()
}

fn spec_any(type_url: &str, json: Vec<u8>) -> prost_types::Any {
    prost_types::Any { type_url: type_url.to_string(), value: json }
}

// Minimal mirrors of `containerd.events.TaskExit` / `TaskOOM`; unknown
// fields in the envelope payload are skipped by prost.
#[derive(Clone, PartialEq, Message)]
struct TaskExitPayload {
    #[prost(string, tag = "1")]
    container_id: String,
    #[prost(string, tag = "2")]
    id: String,
    #[prost(uint32, tag = "3")]
    pid: u32,
    #[prost(uint32, tag = "4")]
    exit_status: u32,
    #[prost(message, optional, tag = "5")]
    exited_at: Option<prost_types::Timestamp>,
}

#[derive(Clone, PartialEq, Message)]
struct TaskOomPayload {
    #[prost(string, tag = "1")]
    container_id: String,
}

// Minimal mirror of the cgroup v1 `io.containerd.cgroups.v1.Metrics`
// payload, down to the fields the CRI stats need.
#[derive(Clone, PartialEq, Message)]
struct CgroupMetricsPayload {
    #[prost(message, optional, tag = "3")]
    cpu: Option<CpuStatPayload>,
    #[prost(message, optional, tag = "4")]
    memory: Option<MemoryStatPayload>,
}

#[derive(Clone, PartialEq, Message)]
struct CpuStatPayload {
    #[prost(message, optional, tag = "1")]
    usage: Option<CpuUsagePayload>,
}

#[derive(Clone, PartialEq, Message)]
struct CpuUsagePayload {
    #[prost(uint64, tag = "1")]
    total: u64,
}

#[derive(Clone, PartialEq, Message)]
struct MemoryStatPayload {
    #[prost(uint64, tag = "30")]
    total_inactive_file: u64,
    #[prost(message, optional, tag = "33")]
    usage: Option<MemoryEntryPayload>,
}

#[derive(Clone, PartialEq, Message)]
struct MemoryEntryPayload {
    #[prost(uint64, tag = "2")]
    usage: u64,
}

fn decode_event(topic: &str, payload: Option<&prost_types::Any>) -> EngineEvent {
    let Some(any) = payload else { return EngineEvent::Other };
    match topic {
        TASK_EXIT_TOPIC => match TaskExitPayload::decode(any.value.as_slice()) {
            Ok(exit) => EngineEvent::TaskExit {
                container_id: exit.container_id,
                id: exit.id,
                pid: exit.pid,
                exit_status: exit.exit_status,
                exited_at: ts_nanos(exit.exited_at),
            },
            Err(e) => {
                warn!("failed to decode task exit event: {e}");
                EngineEvent::Other
            }
        },
        TASK_OOM_TOPIC => match TaskOomPayload::decode(any.value.as_slice()) {
            Ok(oom) => EngineEvent::TaskOom { container_id: oom.container_id },
            Err(e) => {
                warn!("failed to decode task oom event: {e}");
                EngineEvent::Other
            }
        },
        _ => EngineEvent::Other,
    }
}

#[async_trait]
impl Engine for Containerd {
    async fn version(&self) -> Result<String> {
        let mut client = VersionClient::new(self.channel.clone());
        let response = client
            .version(())
            .await
            .map_err(|e| EngineError::from_status("version", e))?;
        Ok(response.into_inner().version)
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let mut client = TransferClient::new(self.channel.clone());

        let source = OciRegistry { reference: reference.to_string(), resolver: None };
        let platform = Self::platform();
        let destination = ImageStore {
            name: reference.to_string(),
            platforms: vec![platform.clone()],
            unpacks: vec![UnpackConfiguration {
                platform: Some(platform),
                snapshotter: self.snapshotter.clone(),
            }],
            ..Default::default()
        };
        let request = TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: None,
        };
        let request = with_namespace!(request, self.namespace.as_str());

        let _ = client
            .transfer(request)
            .await
            .map_err(|e| EngineError::from_status(reference, e))?;
        Ok(())
    }

    async fn get_image(&self, name: &str) -> Result<Option<EngineImage>> {
        let mut client = ImagesClient::new(self.channel.clone());
        let request = GetImageRequest { name: name.to_string() };
        let request = with_namespace!(request, self.namespace.as_str());

        let image = match client.get(request).await {
            Ok(response) => response.into_inner().image,
            Err(status) if status.code() == tonic::Code::NotFound => None,
            Err(status) => return Err(EngineError::from_status(name, status)),
        };
        Ok(image.and_then(|image| {
            image.target.map(|target| EngineImage {
                name: image.name,
                target: Descriptor {
                    media_type: target.media_type,
                    digest: target.digest,
                    size: target.size,
                },
            })
        }))
    }

    async fn create_image(&self, name: &str, target: &Descriptor) -> Result<()> {
        let mut client = ImagesClient::new(self.channel.clone());
        let image = Image {
            name: name.to_string(),
            target: Some(containerd_client::types::Descriptor {
                media_type: target.media_type.clone(),
                digest: target.digest.clone(),
                size: target.size,
                annotations: Default::default(),
            }),
            ..Default::default()
        };

        let request = CreateImageRequest { image: Some(image.clone()), ..Default::default() };
        let request = with_namespace!(request, self.namespace.as_str());
        match client.create(request).await {
            Ok(_) => Ok(()),
            Err(status) if status.code() == tonic::Code::AlreadyExists => {
                // Tag moved; repoint it.
                let request = UpdateImageRequest {
                    image: Some(image),
                    ..Default::default()
                };
                let request = with_namespace!(request, self.namespace.as_str());
                let _ = client
                    .update(request)
                    .await
                    .map_err(|e| EngineError::from_status(name, e))?;
                Ok(())
            }
            Err(status) => Err(EngineError::from_status(name, status)),
        }
    }

    async fn delete_image(&self, name: &str, sync: bool) -> Result<()> {
        let mut client = ImagesClient::new(self.channel.clone());
        let request = DeleteImageRequest { name: name.to_string(), sync, target: None };
        let request = with_namespace!(request, self.namespace.as_str());
        match client.delete(request).await {
            Ok(_) => Ok(()),
            Err(status) => Err(EngineError::from_status(name, status)),
        }
    }

    async fn read_content(&self, digest: &str) -> Result<Vec<u8>> {
        let mut client = ContentClient::new(self.channel.clone());
        let request = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        let request = with_namespace!(request, self.namespace.as_str());

        let mut stream = client
            .read(request)
            .await
            .map_err(|e| EngineError::from_status(digest, e))?
            .into_inner();
        let mut content = Vec::new();
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|e| EngineError::from_status(digest, e))?
        {
            content.extend_from_slice(&chunk.data);
        }
        Ok(content)
    }

    async fn prepare_snapshot(&self, key: &str, parent: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = PrepareSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
            parent: parent.to_string(),
            labels: Default::default(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .prepare(request)
            .await
            .map_err(|e| EngineError::from_status(key, e))?;
        Ok(to_engine_mounts(response.into_inner().mounts))
    }

    async fn view_snapshot(&self, key: &str, parent: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = ViewSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
            parent: parent.to_string(),
            labels: Default::default(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .view(request)
            .await
            .map_err(|e| EngineError::from_status(key, e))?;
        Ok(to_engine_mounts(response.into_inner().mounts))
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = RemoveSnapshotRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        match client.remove(request).await {
            Ok(_) => Ok(()),
            Err(status) => Err(EngineError::from_status(key, status)),
        }
    }

    async fn snapshot_mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = MountsRequest {
            snapshotter: self.snapshotter.clone(),
            key: key.to_string(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .mounts(request)
            .await
            .map_err(|e| EngineError::from_status(key, e))?;
        Ok(to_engine_mounts(response.into_inner().mounts))
    }

    async fn list_snapshot_usage(&self) -> Result<Vec<SnapshotUsage>> {
        let mut client = SnapshotsClient::new(self.channel.clone());
        let request = ListSnapshotsRequest {
            snapshotter: self.snapshotter.clone(),
            ..Default::default()
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let mut stream = client
            .list(request)
            .await
            .map_err(|e| EngineError::from_status("snapshots", e))?
            .into_inner();

        let mut keys = Vec::new();
        while let Some(batch) = stream
            .message()
            .await
            .map_err(|e| EngineError::from_status("snapshots", e))?
        {
            keys.extend(batch.info.into_iter().map(|info| info.name));
        }

        let mut usage = Vec::with_capacity(keys.len());
        for key in keys {
            let request = UsageRequest {
                snapshotter: self.snapshotter.clone(),
                key: key.clone(),
            };
            let request = with_namespace!(request, self.namespace.as_str());
            match client.usage(request).await {
                Ok(response) => {
                    let response = response.into_inner();
                    usage.push(SnapshotUsage {
                        key,
                        size: response.size as u64,
                        inodes: response.inodes as u64,
                    });
                }
                // The snapshot may be gone between list and usage.
                Err(status) if status.code() == tonic::Code::NotFound => {
                    trace!("snapshot '{key}' vanished during usage sweep");
                }
                Err(status) => {
                    return Err(EngineError::from_status(&key, status))
                }
            }
        }
        Ok(usage)
    }

    async fn create_container(&self, container: NewEngineContainer) -> Result<()> {
        let mut client = ContainersClient::new(self.channel.clone());
        let id = container.id.clone();
        let record = Container {
            id: container.id,
            labels: container.labels,
            image: container.image_ref,
            runtime: Some(ContainerRuntime {
                name: self.runtime_type.clone(),
                options: None,
            }),
            spec: Some(spec_any(SPEC_TYPE_URL, container.spec_json)),
            snapshotter: self.snapshotter.clone(),
            snapshot_key: container.snapshot_key,
            ..Default::default()
        };
        let request = CreateContainerRequest { container: Some(record) };
        let request = with_namespace!(request, self.namespace.as_str());
        let _ = client
            .create(request)
            .await
            .map_err(|e| EngineError::from_status(&id, e))?;
        Ok(())
    }

    async fn update_container_spec(&self, id: &str, spec_json: Vec<u8>) -> Result<()> {
        let mut client = ContainersClient::new(self.channel.clone());
        let record = Container {
            id: id.to_string(),
            spec: Some(spec_any(SPEC_TYPE_URL, spec_json)),
            ..Default::default()
        };
        let request = UpdateContainerRequest {
            container: Some(record),
            update_mask: Some(prost_types::FieldMask {
                paths: vec!["spec".to_string()],
            }),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let _ = client
            .update(request)
            .await
            .map_err(|e| EngineError::from_status(id, e))?;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<EngineContainer>> {
        let mut client = ContainersClient::new(self.channel.clone());
        let request = ListContainersRequest { filters: vec![] };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .list(request)
            .await
            .map_err(|e| EngineError::from_status("containers", e))?;
        Ok(response
            .into_inner()
            .containers
            .into_iter()
            .map(|c| EngineContainer { id: c.id, labels: c.labels })
            .collect())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut client = ContainersClient::new(self.channel.clone());
        let request = DeleteContainerRequest { id: id.to_string() };
        let request = with_namespace!(request, self.namespace.as_str());
        match client.delete(request).await {
            Ok(_) => Ok(()),
            Err(status) => Err(EngineError::from_status(id, status)),
        }
    }

    async fn create_task(&self, id: &str, rootfs: &[Mount], io: &TaskIo) -> Result<u32> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = CreateTaskRequest {
            container_id: id.to_string(),
            rootfs: to_containerd_mounts(rootfs),
            stdin: io.stdin.clone(),
            stdout: io.stdout.clone(),
            stderr: io.stderr.clone(),
            terminal: io.terminal,
            ..Default::default()
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .create(request)
            .await
            .map_err(|e| EngineError::from_status(id, e))?;
        Ok(response.into_inner().pid)
    }

    async fn start_task(&self, id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = StartRequest {
            container_id: id.to_string(),
            exec_id: String::new(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let _ = client
            .start(request)
            .await
            .map_err(|e| EngineError::from_status(id, e))?;
        Ok(())
    }

    async fn kill_task(&self, id: &str, signal: u32, all: bool) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = KillRequest {
            container_id: id.to_string(),
            exec_id: String::new(),
            signal,
            all,
        };
        let request = with_namespace!(request, self.namespace.as_str());
        match client.kill(request).await {
            Ok(_) => Ok(()),
            Err(status) => Err(EngineError::from_status(id, status)),
        }
    }

    async fn delete_task(&self, id: &str) -> Result<ExitStatus> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = DeleteTaskRequest { container_id: id.to_string() };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .delete(request)
            .await
            .map_err(|e| EngineError::from_status(id, e))?
            .into_inner();
        Ok(ExitStatus {
            exit_status: response.exit_status,
            exited_at: ts_nanos(response.exited_at),
        })
    }

    async fn get_task(&self, id: &str) -> Result<TaskStatus> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = GetRequest {
            container_id: id.to_string(),
            exec_id: String::new(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .get(request)
            .await
            .map_err(|e| EngineError::from_status(id, e))?;
        let Some(process) = response.into_inner().process else {
            return Err(EngineError::NotFound { resource: id.to_string() });
        };
        let state = match v1::Status::try_from(process.status) {
            Ok(v1::Status::Created) => TaskState::Created,
            Ok(v1::Status::Running) => TaskState::Running,
            Ok(v1::Status::Stopped) => TaskState::Stopped,
            Ok(v1::Status::Paused) | Ok(v1::Status::Pausing) => TaskState::Paused,
            _ => TaskState::Unknown,
        };
        Ok(TaskStatus {
            state,
            pid: process.pid,
            exit_status: process.exit_status,
            exited_at: ts_nanos(process.exited_at),
        })
    }

    async fn update_task_resources(&self, id: &str, resources_json: Vec<u8>) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = UpdateTaskRequest {
            container_id: id.to_string(),
            resources: Some(spec_any(RESOURCES_TYPE_URL, resources_json)),
            ..Default::default()
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let _ = client
            .update(request)
            .await
            .map_err(|e| EngineError::from_status(id, e))?;
        Ok(())
    }

    async fn task_metrics(&self, ids: &[String]) -> Result<Vec<TaskMetrics>> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = MetricsRequest {
            filters: ids.iter().map(|id| format!("id=={id}")).collect(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .metrics(request)
            .await
            .map_err(|e| EngineError::from_status("metrics", e))?;

        let mut metrics = Vec::new();
        for metric in response.into_inner().metrics {
            let mut entry = TaskMetrics {
                id: metric.id,
                timestamp: ts_nanos(metric.timestamp),
                ..Default::default()
            };
            // TODO: decode io.containerd.cgroups.v2.Metrics once unified
            // hierarchy hosts are supported.
            if let Some(data) = metric.data {
                if data.type_url.ends_with("cgroups.v1.Metrics") {
                    match CgroupMetricsPayload::decode(data.value.as_slice()) {
                        Ok(payload) => {
                            if let Some(cpu) =
                                payload.cpu.and_then(|cpu| cpu.usage)
                            {
                                entry.cpu_usage_core_nanos = cpu.total;
                            }
                            if let Some(memory) = payload.memory {
                                let usage = memory
                                    .usage
                                    .map(|entry| entry.usage)
                                    .unwrap_or_default();
                                entry.memory_working_set_bytes = usage
                                    .saturating_sub(memory.total_inactive_file);
                            }
                        }
                        Err(e) => {
                            warn!("failed to decode metrics for '{}': {e}", entry.id);
                        }
                    }
                }
            }
            metrics.push(entry);
        }
        Ok(metrics)
    }

    async fn create_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        process_spec_json: Vec<u8>,
        io: &TaskIo,
    ) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = ExecProcessRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            stdin: io.stdin.clone(),
            stdout: io.stdout.clone(),
            stderr: io.stderr.clone(),
            terminal: io.terminal,
            spec: Some(spec_any(PROCESS_TYPE_URL, process_spec_json)),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let _ = client
            .exec(request)
            .await
            .map_err(|e| EngineError::from_status(exec_id, e))?;
        Ok(())
    }

    async fn start_exec(&self, container_id: &str, exec_id: &str) -> Result<u32> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = StartRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .start(request)
            .await
            .map_err(|e| EngineError::from_status(exec_id, e))?;
        Ok(response.into_inner().pid)
    }

    async fn kill_exec(&self, container_id: &str, exec_id: &str, signal: u32) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = KillRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
            signal,
            all: false,
        };
        let request = with_namespace!(request, self.namespace.as_str());
        match client.kill(request).await {
            Ok(_) => Ok(()),
            Err(status) => Err(EngineError::from_status(exec_id, status)),
        }
    }

    async fn wait_exec(&self, container_id: &str, exec_id: &str) -> Result<ExitStatus> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = WaitRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let response = client
            .wait(request)
            .await
            .map_err(|e| EngineError::from_status(exec_id, e))?
            .into_inner();
        Ok(ExitStatus {
            exit_status: response.exit_status,
            exited_at: ts_nanos(response.exited_at),
        })
    }

    async fn delete_exec(&self, container_id: &str, exec_id: &str) -> Result<()> {
        let mut client = TasksClient::new(self.channel.clone());
        let request = DeleteProcessRequest {
            container_id: container_id.to_string(),
            exec_id: exec_id.to_string(),
        };
        let request = with_namespace!(request, self.namespace.as_str());
        match client.delete_process(request).await {
            Ok(_) => Ok(()),
            Err(status) => Err(EngineError::from_status(exec_id, status)),
        }
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<EngineEvent>> {
        let mut client = EventsClient::new(self.channel.clone());
        let request = SubscribeRequest {
            filters: vec![
                format!("topic==\"{TASK_EXIT_TOPIC}\""),
                format!("topic==\"{TASK_OOM_TOPIC}\""),
            ],
        };
        let request = with_namespace!(request, self.namespace.as_str());
        let mut stream = client
            .subscribe(request)
            .await
            .map_err(|e| EngineError::from_status("events", e))?
            .into_inner();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let _ = tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(envelope)) => {
                        let event = decode_event(
                            &envelope.topic,
                            envelope.event.as_ref(),
                        );
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(status) => {
                        warn!("engine event stream failed: {status}");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}
