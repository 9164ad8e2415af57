/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! gRPC runtime service.
//!
//! Handlers are deliberately thin: gate on initialization, log, delegate
//! to the lifecycle engine, convert error kinds.

use super::{CriService, API_VERSION, RUNTIME_NAME, RUNTIME_VERSION};
use proto::cri::runtime_service_server;
use proto::cri::{
    AttachRequest, AttachResponse, ContainerStatsRequest,
    ContainerStatsResponse, ContainerStatusRequest, ContainerStatusResponse,
    CreateContainerRequest, CreateContainerResponse, ExecRequest, ExecResponse,
    ExecSyncRequest, ExecSyncResponse, ListContainerStatsRequest,
    ListContainerStatsResponse, ListContainersRequest, ListContainersResponse,
    ListPodSandboxRequest, ListPodSandboxResponse, PodSandboxStatusRequest,
    PodSandboxStatusResponse, PortForwardRequest, PortForwardResponse,
    RemoveContainerRequest, RemoveContainerResponse, RemovePodSandboxRequest,
    RemovePodSandboxResponse, ReopenContainerLogRequest,
    ReopenContainerLogResponse, RunPodSandboxRequest, RunPodSandboxResponse,
    RuntimeCondition, RuntimeStatus, StartContainerRequest,
    StartContainerResponse, StatusRequest, StatusResponse,
    StopContainerRequest, StopContainerResponse, StopPodSandboxRequest,
    StopPodSandboxResponse, UpdateContainerResourcesRequest,
    UpdateContainerResourcesResponse, UpdateRuntimeConfigRequest,
    UpdateRuntimeConfigResponse, VersionRequest, VersionResponse,
};
use std::collections::HashMap;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{info, trace, warn};

/// Condition names reported by `Status`.
const RUNTIME_READY: &str = "RuntimeReady";
const NETWORK_READY: &str = "NetworkReady";

#[derive(Clone)]
pub struct RuntimeService {
    service: Arc<CriService>,
}

impl RuntimeService {
    pub fn new(service: Arc<CriService>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl runtime_service_server::RuntimeService for RuntimeService {
    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        self.service.require_initialized()?;
        let runtime_version =
            self.service.engine.version().await.map_err(|e| {
                Status::unavailable(format!("engine version: {e}"))
            })?;
        Ok(Response::new(VersionResponse {
            version: API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version,
            runtime_api_version: API_VERSION.to_string(),
        }))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        let config = r
            .config
            .ok_or_else(|| Status::invalid_argument("no sandbox config"))?;
        info!(
            "RunPodSandbox for '{}'",
            config
                .metadata
                .as_ref()
                .map(|m| m.name.as_str())
                .unwrap_or("<unnamed>")
        );
        let pod_sandbox_id = self
            .service
            .run_pod_sandbox(config, r.runtime_handler)
            .await?;
        trace!("RunPodSandbox returns '{pod_sandbox_id}'");
        Ok(Response::new(RunPodSandboxResponse { pod_sandbox_id }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("StopPodSandbox for '{}'", r.pod_sandbox_id);
        self.service.stop_pod_sandbox(&r.pod_sandbox_id).await?;
        trace!("StopPodSandbox '{}' returns", r.pod_sandbox_id);
        Ok(Response::new(StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("RemovePodSandbox for '{}'", r.pod_sandbox_id);
        self.service.remove_pod_sandbox(&r.pod_sandbox_id).await?;
        trace!("RemovePodSandbox '{}' returns", r.pod_sandbox_id);
        Ok(Response::new(RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        trace!("PodSandboxStatus for '{}'", r.pod_sandbox_id);
        let status =
            self.service.pod_sandbox_status(&r.pod_sandbox_id).await?;
        Ok(Response::new(PodSandboxStatusResponse {
            status: Some(status),
            info: HashMap::new(),
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        trace!("ListPodSandbox with {:?}", r.filter);
        let items = self.service.list_pod_sandbox(r.filter.as_ref());
        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        let config = r
            .config
            .ok_or_else(|| Status::invalid_argument("no container config"))?;
        let sandbox_config = r.sandbox_config.ok_or_else(|| {
            Status::invalid_argument("no sandbox config in create container")
        })?;
        info!("CreateContainer in sandbox '{}'", r.pod_sandbox_id);
        let container_id = self
            .service
            .create_container(&r.pod_sandbox_id, config, sandbox_config)
            .await?;
        trace!("CreateContainer returns '{container_id}'");
        Ok(Response::new(CreateContainerResponse { container_id }))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("StartContainer for '{}'", r.container_id);
        self.service.start_container(&r.container_id).await?;
        trace!("StartContainer '{}' returns", r.container_id);
        Ok(Response::new(StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!(
            "StopContainer for '{}' with timeout {}s",
            r.container_id, r.timeout
        );
        self.service.stop_container(&r.container_id, r.timeout).await?;
        trace!("StopContainer '{}' returns", r.container_id);
        Ok(Response::new(StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("RemoveContainer for '{}'", r.container_id);
        self.service.remove_container(&r.container_id).await?;
        trace!("RemoveContainer '{}' returns", r.container_id);
        Ok(Response::new(RemoveContainerResponse {}))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        trace!("ListContainers with {:?}", r.filter);
        let containers = self.service.list_containers(r.filter.as_ref());
        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        trace!("ContainerStatus for '{}'", r.container_id);
        let status = self.service.container_status(&r.container_id)?;
        Ok(Response::new(ContainerStatusResponse {
            status: Some(status),
            info: HashMap::new(),
        }))
    }

    async fn update_container_resources(
        &self,
        request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        let linux = r.linux.ok_or_else(|| {
            Status::invalid_argument("no linux resources in update")
        })?;
        info!("UpdateContainerResources for '{}'", r.container_id);
        self.service
            .update_container_resources(&r.container_id, linux)
            .await?;
        trace!("UpdateContainerResources '{}' returns", r.container_id);
        Ok(Response::new(UpdateContainerResourcesResponse {}))
    }

    async fn reopen_container_log(
        &self,
        request: Request<ReopenContainerLogRequest>,
    ) -> Result<Response<ReopenContainerLogResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("ReopenContainerLog for '{}'", r.container_id);
        self.service.reopen_container_log(&r.container_id).await?;
        Ok(Response::new(ReopenContainerLogResponse {}))
    }

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("ExecSync in '{}': {:?}", r.container_id, r.cmd);
        let (stdout, stderr, exit_code) = self.service.exec_sync(&r).await?;
        trace!("ExecSync in '{}' returns {exit_code}", r.container_id);
        Ok(Response::new(ExecSyncResponse { stdout, stderr, exit_code }))
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("Exec in '{}': {:?}", r.container_id, r.cmd);
        let url = self.service.exec(&r)?;
        Ok(Response::new(ExecResponse { url }))
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("Attach to '{}'", r.container_id);
        let url = self.service.attach(&r)?;
        Ok(Response::new(AttachResponse { url }))
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        info!("PortForward to '{}' ports {:?}", r.pod_sandbox_id, r.port);
        let url = self.service.port_forward(&r)?;
        Ok(Response::new(PortForwardResponse { url }))
    }

    async fn container_stats(
        &self,
        request: Request<ContainerStatsRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        trace!("ContainerStats for '{}'", r.container_id);
        let stats = self.service.container_stats(&r.container_id).await?;
        Ok(Response::new(ContainerStatsResponse { stats: Some(stats) }))
    }

    async fn list_container_stats(
        &self,
        request: Request<ListContainerStatsRequest>,
    ) -> Result<Response<ListContainerStatsResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        trace!("ListContainerStats with {:?}", r.filter);
        let stats =
            self.service.list_container_stats(r.filter.as_ref()).await?;
        Ok(Response::new(ListContainerStatsResponse { stats }))
    }

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();
        let pod_cidr = r
            .runtime_config
            .and_then(|c| c.network_config)
            .map(|n| n.pod_cidr)
            .unwrap_or_default();
        info!("UpdateRuntimeConfig with pod cidr '{pod_cidr}'");
        self.service.update_runtime_config(&pod_cidr).await?;
        Ok(Response::new(UpdateRuntimeConfigResponse {}))
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        self.service.require_initialized()?;
        let r = request.into_inner();

        let network_ready = self.service.cni.status().is_ok();
        let conditions = vec![
            RuntimeCondition {
                r#type: RUNTIME_READY.to_string(),
                status: true,
                ..Default::default()
            },
            RuntimeCondition {
                r#type: NETWORK_READY.to_string(),
                status: network_ready,
                reason: if network_ready {
                    String::new()
                } else {
                    "NetworkPluginNotReady".to_string()
                },
                message: if network_ready {
                    String::new()
                } else {
                    "cni config not loaded".to_string()
                },
            },
        ];

        let mut info = HashMap::new();
        if r.verbose {
            let config = serde_json::to_string(&self.service.config)
                .unwrap_or_default();
            let _ = info.insert("config".to_string(), config);
            let _ = info.insert(
                "daemon".to_string(),
                format!("{RUNTIME_NAME} {RUNTIME_VERSION}"),
            );
            let _ = info
                .insert("pid".to_string(), std::process::id().to_string());
        }
        Ok(Response::new(StatusResponse {
            status: Some(RuntimeStatus { conditions }),
            info,
        }))
    }
}

impl CriService {
    /// Handle a pod CIDR update from the kubelet: render the conf
    /// template when one is configured, otherwise record and move on.
    pub(crate) async fn update_runtime_config(&self, pod_cidr: &str) -> super::Result<()> {
        if pod_cidr.is_empty() {
            return Ok(());
        }
        if self.config.network_plugin_conf_template.is_empty() {
            warn!("no cni conf template configured, ignoring pod cidr '{pod_cidr}'");
            return Ok(());
        }
        let rendered = crate::cni::config::render_template(
            std::path::Path::new(&self.config.network_plugin_conf_template),
            &self.config.network_plugin_conf_dir,
            pod_cidr,
        )?;
        info!("rendered cni conf '{}' for pod cidr '{pod_cidr}'", rendered.display());
        let _ = self.cni.reload()?;
        Ok(())
    }
}
