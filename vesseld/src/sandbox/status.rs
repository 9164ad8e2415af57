/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! PodSandboxStatus and ListPodSandbox.

use crate::cri::{CriService, Result};
use crate::engine::TaskState;
use crate::store::sandbox::Sandbox;
use proto::cri::{
    LinuxPodSandboxStatus, Namespace, PodSandbox, PodSandboxFilter,
    PodSandboxNetworkStatus, PodSandboxState, PodSandboxStatus,
};

impl CriService {
    /// Status is derived live: READY iff the engine reports the pause task
    /// running. The IP comes from the recorded CNI setup result; a missing
    /// one yields an empty IP, never an error.
    pub(crate) async fn pod_sandbox_status(
        &self,
        id: &str,
    ) -> Result<PodSandboxStatus> {
        let sandbox = self.sandbox_store.get(id)?;

        let state = match self.engine.get_task(id).await {
            Ok(status) if status.state == TaskState::Running => {
                PodSandboxState::SandboxReady
            }
            _ => PodSandboxState::SandboxNotready,
        };

        Ok(to_status(&sandbox, state))
    }

    pub(crate) fn list_pod_sandbox(
        &self,
        filter: Option<&PodSandboxFilter>,
    ) -> Vec<PodSandbox> {
        let mut sandboxes: Vec<PodSandbox> = self
            .sandbox_store
            .list()
            .into_iter()
            .map(|sandbox| to_list_entry(&sandbox))
            .collect();

        if let Some(filter) = filter {
            if !filter.id.is_empty() {
                sandboxes.retain(|s| s.id == filter.id);
            }
            if let Some(state) = &filter.state {
                sandboxes.retain(|s| s.state == state.state);
            }
            if !filter.label_selector.is_empty() {
                sandboxes.retain(|s| {
                    filter
                        .label_selector
                        .iter()
                        .all(|(k, v)| s.labels.get(k) == Some(v))
                });
            }
        }
        sandboxes
    }
}

fn to_status(sandbox: &Sandbox, state: PodSandboxState) -> PodSandboxStatus {
    let config = &sandbox.metadata.config;
    let namespace_options = config
        .linux
        .as_ref()
        .and_then(|l| l.security_context.as_ref())
        .and_then(|sc| sc.namespace_options.clone());
    PodSandboxStatus {
        id: sandbox.metadata.id.clone(),
        metadata: config.metadata.clone(),
        state: state as i32,
        created_at: sandbox.metadata.created_at,
        network: Some(PodSandboxNetworkStatus {
            ip: sandbox.ip.clone(),
            additional_ips: vec![],
        }),
        linux: Some(LinuxPodSandboxStatus {
            namespaces: Some(Namespace { options: namespace_options }),
        }),
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
        runtime_handler: sandbox.metadata.runtime_handler.clone(),
    }
}

fn to_list_entry(sandbox: &Sandbox) -> PodSandbox {
    let config = &sandbox.metadata.config;
    let state: PodSandboxState = sandbox.state.into();
    PodSandbox {
        id: sandbox.metadata.id.clone(),
        metadata: config.metadata.clone(),
        state: state as i32,
        created_at: sandbox.metadata.created_at,
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
        runtime_handler: sandbox.metadata.runtime_handler.clone(),
    }
}
