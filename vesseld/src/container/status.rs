/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! ContainerStatus and ListContainers.

use crate::cri::{CriService, Result};
use crate::store::container::Container;
use proto::cri::{
    Container as CriContainer, ContainerFilter, ContainerState,
    ContainerStatus, ImageSpec,
};

impl CriService {
    pub(crate) fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        let container = self.container_store.get(id)?;
        Ok(to_status(&container))
    }

    pub(crate) fn list_containers(
        &self,
        filter: Option<&ContainerFilter>,
    ) -> Vec<CriContainer> {
        let mut containers: Vec<CriContainer> = self
            .container_store
            .list()
            .iter()
            .map(to_list_entry)
            .collect();

        if let Some(filter) = filter {
            if !filter.id.is_empty() {
                containers.retain(|c| c.id == filter.id);
            }
            if !filter.pod_sandbox_id.is_empty() {
                containers.retain(|c| c.pod_sandbox_id == filter.pod_sandbox_id);
            }
            if let Some(state) = &filter.state {
                containers.retain(|c| c.state == state.state);
            }
            if !filter.label_selector.is_empty() {
                containers.retain(|c| {
                    filter
                        .label_selector
                        .iter()
                        .all(|(k, v)| c.labels.get(k) == Some(v))
                });
            }
        }
        containers
    }
}

fn exit_reason(container: &Container) -> String {
    if container.state() != ContainerState::ContainerExited {
        return container.reason.clone();
    }
    if !container.reason.is_empty() {
        // Typically "OOMKilled", recorded by the event monitor.
        return container.reason.clone();
    }
    if container.status.exit_code == 0 {
        "Completed".to_string()
    } else {
        "Error".to_string()
    }
}

fn to_status(container: &Container) -> ContainerStatus {
    let config = &container.metadata.config;
    ContainerStatus {
        id: container.metadata.id.clone(),
        metadata: config.metadata.clone(),
        state: container.state() as i32,
        created_at: container.metadata.created_at,
        started_at: container.status.started_at,
        finished_at: container.status.finished_at,
        exit_code: container.status.exit_code,
        image: config.image.clone(),
        image_ref: container.metadata.image_ref.clone(),
        reason: exit_reason(container),
        message: container.message.clone(),
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
        mounts: config.mounts.clone(),
        log_path: container
            .metadata
            .log_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    }
}

fn to_list_entry(container: &Container) -> CriContainer {
    let config = &container.metadata.config;
    CriContainer {
        id: container.metadata.id.clone(),
        pod_sandbox_id: container.metadata.sandbox_id.clone(),
        metadata: config.metadata.clone(),
        image: config.image.clone().or_else(|| {
            Some(ImageSpec {
                image: container.metadata.image_ref.clone(),
                ..Default::default()
            })
        }),
        image_ref: container.metadata.image_ref.clone(),
        state: container.state() as i32,
        created_at: container.metadata.created_at,
        labels: config.labels.clone(),
        annotations: config.annotations.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::container::{
        ContainerMetadata, ContainerStatus as Status, OOM_EXIT_REASON,
    };
    use crate::store::unix_nanos;
    use oci_spec::runtime::Spec;
    use proto::cri::ContainerConfig;

    fn container(exit_code: i32, reason: &str, finished: bool) -> Container {
        let mut container = Container::new(
            ContainerMetadata {
                id: "c-1".to_string(),
                name: "app_pod_ns_uid_0".to_string(),
                sandbox_id: "sb-1".to_string(),
                config: ContainerConfig::default(),
                image_ref: "sha256:img".to_string(),
                log_path: None,
                spec: Spec::default(),
                created_at: unix_nanos(),
            },
            None,
        );
        container.status = Status {
            pid: 1,
            started_at: unix_nanos(),
            finished_at: if finished { unix_nanos() } else { 0 },
            exit_code,
        };
        container.reason = reason.to_string();
        container
    }

    #[test]
    fn test_exit_reason_completed_and_error() {
        assert_eq!(exit_reason(&container(0, "", true)), "Completed");
        assert_eq!(exit_reason(&container(137, "", true)), "Error");
    }

    #[test]
    fn test_exit_reason_keeps_oom() {
        assert_eq!(
            exit_reason(&container(137, OOM_EXIT_REASON, true)),
            OOM_EXIT_REASON
        );
    }

    #[test]
    fn test_running_container_has_no_exit_reason() {
        assert_eq!(exit_reason(&container(0, "", false)), "");
    }
}
