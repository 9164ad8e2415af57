/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! UpdateContainerResources.

use crate::cri::{CriError, CriService, Result};
use crate::oci::container_spec::build_resources;
use proto::cri::{ContainerState, LinuxContainerResources};
use tracing::info;

impl CriService {
    /// Update the resource limits of a CREATED or RUNNING container: the
    /// stored OCI spec always reflects the latest request, and a running
    /// task gets the cgroup change pushed into the engine.
    pub(crate) async fn update_container_resources(
        &self,
        id: &str,
        updates: LinuxContainerResources,
    ) -> Result<()> {
        let mut new_spec_json: Option<Vec<u8>> = None;
        let mut merged: Option<LinuxContainerResources> = None;
        let mut state = ContainerState::ContainerUnknown;
        let mut encode_error: Option<String> = None;

        self.container_store.update(id, |container| {
            state = container.state();
            if state != ContainerState::ContainerCreated
                && state != ContainerState::ContainerRunning
            {
                return;
            }

            // Merge into the stored CRI resources so later updates keep
            // compounding, then re-emit the spec's resource section.
            let linux = container
                .metadata
                .config
                .linux
                .get_or_insert_with(Default::default);
            let resources =
                linux.resources.get_or_insert_with(Default::default);
            merge_resources(resources, &updates);
            let resources = resources.clone();

            let privileged = linux
                .security_context
                .as_ref()
                .map(|sc| sc.privileged)
                .unwrap_or(false);
            match build_resources(Some(&resources), privileged) {
                Ok(built) => {
                    let mut spec_linux = container
                        .metadata
                        .spec
                        .linux()
                        .clone()
                        .unwrap_or_default();
                    let _ = spec_linux.set_resources(Some(built));
                    let _ =
                        container.metadata.spec.set_linux(Some(spec_linux));
                    match serde_json::to_vec(&container.metadata.spec) {
                        Ok(json) => new_spec_json = Some(json),
                        Err(e) => encode_error = Some(e.to_string()),
                    }
                    merged = Some(resources);
                }
                Err(e) => encode_error = Some(e.to_string()),
            }
        })?;

        if let Some(message) = encode_error {
            return Err(CriError::internal(format!(
                "failed to rebuild resources of '{id}': {message}"
            )));
        }
        match state {
            ContainerState::ContainerCreated
            | ContainerState::ContainerRunning => {}
            _ => {
                return Err(CriError::precondition(format!(
                    "container '{id}' is in state {state:?}, cannot update resources"
                )))
            }
        }

        if let Some(spec_json) = new_spec_json {
            self.engine.update_container_spec(id, spec_json).await?;
        }
        if state == ContainerState::ContainerRunning {
            let resources = merged.expect("merged resources for running container");
            let built = build_resources(Some(&resources), false)
                .map_err(CriError::from)?;
            let resources_json = serde_json::to_vec(&built).map_err(|e| {
                CriError::internal(format!("serialize resources: {e}"))
            })?;
            self.engine.update_task_resources(id, resources_json).await?;
        }
        info!("updated resources of container '{id}'");
        Ok(())
    }
}

/// Apply non-zero fields of `updates` on top of `current`.
fn merge_resources(
    current: &mut LinuxContainerResources,
    updates: &LinuxContainerResources,
) {
    if updates.cpu_period > 0 {
        current.cpu_period = updates.cpu_period;
    }
    if updates.cpu_quota > 0 {
        current.cpu_quota = updates.cpu_quota;
    }
    if updates.cpu_shares > 0 {
        current.cpu_shares = updates.cpu_shares;
    }
    if updates.memory_limit_in_bytes > 0 {
        current.memory_limit_in_bytes = updates.memory_limit_in_bytes;
    }
    if updates.oom_score_adj != 0 {
        current.oom_score_adj = updates.oom_score_adj;
    }
    if !updates.cpuset_cpus.is_empty() {
        current.cpuset_cpus = updates.cpuset_cpus.clone();
    }
    if !updates.cpuset_mems.is_empty() {
        current.cpuset_mems = updates.cpuset_mems.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut current = LinuxContainerResources {
            cpu_shares: 512,
            memory_limit_in_bytes: 2 * 1024 * 1024,
            ..Default::default()
        };
        merge_resources(
            &mut current,
            &LinuxContainerResources {
                memory_limit_in_bytes: 4 * 1024 * 1024,
                ..Default::default()
            },
        );
        assert_eq!(current.memory_limit_in_bytes, 4 * 1024 * 1024);
        assert_eq!(current.cpu_shares, 512);
    }

    #[test]
    fn test_merge_updates_cpusets() {
        let mut current = LinuxContainerResources::default();
        merge_resources(
            &mut current,
            &LinuxContainerResources {
                cpuset_cpus: "0-3".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(current.cpuset_cpus, "0-3");
    }
}
