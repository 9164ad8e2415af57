/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! ContainerStats and ListContainerStats.

use crate::cri::{CriService, Result};
use crate::store::container::Container;
use crate::store::unix_nanos;
use proto::cri::{
    ContainerAttributes, ContainerState, ContainerStats, ContainerStatsFilter,
    CpuUsage, FilesystemIdentifier, FilesystemUsage, MemoryUsage, UInt64Value,
};
use std::collections::HashMap;

impl CriService {
    pub(crate) async fn container_stats(&self, id: &str) -> Result<ContainerStats> {
        let container = self.container_store.get(id)?;
        let metrics = self
            .engine
            .task_metrics(&[id.to_string()])
            .await
            .unwrap_or_default();
        let metrics: HashMap<_, _> =
            metrics.into_iter().map(|m| (m.id.clone(), m)).collect();
        Ok(self.assemble_stats(&container, &metrics))
    }

    /// Join live task metrics with the snapshot usage sweep. Exited
    /// containers whose cpu and memory numbers would be zero are skipped.
    pub(crate) async fn list_container_stats(
        &self,
        filter: Option<&ContainerStatsFilter>,
    ) -> Result<Vec<ContainerStats>> {
        let mut containers = self.container_store.list();
        if let Some(filter) = filter {
            if !filter.id.is_empty() {
                containers.retain(|c| c.id() == filter.id);
            }
            if !filter.pod_sandbox_id.is_empty() {
                containers
                    .retain(|c| c.metadata.sandbox_id == filter.pod_sandbox_id);
            }
            if !filter.label_selector.is_empty() {
                containers.retain(|c| {
                    filter.label_selector.iter().all(|(k, v)| {
                        c.metadata.config.labels.get(k) == Some(v)
                    })
                });
            }
        }

        let ids: Vec<String> =
            containers.iter().map(|c| c.id().to_string()).collect();
        let metrics = self.engine.task_metrics(&ids).await.unwrap_or_default();
        let metrics: HashMap<_, _> =
            metrics.into_iter().map(|m| (m.id.clone(), m)).collect();

        Ok(containers
            .iter()
            .filter(|container| {
                container.state() != ContainerState::ContainerExited
                    || metrics.contains_key(container.id())
            })
            .map(|container| self.assemble_stats(container, &metrics))
            .collect())
    }

    fn assemble_stats(
        &self,
        container: &Container,
        metrics: &HashMap<String, crate::engine::TaskMetrics>,
    ) -> ContainerStats {
        let id = container.id();
        let config = &container.metadata.config;
        let attributes = ContainerAttributes {
            id: id.to_string(),
            metadata: config.metadata.clone(),
            labels: config.labels.clone(),
            annotations: config.annotations.clone(),
        };

        let (cpu, memory) = match metrics.get(id) {
            Some(sample) => (
                Some(CpuUsage {
                    timestamp: sample.timestamp,
                    usage_core_nano_seconds: Some(UInt64Value {
                        value: sample.cpu_usage_core_nanos,
                    }),
                }),
                Some(MemoryUsage {
                    timestamp: sample.timestamp,
                    working_set_bytes: Some(UInt64Value {
                        value: sample.memory_working_set_bytes,
                    }),
                }),
            ),
            None => (None, None),
        };

        let writable_layer = self.snapshot_store.get(id).map(|stats| {
            FilesystemUsage {
                timestamp: stats.timestamp,
                fs_id: Some(FilesystemIdentifier {
                    mountpoint: self.config.image_fs_path().display().to_string(),
                }),
                used_bytes: Some(UInt64Value { value: stats.size }),
                inodes_used: Some(UInt64Value { value: stats.inodes_used }),
            }
        });
        let writable_layer = writable_layer.or_else(|| {
            Some(FilesystemUsage {
                timestamp: unix_nanos(),
                fs_id: Some(FilesystemIdentifier {
                    mountpoint: self.config.image_fs_path().display().to_string(),
                }),
                used_bytes: Some(UInt64Value { value: 0 }),
                inodes_used: Some(UInt64Value { value: 0 }),
            })
        });

        ContainerStats {
            attributes: Some(attributes),
            cpu,
            memory,
            writable_layer,
        }
    }
}
