/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The stored OCI spec and the engine-side spec reflect the latest memory
//! limit after create, after an update while CREATED, and after an update
//! while RUNNING.

mod common;

use common::{container_config, sandbox_config, TestDaemon};
use proto::cri::{
    CreateContainerRequest, ImageSpec, LinuxContainerConfig,
    LinuxContainerResources, PullImageRequest, RunPodSandboxRequest,
    StartContainerRequest, UpdateContainerResourcesRequest,
};

const MIB: i64 = 1024 * 1024;

fn engine_memory_limit(daemon: &TestDaemon, id: &str) -> i64 {
    let spec_json = daemon
        .fake
        .container_spec_json(id)
        .expect("engine container spec");
    let spec: serde_json::Value =
        serde_json::from_slice(&spec_json).expect("spec json");
    spec.pointer("/linux/resources/memory/limit")
        .and_then(|v| v.as_i64())
        .expect("memory limit in spec")
}

#[tokio::test(flavor = "multi_thread")]
async fn update_resources_should_track_spec_at_every_stage() {
    let mut daemon = TestDaemon::start().await;

    let sandbox_id = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config("limits", "uid-1")),
            runtime_handler: String::new(),
        })
        .await
        .expect("run sandbox")
        .into_inner()
        .pod_sandbox_id;
    daemon
        .images
        .pull_image(PullImageRequest {
            image: Some(ImageSpec {
                image: "busybox:latest".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .expect("pull");

    let mut config = container_config("main", "busybox:latest");
    config.linux = Some(LinuxContainerConfig {
        resources: Some(LinuxContainerResources {
            memory_limit_in_bytes: 2 * MIB,
            ..Default::default()
        }),
        ..Default::default()
    });
    let container_id = daemon
        .runtime
        .create_container(CreateContainerRequest {
            pod_sandbox_id: sandbox_id,
            config: Some(config),
            sandbox_config: Some(sandbox_config("limits", "uid-1")),
        })
        .await
        .expect("create")
        .into_inner()
        .container_id;
    assert_eq!(engine_memory_limit(&daemon, &container_id), 2 * MIB);

    daemon
        .runtime
        .update_container_resources(UpdateContainerResourcesRequest {
            container_id: container_id.clone(),
            linux: Some(LinuxContainerResources {
                memory_limit_in_bytes: 4 * MIB,
                ..Default::default()
            }),
        })
        .await
        .expect("update while created");
    assert_eq!(engine_memory_limit(&daemon, &container_id), 4 * MIB);

    daemon
        .runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .expect("start");

    daemon
        .runtime
        .update_container_resources(UpdateContainerResourcesRequest {
            container_id: container_id.clone(),
            linux: Some(LinuxContainerResources {
                memory_limit_in_bytes: 8 * MIB,
                ..Default::default()
            }),
        })
        .await
        .expect("update while running");
    assert_eq!(engine_memory_limit(&daemon, &container_id), 8 * MIB);

    daemon.stop();
}
