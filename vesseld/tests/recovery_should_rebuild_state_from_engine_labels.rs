/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! After a daemon restart, the stores are rebuilt from the metadata labels
//! persisted on the engine containers, task state is recomputed, and the
//! recovered names stay reserved.

mod common;

use common::{container_config, sandbox_config, TestDaemon};
use proto::cri::{
    ContainerState, ContainerStatusRequest, CreateContainerRequest,
    ImageSpec, ListContainersRequest, ListPodSandboxRequest,
    PodSandboxState, PullImageRequest, RunPodSandboxRequest,
    StartContainerRequest,
};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread")]
async fn recovery_should_rebuild_state_from_engine_labels() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first_dir = dir.path().join("first");
    std::fs::create_dir_all(&first_dir).expect("first dir");

    let fake = Arc::new(vesseld::engine::testing::FakeEngine::new());
    let mut daemon =
        TestDaemon::start_with(Arc::clone(&fake), &first_dir).await;

    let sandbox_id = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config("survivor", "uid-1")),
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
    let running_id = daemon
        .runtime
        .create_container(CreateContainerRequest {
            pod_sandbox_id: sandbox_id.clone(),
            config: Some(container_config("running", "busybox:latest")),
            sandbox_config: Some(sandbox_config("survivor", "uid-1")),
        })
        .await
        .expect("create running")
        .into_inner()
        .container_id;
    daemon
        .runtime
        .start_container(StartContainerRequest {
            container_id: running_id.clone(),
        })
        .await
        .expect("start");
    let created_id = daemon
        .runtime
        .create_container(CreateContainerRequest {
            pod_sandbox_id: sandbox_id.clone(),
            config: Some(container_config("pending", "busybox:latest")),
            sandbox_config: Some(sandbox_config("survivor", "uid-1")),
        })
        .await
        .expect("create pending")
        .into_inner()
        .container_id;

    // The old daemon goes away; a new one boots over the same engine.
    daemon.stop();
    let second_dir = dir.path().join("second");
    std::fs::create_dir_all(&second_dir).expect("second dir");
    let mut restarted =
        TestDaemon::start_with(Arc::clone(&fake), &second_dir).await;

    let sandboxes = restarted
        .runtime
        .list_pod_sandbox(ListPodSandboxRequest { filter: None })
        .await
        .expect("list sandboxes")
        .into_inner()
        .items;
    assert_eq!(sandboxes.len(), 1);
    assert_eq!(sandboxes[0].id, sandbox_id);
    assert_eq!(sandboxes[0].state, PodSandboxState::SandboxReady as i32);

    let containers = restarted
        .runtime
        .list_containers(ListContainersRequest { filter: None })
        .await
        .expect("list containers")
        .into_inner()
        .containers;
    assert_eq!(containers.len(), 2);

    let status_of = |id: String| {
        let mut client = restarted.runtime.clone();
        async move {
            client
                .container_status(ContainerStatusRequest {
                    container_id: id,
                    verbose: false,
                })
                .await
                .expect("status")
                .into_inner()
                .status
                .expect("status body")
        }
    };
    let running = status_of(running_id.clone()).await;
    assert_eq!(running.state, ContainerState::ContainerRunning as i32);
    let created = status_of(created_id.clone()).await;
    // The pending container's task was never created, so after a restart
    // there is nothing to probe and it recovers as exited.
    assert_eq!(created.state, ContainerState::ContainerExited as i32);

    // Recovered names stay reserved: the same logical container name in
    // the same pod cannot be created again.
    let err = restarted
        .runtime
        .create_container(CreateContainerRequest {
            pod_sandbox_id: sandbox_id.clone(),
            config: Some(container_config("running", "busybox:latest")),
            sandbox_config: Some(sandbox_config("survivor", "uid-1")),
        })
        .await
        .expect_err("duplicate recovered name");
    assert_eq!(err.code(), tonic::Code::AlreadyExists);

    restarted.stop();
}
