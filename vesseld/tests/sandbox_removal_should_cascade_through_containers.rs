/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Stop-then-remove of a sandbox takes all of its containers with it: the
//! stores empty out, the engine holds nothing, and the names are free for
//! a fresh pod with the same metadata.

mod common;

use common::{container_config, sandbox_config, TestDaemon};
use proto::cri::{
    CreateContainerRequest, ImageSpec, ListContainersRequest,
    ListPodSandboxRequest, PullImageRequest, RemovePodSandboxRequest,
    RunPodSandboxRequest, StartContainerRequest, StopPodSandboxRequest,
};

#[tokio::test(flavor = "multi_thread")]
async fn sandbox_removal_should_cascade_through_containers() {
    let mut daemon = TestDaemon::start().await;

    let sandbox_id = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config("family", "uid-1")),
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

    let mut container_ids = Vec::new();
    for name in ["a", "b", "c"] {
        let id = daemon
            .runtime
            .create_container(CreateContainerRequest {
                pod_sandbox_id: sandbox_id.clone(),
                config: Some(container_config(name, "busybox:latest")),
                sandbox_config: Some(sandbox_config("family", "uid-1")),
            })
            .await
            .expect("create container")
            .into_inner()
            .container_id;
        container_ids.push(id);
    }
    // Two of the three run; one stays CREATED.
    for id in &container_ids[..2] {
        daemon
            .runtime
            .start_container(StartContainerRequest {
                container_id: id.clone(),
            })
            .await
            .expect("start container");
    }

    daemon
        .runtime
        .stop_pod_sandbox(StopPodSandboxRequest {
            pod_sandbox_id: sandbox_id.clone(),
        })
        .await
        .expect("stop sandbox");
    daemon
        .runtime
        .remove_pod_sandbox(RemovePodSandboxRequest {
            pod_sandbox_id: sandbox_id.clone(),
        })
        .await
        .expect("remove sandbox");

    let sandboxes = daemon
        .runtime
        .list_pod_sandbox(ListPodSandboxRequest { filter: None })
        .await
        .expect("list sandboxes")
        .into_inner()
        .items;
    assert!(sandboxes.is_empty());
    let containers = daemon
        .runtime
        .list_containers(ListContainersRequest { filter: None })
        .await
        .expect("list containers")
        .into_inner()
        .containers;
    assert!(containers.is_empty());

    for id in &container_ids {
        assert!(!daemon.fake.container_exists(id), "engine kept '{id}'");
        assert!(!daemon.fake.snapshot_exists(id), "snapshot kept '{id}'");
        assert!(!daemon.fake.task_exists(id), "task kept '{id}'");
    }
    assert!(!daemon.fake.container_exists(&sandbox_id));

    // All names are released: the identical pod can run again.
    let second = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config("family", "uid-1")),
            runtime_handler: String::new(),
        })
        .await
        .expect("rerun sandbox")
        .into_inner()
        .pod_sandbox_id;
    assert_ne!(second, sandbox_id);

    daemon.stop();
}
