/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! CREATED → RUNNING → EXITED → removed, with the exit transition driven
//! by the event monitor; invalid transitions are rejected and stops and
//! removes are idempotent.

mod common;

use common::{
    container_config, sandbox_config, TestDaemon, WAIT_ATTEMPTS, WAIT_INTERVAL,
};
use proto::cri::{
    ContainerState, ContainerStatusRequest, CreateContainerRequest,
    ImageSpec, PullImageRequest, RemoveContainerRequest, RunPodSandboxRequest,
    StartContainerRequest, StopContainerRequest,
};
use tonic::Code;

async fn container_state(
    daemon: &mut TestDaemon,
    id: &str,
) -> (i32, i64, i32) {
    let status = daemon
        .runtime
        .container_status(ContainerStatusRequest {
            container_id: id.to_string(),
            verbose: false,
        })
        .await
        .expect("container status")
        .into_inner()
        .status
        .expect("status body");
    (status.state, status.finished_at, status.exit_code)
}

#[tokio::test(flavor = "multi_thread")]
async fn container_lifecycle_should_follow_state_machine() {
    let mut daemon = TestDaemon::start().await;

    let sandbox_id = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config("app", "uid-1")),
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
        .expect("pull image");

    let container_id = daemon
        .runtime
        .create_container(CreateContainerRequest {
            pod_sandbox_id: sandbox_id.clone(),
            config: Some(container_config("main", "busybox:latest")),
            sandbox_config: Some(sandbox_config("app", "uid-1")),
        })
        .await
        .expect("create container")
        .into_inner()
        .container_id;

    let (state, finished_at, _) =
        container_state(&mut daemon, &container_id).await;
    assert_eq!(state, ContainerState::ContainerCreated as i32);
    assert_eq!(finished_at, 0);

    // Stopping a container that never ran is a no-op.
    daemon
        .runtime
        .stop_container(StopContainerRequest {
            container_id: container_id.clone(),
            timeout: 1,
        })
        .await
        .expect("stop created container");
    let (state, _, _) = container_state(&mut daemon, &container_id).await;
    assert_eq!(state, ContainerState::ContainerCreated as i32);

    daemon
        .runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .expect("start container");
    let (state, _, _) = container_state(&mut daemon, &container_id).await;
    assert_eq!(state, ContainerState::ContainerRunning as i32);

    // Starting again is an invalid transition.
    let err = daemon
        .runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .expect_err("double start");
    assert_eq!(err.code(), Code::FailedPrecondition);

    // Removing a running container is rejected.
    let err = daemon
        .runtime
        .remove_container(RemoveContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .expect_err("remove running");
    assert_eq!(err.code(), Code::FailedPrecondition);

    // Stop kills the fake task, which publishes the exit event; the
    // monitor makes the EXITED transition.
    daemon
        .runtime
        .stop_container(StopContainerRequest {
            container_id: container_id.clone(),
            timeout: 5,
        })
        .await
        .expect("stop container");

    let mut exited = false;
    for _ in 0..WAIT_ATTEMPTS {
        let (state, finished_at, exit_code) =
            container_state(&mut daemon, &container_id).await;
        if state == ContainerState::ContainerExited as i32 {
            assert!(finished_at > 0);
            assert_ne!(exit_code, 0);
            exited = true;
            break;
        }
        tokio::time::sleep(WAIT_INTERVAL).await;
    }
    assert!(exited, "container never reached EXITED");

    // A second stop of an exited container changes nothing.
    daemon
        .runtime
        .stop_container(StopContainerRequest {
            container_id: container_id.clone(),
            timeout: 1,
        })
        .await
        .expect("stop exited container");

    daemon
        .runtime
        .remove_container(RemoveContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .expect("remove container");
    let err = daemon
        .runtime
        .container_status(ContainerStatusRequest {
            container_id: container_id.clone(),
            verbose: false,
        })
        .await
        .expect_err("status of removed container");
    assert_eq!(err.code(), Code::NotFound);

    // Removing an unknown container converges to success.
    daemon
        .runtime
        .remove_container(RemoveContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .expect("second remove");

    daemon.stop();
}
