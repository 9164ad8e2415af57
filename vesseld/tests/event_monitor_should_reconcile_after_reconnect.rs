/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Exit events lost during an engine outage are recovered by the relist
//! sweep after the monitor reconnects, and OOM kills are tagged.

mod common;

use common::{
    container_config, sandbox_config, TestDaemon, WAIT_ATTEMPTS, WAIT_INTERVAL,
};
use proto::cri::{
    ContainerState, ContainerStatusRequest, CreateContainerRequest,
    ImageSpec, PullImageRequest, RunPodSandboxRequest, StartContainerRequest,
};

async fn running_container(daemon: &mut TestDaemon) -> String {
    let sandbox_id = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config("events", "uid-1")),
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
    let container_id = daemon
        .runtime
        .create_container(CreateContainerRequest {
            pod_sandbox_id: sandbox_id,
            config: Some(container_config("main", "busybox:latest")),
            sandbox_config: Some(sandbox_config("events", "uid-1")),
        })
        .await
        .expect("create")
        .into_inner()
        .container_id;
    daemon
        .runtime
        .start_container(StartContainerRequest {
            container_id: container_id.clone(),
        })
        .await
        .expect("start");
    container_id
}

async fn wait_for_state(
    daemon: &mut TestDaemon,
    id: &str,
    wanted: ContainerState,
) -> proto::cri::ContainerStatus {
    for _ in 0..WAIT_ATTEMPTS {
        let status = daemon
            .runtime
            .container_status(ContainerStatusRequest {
                container_id: id.to_string(),
                verbose: false,
            })
            .await
            .expect("status")
            .into_inner()
            .status
            .expect("status body");
        if status.state == wanted as i32 {
            return status;
        }
        tokio::time::sleep(WAIT_INTERVAL).await;
    }
    panic!("container '{id}' never reached {wanted:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn missed_exit_is_recovered_by_relist() {
    let mut daemon = TestDaemon::start().await;
    let container_id = running_container(&mut daemon).await;

    // Cut the event stream, then let the task die silently: the exit
    // event is published to nobody.
    daemon.fake.disconnect_events();
    daemon.fake.exit_task(&container_id, 7).await;

    // The monitor notices the closed stream, reconnects and relists.
    let status = wait_for_state(
        &mut daemon,
        &container_id,
        ContainerState::ContainerExited,
    )
    .await;
    assert!(status.finished_at > 0);
    assert_eq!(status.exit_code, 7);

    daemon.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn oom_kill_is_reported_as_reason() {
    let mut daemon = TestDaemon::start().await;
    let container_id = running_container(&mut daemon).await;

    daemon.fake.oom_task(&container_id).await;
    daemon.fake.exit_task(&container_id, 137).await;

    let status = wait_for_state(
        &mut daemon,
        &container_id,
        ContainerState::ContainerExited,
    )
    .await;
    assert_eq!(status.exit_code, 137);
    assert_eq!(status.reason, "OOMKilled");

    daemon.stop();
}
