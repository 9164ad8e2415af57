/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! A sandbox runs to READY, stops to NOTREADY, and removal leaves nothing
//! behind in the daemon or the engine.

mod common;

use common::{sandbox_config, TestDaemon};
use proto::cri::{
    ListPodSandboxRequest, PodSandboxState, PodSandboxStatusRequest,
    RemovePodSandboxRequest, RunPodSandboxRequest, StopPodSandboxRequest,
};

#[tokio::test(flavor = "multi_thread")]
async fn sandbox_lifecycle_should_reach_ready_and_remove_cleanly() {
    let mut daemon = TestDaemon::start().await;

    let response = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config("web", "uid-1")),
            runtime_handler: String::new(),
        })
        .await
        .expect("run sandbox")
        .into_inner();
    let id = response.pod_sandbox_id;
    assert_eq!(id.len(), 64);

    let status = daemon
        .runtime
        .pod_sandbox_status(PodSandboxStatusRequest {
            pod_sandbox_id: id.clone(),
            verbose: false,
        })
        .await
        .expect("status")
        .into_inner()
        .status
        .expect("status body");
    assert_eq!(status.state, PodSandboxState::SandboxReady as i32);
    assert_eq!(
        status.metadata.as_ref().expect("metadata").name,
        "web"
    );

    // The engine now holds the pause snapshot, container and task.
    assert!(daemon.fake.snapshot_exists(&id));
    assert!(daemon.fake.container_exists(&id));
    assert!(daemon.fake.task_exists(&id));

    daemon
        .runtime
        .stop_pod_sandbox(StopPodSandboxRequest { pod_sandbox_id: id.clone() })
        .await
        .expect("stop sandbox");

    let status = daemon
        .runtime
        .pod_sandbox_status(PodSandboxStatusRequest {
            pod_sandbox_id: id.clone(),
            verbose: false,
        })
        .await
        .expect("status after stop")
        .into_inner()
        .status
        .expect("status body");
    assert_eq!(status.state, PodSandboxState::SandboxNotready as i32);

    daemon
        .runtime
        .remove_pod_sandbox(RemovePodSandboxRequest {
            pod_sandbox_id: id.clone(),
        })
        .await
        .expect("remove sandbox");

    let listed = daemon
        .runtime
        .list_pod_sandbox(ListPodSandboxRequest { filter: None })
        .await
        .expect("list")
        .into_inner();
    assert!(listed.items.is_empty());
    assert!(!daemon.fake.snapshot_exists(&id));
    assert!(!daemon.fake.container_exists(&id));

    // Removing again is success with no effect.
    daemon
        .runtime
        .remove_pod_sandbox(RemovePodSandboxRequest { pod_sandbox_id: id })
        .await
        .expect("second remove");

    daemon.stop();
}
