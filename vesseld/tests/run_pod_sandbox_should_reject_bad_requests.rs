/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Admission checks and name reservation on RunPodSandbox.

mod common;

use common::{sandbox_config, sandbox_config_with_attempt, TestDaemon};
use proto::cri::{DnsConfig, RunPodSandboxRequest};
use tonic::Code;

#[tokio::test(flavor = "multi_thread")]
async fn seven_dns_search_domains_are_rejected() {
    let mut daemon = TestDaemon::start().await;

    let mut config = sandbox_config("dns", "uid-1");
    config.dns_config = Some(DnsConfig {
        servers: vec!["8.8.8.8".to_string()],
        searches: (0..7).map(|i| format!("d{i}.example")).collect(),
        options: vec![],
    });
    let err = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(config),
            runtime_handler: String::new(),
        })
        .await
        .expect_err("seven searches");
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(err.message().contains("more than 6 domains"));

    daemon.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn untrusted_workload_cannot_request_host_namespaces() {
    let mut daemon = TestDaemon::start().await;

    // The host-network config plus the untrusted annotation must not pass
    // admission.
    let mut config = sandbox_config("untrusted", "uid-1");
    let _ = config.annotations.insert(
        "io.kubernetes.cri.untrusted-workload".to_string(),
        "true".to_string(),
    );
    let err = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(config),
            runtime_handler: String::new(),
        })
        .await
        .expect_err("untrusted with host network");
    assert_eq!(err.code(), Code::InvalidArgument);

    daemon.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn equal_metadata_runs_race_to_one_winner() {
    let daemon = TestDaemon::start().await;

    let mut attempts = Vec::new();
    for _ in 0..2 {
        let mut client = daemon.runtime.clone();
        attempts.push(tokio::spawn(async move {
            client
                .run_pod_sandbox(RunPodSandboxRequest {
                    config: Some(sandbox_config("dup", "uid-dup")),
                    runtime_handler: String::new(),
                })
                .await
        }));
    }
    let mut ok = 0;
    let mut already_exists = 0;
    for attempt in attempts {
        match attempt.await.expect("join") {
            Ok(_) => ok += 1,
            Err(status) if status.code() == Code::AlreadyExists => {
                already_exists += 1
            }
            Err(status) => panic!("unexpected status: {status}"),
        }
    }
    assert_eq!((ok, already_exists), (1, 1));

    daemon.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn distinct_attempts_of_one_pod_coexist() {
    let mut daemon = TestDaemon::start().await;

    let first = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config_with_attempt("pod", "uid-1", 0)),
            runtime_handler: String::new(),
        })
        .await
        .expect("first attempt")
        .into_inner()
        .pod_sandbox_id;
    let second = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config_with_attempt("pod", "uid-1", 1)),
            runtime_handler: String::new(),
        })
        .await
        .expect("second attempt")
        .into_inner()
        .pod_sandbox_id;

    assert_ne!(first, second);

    daemon.stop();
}
