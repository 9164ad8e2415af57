/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Image pulls converge, removal hides the image, and a remove racing a
//! container create resolves to exactly one winner.

mod common;

use common::{container_config, sandbox_config, TestDaemon};
use proto::cri::{
    CreateContainerRequest, ImageSpec, ListImagesRequest, PullImageRequest,
    RemoveImageRequest, RunPodSandboxRequest,
};

fn image_spec(reference: &str) -> Option<ImageSpec> {
    Some(ImageSpec { image: reference.to_string(), ..Default::default() })
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_pulls_of_one_reference_converge_to_one_entry() {
    let daemon = TestDaemon::start().await;

    let mut pulls = Vec::new();
    for _ in 0..3 {
        let mut client = daemon.images.clone();
        pulls.push(tokio::spawn(async move {
            client
                .pull_image(PullImageRequest {
                    image: image_spec("busybox:latest"),
                    ..Default::default()
                })
                .await
                .map(|r| r.into_inner().image_ref)
        }));
    }
    let mut ids = Vec::new();
    for pull in pulls {
        ids.push(pull.await.expect("join").expect("pull"));
    }
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "pulls disagree: {ids:?}");

    let mut client = daemon.images.clone();
    let images = client
        .list_images(ListImagesRequest { filter: None })
        .await
        .expect("list images")
        .into_inner()
        .images;
    assert_eq!(images.len(), 1);
    assert_eq!(
        images[0].repo_tags,
        vec!["docker.io/library/busybox:latest".to_string()]
    );

    daemon.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_image_disappears_from_listing() {
    let mut daemon = TestDaemon::start().await;

    let image_id = daemon
        .images
        .pull_image(PullImageRequest {
            image: image_spec("busybox:latest"),
            ..Default::default()
        })
        .await
        .expect("pull")
        .into_inner()
        .image_ref;

    daemon
        .images
        .remove_image(RemoveImageRequest { image: image_spec("busybox:latest") })
        .await
        .expect("remove");

    let images = daemon
        .images
        .list_images(ListImagesRequest { filter: None })
        .await
        .expect("list")
        .into_inner()
        .images;
    assert!(images.iter().all(|i| i.id != image_id));

    // Removing an absent image is success.
    daemon
        .images
        .remove_image(RemoveImageRequest { image: image_spec("busybox:latest") })
        .await
        .expect("second remove");

    daemon.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn remove_image_racing_create_container_has_one_winner() {
    let mut daemon = TestDaemon::start().await;

    let sandbox_id = daemon
        .runtime
        .run_pod_sandbox(RunPodSandboxRequest {
            config: Some(sandbox_config("race", "uid-1")),
            runtime_handler: String::new(),
        })
        .await
        .expect("run sandbox")
        .into_inner()
        .pod_sandbox_id;

    for round in 0..8 {
        let reference = format!("busybox:round-{round}");
        daemon
            .images
            .pull_image(PullImageRequest {
                image: image_spec(&reference),
                ..Default::default()
            })
            .await
            .expect("pull");

        let mut image_client = daemon.images.clone();
        let remove_ref = reference.clone();
        let remover = tokio::spawn(async move {
            image_client
                .remove_image(RemoveImageRequest {
                    image: image_spec(&remove_ref),
                })
                .await
                .is_ok()
        });

        let mut runtime_client = daemon.runtime.clone();
        let sandbox = sandbox_id.clone();
        let create_ref = reference.clone();
        let creator = tokio::spawn(async move {
            runtime_client
                .create_container(CreateContainerRequest {
                    pod_sandbox_id: sandbox,
                    config: Some(container_config(
                        &format!("c-{round}"),
                        &create_ref,
                    )),
                    sandbox_config: Some(sandbox_config("race", "uid-1")),
                })
                .await
        })
        .await
        .expect("join create");
        let removed = remover.await.expect("join remove");

        match creator {
            Ok(_) => {
                // The create leased the image first; the removal must have
                // been rejected.
                assert!(
                    !removed,
                    "round {round}: both create and remove succeeded"
                );
            }
            Err(status) => {
                assert!(
                    removed,
                    "round {round}: both create and remove failed: {status}"
                );
                assert!(
                    matches!(
                        status.code(),
                        tonic::Code::NotFound | tonic::Code::FailedPrecondition
                    ),
                    "round {round}: unexpected code {:?}",
                    status.code()
                );
            }
        }
    }

    daemon.stop();
}
