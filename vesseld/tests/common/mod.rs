/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */
#![allow(unused)]

//! End-to-end test harness: a real gRPC server over a UNIX socket, backed
//! by the in-memory fake engine. Pods run with host network and host IPC
//! so no test needs privileges.

use proto::cri::image_service_client::ImageServiceClient;
use proto::cri::image_service_server::ImageServiceServer;
use proto::cri::runtime_service_client::RuntimeServiceClient;
use proto::cri::runtime_service_server::RuntimeServiceServer;
use proto::cri::{
    ContainerConfig, ContainerMetadata, ImageSpec, LinuxPodSandboxConfig,
    LinuxSandboxSecurityContext, NamespaceMode, NamespaceOption,
    PodSandboxConfig, PodSandboxMetadata,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tower::service_fn;
use vesseld::cni::Cni;
use vesseld::config::Config;
use vesseld::cri::image_service::ImageService;
use vesseld::cri::runtime_service::RuntimeService;
use vesseld::cri::CriService;
use vesseld::engine::testing::FakeEngine;
use vesseld::engine::Engine;

pub struct TestDaemon {
    pub runtime: RuntimeServiceClient<Channel>,
    pub images: ImageServiceClient<Channel>,
    pub fake: Arc<FakeEngine>,
    pub service: Arc<CriService>,
    shutdown: watch::Sender<()>,
    // Keeps the tempdir (and the socket inside it) alive for the test.
    _dir: Option<tempfile::TempDir>,
}

impl TestDaemon {
    /// Boot a daemon with a fresh fake engine and state directory.
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let fake = Arc::new(FakeEngine::new());
        let mut daemon =
            Self::start_with(Arc::clone(&fake), dir.path()).await;
        daemon._dir = Some(dir);
        daemon
    }

    /// Boot a daemon over existing engine state, as a restart would.
    pub async fn start_with(fake: Arc<FakeEngine>, dir: &Path) -> Self {
        let config = test_config(dir);
        let cni = Arc::new(Cni::new(
            config.network_plugin_bin_dir.clone(),
            config.network_plugin_conf_dir.clone(),
            config.network_plugin_max_conf_num,
        ));
        let engine: Arc<dyn Engine> = Arc::clone(&fake) as Arc<dyn Engine>;
        let service =
            Arc::new(CriService::new(config.clone(), engine, cni));
        service.recover().await.expect("recovery");
        service.set_initialized();

        let (shutdown, _) = watch::channel(());
        let _ = tokio::spawn(vesseld::events::run(
            Arc::clone(&service),
            shutdown.subscribe(),
        ));

        let socket = config.socket_path.clone();
        let listener = UnixListener::bind(&socket).expect("bind test socket");
        let mut server_shutdown = shutdown.subscribe();
        let runtime_service = RuntimeService::new(Arc::clone(&service));
        let image_service = ImageService::new(Arc::clone(&service));
        let _ = tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(RuntimeServiceServer::new(runtime_service))
                .add_service(ImageServiceServer::new(image_service))
                .serve_with_incoming_shutdown(
                    UnixListenerStream::new(listener),
                    async move {
                        let _ = server_shutdown.changed().await;
                    },
                )
                .await;
        });

        let channel = connect(&socket).await;
        Self {
            runtime: RuntimeServiceClient::new(channel.clone()),
            images: ImageServiceClient::new(channel),
            fake,
            service,
            shutdown,
            _dir: None,
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.root_dir = dir.join("root");
    config.state_dir = dir.join("state");
    config.socket_path = dir.join("vesseld.sock");
    config.network_plugin_conf_dir = dir.join("cni");
    std::fs::create_dir_all(&config.root_dir).expect("root dir");
    std::fs::create_dir_all(&config.state_dir).expect("state dir");
    config
}

async fn connect(socket: &Path) -> Channel {
    let socket = socket.to_path_buf();
    let endpoint =
        Endpoint::from_static("http://[::]:0").connect_timeout(Duration::from_secs(5));
    for _ in 0..50 {
        let socket = socket.clone();
        let result = endpoint
            .connect_with_connector(service_fn(move |_: Uri| {
                UnixStream::connect(socket.clone())
            }))
            .await;
        match result {
            Ok(channel) => return channel,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("could not connect to test daemon");
}

/// A host-network, host-IPC sandbox config, runnable without privileges.
pub fn sandbox_config(name: &str, uid: &str) -> PodSandboxConfig {
    sandbox_config_with_attempt(name, uid, 0)
}

pub fn sandbox_config_with_attempt(
    name: &str,
    uid: &str,
    attempt: u32,
) -> PodSandboxConfig {
    PodSandboxConfig {
        metadata: Some(PodSandboxMetadata {
            name: name.to_string(),
            uid: uid.to_string(),
            namespace: "default".to_string(),
            attempt,
        }),
        hostname: name.to_string(),
        log_directory: String::new(),
        linux: Some(LinuxPodSandboxConfig {
            security_context: Some(LinuxSandboxSecurityContext {
                namespace_options: Some(NamespaceOption {
                    network: NamespaceMode::Node as i32,
                    ipc: NamespaceMode::Node as i32,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn container_config(name: &str, image: &str) -> ContainerConfig {
    ContainerConfig {
        metadata: Some(ContainerMetadata {
            name: name.to_string(),
            attempt: 0,
        }),
        image: Some(ImageSpec { image: image.to_string(), ..Default::default() }),
        ..Default::default()
    }
}

/// Deadline used by polling loops in the tests.
pub const WAIT_ATTEMPTS: usize = 200;
pub const WAIT_INTERVAL: Duration = Duration::from_millis(25);
