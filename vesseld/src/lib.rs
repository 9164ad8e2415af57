/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! vesseld: a CRI shim daemon.
//!
//! Serves the kubelet's Runtime and Image gRPC services over a local UNIX
//! socket and translates them into operations against a containerd-style
//! engine and a CNI plugin. The lifecycle core lives in [`cri`] and the
//! manager modules; this crate root only assembles and runs the daemon.

#![warn(future_incompatible, nonstandard_style, unused)]
#![warn(
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    unconditional_recursion,
    unused_comparisons,
    while_true
)]
#![warn(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
#![warn(clippy::unwrap_used)]

use anyhow::Context;
use clap::Parser;
use proto::cri::image_service_server::ImageServiceServer;
use proto::cri::runtime_service_server::RuntimeServiceServer;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tonic::transport::Server;
use tracing::{error, info, warn};

pub mod cni;
pub mod config;
pub mod container;
pub mod cri;
pub mod engine;
pub mod events;
mod graceful_shutdown;
pub mod image;
pub mod logging;
pub mod metrics;
pub mod names;
pub mod netns;
pub mod oci;
pub mod recovery;
pub mod registrar;
pub mod sandbox;
pub mod store;
pub mod streaming;

use crate::cni::Cni;
use crate::config::Config;
use crate::cri::image_service::ImageService;
use crate::cri::runtime_service::RuntimeService;
use crate::cri::CriService;
use crate::engine::Containerd;

/// Command line options for vesseld. Flags override file configuration.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct VesseldOptions {
    /// Path to the TOML configuration file.
    #[clap(short, long, value_parser)]
    pub config: Option<PathBuf>,
    /// CRI socket path served to the kubelet.
    #[clap(short, long, value_parser)]
    pub socket: Option<PathBuf>,
    /// Persistent state directory.
    #[clap(long, value_parser)]
    pub root_dir: Option<PathBuf>,
    /// Ephemeral state directory.
    #[clap(long, value_parser)]
    pub state_dir: Option<PathBuf>,
    /// Engine gRPC socket path.
    #[clap(long, value_parser)]
    pub engine_socket: Option<PathBuf>,
    /// Engine namespace to operate in.
    #[clap(long, value_parser)]
    pub namespace: Option<String>,
    /// Raise the default log level from info to debug.
    #[clap(short, long)]
    pub verbose: bool,
}

impl VesseldOptions {
    fn apply(&self, config: &mut Config) {
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if let Some(root_dir) = &self.root_dir {
            config.root_dir = root_dir.clone();
        }
        if let Some(state_dir) = &self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if let Some(engine_socket) = &self.engine_socket {
            config.engine.socket_path = engine_socket.clone();
        }
        if let Some(namespace) = &self.namespace {
            config.engine.namespace = namespace.clone();
        }
    }
}

/// Run the daemon until a termination signal arrives. Recovery must
/// succeed before any listener accepts traffic.
pub async fn run(options: VesseldOptions) -> anyhow::Result<()> {
    let mut config = Config::load(options.config.as_deref())
        .context("failed to load configuration")?;
    options.apply(&mut config);

    info!("starting vesseld, pid {}", std::process::id());
    tokio::fs::create_dir_all(&config.root_dir)
        .await
        .with_context(|| {
            format!("failed to create root dir '{}'", config.root_dir.display())
        })?;
    tokio::fs::create_dir_all(&config.state_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create state dir '{}'",
                config.state_dir.display()
            )
        })?;

    let engine = Containerd::connect(
        &config.engine.socket_path,
        &config.engine.namespace,
        &config.engine.snapshotter,
        &config.engine.runtime_type,
    )
    .await
    .context("failed to connect to the engine")?;
    info!(
        "connected to engine at '{}', namespace '{}'",
        config.engine.socket_path.display(),
        config.engine.namespace
    );

    let cni = Arc::new(Cni::new(
        config.network_plugin_bin_dir.clone(),
        config.network_plugin_conf_dir.clone(),
        config.network_plugin_max_conf_num,
    ));
    match cni.reload() {
        Ok(_) => info!("loaded cni networks"),
        Err(e) => warn!("cni not ready yet: {e}"),
    }

    let service =
        Arc::new(CriService::new(config.clone(), Arc::new(engine), cni.clone()));

    service.recover().await.context("state recovery failed")?;

    // Build gRPC services.
    let (mut health_reporter, health_service) =
        tonic_health::server::health_reporter();
    let runtime_service = RuntimeService::new(Arc::clone(&service));
    let runtime_server = RuntimeServiceServer::new(runtime_service.clone());
    health_reporter
        .set_serving::<RuntimeServiceServer<RuntimeService>>()
        .await;
    let image_service = ImageService::new(Arc::clone(&service));
    let image_server = ImageServiceServer::new(image_service.clone());
    health_reporter.set_serving::<ImageServiceServer<ImageService>>().await;

    let graceful_shutdown =
        graceful_shutdown::GracefulShutdown::new(health_reporter);

    // Background loops, each owning a shutdown receiver.
    let stream_addr = streaming::server::run(
        Arc::clone(&service),
        graceful_shutdown.subscribe(),
    )
    .await
    .context("failed to start stream server")?;
    service.streaming.set_base_url(stream_addr);

    let _ = tokio::spawn(events::run(
        Arc::clone(&service),
        graceful_shutdown.subscribe(),
    ));
    let _ = tokio::spawn(metrics::run(
        Arc::clone(&service),
        graceful_shutdown.subscribe(),
    ));
    let _ = tokio::spawn(cni::watcher::run(
        Arc::clone(&cni),
        graceful_shutdown.subscribe(),
    ));

    // Recovery is done and the loops are up: start serving.
    service.set_initialized();

    let uds = bind_unix_socket(&config).await?;
    let mut uds_shutdown = graceful_shutdown.subscribe();
    let uds_runtime_server = runtime_server.clone();
    let uds_image_server = image_server.clone();
    let uds_health = health_service.clone();
    let server_handle = tokio::spawn(async move {
        Server::builder()
            .add_service(uds_health)
            .add_service(uds_runtime_server)
            .add_service(uds_image_server)
            .serve_with_incoming_shutdown(uds, async move {
                let _ = uds_shutdown.changed().await;
                info!("gRPC server received shutdown signal");
            })
            .await
    });

    if !config.disable_tcp_service {
        let address = config.tcp_server_address.clone();
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("failed to bind tcp '{address}'"))?;
        info!("serving CRI on tcp '{address}'");
        let mut tcp_shutdown = graceful_shutdown.subscribe();
        let tcp_runtime_server = runtime_server.clone();
        let tcp_image_server = image_server.clone();
        let tcp_health = health_service.clone();
        let _ = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(tcp_health)
                .add_service(tcp_runtime_server)
                .add_service(tcp_image_server)
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    async move {
                        let _ = tcp_shutdown.changed().await;
                    },
                )
                .await;
            if let Err(e) = result {
                error!("tcp gRPC server exited with error: {e}");
            }
        });
    }

    let shutdown_handle = tokio::spawn(graceful_shutdown.wait());
    let (server_result, _) = tokio::try_join!(server_handle, shutdown_handle)?;
    server_result.context("gRPC server failed")?;
    info!("vesseld exited cleanly");
    Ok(())
}

async fn bind_unix_socket(config: &Config) -> anyhow::Result<UnixListenerStream> {
    let socket_path = &config.socket_path;
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("failed to create socket dir '{}'", parent.display())
        })?;
    }
    match tokio::fs::remove_file(socket_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| {
                format!(
                    "failed to remove stale socket '{}'",
                    socket_path.display()
                )
            })
        }
    }
    let listener = UnixListener::bind(socket_path).with_context(|| {
        format!("failed to bind socket '{}'", socket_path.display())
    })?;
    // Kubelet runs as root; keep the socket group-accessible only.
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o660);
    std::fs::set_permissions(socket_path, permissions).with_context(|| {
        format!("failed to chmod socket '{}'", socket_path.display())
    })?;
    info!("serving CRI on '{}'", socket_path.display());
    Ok(UnixListenerStream::new(listener))
}
