/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Signal-driven shutdown fan-out.

use crate::cri::image_service::ImageService;
use crate::cri::runtime_service::RuntimeService;
use proto::cri::image_service_server::ImageServiceServer;
use proto::cri::runtime_service_server::RuntimeServiceServer;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch::{channel, Receiver, Sender};
use tonic_health::server::HealthReporter;
use tracing::info;

pub(crate) struct GracefulShutdown {
    health_reporter: HealthReporter,
    shutdown_broadcaster: Sender<()>,
}

impl GracefulShutdown {
    pub fn new(health_reporter: HealthReporter) -> Self {
        let (tx, _) = channel(());
        Self { health_reporter, shutdown_broadcaster: tx }
    }

    /// Subscribe to the shutdown broadcast channel. Every background loop
    /// and server holds one receiver; dropping it signals completion.
    pub fn subscribe(&self) -> Receiver<()> {
        self.shutdown_broadcaster.subscribe()
    }

    /// Wait for SIGTERM or SIGINT, then:
    /// * flip the health endpoints to NOT_SERVING,
    /// * broadcast shutdown to the gRPC servers and background loops,
    /// * wait for every subscriber to drop.
    pub async fn wait(mut self) {
        tokio::select! {
            _ = wait_for_signal(SignalKind::terminate()) => {
                info!("received SIGTERM");
            }
            _ = wait_for_signal(SignalKind::interrupt()) => {
                info!("received SIGINT");
            }
        }

        self.health_reporter
            .set_not_serving::<RuntimeServiceServer<RuntimeService>>()
            .await;
        self.health_reporter
            .set_not_serving::<ImageServiceServer<ImageService>>()
            .await;

        let _ = self.shutdown_broadcaster.send_replace(());
        self.shutdown_broadcaster.closed().await;
        info!("all subsystems stopped");
    }
}

async fn wait_for_signal(kind: SignalKind) {
    let mut stream =
        tokio::signal::unix::signal(kind).expect("failed to install signal handler");
    let _ = stream.recv().await;
}
