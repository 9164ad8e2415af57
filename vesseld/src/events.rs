/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Event monitor.
//!
//! Subscribes to the engine's ordered event stream and applies the
//! authoritative lifecycle transitions: task exits flip containers to
//! EXITED and pause exits flip sandboxes to NOTREADY. Every reconnect is
//! followed by a relist sweep so exits missed during an outage cannot
//! leave the stores drifting from engine state.

use crate::cri::CriService;
use crate::engine::{EngineEvent, TaskState};
use crate::store::container::OOM_EXIT_REASON;
use crate::store::sandbox::SandboxState;
use crate::store::unix_nanos;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// First retry delay after losing the engine connection.
const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(100);
/// Ceiling for the reconnect delay.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(30);
const EXPONENTIAL_FACTOR: f64 = 2.0;

/// Exit code recorded when the real one is unknowable (task vanished).
const UNKNOWN_EXIT_CODE: i32 = 255;

/// Run the monitor until shutdown. Reconnects forever with exponential
/// backoff; events are processed strictly in arrival order.
pub async fn run(service: Arc<CriService>, mut shutdown: watch::Receiver<()>) {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(MIN_RETRY_INTERVAL)
        .with_multiplier(EXPONENTIAL_FACTOR)
        .with_max_interval(MAX_RETRY_INTERVAL)
        .with_max_elapsed_time(None)
        .build();

    loop {
        let mut events = match service.engine.subscribe_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("failed to subscribe to engine events: {e}");
                let delay =
                    backoff.next_backoff().unwrap_or(MAX_RETRY_INTERVAL);
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };
        backoff.reset();
        info!("subscribed to engine events");

        // Catch up on anything that happened while disconnected.
        relist(&service).await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("event monitor shutting down");
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => handle_event(&service, event).await,
                    None => {
                        warn!("engine event stream closed, reconnecting");
                        break;
                    }
                },
            }
        }
    }
}

async fn handle_event(service: &CriService, event: EngineEvent) {
    match event {
        EngineEvent::TaskExit { container_id, id, pid, exit_status, exited_at } => {
            handle_task_exit(service, &container_id, &id, pid, exit_status, exited_at)
                .await;
        }
        EngineEvent::TaskOom { container_id } => {
            debug!("task oom for '{container_id}'");
            match service.container_store.update(&container_id, |container| {
                container.reason = OOM_EXIT_REASON.to_string();
            }) {
                Ok(()) => {}
                // A sandbox or an already-removed container; nothing to tag.
                Err(_) => {}
            }
        }
        EngineEvent::Other => {}
    }
}

async fn handle_task_exit(
    service: &CriService,
    container_id: &str,
    process_id: &str,
    pid: u32,
    exit_status: u32,
    exited_at: i64,
) {
    if let Ok(container) = service.container_store.get(container_id) {
        // Exec processes exit under the same container id but their own
        // process id; only the init process drives the state machine.
        if process_id != container_id && pid != container.status.pid {
            return;
        }
        debug!("task exit for container '{container_id}', status {exit_status}");

        match service.engine.delete_task(container_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!("failed to delete exited task '{container_id}': {e}");
                return;
            }
        }
        let finished_at = if exited_at > 0 { exited_at } else { unix_nanos() };
        let result = service.container_store.update(container_id, |container| {
            // A start-failure path may have recorded the exit already;
            // the first record wins.
            if container.status.finished_at != 0 {
                return;
            }
            container.status.pid = 0;
            container.status.finished_at = finished_at;
            container.status.exit_code = exit_status as i32;
        });
        if let Err(e) = result {
            warn!("failed to record exit of '{container_id}': {e}");
        }
        return;
    }

    if service.sandbox_store.get(container_id).is_ok() {
        debug!("pause task exit for sandbox '{container_id}'");
        let result = service.sandbox_store.update(container_id, |sandbox| {
            sandbox.state = SandboxState::NotReady;
            sandbox.task_pid = 0;
        });
        if let Err(e) = result {
            warn!("failed to mark sandbox '{container_id}' not ready: {e}");
        }
    }
}

/// Re-derive in-memory state from the engine: any RUNNING container or
/// READY sandbox whose task is gone or stopped gets the transition a
/// missed exit event would have applied.
pub(crate) async fn relist(service: &CriService) {
    use proto::cri::ContainerState;

    for container in service.container_store.list() {
        if container.state() != ContainerState::ContainerRunning {
            continue;
        }
        let id = container.id().to_string();
        match service.engine.get_task(&id).await {
            Ok(status) if status.state == TaskState::Stopped => {
                handle_task_exit(
                    service,
                    &id,
                    &id,
                    container.status.pid,
                    status.exit_status,
                    status.exited_at,
                )
                .await;
            }
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                warn!("running container '{id}' has no task, marking exited");
                let _ = service.container_store.update(&id, |container| {
                    if container.status.finished_at == 0 {
                        container.status.pid = 0;
                        container.status.finished_at = unix_nanos();
                        container.status.exit_code = UNKNOWN_EXIT_CODE;
                    }
                });
            }
            Err(e) => warn!("relist of container '{id}' failed: {e}"),
        }
    }

    for sandbox in service.sandbox_store.list() {
        if sandbox.state != SandboxState::Ready {
            continue;
        }
        let id = sandbox.id().to_string();
        let stopped = match service.engine.get_task(&id).await {
            Ok(status) => status.state != TaskState::Running,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                warn!("relist of sandbox '{id}' failed: {e}");
                false
            }
        };
        if stopped {
            warn!("ready sandbox '{id}' has no running pause task");
            let _ = service.sandbox_store.update(&id, |sandbox| {
                sandbox.state = SandboxState::NotReady;
                sandbox.task_pid = 0;
            });
        }
    }
}
