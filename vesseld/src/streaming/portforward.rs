/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Port forwarding into a sandbox's network namespace.

use super::{Coordinator, PortForwardSession, SessionKind, StreamingError};
use crate::cri::{CriError, CriService, Result};
use crate::store::sandbox::SandboxState;
use proto::cri::PortForwardRequest;
use std::os::unix::io::AsRawFd;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

impl CriService {
    /// Allocate a port-forward session and hand back its one-shot URL.
    pub(crate) fn port_forward(&self, request: &PortForwardRequest) -> Result<String> {
        let sandbox = self.sandbox_store.get(&request.pod_sandbox_id)?;
        if sandbox.state != SandboxState::Ready {
            return Err(CriError::precondition(format!(
                "sandbox '{}' is not running",
                request.pod_sandbox_id
            )));
        }
        if request.port.is_empty() {
            return Err(CriError::invalid("port forward requires a port"));
        }
        for port in &request.port {
            if *port <= 0 || *port > u16::MAX as i32 {
                return Err(CriError::invalid(format!("invalid port {port}")));
            }
        }

        let session = PortForwardSession {
            sandbox_id: request.pod_sandbox_id.clone(),
            net_ns_path: sandbox.metadata.net_ns_path.clone(),
            ports: request.port.clone(),
        };
        Ok(self.streaming.register(SessionKind::PortForward(session)))
    }
}

impl Coordinator {
    /// Drive a claimed port-forward session: enter the sandbox's network
    /// namespace and splice the connection through socat to the target
    /// port. Port-forward sessions are independent of each other.
    pub(crate) async fn run_port_forward_session<S>(
        &self,
        stream: S,
        session: PortForwardSession,
    ) -> super::Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let port = *session.ports.first().ok_or_else(|| StreamingError::Io {
            message: "port forward session without ports".to_string(),
        })?;

        let mut command = Command::new("socat");
        let _ = command
            .arg("-")
            .arg(format!("TCP4:localhost:{port}"))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // Host-network sandboxes have no namespace of their own; socat
        // then dials the host loopback directly.
        if !session.net_ns_path.is_empty() {
            let netns = std::fs::File::open(&session.net_ns_path).map_err(
                |e| StreamingError::Io {
                    message: format!(
                        "open netns '{}': {e}",
                        session.net_ns_path
                    ),
                },
            )?;
            let netns_fd = netns.as_raw_fd();
            unsafe {
                let _ = command.pre_exec(move || {
                    let fd = std::os::fd::BorrowedFd::borrow_raw(netns_fd);
                    nix::sched::setns(fd, nix::sched::CloneFlags::CLONE_NEWNET)
                        .map_err(std::io::Error::other)
                });
            }
            // Keep the fd alive until the child is spawned.
            let mut child = command.spawn().map_err(|e| StreamingError::Io {
                message: format!("spawn socat: {e}"),
            })?;
            drop(netns);
            return splice(stream, &mut child, &session.sandbox_id, port).await;
        }

        let mut child = command.spawn().map_err(|e| StreamingError::Io {
            message: format!("spawn socat: {e}"),
        })?;
        splice(stream, &mut child, &session.sandbox_id, port).await
    }
}

async fn splice<S>(
    stream: S,
    child: &mut tokio::process::Child,
    sandbox_id: &str,
    port: i32,
) -> super::Result<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let mut child_stdin = child.stdin.take().ok_or_else(|| StreamingError::Io {
        message: "socat has no stdin".to_string(),
    })?;
    let mut child_stdout =
        child.stdout.take().ok_or_else(|| StreamingError::Io {
            message: "socat has no stdout".to_string(),
        })?;

    let (mut client_read, mut client_write) = tokio::io::split(stream);

    let inbound = tokio::spawn(async move {
        let mut chunk = vec![0u8; 8192];
        loop {
            match client_read.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if child_stdin.write_all(&chunk[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        // Dropping stdin tells socat the client is done.
    });
    let outbound = tokio::spawn(async move {
        let mut chunk = vec![0u8; 8192];
        loop {
            match child_stdout.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if client_write.write_all(&chunk[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = client_write.shutdown().await;
    });

    // Either side hanging up ends the session.
    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
    }
    match child.wait().await {
        Ok(status) => {
            debug!(
                "port forward to '{sandbox_id}':{port} finished ({status})"
            );
        }
        Err(e) => warn!("socat for '{sandbox_id}' did not exit cleanly: {e}"),
    }
    Ok(())
}
