/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Attach to the stdio of a running container task.

use super::{AttachSession, Coordinator, SessionKind, StreamingError};
use crate::cri::{CriError, CriService, Result};
use proto::cri::{AttachRequest, ContainerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

impl CriService {
    /// Allocate an attach session and hand back its one-shot URL.
    pub(crate) fn attach(&self, request: &AttachRequest) -> Result<String> {
        let container = self.container_store.get(&request.container_id)?;
        if container.state() != ContainerState::ContainerRunning {
            return Err(CriError::precondition(format!(
                "container '{}' is not running",
                request.container_id
            )));
        }
        if !(request.stdin || request.stdout || request.stderr) {
            return Err(CriError::invalid(
                "attach requires at least one of stdin, stdout and stderr",
            ));
        }
        let io = container.io.clone().ok_or_else(|| {
            CriError::precondition(format!(
                "container '{}' has no io attached",
                request.container_id
            ))
        })?;

        let session = AttachSession {
            container_id: request.container_id.clone(),
            io,
            tty: container.metadata.config.tty,
            stdin: request.stdin,
            stdout: request.stdout,
            stderr: request.stderr,
        };
        Ok(self.streaming.register(SessionKind::Attach(session)))
    }
}

impl Coordinator {
    /// Drive a claimed attach session: client bytes into the container's
    /// stdin FIFO, broadcast output chunks back to the client. The session
    /// ends when the client hangs up.
    pub(crate) async fn run_attach_session<S>(
        &self,
        stream: S,
        session: AttachSession,
    ) -> super::Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut client_read, mut client_write) = tokio::io::split(stream);

        let mut output = session.io.subscribe_output();
        let wants_stdout = session.stdout || session.tty;
        let wants_stderr = session.stderr && !session.tty;
        let output_task = tokio::spawn(async move {
            loop {
                match output.recv().await {
                    Ok(chunk) => {
                        let wanted = (chunk.stream == "stdout" && wants_stdout)
                            || (chunk.stream == "stderr" && wants_stderr);
                        if !wanted {
                            continue;
                        }
                        if client_write.write_all(&chunk.bytes).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        debug!("attach output lagged by {n} chunks");
                    }
                    Err(_) => break,
                }
            }
            let _ = client_write.shutdown().await;
        });

        // Feed stdin until the client closes its stream.
        if session.stdin {
            let stdin_path = session.io.stdin_path().ok_or_else(|| {
                StreamingError::Io {
                    message: format!(
                        "container '{}' was created without stdin",
                        session.container_id
                    ),
                }
            })?;
            let mut sender = super::exec::open_sender(stdin_path)?;
            let mut chunk = vec![0u8; 8192];
            loop {
                match client_read.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sender.write_all(&chunk[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        } else {
            // Output-only attach: wait for the client to hang up.
            let mut sink = vec![0u8; 1024];
            while let Ok(n) = client_read.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        }

        output_task.abort();
        debug!("attach session for '{}' finished", session.container_id);
        Ok(())
    }
}
