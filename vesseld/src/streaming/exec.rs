/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Exec and ExecSync.

use super::{
    generate_exec_id, Coordinator, ExecSession, SessionKind, StreamingError,
};
use crate::container::io::make_fifo;
use crate::cri::{CriError, CriService, Result};
use crate::engine::TaskIo;
use proto::cri::{ContainerState, ExecRequest, ExecSyncRequest};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::watch;
use tracing::{debug, warn};

const SIGKILL: u32 = 9;

/// Grace granted for the kill after an exec-sync timeout.
const KILL_WAIT: Duration = Duration::from_secs(10);

/// Quiet period after process exit before output draining stops.
const DRAIN_QUIET: Duration = Duration::from_millis(100);

impl CriService {
    /// Allocate an exec session and hand back its one-shot URL.
    pub(crate) fn exec(&self, request: &ExecRequest) -> Result<String> {
        let container = self.container_store.get(&request.container_id)?;
        if container.state() != ContainerState::ContainerRunning {
            return Err(CriError::precondition(format!(
                "container '{}' is not running",
                request.container_id
            )));
        }
        if request.cmd.is_empty() {
            return Err(CriError::invalid("exec requires a command"));
        }
        if !(request.stdin || request.stdout || request.stderr) {
            return Err(CriError::invalid(
                "exec requires at least one of stdin, stdout and stderr",
            ));
        }
        let process = container
            .metadata
            .spec
            .process()
            .clone()
            .ok_or_else(|| CriError::internal("container spec has no process"))?;

        let session = ExecSession {
            container_id: request.container_id.clone(),
            cmd: request.cmd.clone(),
            tty: request.tty,
            stdin: request.stdin,
            stdout: request.stdout,
            stderr: request.stderr,
            process: Box::new(process),
            exec_dir: self.config.container_exec_dir(&request.container_id),
        };
        Ok(self.streaming.register(SessionKind::Exec(session)))
    }

    /// Run a command synchronously, buffering stdout and stderr up to the
    /// configured cap. On timeout the process is killed and an error is
    /// returned.
    pub(crate) async fn exec_sync(
        &self,
        request: &ExecSyncRequest,
    ) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        let id = &request.container_id;
        let container = self.container_store.get(id)?;
        if container.state() != ContainerState::ContainerRunning {
            return Err(CriError::precondition(format!(
                "container '{id}' is not running"
            )));
        }
        if request.cmd.is_empty() {
            return Err(CriError::invalid("exec requires a command"));
        }
        let process = container
            .metadata
            .spec
            .process()
            .clone()
            .ok_or_else(|| CriError::internal("container spec has no process"))?;

        let exec_id = generate_exec_id();
        let exec_dir = self.config.container_exec_dir(id).join(&exec_id);
        std::fs::create_dir_all(&exec_dir).map_err(|e| {
            CriError::io(format!("create exec dir '{}'", exec_dir.display()), e)
        })?;

        let stdout_fifo = exec_dir.join("stdout");
        let stderr_fifo = exec_dir.join("stderr");
        make_fifo(&stdout_fifo).map_err(|e| CriError::internal(e.to_string()))?;
        make_fifo(&stderr_fifo).map_err(|e| CriError::internal(e.to_string()))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let stdout_task = tokio::spawn(collect_capped(
            stdout_fifo.clone(),
            self.streaming.exec_io_cap,
            stop_rx.clone(),
        ));
        let stderr_task = tokio::spawn(collect_capped(
            stderr_fifo.clone(),
            self.streaming.exec_io_cap,
            stop_rx,
        ));

        let mut exec_process = process;
        let _ = exec_process.set_args(Some(request.cmd.clone()));
        let _ = exec_process.set_terminal(Some(false));
        let process_json = serde_json::to_vec(&exec_process).map_err(|e| {
            CriError::internal(format!("serialize exec process: {e}"))
        })?;

        let io = TaskIo {
            stdout: stdout_fifo.display().to_string(),
            stderr: stderr_fifo.display().to_string(),
            ..Default::default()
        };
        let run = async {
            self.engine
                .create_exec(id, &exec_id, process_json, &io)
                .await?;
            let _ = self.engine.start_exec(id, &exec_id).await?;

            let exit = if request.timeout > 0 {
                let timeout = Duration::from_secs(request.timeout as u64);
                match tokio::time::timeout(
                    timeout,
                    self.engine.wait_exec(id, &exec_id),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        warn!(
                            "exec '{exec_id}' in '{id}' timed out, killing"
                        );
                        match self
                            .engine
                            .kill_exec(id, &exec_id, SIGKILL)
                            .await
                        {
                            Ok(()) => {}
                            Err(e) if e.is_not_found() => {}
                            Err(e) => warn!("failed to kill exec: {e}"),
                        }
                        let _ = tokio::time::timeout(
                            KILL_WAIT,
                            self.engine.wait_exec(id, &exec_id),
                        )
                        .await;
                        return Err(CriError::DeadlineExceeded {
                            reason: format!(
                                "exec in container '{id}' timed out after {}s",
                                request.timeout
                            ),
                        });
                    }
                }
            } else {
                self.engine.wait_exec(id, &exec_id).await?
            };
            Ok(exit)
        };
        let result = run.await;

        // Let the collectors drain whatever the process flushed last.
        tokio::time::sleep(DRAIN_QUIET).await;
        let _ = stop_tx.send(true);
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        match self.engine.delete_exec(id, &exec_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to delete exec '{exec_id}': {e}"),
        }
        if let Err(e) = std::fs::remove_dir_all(&exec_dir) {
            warn!("failed to remove exec dir '{}': {e}", exec_dir.display());
        }

        let exit = result?;
        debug!("exec '{exec_id}' in '{id}' exited {}", exit.exit_status);
        Ok((stdout, stderr, exit.exit_status as i32))
    }
}

impl Coordinator {
    /// Drive a claimed exec session over an upgraded connection.
    pub(crate) async fn run_exec_session<S>(
        &self,
        stream: S,
        session: ExecSession,
    ) -> super::Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let exec_id = generate_exec_id();
        let exec_dir = session.exec_dir.join(&exec_id);
        std::fs::create_dir_all(&exec_dir).map_err(|e| StreamingError::Io {
            message: format!("create exec dir: {e}"),
        })?;

        let stdout_fifo = exec_dir.join("stdout");
        let stderr_fifo = exec_dir.join("stderr");
        let stdin_fifo = exec_dir.join("stdin");
        let mut io = TaskIo { terminal: session.tty, ..Default::default() };
        if session.stdout || session.tty {
            make_fifo(&stdout_fifo)
                .map_err(|e| StreamingError::Io { message: e.to_string() })?;
            io.stdout = stdout_fifo.display().to_string();
        }
        if session.stderr && !session.tty {
            make_fifo(&stderr_fifo)
                .map_err(|e| StreamingError::Io { message: e.to_string() })?;
            io.stderr = stderr_fifo.display().to_string();
        }
        if session.stdin {
            make_fifo(&stdin_fifo)
                .map_err(|e| StreamingError::Io { message: e.to_string() })?;
            io.stdin = stdin_fifo.display().to_string();
        }

        let mut exec_process = session.process;
        let _ = exec_process.set_args(Some(session.cmd.clone()));
        let _ = exec_process.set_terminal(Some(session.tty));
        let process_json =
            serde_json::to_vec(&exec_process).map_err(|e| StreamingError::Io {
                message: format!("serialize exec process: {e}"),
            })?;

        let id = session.container_id.clone();
        self.engine.create_exec(&id, &exec_id, process_json, &io).await?;

        // Open our FIFO ends before the process starts writing.
        let stdout_rx = if io.stdout.is_empty() {
            None
        } else {
            Some(open_receiver(&stdout_fifo)?)
        };
        let stderr_rx = if io.stderr.is_empty() {
            None
        } else {
            Some(open_receiver(&stderr_fifo)?)
        };
        let stdin_tx = if io.stdin.is_empty() {
            None
        } else {
            Some(open_sender(&stdin_fifo)?)
        };

        let _ = self.engine.start_exec(&id, &exec_id).await?;

        let (mut client_read, mut client_write) = tokio::io::split(stream);

        // Client bytes feed stdin; closing the client stream closes the
        // stdin copy without tearing down the output side.
        let stdin_task = stdin_tx.map(|mut sender| {
            tokio::spawn(async move {
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
            })
        });

        let (stop_tx, stop_rx) = watch::channel(false);
        let output_task = tokio::spawn(async move {
            pump_outputs(stdout_rx, stderr_rx, &mut client_write, stop_rx)
                .await;
            let _ = client_write.shutdown().await;
        });

        let wait_result = self.engine.wait_exec(&id, &exec_id).await;
        tokio::time::sleep(DRAIN_QUIET).await;
        let _ = stop_tx.send(true);
        let _ = output_task.await;
        if let Some(task) = stdin_task {
            task.abort();
        }

        match self.engine.delete_exec(&id, &exec_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!("failed to delete exec '{exec_id}': {e}"),
        }
        if let Err(e) = std::fs::remove_dir_all(&exec_dir) {
            warn!("failed to remove exec dir '{}': {e}", exec_dir.display());
        }
        let _ = wait_result?;
        Ok(())
    }
}

pub(super) fn open_receiver(path: &Path) -> super::Result<pipe::Receiver> {
    pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)
        .map_err(|e| StreamingError::Io {
            message: format!("open fifo '{}': {e}", path.display()),
        })
}

pub(super) fn open_sender(path: &Path) -> super::Result<pipe::Sender> {
    pipe::OpenOptions::new()
        .read_write(true)
        .open_sender(path)
        .map_err(|e| StreamingError::Io {
            message: format!("open fifo '{}': {e}", path.display()),
        })
}

/// Copy both output FIFOs to the client until told to stop and the
/// streams have gone quiet. Each stream stays ordered; no interleaving
/// guarantee across them.
async fn pump_outputs<W>(
    stdout: Option<pipe::Receiver>,
    stderr: Option<pipe::Receiver>,
    client: &mut W,
    stop: watch::Receiver<bool>,
) where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut stdout = stdout;
    let mut stderr = stderr;
    let mut chunk = vec![0u8; 8192];
    loop {
        let stopped = *stop.borrow();
        let mut progressed = false;
        for receiver in [stdout.as_mut(), stderr.as_mut()].into_iter().flatten()
        {
            match tokio::time::timeout(
                Duration::from_millis(50),
                receiver.read(&mut chunk),
            )
            .await
            {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(n)) => {
                    progressed = true;
                    if client.write_all(&chunk[..n]).await.is_err() {
                        return;
                    }
                }
                Err(_) => {}
            }
        }
        if stopped && !progressed {
            return;
        }
    }
}

/// Read a FIFO into a capped buffer until stopped and quiet.
async fn collect_capped(
    fifo: PathBuf,
    cap: usize,
    stop: watch::Receiver<bool>,
) -> Vec<u8> {
    let Ok(mut receiver) = pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(&fifo)
    else {
        return Vec::new();
    };
    let mut out = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        let stopped = *stop.borrow();
        match tokio::time::timeout(
            Duration::from_millis(50),
            receiver.read(&mut chunk),
        )
        .await
        {
            Ok(Ok(0)) | Ok(Err(_)) => return out,
            Ok(Ok(n)) => {
                let room = cap.saturating_sub(out.len());
                out.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(_) if stopped => return out,
            Err(_) => {}
        }
    }
}
