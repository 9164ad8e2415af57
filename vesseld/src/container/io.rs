/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Container stdio: FIFOs toward the engine, kubelet log files toward the
//! node.
//!
//! The engine writes raw stdout/stderr into per-container FIFOs; pump
//! tasks reframe each line into the kubelet log format
//! `RFC3339Nano stream tag content` and append it to the container log
//! file. `ReopenContainerLog` swaps the sink file under the pumps after
//! external rotation.

use chrono::{SecondsFormat, Utc};
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{trace, warn};

/// One raw chunk of task output, fanned out to attach sessions.
#[derive(Clone, Debug)]
pub struct OutputChunk {
    pub stream: &'static str,
    pub bytes: Vec<u8>,
}

/// Buffered chunks per attach subscriber before it starts lagging.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

pub(crate) type Result<T> = std::result::Result<T, IoError>;

#[derive(Debug, Error)]
pub enum IoError {
    #[error("failed to create fifo '{path}': {message}")]
    Fifo { path: String, message: String },
    #[error("failed to open log file '{path}': {source}")]
    Log { path: String, source: std::io::Error },
}

/// Tag marking a complete line in the kubelet log format.
const TAG_FULL: &str = "F";
/// Tag marking a line split because it exceeded the size limit.
const TAG_PARTIAL: &str = "P";

/// Shared log sink; reopened in place on rotation.
#[derive(Debug)]
pub struct LogSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl LogSink {
    async fn open(path: &Path) -> Result<Self> {
        let file = open_append(path).await?;
        Ok(Self { path: path.to_path_buf(), file: Mutex::new(file) })
    }

    /// Swap in a fresh append handle, for use after log rotation.
    pub async fn reopen(&self) -> Result<()> {
        let file = open_append(&self.path).await?;
        *self.file.lock().await = file;
        Ok(())
    }

    async fn write_line(&self, stream: &str, tag: &str, content: &[u8]) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        let mut line =
            Vec::with_capacity(timestamp.len() + stream.len() + content.len() + 8);
        line.extend_from_slice(timestamp.as_bytes());
        line.push(b' ');
        line.extend_from_slice(stream.as_bytes());
        line.push(b' ');
        line.extend_from_slice(tag.as_bytes());
        line.push(b' ');
        line.extend_from_slice(content);
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if let Err(e) = file.write_all(&line).await {
            warn!("failed to append container log '{}': {e}", self.path.display());
        }
    }
}

async fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|source| IoError::Log {
            path: path.display().to_string(),
            source,
        })
}

/// Stdio endpoints of one container task.
#[derive(Debug)]
pub struct ContainerIo {
    stdout_fifo: PathBuf,
    stderr_fifo: PathBuf,
    stdin_fifo: Option<PathBuf>,
    log: Option<Arc<LogSink>>,
    output: broadcast::Sender<OutputChunk>,
    shutdown: watch::Sender<()>,
}

impl ContainerIo {
    /// Create the FIFOs under `io_dir` and start the log pumps when a log
    /// path was requested.
    pub async fn new(
        io_dir: &Path,
        log_path: Option<&Path>,
        with_stdin: bool,
        max_line_size: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(io_dir).map_err(|e| IoError::Fifo {
            path: io_dir.display().to_string(),
            message: e.to_string(),
        })?;
        let stdout_fifo = io_dir.join("stdout");
        let stderr_fifo = io_dir.join("stderr");
        make_fifo(&stdout_fifo)?;
        make_fifo(&stderr_fifo)?;
        let stdin_fifo = if with_stdin {
            let path = io_dir.join("stdin");
            make_fifo(&path)?;
            Some(path)
        } else {
            None
        };

        let (shutdown, _) = watch::channel(());
        let (output, _) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let log = match log_path {
            Some(path) => Some(Arc::new(LogSink::open(path).await?)),
            None => None,
        };

        let io = Self { stdout_fifo, stderr_fifo, stdin_fifo, log, output, shutdown };
        if let Some(log) = &io.log {
            io.spawn_pump("stdout", io.stdout_fifo.clone(), Arc::clone(log), max_line_size);
            io.spawn_pump("stderr", io.stderr_fifo.clone(), Arc::clone(log), max_line_size);
        }
        Ok(io)
    }

    /// Subscribe to the live output stream; used by attach sessions.
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputChunk> {
        self.output.subscribe()
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_fifo
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_fifo
    }

    pub fn stdin_path(&self) -> Option<&Path> {
        self.stdin_fifo.as_deref()
    }

    pub fn log(&self) -> Option<Arc<LogSink>> {
        self.log.clone()
    }

    /// Stop the pumps. Idempotent; also triggered by drop.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }

    fn spawn_pump(
        &self,
        stream: &'static str,
        fifo: PathBuf,
        log: Arc<LogSink>,
        max_line_size: usize,
    ) {
        let mut shutdown = self.shutdown.subscribe();
        let output = self.output.clone();
        let _ = tokio::spawn(async move {
            // Opened read-write so the FIFO never reports EOF between task
            // restarts; the pump ends on the shutdown signal.
            let mut receiver = match pipe::OpenOptions::new()
                .read_write(true)
                .open_receiver(&fifo)
            {
                Ok(receiver) => receiver,
                Err(e) => {
                    warn!("failed to open fifo '{}': {e}", fifo.display());
                    return;
                }
            };

            let mut buffer = Vec::with_capacity(8192);
            let mut chunk = vec![0u8; 8192];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    read = receiver.read(&mut chunk) => match read {
                        Ok(0) => break,
                        Ok(n) => {
                            // Attach sessions see the raw bytes; dropped
                            // chunks only affect laggy subscribers.
                            let _ = output.send(OutputChunk {
                                stream,
                                bytes: chunk[..n].to_vec(),
                            });
                            buffer.extend_from_slice(&chunk[..n]);
                            drain_lines(&log, stream, &mut buffer, max_line_size)
                                .await;
                        }
                        Err(e) => {
                            warn!("fifo '{}' read failed: {e}", fifo.display());
                            break;
                        }
                    },
                }
            }
            // Flush whatever is left as a final partial line.
            if !buffer.is_empty() {
                log.write_line(stream, TAG_PARTIAL, &buffer).await;
            }
            trace!("log pump for '{}' finished", fifo.display());
        });
    }
}

impl Drop for ContainerIo {
    fn drop(&mut self) {
        self.close();
    }
}

async fn drain_lines(
    log: &LogSink,
    stream: &str,
    buffer: &mut Vec<u8>,
    max_line_size: usize,
) {
    loop {
        if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let rest = buffer.split_off(pos + 1);
            let mut line = std::mem::replace(buffer, rest);
            let _ = line.pop();
            log.write_line(stream, TAG_FULL, &line).await;
            continue;
        }
        if max_line_size > 0 && buffer.len() >= max_line_size {
            let rest = buffer.split_off(max_line_size);
            let line = std::mem::replace(buffer, rest);
            log.write_line(stream, TAG_PARTIAL, &line).await;
            continue;
        }
        return;
    }
}

pub(crate) fn make_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => Ok(()),
        Err(nix::Error::EEXIST) => Ok(()),
        Err(e) => Err(IoError::Fifo {
            path: path.display().to_string(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for_content(path: &Path, needle: &str) -> String {
        for _ in 0..100 {
            if let Ok(content) = tokio::fs::read_to_string(path).await {
                if content.contains(needle) {
                    return content;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("log never contained '{needle}'");
    }

    #[tokio::test]
    async fn test_pump_frames_full_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("container.log");
        let io = ContainerIo::new(
            &dir.path().join("io"),
            Some(&log_path),
            false,
            16 * 1024,
        )
        .await
        .expect("io");

        let mut sender = pipe::OpenOptions::new()
            .open_sender(io.stdout_path())
            .expect("open sender");
        sender.write_all(b"hello world\n").await.expect("write");
        drop(sender);

        let content = wait_for_content(&log_path, "hello world").await;
        let line = content
            .lines()
            .find(|l| l.contains("hello world"))
            .expect("line");
        let fields: Vec<&str> = line.splitn(4, ' ').collect();
        assert_eq!(fields.len(), 4);
        assert!(fields[0].ends_with('Z'), "timestamp: {}", fields[0]);
        assert_eq!(fields[1], "stdout");
        assert_eq!(fields[2], "F");
        assert_eq!(fields[3], "hello world");
        io.close();
    }

    #[tokio::test]
    async fn test_pump_splits_long_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("container.log");
        let io = ContainerIo::new(
            &dir.path().join("io"),
            Some(&log_path),
            false,
            8,
        )
        .await
        .expect("io");

        let mut sender = pipe::OpenOptions::new()
            .open_sender(io.stderr_path())
            .expect("open sender");
        sender.write_all(b"0123456789abcdef\n").await.expect("write");
        drop(sender);

        let content = wait_for_content(&log_path, "89abcdef").await;
        let tags: Vec<&str> = content
            .lines()
            .map(|l| l.splitn(4, ' ').nth(2).expect("tag"))
            .collect();
        assert_eq!(tags, vec!["P", "P", "F"]);
        io.close();
    }

    #[tokio::test]
    async fn test_reopen_switches_to_rotated_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_path = dir.path().join("container.log");
        let io = ContainerIo::new(
            &dir.path().join("io"),
            Some(&log_path),
            false,
            16 * 1024,
        )
        .await
        .expect("io");

        let mut sender = pipe::OpenOptions::new()
            .open_sender(io.stdout_path())
            .expect("open sender");
        sender.write_all(b"before rotation\n").await.expect("write");
        let _ = wait_for_content(&log_path, "before rotation").await;

        // Simulate logrotate: move the file aside, then reopen.
        let rotated = dir.path().join("container.log.1");
        std::fs::rename(&log_path, &rotated).expect("rotate");
        io.log().expect("log sink").reopen().await.expect("reopen");

        sender.write_all(b"after rotation\n").await.expect("write");
        drop(sender);

        let content = wait_for_content(&log_path, "after rotation").await;
        assert!(!content.contains("before rotation"));
        io.close();
    }

    #[tokio::test]
    async fn test_stdin_fifo_created_on_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let io = ContainerIo::new(&dir.path().join("io"), None, true, 1024)
            .await
            .expect("io");
        let stdin = io.stdin_path().expect("stdin fifo");
        let metadata = std::fs::metadata(stdin).expect("metadata");
        use std::os::unix::fs::FileTypeExt;
        assert!(metadata.file_type().is_fifo());
    }
}
