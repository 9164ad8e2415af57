/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Streaming coordinator.
//!
//! `Exec`, `Attach` and `PortForward` answer with a URL carrying a
//! single-use token; the kubelet's client then upgrades an HTTP connection
//! against [`server`] and the coordinator wires the connection to the task.
//! Unclaimed tokens expire. `ExecSync` shares the exec machinery without
//! ever touching HTTP.

use crate::config::Config;
use crate::container::io::ContainerIo;
use crate::engine::Engine;
use oci_spec::runtime::Process;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

pub mod attach;
pub mod exec;
pub mod portforward;
pub mod server;

/// Unclaimed session tokens die after this long.
const TOKEN_TTL: Duration = Duration::from_secs(60);

pub(crate) type Result<T> = std::result::Result<T, StreamingError>;

#[derive(Debug, Error)]
pub enum StreamingError {
    #[error("streaming session '{token}' not found or expired")]
    SessionNotFound { token: String },
    #[error("{what} timed out")]
    Timeout { what: String },
    #[error("streaming io failed: {message}")]
    Io { message: String },
    #[error("engine rejected streaming request: {message}")]
    Engine { message: String },
}

impl From<crate::engine::EngineError> for StreamingError {
    fn from(e: crate::engine::EngineError) -> Self {
        StreamingError::Engine { message: e.to_string() }
    }
}

/// An exec session pending its HTTP upgrade.
#[derive(Clone, Debug)]
pub struct ExecSession {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    /// Process template from the container's OCI spec snapshot; exec
    /// inherits env, cwd and identity from it.
    pub process: Box<Process>,
    pub exec_dir: PathBuf,
}

/// An attach session pending its HTTP upgrade.
#[derive(Clone, Debug)]
pub struct AttachSession {
    pub container_id: String,
    pub io: Arc<ContainerIo>,
    pub tty: bool,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// A port-forward session pending its HTTP upgrade.
#[derive(Clone, Debug)]
pub struct PortForwardSession {
    pub sandbox_id: String,
    pub net_ns_path: String,
    pub ports: Vec<i32>,
}

#[derive(Clone, Debug)]
pub enum SessionKind {
    Exec(ExecSession),
    Attach(AttachSession),
    PortForward(PortForwardSession),
}

impl SessionKind {
    fn url_segment(&self) -> &'static str {
        match self {
            SessionKind::Exec(_) => "exec",
            SessionKind::Attach(_) => "attach",
            SessionKind::PortForward(_) => "portforward",
        }
    }
}

struct PendingSession {
    kind: SessionKind,
    expires_at: Instant,
}

pub struct Coordinator {
    pub(crate) engine: Arc<dyn Engine>,
    sessions: Mutex<HashMap<String, PendingSession>>,
    base_url: OnceLock<String>,
    pub(crate) idle_timeout: Duration,
    /// Cap on buffered exec-sync output, per stream.
    pub(crate) exec_io_cap: usize,
}

impl Coordinator {
    pub fn new(engine: Arc<dyn Engine>, config: &Config) -> Self {
        Self {
            engine,
            sessions: Mutex::new(HashMap::new()),
            base_url: OnceLock::new(),
            idle_timeout: Duration::from_secs(
                config.stream_idle_timeout_secs.max(1),
            ),
            exec_io_cap: 16 << 20,
        }
    }

    /// Record where the stream server actually bound; called once at boot.
    pub fn set_base_url(&self, address: std::net::SocketAddr) {
        let _ = self.base_url.set(format!("http://{address}"));
    }

    /// Register a pending session and return its URL.
    pub fn register(&self, kind: SessionKind) -> String {
        let token = Uuid::new_v4().simple().to_string();
        let segment = kind.url_segment();
        let mut sessions = self.sessions.lock().expect("sessions lock");
        purge_expired(&mut sessions);
        let _ = sessions.insert(
            token.clone(),
            PendingSession { kind, expires_at: Instant::now() + TOKEN_TTL },
        );
        let base = self
            .base_url
            .get()
            .cloned()
            .unwrap_or_else(|| "http://127.0.0.1:0".to_string());
        format!("{base}/{segment}/{token}")
    }

    /// Single-use claim of a pending session.
    pub fn claim(&self, token: &str) -> Result<SessionKind> {
        let mut sessions = self.sessions.lock().expect("sessions lock");
        purge_expired(&mut sessions);
        sessions
            .remove(token)
            .map(|pending| pending.kind)
            .ok_or_else(|| StreamingError::SessionNotFound {
                token: token.to_string(),
            })
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.sessions.lock().expect("sessions lock").len()
    }
}

fn purge_expired(sessions: &mut HashMap<String, PendingSession>) {
    let now = Instant::now();
    sessions.retain(|_, pending| pending.expires_at > now);
}

/// Fresh exec process id, unique per exec attempt.
pub(crate) fn generate_exec_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeEngine;

    fn coordinator() -> Coordinator {
        Coordinator::new(Arc::new(FakeEngine::new()), &Config::default())
    }

    fn port_forward_session() -> SessionKind {
        SessionKind::PortForward(PortForwardSession {
            sandbox_id: "sb-1".to_string(),
            net_ns_path: String::new(),
            ports: vec![8080],
        })
    }

    #[test]
    fn test_register_returns_tokenized_url() {
        let coordinator = coordinator();
        coordinator.set_base_url("127.0.0.1:10101".parse().expect("addr"));
        let url = coordinator.register(port_forward_session());
        assert!(url.starts_with("http://127.0.0.1:10101/portforward/"));
    }

    #[test]
    fn test_claim_is_single_use() {
        let coordinator = coordinator();
        let url = coordinator.register(port_forward_session());
        let token = url.rsplit('/').next().expect("token").to_string();

        assert!(coordinator.claim(&token).is_ok());
        assert!(matches!(
            coordinator.claim(&token),
            Err(StreamingError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_claim_unknown_token_fails() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.claim("bogus"),
            Err(StreamingError::SessionNotFound { .. })
        ));
    }

    #[test]
    fn test_register_purges_expired_sessions() {
        let coordinator = coordinator();
        let _ = coordinator.register(port_forward_session());
        assert_eq!(coordinator.pending_count(), 1);
        // Forcibly expire everything.
        {
            let mut sessions =
                coordinator.sessions.lock().expect("sessions lock");
            for pending in sessions.values_mut() {
                pending.expires_at = Instant::now() - Duration::from_secs(1);
            }
        }
        let _ = coordinator.register(port_forward_session());
        assert_eq!(coordinator.pending_count(), 1);
    }
}
