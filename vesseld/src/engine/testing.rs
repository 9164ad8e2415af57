/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! In-memory [`Engine`] used by unit and integration tests.
//!
//! The fake models just enough engine behavior to drive the lifecycle
//! paths: images with real manifest/config content blobs, snapshots with
//! usage numbers, tasks that exit when killed and publish exit events, and
//! exec processes with scripted output.

use super::{
    Descriptor, Engine, EngineContainer, EngineError, EngineEvent, EngineImage,
    ExitStatus, Mount, NewEngineContainer, Result, SnapshotUsage, TaskIo,
    TaskMetrics, TaskState, TaskStatus,
};
use crate::store::unix_nanos;
use async_trait::async_trait;
use sha2::{Digest as _, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

const SIGKILL: u32 = 9;

/// Scripted behavior for exec processes launched in the fake.
#[derive(Clone, Debug)]
pub struct ExecScript {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: u32,
    pub delay: Duration,
}

impl Default for ExecScript {
    fn default() -> Self {
        Self {
            stdout: b"ok\n".to_vec(),
            stderr: vec![],
            exit_code: 0,
            delay: Duration::from_millis(0),
        }
    }
}

#[derive(Clone, Debug)]
struct FakeTask {
    pid: u32,
    state: TaskState,
    exit_status: u32,
    exited_at: i64,
}

#[derive(Clone, Debug)]
struct FakeExec {
    pid: u32,
    running: bool,
    exit_status: u32,
    exited_at: i64,
    io: TaskIo,
}

#[derive(Default)]
struct State {
    images: HashMap<String, EngineImage>,
    content: HashMap<String, Vec<u8>>,
    image_configs: HashMap<String, serde_json::Value>,
    snapshots: HashMap<String, SnapshotUsage>,
    containers: HashMap<String, NewEngineContainer>,
    tasks: HashMap<String, FakeTask>,
    execs: HashMap<(String, String), FakeExec>,
    exec_scripts: HashMap<String, ExecScript>,
    subscribers: Vec<mpsc::Sender<EngineEvent>>,
    failures: HashSet<(String, String)>,
}

pub struct FakeEngine {
    state: Arc<Mutex<State>>,
    next_pid: AtomicU32,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            next_pid: AtomicU32::new(1000),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake engine lock")
    }

    fn alloc_pid(&self) -> u32 {
        self.next_pid.fetch_add(1, Ordering::SeqCst)
    }

    /// Make the named operation fail once for the given resource.
    pub fn inject_failure(&self, op: &str, resource: &str) {
        let _ = self
            .lock()
            .failures
            .insert((op.to_string(), resource.to_string()));
    }

    fn take_failure(&self, op: &str, resource: &str) -> Result<()> {
        if self
            .lock()
            .failures
            .remove(&(op.to_string(), resource.to_string()))
        {
            return Err(EngineError::Failed {
                message: format!("injected failure: {op} {resource}"),
            });
        }
        Ok(())
    }

    /// Override the image config the next pull of `reference` will produce.
    pub fn set_image_config(&self, reference: &str, config: serde_json::Value) {
        let _ = self
            .lock()
            .image_configs
            .insert(reference.to_string(), config);
    }

    /// Script the output of exec processes in `container_id`.
    pub fn set_exec_script(&self, container_id: &str, script: ExecScript) {
        let _ = self
            .lock()
            .exec_scripts
            .insert(container_id.to_string(), script);
    }

    pub fn task_exists(&self, id: &str) -> bool {
        self.lock().tasks.contains_key(id)
    }

    pub fn snapshot_exists(&self, key: &str) -> bool {
        self.lock().snapshots.contains_key(key)
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn container_spec_json(&self, id: &str) -> Option<Vec<u8>> {
        self.lock().containers.get(id).map(|c| c.spec_json.clone())
    }

    /// Terminate a running task out of band, as if the process died, and
    /// publish the exit event.
    pub async fn exit_task(&self, id: &str, exit_status: u32) {
        let event = {
            let mut state = self.lock();
            let Some(task) = state.tasks.get_mut(id) else { return };
            if task.state == TaskState::Stopped {
                return;
            }
            task.state = TaskState::Stopped;
            task.exit_status = exit_status;
            task.exited_at = unix_nanos();
            EngineEvent::TaskExit {
                container_id: id.to_string(),
                id: id.to_string(),
                pid: task.pid,
                exit_status,
                exited_at: task.exited_at,
            }
        };
        self.publish(event).await;
    }

    /// Publish a task OOM event for `id`.
    pub async fn oom_task(&self, id: &str) {
        self.publish(EngineEvent::TaskOom { container_id: id.to_string() })
            .await;
    }

    /// Drop all event subscribers, simulating an engine connection loss.
    pub fn disconnect_events(&self) {
        self.lock().subscribers.clear();
    }

    async fn publish(&self, event: EngineEvent) {
        let subscribers = self.lock().subscribers.clone();
        for tx in subscribers {
            let _ = tx.send(event.clone()).await;
        }
    }

    fn digest_of(data: &[u8]) -> String {
        format!("sha256:{:x}", Sha256::digest(data))
    }

    fn default_image_config(reference: &str) -> serde_json::Value {
        serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {
                "Env": ["PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"],
                "Entrypoint": ["/entry"],
                "Cmd": ["serve"],
                "WorkingDir": "/",
            },
            "rootfs": {
                "type": "layers",
                "diff_ids": [Self::digest_of(reference.as_bytes())],
            },
        })
    }

    // Open a FIFO writer without blocking forever when no reader ever
    // attaches; gives up after `timeout`.
    fn open_fifo_writer(
        path: &str,
        timeout: Duration,
    ) -> std::io::Result<Option<std::fs::File>> {
        use std::os::unix::fs::OpenOptionsExt;
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(path)
            {
                Ok(f) => return Ok(Some(f)),
                Err(e) if e.raw_os_error() == Some(nix::libc::ENXIO) => {
                    if std::time::Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Write scripted exec output to the FIFO endpoints, then mark the exec
    // process exited.
    fn run_exec_script(
        state: Arc<Mutex<State>>,
        key: (String, String),
        io: TaskIo,
        script: ExecScript,
    ) {
        let _ = tokio::spawn(async move {
            tokio::time::sleep(script.delay).await;
            let stdout = io.stdout.clone();
            let stderr = io.stderr.clone();
            let stdout_bytes = script.stdout.clone();
            let stderr_bytes = script.stderr.clone();
            let write_result = tokio::task::spawn_blocking(move || {
                use std::io::Write;
                if !stdout.is_empty() && !stdout_bytes.is_empty() {
                    if let Some(mut f) = Self::open_fifo_writer(
                        &stdout,
                        Duration::from_secs(5),
                    )? {
                        f.write_all(&stdout_bytes)?;
                    }
                }
                if !stderr.is_empty() && !stderr_bytes.is_empty() {
                    if let Some(mut f) = Self::open_fifo_writer(
                        &stderr,
                        Duration::from_secs(5),
                    )? {
                        f.write_all(&stderr_bytes)?;
                    }
                }
                Ok::<_, std::io::Error>(())
            })
            .await;
            if let Ok(Err(e)) = write_result {
                tracing::warn!("fake exec io write failed: {e}");
            }

            let mut state = state.lock().expect("fake engine lock");
            if let Some(exec) = state.execs.get_mut(&key) {
                // A kill may have landed first; keep its exit status.
                if exec.running {
                    exec.running = false;
                    exec.exit_status = script.exit_code;
                    exec.exited_at = unix_nanos();
                }
            }
        });
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn version(&self) -> Result<String> {
        Ok("1.7.0-fake".to_string())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        self.take_failure("pull_image", reference)?;
        let mut state = self.lock();

        let config_json = state
            .image_configs
            .get(reference)
            .cloned()
            .unwrap_or_else(|| Self::default_image_config(reference));
        let config_bytes =
            serde_json::to_vec(&config_json).expect("fake image config");
        let config_digest = Self::digest_of(&config_bytes);

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config_bytes.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": Self::digest_of(format!("{reference}-layer").as_bytes()),
                "size": 1024,
            }],
        });
        let manifest_bytes =
            serde_json::to_vec(&manifest).expect("fake image manifest");
        let manifest_digest = Self::digest_of(&manifest_bytes);

        let _ = state.content.insert(config_digest, config_bytes);
        let _ = state
            .content
            .insert(manifest_digest.clone(), manifest_bytes.clone());
        let _ = state.images.insert(
            reference.to_string(),
            EngineImage {
                name: reference.to_string(),
                target: Descriptor {
                    media_type: "application/vnd.oci.image.manifest.v1+json"
                        .to_string(),
                    digest: manifest_digest,
                    size: manifest_bytes.len() as i64,
                },
            },
        );
        Ok(())
    }

    async fn get_image(&self, name: &str) -> Result<Option<EngineImage>> {
        Ok(self.lock().images.get(name).cloned())
    }

    async fn create_image(&self, name: &str, target: &Descriptor) -> Result<()> {
        let mut state = self.lock();
        let _ = state.images.insert(
            name.to_string(),
            EngineImage { name: name.to_string(), target: target.clone() },
        );
        Ok(())
    }

    async fn delete_image(&self, name: &str, _sync: bool) -> Result<()> {
        let mut state = self.lock();
        if state.images.remove(name).is_none() {
            return Err(EngineError::NotFound { resource: name.to_string() });
        }
        Ok(())
    }

    async fn read_content(&self, digest: &str) -> Result<Vec<u8>> {
        self.lock().content.get(digest).cloned().ok_or_else(|| {
            EngineError::NotFound { resource: digest.to_string() }
        })
    }

    async fn prepare_snapshot(&self, key: &str, _parent: &str) -> Result<Vec<Mount>> {
        self.take_failure("prepare_snapshot", key)?;
        let mut state = self.lock();
        if state.snapshots.contains_key(key) {
            return Err(EngineError::AlreadyExists {
                resource: key.to_string(),
            });
        }
        let _ = state.snapshots.insert(
            key.to_string(),
            SnapshotUsage { key: key.to_string(), size: 4096, inodes: 16 },
        );
        Ok(vec![Mount {
            mount_type: "overlay".to_string(),
            source: "overlay".to_string(),
            target: String::new(),
            options: vec![format!("upperdir=/fake/{key}/fs")],
        }])
    }

    async fn view_snapshot(&self, key: &str, parent: &str) -> Result<Vec<Mount>> {
        self.take_failure("view_snapshot", key)?;
        self.prepare_snapshot(key, parent).await
    }

    async fn remove_snapshot(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        if state.snapshots.remove(key).is_none() {
            return Err(EngineError::NotFound { resource: key.to_string() });
        }
        Ok(())
    }

    async fn snapshot_mounts(&self, key: &str) -> Result<Vec<Mount>> {
        let state = self.lock();
        if !state.snapshots.contains_key(key) {
            return Err(EngineError::NotFound { resource: key.to_string() });
        }
        Ok(vec![Mount {
            mount_type: "overlay".to_string(),
            source: "overlay".to_string(),
            target: String::new(),
            options: vec![format!("upperdir=/fake/{key}/fs")],
        }])
    }

    async fn list_snapshot_usage(&self) -> Result<Vec<SnapshotUsage>> {
        Ok(self.lock().snapshots.values().cloned().collect())
    }

    async fn create_container(&self, container: NewEngineContainer) -> Result<()> {
        self.take_failure("create_container", &container.id)?;
        let mut state = self.lock();
        if state.containers.contains_key(&container.id) {
            return Err(EngineError::AlreadyExists { resource: container.id });
        }
        let _ = state.containers.insert(container.id.clone(), container);
        Ok(())
    }

    async fn update_container_spec(&self, id: &str, spec_json: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        let Some(container) = state.containers.get_mut(id) else {
            return Err(EngineError::NotFound { resource: id.to_string() });
        };
        container.spec_json = spec_json;
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<EngineContainer>> {
        Ok(self
            .lock()
            .containers
            .values()
            .map(|c| EngineContainer { id: c.id.clone(), labels: c.labels.clone() })
            .collect())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.containers.remove(id).is_none() {
            return Err(EngineError::NotFound { resource: id.to_string() });
        }
        Ok(())
    }

    async fn create_task(&self, id: &str, _rootfs: &[Mount], _io: &TaskIo) -> Result<u32> {
        self.take_failure("create_task", id)?;
        let pid = self.alloc_pid();
        let mut state = self.lock();
        if state.tasks.contains_key(id) {
            return Err(EngineError::AlreadyExists { resource: id.to_string() });
        }
        let _ = state.tasks.insert(
            id.to_string(),
            FakeTask { pid, state: TaskState::Created, exit_status: 0, exited_at: 0 },
        );
        Ok(pid)
    }

    async fn start_task(&self, id: &str) -> Result<()> {
        self.take_failure("start_task", id)?;
        let mut state = self.lock();
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(EngineError::NotFound { resource: id.to_string() });
        };
        task.state = TaskState::Running;
        Ok(())
    }

    async fn kill_task(&self, id: &str, signal: u32, _all: bool) -> Result<()> {
        self.take_failure("kill_task", id)?;
        {
            let state = self.lock();
            let Some(task) = state.tasks.get(id) else {
                return Err(EngineError::NotFound { resource: id.to_string() });
            };
            if task.state == TaskState::Stopped {
                return Err(EngineError::Rejected {
                    message: "process already finished".to_string(),
                });
            }
        }
        // Any signal terminates the fake process; exit code mirrors the
        // usual 128+signal convention.
        let code = if signal == SIGKILL { 137 } else { 128 + signal };
        self.exit_task(id, code).await;
        Ok(())
    }

    async fn delete_task(&self, id: &str) -> Result<ExitStatus> {
        let mut state = self.lock();
        let Some(task) = state.tasks.remove(id) else {
            return Err(EngineError::NotFound { resource: id.to_string() });
        };
        Ok(ExitStatus { exit_status: task.exit_status, exited_at: task.exited_at })
    }

    async fn get_task(&self, id: &str) -> Result<TaskStatus> {
        let state = self.lock();
        let Some(task) = state.tasks.get(id) else {
            return Err(EngineError::NotFound { resource: id.to_string() });
        };
        Ok(TaskStatus {
            state: task.state,
            pid: task.pid,
            exit_status: task.exit_status,
            exited_at: task.exited_at,
        })
    }

    async fn update_task_resources(&self, id: &str, _resources_json: Vec<u8>) -> Result<()> {
        let state = self.lock();
        if !state.tasks.contains_key(id) {
            return Err(EngineError::NotFound { resource: id.to_string() });
        }
        Ok(())
    }

    async fn task_metrics(&self, ids: &[String]) -> Result<Vec<TaskMetrics>> {
        let state = self.lock();
        Ok(ids
            .iter()
            .filter(|id| state.tasks.contains_key(*id))
            .map(|id| TaskMetrics {
                id: id.clone(),
                timestamp: unix_nanos(),
                cpu_usage_core_nanos: 1_000_000,
                memory_working_set_bytes: 8 << 20,
            })
            .collect())
    }

    async fn create_exec(
        &self,
        container_id: &str,
        exec_id: &str,
        _process_spec_json: Vec<u8>,
        io: &TaskIo,
    ) -> Result<()> {
        let mut state = self.lock();
        if !state.tasks.contains_key(container_id) {
            return Err(EngineError::NotFound {
                resource: container_id.to_string(),
            });
        }
        let _ = state.execs.insert(
            (container_id.to_string(), exec_id.to_string()),
            FakeExec {
                pid: 0,
                running: false,
                exit_status: 0,
                exited_at: 0,
                io: io.clone(),
            },
        );
        Ok(())
    }

    async fn start_exec(&self, container_id: &str, exec_id: &str) -> Result<u32> {
        let key = (container_id.to_string(), exec_id.to_string());
        let pid = self.alloc_pid();
        let (script, io) = {
            let mut state = self.lock();
            let script = state
                .exec_scripts
                .get(container_id)
                .cloned()
                .unwrap_or_default();
            let Some(exec) = state.execs.get_mut(&key) else {
                return Err(EngineError::NotFound {
                    resource: exec_id.to_string(),
                });
            };
            exec.pid = pid;
            exec.running = true;
            (script, exec.io.clone())
        };
        Self::run_exec_script(Arc::clone(&self.state), key, io, script);
        Ok(pid)
    }

    async fn kill_exec(&self, container_id: &str, exec_id: &str, _signal: u32) -> Result<()> {
        let mut state = self.lock();
        let key = (container_id.to_string(), exec_id.to_string());
        let Some(exec) = state.execs.get_mut(&key) else {
            return Err(EngineError::NotFound { resource: exec_id.to_string() });
        };
        exec.running = false;
        exec.exit_status = 137;
        exec.exited_at = unix_nanos();
        Ok(())
    }

    async fn wait_exec(&self, container_id: &str, exec_id: &str) -> Result<ExitStatus> {
        loop {
            {
                let state = self.lock();
                let key = (container_id.to_string(), exec_id.to_string());
                let Some(exec) = state.execs.get(&key) else {
                    return Err(EngineError::NotFound {
                        resource: exec_id.to_string(),
                    });
                };
                if !exec.running && exec.pid != 0 {
                    return Ok(ExitStatus {
                        exit_status: exec.exit_status,
                        exited_at: exec.exited_at,
                    });
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn delete_exec(&self, container_id: &str, exec_id: &str) -> Result<()> {
        let mut state = self.lock();
        let key = (container_id.to_string(), exec_id.to_string());
        if state.execs.remove(&key).is_none() {
            return Err(EngineError::NotFound { resource: exec_id.to_string() });
        }
        Ok(())
    }

    async fn subscribe_events(&self) -> Result<mpsc::Receiver<EngineEvent>> {
        let (tx, rx) = mpsc::channel(128);
        self.lock().subscribers.push(tx);
        Ok(rx)
    }
}
