/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! The CRI core.
//!
//! [`CriService`] owns the stores, the registrars and the seams to the
//! engine, CNI and streaming coordinator. The gRPC surfaces in
//! [`runtime_service`] and [`image_service`] are thin wrappers that gate on
//! initialization and convert error kinds; every piece of lifecycle logic
//! lives in the manager modules which attach further methods to this type.

use crate::cni::Cni;
use crate::config::Config;
use crate::engine::Engine;
use crate::registrar::Registrar;
use crate::store::container::ContainerStore;
use crate::store::image::ImageStore;
use crate::store::sandbox::SandboxStore;
use crate::store::snapshot::SnapshotStore;
use crate::streaming::Coordinator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

pub mod error;
pub mod image_service;
pub mod runtime_service;

pub use error::{CriError, Result};

/// Label on engine containers carrying the serialized sandbox metadata.
pub const SANDBOX_METADATA_LABEL: &str = "io.vessel.cri/sandbox-metadata";
/// Label on engine containers carrying the serialized container metadata.
pub const CONTAINER_METADATA_LABEL: &str = "io.vessel.cri/container-metadata";

/// API version reported by `Version`.
pub const API_VERSION: &str = "v1";
/// The daemon's own version string.
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const RUNTIME_NAME: &str = "vessel";

pub struct CriService {
    pub(crate) config: Config,
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) cni: Arc<Cni>,
    pub(crate) streaming: Coordinator,
    pub(crate) sandbox_store: SandboxStore,
    pub(crate) container_store: ContainerStore,
    pub(crate) image_store: ImageStore,
    pub(crate) snapshot_store: SnapshotStore,
    pub(crate) sandbox_names: Registrar,
    pub(crate) container_names: Registrar,
    pub(crate) pull_permits: Semaphore,
    initialized: AtomicBool,
}

impl CriService {
    /// Assemble the core from its concrete collaborators. Nothing is
    /// served until [`CriService::set_initialized`] after recovery.
    pub fn new(config: Config, engine: Arc<dyn Engine>, cni: Arc<Cni>) -> Self {
        let streaming = Coordinator::new(
            Arc::clone(&engine),
            &config,
        );
        let max_pulls = config.max_concurrent_pulls.max(1);
        Self {
            config,
            engine,
            cni,
            streaming,
            sandbox_store: SandboxStore::new(),
            container_store: ContainerStore::new(),
            image_store: ImageStore::new(),
            snapshot_store: SnapshotStore::new(),
            sandbox_names: Registrar::new(),
            container_names: Registrar::new(),
            pull_permits: Semaphore::new(max_pulls),
            initialized: AtomicBool::new(false),
        }
    }

    /// Flip the service into serving mode once recovery has finished.
    pub fn set_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn require_initialized(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(CriError::NotInitialized);
        }
        Ok(())
    }
}
