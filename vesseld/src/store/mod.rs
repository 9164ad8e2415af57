/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! In-memory catalogs of live entities.
//!
//! Stores are the single source of truth for naming and membership; the
//! engine is only consulted for runtime facts. Entities enter a store only
//! after their create path has fully succeeded, and `get`/`list` hand out
//! snapshot copies so readers never observe a half-applied mutation.

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub mod container;
pub mod image;
pub mod sandbox;
pub mod snapshot;

pub(crate) type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sandbox '{sandbox_id}' already exists")]
    SandboxExists { sandbox_id: String },
    #[error("sandbox '{sandbox_id}' not found")]
    SandboxNotFound { sandbox_id: String },
    #[error("container '{container_id}' already exists")]
    ContainerExists { container_id: String },
    #[error("container '{container_id}' not found")]
    ContainerNotFound { container_id: String },
    #[error("image '{image_id}' not found")]
    ImageNotFound { image_id: String },
    #[error("image '{image_id}' is leased")]
    ImageLeased { image_id: String },
    #[error("image '{image_id}' is not leasable")]
    ImageNotLeasable { image_id: String },
    #[error("image '{image_id}' is not leased")]
    ImageNotLeased { image_id: String },
}

/// Current wall-clock time in nanoseconds since the UNIX epoch, the unit the
/// CRI uses for every timestamp field.
pub(crate) fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}
