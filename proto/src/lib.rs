/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Generated Kubernetes CRI definitions served by vesseld.
//!
//! Built from the vendored `runtime.v1` proto subset; field numbers track
//! the upstream cri-api so the daemon stays wire compatible with the
//! kubelet.

#![allow(clippy::derive_partial_eq_without_eq)]

pub mod cri {
    tonic::include_proto!("runtime.v1");
}
