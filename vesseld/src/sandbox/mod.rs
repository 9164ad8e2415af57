/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Pod sandbox lifecycle.

use proto::cri::{NamespaceMode, PodSandboxConfig};

pub mod files;
mod remove;
mod run;
mod status;
mod stop;

/// Annotation marking a pod as untrusted; such pods must not request host
/// namespaces.
pub(crate) const UNTRUSTED_WORKLOAD_ANNOTATION: &str =
    "io.kubernetes.cri.untrusted-workload";

pub(crate) fn host_network(config: &PodSandboxConfig) -> bool {
    namespace_mode(config, |o| o.network) == NamespaceMode::Node
}

pub(crate) fn host_pid(config: &PodSandboxConfig) -> bool {
    namespace_mode(config, |o| o.pid) == NamespaceMode::Node
}

pub(crate) fn host_ipc(config: &PodSandboxConfig) -> bool {
    namespace_mode(config, |o| o.ipc) == NamespaceMode::Node
}

fn namespace_mode(
    config: &PodSandboxConfig,
    pick: fn(&proto::cri::NamespaceOption) -> i32,
) -> NamespaceMode {
    config
        .linux
        .as_ref()
        .and_then(|l| l.security_context.as_ref())
        .and_then(|sc| sc.namespace_options.as_ref())
        .map(pick)
        .and_then(|mode| NamespaceMode::try_from(mode).ok())
        .unwrap_or(NamespaceMode::Pod)
}
