/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Entity ids and kubelet-level names.

use proto::cri::{ContainerMetadata, PodSandboxMetadata};
use rand::RngCore;
use std::fmt::Write as _;

/// A fresh 64 hex character id, unique within the process and opaque to
/// everything outside it.
pub fn generate_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut id = String::with_capacity(64);
    for byte in bytes {
        let _ = write!(id, "{byte:02x}");
    }
    id
}

/// Collapse the sandbox metadata tuple into the unique human-level name.
pub fn make_sandbox_name(metadata: &PodSandboxMetadata) -> String {
    [
        metadata.name.as_str(),
        metadata.namespace.as_str(),
        metadata.uid.as_str(),
        &metadata.attempt.to_string(),
    ]
    .join("_")
}

/// Collapse container plus sandbox metadata into the unique container name.
pub fn make_container_name(
    metadata: &ContainerMetadata,
    sandbox_metadata: &PodSandboxMetadata,
) -> String {
    [
        metadata.name.as_str(),
        sandbox_metadata.name.as_str(),
        sandbox_metadata.namespace.as_str(),
        sandbox_metadata.uid.as_str(),
        &metadata.attempt.to_string(),
    ]
    .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_shape_and_uniqueness() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_sandbox_name_tuple() {
        let metadata = PodSandboxMetadata {
            name: "nginx".to_string(),
            uid: "uid-1".to_string(),
            namespace: "default".to_string(),
            attempt: 3,
        };
        assert_eq!(make_sandbox_name(&metadata), "nginx_default_uid-1_3");
    }

    #[test]
    fn test_container_name_includes_sandbox_tuple() {
        let sandbox = PodSandboxMetadata {
            name: "nginx".to_string(),
            uid: "uid-1".to_string(),
            namespace: "default".to_string(),
            attempt: 0,
        };
        let container = ContainerMetadata {
            name: "app".to_string(),
            attempt: 2,
        };
        assert_eq!(
            make_container_name(&container, &sandbox),
            "app_nginx_default_uid-1_2"
        );
    }
}
