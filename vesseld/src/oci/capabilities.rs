/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Capability set computation for container processes.

use super::{OciError, Result};
use oci_spec::runtime::Capability;
use std::collections::HashSet;

/// Default capability set granted to unprivileged containers.
const DEFAULT_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

/// Every capability the kernel knows, for `ALL` expansion and privileged
/// containers.
const ALL_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
];

fn normalize(name: &str) -> String {
    let upper = name.to_uppercase();
    if upper.starts_with("CAP_") {
        upper
    } else {
        format!("CAP_{upper}")
    }
}

fn parse(name: &str) -> Result<Capability> {
    serde_json::from_value(serde_json::Value::String(normalize(name)))
        .map_err(|_| OciError::UnknownCapability { name: name.to_string() })
}

/// Every known capability, for privileged containers.
pub fn all() -> HashSet<Capability> {
    ALL_CAPABILITIES
        .iter()
        .map(|name| parse(name).expect("known capability"))
        .collect()
}

/// Compute the effective capability set from the security context's add and
/// drop lists. `ALL` in either list expands to the full set first; the
/// individual entries are then applied on top.
pub fn compute(add: &[String], drop: &[String]) -> Result<HashSet<Capability>> {
    let has_all =
        |list: &[String]| list.iter().any(|c| c.eq_ignore_ascii_case("ALL"));

    let mut set: HashSet<Capability> = if has_all(add) || has_all(drop) {
        all()
    } else {
        DEFAULT_CAPABILITIES
            .iter()
            .map(|name| parse(name).expect("known capability"))
            .collect()
    };

    for name in add {
        if name.eq_ignore_ascii_case("ALL") {
            set.extend(all());
            continue;
        }
        let _ = set.insert(parse(name)?);
    }
    for name in drop {
        if name.eq_ignore_ascii_case("ALL") {
            set.clear();
            continue;
        }
        let _ = set.remove(&parse(name)?);
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_set_without_changes() {
        let set = compute(&[], &[]).expect("compute");
        assert_eq!(set.len(), DEFAULT_CAPABILITIES.len());
        assert!(set.contains(&parse("NET_RAW").expect("cap")));
        assert!(!set.contains(&parse("SYS_ADMIN").expect("cap")));
    }

    #[test]
    fn test_add_without_prefix() {
        let set =
            compute(&["SYS_ADMIN".to_string()], &[]).expect("compute");
        assert!(set.contains(&parse("CAP_SYS_ADMIN").expect("cap")));
    }

    #[test]
    fn test_all_expansion_then_drop() {
        let set = compute(
            &["ALL".to_string()],
            &["NET_RAW".to_string()],
        )
        .expect("compute");
        assert_eq!(set.len(), ALL_CAPABILITIES.len() - 1);
        assert!(!set.contains(&parse("NET_RAW").expect("cap")));
    }

    #[test]
    fn test_drop_all_then_add() {
        let set = compute(
            &["CHOWN".to_string()],
            &["ALL".to_string()],
        )
        .expect("compute");
        // Drops run after adds, so dropping ALL leaves nothing.
        assert!(set.is_empty());
    }

    #[test]
    fn test_unknown_capability_is_error() {
        assert!(matches!(
            compute(&["FLY".to_string()], &[]),
            Err(OciError::UnknownCapability { name }) if name == "FLY"
        ));
    }
}
