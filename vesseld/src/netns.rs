/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Named network namespaces.
//!
//! A sandbox's network namespace is created up front and bind-mounted under
//! the netns run directory, so it outlives the pause task and CNI teardown
//! still has something to address after a pause crash.

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Run directory for named network namespaces, shared with iproute2.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

pub(crate) type Result<T> = std::result::Result<T, NetNsError>;

#[derive(Debug, Error)]
pub enum NetNsError {
    #[error("failed to create netns file '{path}': {source}")]
    Create { path: String, source: io::Error },
    #[error("failed to unshare network namespace: {0}")]
    Unshare(nix::Error),
    #[error("failed to bind mount netns at '{path}': {source}")]
    Mount { path: String, source: nix::Error },
    #[error("failed to remove netns '{path}': {source}")]
    Remove { path: String, source: io::Error },
}

/// Create a fresh network namespace named `id` and pin it with a bind
/// mount. Returns the namespace path to hand to the OCI spec and CNI.
pub fn create(run_dir: &Path, id: &str) -> Result<PathBuf> {
    let ns_path = run_dir.join(id);
    fs::create_dir_all(run_dir).map_err(|source| NetNsError::Create {
        path: run_dir.display().to_string(),
        source,
    })?;
    let _ = fs::File::create(&ns_path).map_err(|source| NetNsError::Create {
        path: ns_path.display().to_string(),
        source,
    })?;

    // A scratch thread unshares its network namespace and pins it onto the
    // mount point; the namespace survives the thread through the mount.
    let mount_path = ns_path.clone();
    let handle = std::thread::spawn(move || -> Result<()> {
        unshare(CloneFlags::CLONE_NEWNET).map_err(NetNsError::Unshare)?;
        let src = PathBuf::from("/proc/thread-self/ns/net");
        mount(
            Some(src.as_path()),
            mount_path.as_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|source| NetNsError::Mount {
            path: mount_path.display().to_string(),
            source,
        })
    });

    match handle.join() {
        Ok(Ok(())) => Ok(ns_path),
        Ok(Err(e)) => {
            let _ = fs::remove_file(&ns_path);
            Err(e)
        }
        Err(_) => {
            let _ = fs::remove_file(&ns_path);
            Err(NetNsError::Unshare(nix::Error::EIO))
        }
    }
}

/// Unpin and delete the namespace. Idempotent: a missing path is success.
pub fn remove(ns_path: &Path) -> Result<()> {
    if !ns_path.exists() {
        return Ok(());
    }
    match umount2(ns_path, MntFlags::MNT_DETACH) {
        Ok(()) => {}
        // Not mounted (already detached) or already gone.
        Err(nix::Error::EINVAL) | Err(nix::Error::ENOENT) => {}
        Err(e) => {
            return Err(NetNsError::Remove {
                path: ns_path.display().to_string(),
                source: io::Error::other(e),
            })
        }
    }
    match fs::remove_file(ns_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(NetNsError::Remove {
            path: ns_path.display().to_string(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        remove(&dir.path().join("missing")).expect("idempotent remove");
    }

    // Ignored: requires CAP_SYS_ADMIN, which we don't have in CI.
    #[ignore]
    #[test]
    fn test_create_and_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ns_path = create(dir.path(), "netns-test").expect("create");
        assert!(ns_path.exists());
        remove(&ns_path).expect("remove");
        assert!(!ns_path.exists());
    }
}
