/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Catalog of unpacked images, with deletion guarded by leases.

use super::{Result, StoreError};
use oci_spec::image::ImageConfiguration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// A refcount guarding an image against deletion while containers use it.
///
/// * A lease can be taken many times.
/// * An image with live leases cannot be set nonleasable.
/// * A nonleasable image cannot be leased.
#[derive(Debug, Default)]
pub struct Leases {
    inner: Mutex<LeasesInner>,
}

#[derive(Debug, Default)]
struct LeasesInner {
    count: usize,
    nonleasable: bool,
}

impl Leases {
    fn lease(&self, image_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("leases lock");
        if inner.nonleasable {
            return Err(StoreError::ImageNotLeasable {
                image_id: image_id.to_string(),
            });
        }
        inner.count += 1;
        Ok(())
    }

    fn unlease(&self, image_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("leases lock");
        if inner.count == 0 {
            return Err(StoreError::ImageNotLeased {
                image_id: image_id.to_string(),
            });
        }
        inner.count -= 1;
        Ok(())
    }

    fn set_nonleasable(&self, image_id: &str, nonleasable: bool) -> Result<()> {
        let mut inner = self.inner.lock().expect("leases lock");
        if nonleasable && inner.count > 0 {
            return Err(StoreError::ImageLeased {
                image_id: image_id.to_string(),
            });
        }
        inner.nonleasable = nonleasable;
        Ok(())
    }
}

/// An image that is present in the engine image store and whose layers are
/// unpacked in the configured snapshotter. Only such images enter this store.
#[derive(Clone, Debug)]
pub struct Image {
    /// Image id: the digest of the image config blob.
    pub id: String,
    /// Canonical hash of the unpacked layer chain.
    pub chain_id: String,
    /// Total unpacked size in bytes.
    pub size: i64,
    pub config: ImageConfiguration,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    /// Shared across snapshot copies so every holder sees the same count.
    leases: Arc<Leases>,
}

impl Image {
    pub fn new(
        id: String,
        chain_id: String,
        size: i64,
        config: ImageConfiguration,
    ) -> Self {
        Self {
            id,
            chain_id,
            size,
            config,
            repo_tags: vec![],
            repo_digests: vec![],
            leases: Arc::new(Leases::default()),
        }
    }
}

type Cache = HashMap<String, Arc<RwLock<Image>>>;

#[derive(Debug, Default)]
pub struct ImageStore {
    cache: RwLock<Cache>,
}

impl ImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add inserts the image, or merges `repo_tags`/`repo_digests` into the
    /// existing entry when the image id is already present. Concurrent pulls
    /// of the same image converge to one entry without duplicated tags.
    pub fn add(&self, image: Image) {
        let entry = {
            let mut cache = self.cache.write().expect("image store lock");
            Arc::clone(
                cache
                    .entry(image.id.clone())
                    .or_insert_with(|| Arc::new(RwLock::new(image.clone()))),
            )
        };
        let mut existing = entry.write().expect("image entry lock");
        for tag in image.repo_tags {
            if !existing.repo_tags.contains(&tag) {
                existing.repo_tags.push(tag);
            }
        }
        for digest in image.repo_digests {
            if !existing.repo_digests.contains(&digest) {
                existing.repo_digests.push(digest);
            }
        }
    }

    pub fn get(&self, image_id: &str) -> Result<Image> {
        let cache = self.cache.read().expect("image store lock");
        let Some(entry) = cache.get(image_id) else {
            return Err(StoreError::ImageNotFound {
                image_id: image_id.to_string(),
            });
        };
        let image = entry.read().expect("image entry lock").clone();
        Ok(image)
    }

    pub fn list(&self) -> Vec<Image> {
        let cache = self.cache.read().expect("image store lock");
        cache
            .values()
            .map(|entry| entry.read().expect("image entry lock").clone())
            .collect()
    }

    /// Update applies `f` under the per-entity lock.
    pub fn update<F>(&self, image_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Image),
    {
        let entry = {
            let cache = self.cache.read().expect("image store lock");
            let Some(entry) = cache.get(image_id) else {
                return Err(StoreError::ImageNotFound {
                    image_id: image_id.to_string(),
                });
            };
            Arc::clone(entry)
        };
        let mut image = entry.write().expect("image entry lock");
        f(&mut image);
        Ok(())
    }

    pub fn delete(&self, image_id: &str) {
        let mut cache = self.cache.write().expect("image store lock");
        let _ = cache.remove(image_id);
    }

    /// Resolve a user reference to an image: exact id match first, then tag,
    /// then digest. `None` means absent, which is distinct from an error.
    pub fn resolve(&self, reference: &str) -> Option<Image> {
        let cache = self.cache.read().expect("image store lock");
        if let Some(entry) = cache.get(reference) {
            return Some(entry.read().expect("image entry lock").clone());
        }
        for entry in cache.values() {
            let image = entry.read().expect("image entry lock");
            if image.repo_tags.iter().any(|t| t == reference) {
                return Some(image.clone());
            }
        }
        for entry in cache.values() {
            let image = entry.read().expect("image entry lock");
            if image.repo_digests.iter().any(|d| d == reference) {
                return Some(image.clone());
            }
        }
        None
    }

    /// Take a lease on the image, failing when it is being removed.
    pub fn lease(&self, image_id: &str) -> Result<()> {
        self.with_leases(image_id, |leases| leases.lease(image_id))
    }

    /// Drop a lease on the image.
    pub fn unlease(&self, image_id: &str) -> Result<()> {
        self.with_leases(image_id, |leases| leases.unlease(image_id))
    }

    /// Mark the image nonleasable ahead of removal. Fails when leased.
    pub fn set_nonleasable(&self, image_id: &str, nonleasable: bool) -> Result<()> {
        self.with_leases(image_id, |leases| {
            leases.set_nonleasable(image_id, nonleasable)
        })
    }

    fn with_leases<F>(&self, image_id: &str, f: F) -> Result<()>
    where
        F: FnOnce(&Leases) -> Result<()>,
    {
        let entry = {
            let cache = self.cache.read().expect("image store lock");
            let Some(entry) = cache.get(image_id) else {
                return Err(StoreError::ImageNotFound {
                    image_id: image_id.to_string(),
                });
            };
            Arc::clone(entry)
        };
        let image = entry.read().expect("image entry lock");
        f(&image.leases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_for_tests(id: &str, tag: &str) -> Image {
        let mut image = Image::new(
            id.to_string(),
            format!("{id}-chain"),
            1024,
            ImageConfiguration::default(),
        );
        image.repo_tags = vec![tag.to_string()];
        image
    }

    #[test]
    fn test_add_merges_tags_without_duplicates() {
        let store = ImageStore::new();
        store.add(image_for_tests("sha256:abc", "docker.io/library/busybox:latest"));
        store.add(image_for_tests("sha256:abc", "docker.io/library/busybox:latest"));
        store.add(image_for_tests("sha256:abc", "docker.io/library/busybox:1.36"));

        let image = store.get("sha256:abc").expect("get");
        assert_eq!(
            image.repo_tags,
            vec![
                "docker.io/library/busybox:latest".to_string(),
                "docker.io/library/busybox:1.36".to_string(),
            ]
        );
    }

    #[test]
    fn test_resolve_by_id_tag_digest() {
        let store = ImageStore::new();
        let mut image = image_for_tests("sha256:abc", "docker.io/library/busybox:latest");
        image.repo_digests =
            vec!["docker.io/library/busybox@sha256:feed".to_string()];
        store.add(image);

        assert!(store.resolve("sha256:abc").is_some());
        assert!(store.resolve("docker.io/library/busybox:latest").is_some());
        assert!(store
            .resolve("docker.io/library/busybox@sha256:feed")
            .is_some());
        assert!(store.resolve("docker.io/library/nginx:latest").is_none());
    }

    #[test]
    fn test_lease_blocks_nonleasable() {
        let store = ImageStore::new();
        store.add(image_for_tests("sha256:abc", "busybox:latest"));

        store.lease("sha256:abc").expect("lease");
        assert!(matches!(
            store.set_nonleasable("sha256:abc", true),
            Err(StoreError::ImageLeased { .. })
        ));

        store.unlease("sha256:abc").expect("unlease");
        store.set_nonleasable("sha256:abc", true).expect("nonleasable");
        assert!(matches!(
            store.lease("sha256:abc"),
            Err(StoreError::ImageNotLeasable { .. })
        ));
    }

    #[test]
    fn test_unlease_without_lease_is_error() {
        let store = ImageStore::new();
        store.add(image_for_tests("sha256:abc", "busybox:latest"));
        assert!(matches!(
            store.unlease("sha256:abc"),
            Err(StoreError::ImageNotLeased { .. })
        ));
    }

    #[test]
    fn test_leases_shared_across_snapshots() {
        let store = ImageStore::new();
        store.add(image_for_tests("sha256:abc", "busybox:latest"));

        // A snapshot copy taken before the lease still guards deletion,
        // because the lease state is shared.
        let _snapshot = store.get("sha256:abc").expect("get");
        store.lease("sha256:abc").expect("lease");
        assert!(store.set_nonleasable("sha256:abc", true).is_err());
    }

    #[test]
    fn test_exactly_one_of_lease_and_remove_wins() {
        use std::sync::Arc;

        for _ in 0..16 {
            let store = Arc::new(ImageStore::new());
            store.add(image_for_tests("sha256:abc", "busybox:latest"));

            let lease_store = Arc::clone(&store);
            let leaser = std::thread::spawn(move || {
                lease_store.lease("sha256:abc").is_ok()
            });
            let remove_store = Arc::clone(&store);
            let remover = std::thread::spawn(move || {
                remove_store.set_nonleasable("sha256:abc", true).is_ok()
            });

            let leased = leaser.join().expect("leaser");
            let removed = remover.join().expect("remover");
            assert!(
                leased ^ removed,
                "exactly one of lease/remove must win, got lease={leased} remove={removed}"
            );
        }
    }
}
