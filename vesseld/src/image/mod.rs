/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Image management: pull, list, status, remove, filesystem info.
//!
//! An image is visible to callers only once it is present in the engine
//! image store and unpacked in the configured snapshotter; the engine's
//! transfer service guarantees both before the pull returns.

use crate::cri::{CriError, CriService, Result};
use crate::engine::{Descriptor, EngineImage};
use crate::store::image::Image;
use crate::store::unix_nanos;
use oci_spec::image::ImageConfiguration;
use proto::cri::{
    FilesystemIdentifier, FilesystemUsage, ImageSpec, Int64Value, UInt64Value,
};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::{debug, info};

pub mod refs;

use refs::ImageReference;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid image reference '{reference}': {message}")]
    BadReference { reference: String, message: String },
    #[error("malformed image metadata for '{reference}': {message}")]
    Malformed { reference: String, message: String },
}

/// Everything derived from the engine-side image content.
struct ResolvedImage {
    image_id: String,
    chain_id: String,
    size: i64,
    config: ImageConfiguration,
    manifest_digest: String,
}

impl CriService {
    /// Resolve a reference against the local image store, or pull it when
    /// absent. Used by sandbox run for the pause image.
    pub(crate) async fn ensure_image(&self, reference: &str) -> Result<Image> {
        if let Some(image) = self.image_store.resolve(reference) {
            return Ok(image);
        }
        let image_id = self.pull_image(reference).await?;
        Ok(self.image_store.get(&image_id)?)
    }

    /// Pull and unpack an image; returns its image id. Concurrent pulls of
    /// the same image converge to one store entry.
    pub(crate) async fn pull_image(&self, reference: &str) -> Result<String> {
        let parsed = ImageReference::parse(reference)?;
        let pull_ref = parsed.pull_name();

        let _permit = self
            .pull_permits
            .acquire()
            .await
            .map_err(|_| CriError::internal("pull semaphore closed"))?;

        info!("pulling image '{pull_ref}'");
        self.engine.pull_image(&pull_ref).await?;

        let engine_image = self
            .engine
            .get_image(&pull_ref)
            .await?
            .ok_or_else(|| CriError::internal(format!(
                "image '{pull_ref}' vanished after pull"
            )))?;
        let resolved = self.resolve_image_metadata(&engine_image).await?;

        // Register the canonical digest reference and the image id in the
        // engine store, so both survive tag moves and removal can
        // enumerate them.
        let repo_digest = parsed.digest_name(&resolved.manifest_digest);
        let target = Descriptor {
            media_type: engine_image.target.media_type.clone(),
            digest: resolved.manifest_digest.clone(),
            size: engine_image.target.size,
        };
        self.engine.create_image(&repo_digest, &target).await?;
        self.engine.create_image(&resolved.image_id, &target).await?;

        let mut image = Image::new(
            resolved.image_id.clone(),
            resolved.chain_id,
            resolved.size,
            resolved.config,
        );
        if let Some(tag) = parsed.tagged_name() {
            image.repo_tags.push(tag);
        }
        image.repo_digests.push(repo_digest);
        self.image_store.add(image);

        debug!("pulled image '{pull_ref}' as '{}'", resolved.image_id);
        Ok(resolved.image_id)
    }

    /// Remove an image and all its engine references. Absent images are
    /// success; leased images fail and the caller must stop using them
    /// first.
    pub(crate) async fn remove_image(&self, reference: &str) -> Result<()> {
        let Some(image) = self.image_store.resolve(reference) else {
            return Ok(());
        };
        let image_id = image.id.clone();
        self.image_store.set_nonleasable(&image_id, true)?;

        // A tag may have been repointed by a later pull under another
        // image id; such tags are abandoned, not deleted.
        let known_digests: Vec<String> = image
            .repo_digests
            .iter()
            .filter_map(|d| d.split_once('@').map(|(_, digest)| digest.to_string()))
            .collect();
        let mut owned_refs: Vec<String> = Vec::new();
        for tag in &image.repo_tags {
            match self.engine.get_image(tag).await? {
                Some(engine_image)
                    if known_digests.contains(&engine_image.target.digest) =>
                {
                    owned_refs.push(tag.clone());
                }
                Some(_) => {
                    info!("tag '{tag}' has moved; leaving it in place");
                    let _ = self.image_store.update(&image_id, |image| {
                        image.repo_tags.retain(|t| t != tag);
                    });
                }
                None => {}
            }
        }
        owned_refs.extend(image.repo_digests.iter().cloned());

        for name in owned_refs {
            match self.engine.delete_image(&name, false).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        // The id reference goes last, synchronously, so layer garbage
        // collection has completed when we drop the entry.
        match self.engine.delete_image(&image_id, true).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.image_store.delete(&image_id);
        info!("removed image '{image_id}'");
        Ok(())
    }

    pub(crate) fn list_images(&self, filter: Option<&ImageSpec>) -> Vec<proto::cri::Image> {
        let wanted = filter.map(|spec| spec.image.as_str()).filter(|s| !s.is_empty());
        self.image_store
            .list()
            .into_iter()
            .filter(|image| match wanted {
                Some(reference) => {
                    image.id == reference
                        || image.repo_tags.iter().any(|t| t == reference)
                        || image.repo_digests.iter().any(|d| d == reference)
                }
                None => true,
            })
            .map(|image| to_cri_image(&image))
            .collect()
    }

    pub(crate) fn image_status(&self, reference: &str) -> Option<proto::cri::Image> {
        self.image_store.resolve(reference).map(|image| to_cri_image(&image))
    }

    /// Report the snapshotter root as the image filesystem, with usage
    /// aggregated from the snapshot stats sweep.
    pub(crate) fn image_fs_info(&self) -> FilesystemUsage {
        let mut used_bytes = 0u64;
        let mut inodes_used = 0u64;
        let mut timestamp = unix_nanos();
        for (_, stats) in self.snapshot_store.list() {
            used_bytes += stats.size;
            inodes_used += stats.inodes_used;
            timestamp = timestamp.max(stats.timestamp);
        }
        FilesystemUsage {
            timestamp,
            fs_id: Some(FilesystemIdentifier {
                mountpoint: self.config.image_fs_path().display().to_string(),
            }),
            used_bytes: Some(UInt64Value { value: used_bytes }),
            inodes_used: Some(UInt64Value { value: inodes_used }),
        }
    }

    /// Walk manifest and config blobs to derive the image identity.
    async fn resolve_image_metadata(
        &self,
        engine_image: &EngineImage,
    ) -> Result<ResolvedImage> {
        let reference = engine_image.name.clone();
        let malformed = |message: String| ImageError::Malformed {
            reference: reference.clone(),
            message,
        };

        let mut manifest_digest = engine_image.target.digest.clone();
        let mut manifest: serde_json::Value = serde_json::from_slice(
            &self.engine.read_content(&manifest_digest).await?,
        )
        .map_err(|e| malformed(format!("manifest: {e}")))?;

        // A multi-platform index points at per-platform manifests; pick
        // the one for this host.
        if let Some(manifests) = manifest.get("manifests").and_then(|m| m.as_array())
        {
            let arch = match std::env::consts::ARCH {
                "x86_64" => "amd64",
                "aarch64" => "arm64",
                arch => arch,
            };
            let chosen = manifests
                .iter()
                .find(|entry| {
                    entry
                        .pointer("/platform/architecture")
                        .and_then(|a| a.as_str())
                        == Some(arch)
                        && entry.pointer("/platform/os").and_then(|o| o.as_str())
                            == Some("linux")
                })
                .or_else(|| manifests.first())
                .ok_or_else(|| malformed("empty image index".to_string()))?;
            manifest_digest = chosen
                .get("digest")
                .and_then(|d| d.as_str())
                .ok_or_else(|| malformed("index entry without digest".to_string()))?
                .to_string();
            manifest = serde_json::from_slice(
                &self.engine.read_content(&manifest_digest).await?,
            )
            .map_err(|e| malformed(format!("platform manifest: {e}")))?;
        }

        let config_digest = manifest
            .pointer("/config/digest")
            .and_then(|d| d.as_str())
            .ok_or_else(|| malformed("manifest without config digest".to_string()))?
            .to_string();
        let config_size = manifest
            .pointer("/config/size")
            .and_then(|s| s.as_i64())
            .unwrap_or_default();
        let layer_size: i64 = manifest
            .get("layers")
            .and_then(|l| l.as_array())
            .map(|layers| {
                layers
                    .iter()
                    .filter_map(|layer| layer.get("size").and_then(|s| s.as_i64()))
                    .sum()
            })
            .unwrap_or_default();

        let config_bytes = self.engine.read_content(&config_digest).await?;
        let config: ImageConfiguration = serde_json::from_slice(&config_bytes)
            .map_err(|e| malformed(format!("image config: {e}")))?;

        let chain_id = chain_id(config.rootfs().diff_ids());

        Ok(ResolvedImage {
            image_id: config_digest,
            chain_id,
            size: config_size + layer_size,
            config,
            manifest_digest,
        })
    }
}

/// Canonical hash of an ordered layer chain.
pub(crate) fn chain_id(diff_ids: &[String]) -> String {
    let mut chain = String::new();
    for diff_id in diff_ids {
        if chain.is_empty() {
            chain = diff_id.clone();
        } else {
            let mut hasher = Sha256::new();
            hasher.update(format!("{chain} {diff_id}").as_bytes());
            chain = format!("sha256:{:x}", hasher.finalize());
        }
    }
    chain
}

/// Convert a store image into its CRI representation, deriving uid or
/// username from the image config's user field.
pub(crate) fn to_cri_image(image: &Image) -> proto::cri::Image {
    let user = image
        .config
        .config()
        .as_ref()
        .and_then(|c| c.user().clone())
        .unwrap_or_default();
    let user = user.split(':').next().unwrap_or("").to_string();
    let (uid, username) = match user.parse::<i64>() {
        Ok(value) => (Some(Int64Value { value }), String::new()),
        Err(_) => (None, user),
    };
    proto::cri::Image {
        id: image.id.clone(),
        repo_tags: image.repo_tags.clone(),
        repo_digests: image.repo_digests.clone(),
        size: image.size.max(0) as u64,
        uid,
        username,
        spec: Some(ImageSpec { image: image.id.clone(), ..Default::default() }),
        pinned: false,
    }
}
