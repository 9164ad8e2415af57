/* -------------------------------------------------------------------------- *\
 * Copyright 2024 - 2026, the vessel contributors                             *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

//! Docker-style image reference normalization.

use super::ImageError;

type Result<T> = std::result::Result<T, ImageError>;

const DEFAULT_DOMAIN: &str = "docker.io";
const OFFICIAL_REPO_PREFIX: &str = "library/";
const DEFAULT_TAG: &str = "latest";

/// A parsed reference, normalized to `domain/path`, with the tag defaulted
/// to `latest` when neither tag nor digest was supplied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    /// `domain/path`, e.g. `docker.io/library/busybox`.
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalize a user-supplied reference.
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(ImageError::BadReference {
                reference: reference.to_string(),
                message: "empty reference".to_string(),
            });
        }
        if reference.starts_with("sha256:") {
            return Err(ImageError::BadReference {
                reference: reference.to_string(),
                message: "image id is not a pullable reference".to_string(),
            });
        }

        let (remainder, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !digest.starts_with("sha256:") || digest.len() != 71 {
                    return Err(ImageError::BadReference {
                        reference: reference.to_string(),
                        message: format!("malformed digest '{digest}'"),
                    });
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; a colon before it
        // is a registry port.
        let (name, tag) = match remainder.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => {
                (name.to_string(), Some(tag.to_string()))
            }
            _ => (remainder.to_string(), None),
        };
        if name.is_empty() {
            return Err(ImageError::BadReference {
                reference: reference.to_string(),
                message: "empty repository name".to_string(),
            });
        }

        let name = match name.split_once('/') {
            Some((domain, _))
                if domain.contains('.')
                    || domain.contains(':')
                    || domain == "localhost" =>
            {
                name
            }
            Some(_) => format!("{DEFAULT_DOMAIN}/{name}"),
            None => format!("{DEFAULT_DOMAIN}/{OFFICIAL_REPO_PREFIX}{name}"),
        };

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };
        Ok(Self { name, tag, digest })
    }

    /// The reference handed to the engine for pulling: digest wins over
    /// tag.
    pub fn pull_name(&self) -> String {
        if let Some(digest) = &self.digest {
            return format!("{}@{digest}", self.name);
        }
        self.tagged_name().expect("reference without tag or digest")
    }

    /// `domain/path:tag` when a tag is present.
    pub fn tagged_name(&self) -> Option<String> {
        self.tag.as_ref().map(|tag| format!("{}:{tag}", self.name))
    }

    /// `domain/path@digest` for a given manifest digest.
    pub fn digest_name(&self, digest: &str) -> String {
        format!("{}@{digest}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_name_gets_default_domain_and_tag() {
        let parsed = ImageReference::parse("busybox").expect("parse");
        assert_eq!(parsed.name, "docker.io/library/busybox");
        assert_eq!(parsed.tag.as_deref(), Some("latest"));
        assert_eq!(parsed.pull_name(), "docker.io/library/busybox:latest");
    }

    #[test]
    fn test_namespaced_name_skips_library() {
        let parsed = ImageReference::parse("grafana/loki:2.9").expect("parse");
        assert_eq!(parsed.pull_name(), "docker.io/grafana/loki:2.9");
    }

    #[test]
    fn test_registry_with_port() {
        let parsed =
            ImageReference::parse("registry.local:5000/team/app:v1").expect("parse");
        assert_eq!(parsed.name, "registry.local:5000/team/app");
        assert_eq!(parsed.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_digest_reference() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let parsed = ImageReference::parse(&format!(
            "registry.k8s.io/pause@{digest}"
        ))
        .expect("parse");
        assert_eq!(parsed.name, "registry.k8s.io/pause");
        assert_eq!(parsed.tag, None);
        assert_eq!(parsed.digest.as_deref(), Some(digest.as_str()));
        assert_eq!(parsed.pull_name(), format!("registry.k8s.io/pause@{digest}"));
    }

    #[test]
    fn test_malformed_digest_is_error() {
        assert!(matches!(
            ImageReference::parse("busybox@sha256:short"),
            Err(ImageError::BadReference { .. })
        ));
    }

    #[test]
    fn test_image_id_is_not_pullable() {
        let id = format!("sha256:{}", "b".repeat(64));
        assert!(matches!(
            ImageReference::parse(&id),
            Err(ImageError::BadReference { .. })
        ));
    }
}
