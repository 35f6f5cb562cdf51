//! Image reference parsing.

use std::str::FromStr;

use secpol_common::{PolicyError, PolicyResult};

/// A parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (with optional port).
    pub registry: String,
    /// Repository name.
    pub repository: String,
    /// Tag or digest.
    pub reference: ImageTag,
}

/// Image tag or digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageTag {
    /// A tag (e.g., "latest").
    Tag(String),
    /// A digest (e.g., "sha256:abc123...").
    Digest(String),
}

impl ImageTag {
    /// The tag or digest as used in a manifest URL.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tag(t) | Self::Digest(t) => t,
        }
    }
}

impl ImageReference {
    /// Default registry.
    pub const DEFAULT_REGISTRY: &'static str = "docker.io";
    /// Default tag.
    pub const DEFAULT_TAG: &'static str = "latest";
    /// API host serving the default registry.
    const DEFAULT_REGISTRY_API: &'static str = "registry-1.docker.io";
    /// Names written for Docker Hub.
    const DOCKER_HUB_ALIASES: [&'static str; 3] =
        ["docker.io", "index.docker.io", "registry-1.docker.io"];

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `alpine` -> docker.io/library/alpine:latest
    /// - `alpine:3.19` -> docker.io/library/alpine:3.19
    /// - `myuser/myapp` -> docker.io/myuser/myapp:latest
    /// - `ghcr.io/org/app:v1.0` -> ghcr.io/org/app:v1.0
    /// - `docker.io/alpine` -> docker.io/library/alpine:latest
    /// - `localhost:5000/app@sha256:...` -> pinned by digest
    /// - `nginx:1.25@sha256:...` -> pinned by digest, tag dropped
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidReference`] for empty names, empty tags,
    /// malformed digests and repository names with invalid characters.
    pub fn parse(reference: &str) -> PolicyResult<Self> {
        let original = reference;
        let reference = reference.trim();
        let invalid = |reason: &str| PolicyError::InvalidReference {
            reference: original.to_string(),
            reason: reason.to_string(),
        };

        if reference.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (name, tag) = if let Some(idx) = reference.find('@') {
            let (name, digest) = reference.split_at(idx);
            let digest = &digest[1..];
            if !is_valid_digest(digest) {
                return Err(invalid("digest must look like <algorithm>:<hex>"));
            }
            // `name:tag@digest` pins by digest; the tag is informational.
            let name = match name.rfind(':') {
                Some(colon) if !name[colon + 1..].contains('/') => &name[..colon],
                _ => name,
            };
            (name, ImageTag::Digest(digest.to_string()))
        } else if let Some(idx) = reference.rfind(':') {
            // A colon before the last slash is a registry port, not a tag.
            let potential_tag = &reference[idx + 1..];
            if potential_tag.contains('/') {
                (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
            } else if potential_tag.is_empty() {
                return Err(invalid("tag is empty"));
            } else {
                (&reference[..idx], ImageTag::Tag(potential_tag.to_string()))
            }
        } else {
            (reference, ImageTag::Tag(Self::DEFAULT_TAG.to_string()))
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if Self::DOCKER_HUB_ALIASES.contains(&first) => {
                (Self::DEFAULT_REGISTRY.to_string(), rest.to_string())
            }
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            _ => (Self::DEFAULT_REGISTRY.to_string(), name.to_string()),
        };

        // Official Docker Hub images live under `library/`.
        let repository = if registry == Self::DEFAULT_REGISTRY && !repository.contains('/') {
            format!("library/{repository}")
        } else {
            repository
        };

        if !is_valid_repository(&repository) {
            return Err(invalid(
                "repository must be lowercase alphanumerics separated by '/', '.', '_' or '-'",
            ));
        }

        Ok(Self {
            registry,
            repository,
            reference: tag,
        })
    }

    /// Get the full reference string.
    #[must_use]
    pub fn full_reference(&self) -> String {
        let tag = match &self.reference {
            ImageTag::Tag(t) => format!(":{t}"),
            ImageTag::Digest(d) => format!("@{d}"),
        };
        format!("{}/{}{}", self.registry, self.repository, tag)
    }

    /// Base URL of the registry's distribution API.
    ///
    /// Loopback registries are spoken to over plain HTTP.
    #[must_use]
    pub fn api_base(&self) -> String {
        let host = if self.registry == Self::DEFAULT_REGISTRY {
            Self::DEFAULT_REGISTRY_API
        } else {
            self.registry.as_str()
        };

        let scheme = if is_loopback(host) { "http" } else { "https" };
        format!("{scheme}://{host}")
    }
}

fn is_loopback(host: &str) -> bool {
    let name = host
        .rsplit_once(':')
        .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
        .map_or(host, |(name, _)| name);
    matches!(name, "localhost" | "127.0.0.1" | "[::1]")
}

fn is_valid_digest(digest: &str) -> bool {
    digest.split_once(':').is_some_and(|(algorithm, hex)| {
        !algorithm.is_empty()
            && algorithm
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
            && hex.len() >= 32
            && hex.chars().all(|c| c.is_ascii_hexdigit())
    })
}

fn is_valid_repository(repository: &str) -> bool {
    repository.split('/').all(|component| {
        !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
            && component.starts_with(|c: char| c.is_ascii_alphanumeric())
    })
}

impl FromStr for ImageReference {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}
