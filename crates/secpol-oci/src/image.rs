//! OCI Image Specification types.
//!
//! Based on the OCI Image Specification v1.1.0:
//! <https://github.com/opencontainers/image-spec>
//!
//! Docker schema 2 manifests and configs share this shape, so the same types
//! are used for both.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use secpol_common::PolicyError;
use serde::{Deserialize, Serialize};

/// OCI Image Manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type of the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Image configuration descriptor.
    pub config: Descriptor,
    /// Image layers, base layer first.
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// OCI Image Index (multi-architecture manifest).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Manifest list.
    pub manifests: Vec<ManifestDescriptor>,
}

impl ImageIndex {
    /// Find the first manifest built for `platform`.
    #[must_use]
    pub fn find_platform(&self, platform: &Platform) -> Option<&ManifestDescriptor> {
        self.manifests.iter().find(|m| {
            m.platform
                .as_ref()
                .is_some_and(|candidate| candidate.satisfies(platform))
        })
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size in bytes.
    pub size: i64,
    /// URLs for downloading.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,
}

impl Descriptor {
    /// Create a descriptor without alternate URLs.
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: i64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            urls: Vec::new(),
        }
    }
}

/// Manifest descriptor with platform information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    /// Base descriptor.
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Platform information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Operating system.
    pub os: String,
    /// Architecture.
    pub architecture: String,
    /// Architecture variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Create a platform for linux/amd64.
    #[must_use]
    pub fn linux_amd64() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }

    /// Whether this (manifest) platform can serve a `wanted` platform.
    ///
    /// A wanted platform without a variant accepts any variant.
    #[must_use]
    pub fn satisfies(&self, wanted: &Self) -> bool {
        self.os == wanted.os
            && self.architecture == wanted.architecture
            && (wanted.variant.is_none() || self.variant == wanted.variant)
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::linux_amd64()
    }
}

impl FromStr for Platform {
    type Err = PolicyError;

    /// Parse `os/arch` or `os/arch/variant`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let invalid = || PolicyError::Config {
            message: format!("Invalid platform '{s}', expected os/arch[/variant]"),
        };

        match parts.as_slice() {
            [os, arch] if !os.is_empty() && !arch.is_empty() => Ok(Self {
                os: (*os).to_string(),
                architecture: (*arch).to_string(),
                variant: None,
            }),
            [os, arch, variant] if !os.is_empty() && !arch.is_empty() && !variant.is_empty() => {
                Ok(Self {
                    os: (*os).to_string(),
                    architecture: (*arch).to_string(),
                    variant: Some((*variant).to_string()),
                })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

/// OCI Image Configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Execution parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ExecutionConfig>,
    /// Rootfs information.
    #[serde(default)]
    pub rootfs: RootFs,
}

impl ImageConfig {
    /// The default argv of the image: `Entrypoint` followed by `Cmd`.
    #[must_use]
    pub fn default_command(&self) -> Vec<String> {
        let Some(exec) = &self.config else {
            return Vec::new();
        };

        exec.entrypoint
            .iter()
            .flatten()
            .chain(exec.cmd.iter().flatten())
            .cloned()
            .collect()
    }

    /// The working directory baked into the image, if any.
    #[must_use]
    pub fn working_dir(&self) -> Option<&str> {
        self.config
            .as_ref()
            .and_then(|exec| exec.working_dir.as_deref())
            .filter(|dir| !dir.is_empty())
    }
}

/// Execution configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecutionConfig {
    /// User.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Environment variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    /// Entrypoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Default command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Root filesystem information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    /// Type (must be "layers").
    #[serde(rename = "type", default)]
    pub fs_type: String,
    /// Layer diff IDs (uncompressed digests).
    #[serde(default)]
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// Common media types.
pub mod media_types {
    /// OCI image manifest media type.
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index media type.
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI image config media type.
    pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    /// OCI layer media type (tar+gzip).
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    /// OCI layer media type (tar+zstd).
    pub const LAYER_TAR_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    /// OCI layer media type (uncompressed tar).
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

    /// Docker manifest v2 schema 2 media type.
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    /// Docker manifest list media type.
    pub const DOCKER_INDEX: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    /// Docker image config media type.
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    /// Docker layer media type.
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Whether `media_type` names a multi-platform index.
    #[must_use]
    pub fn is_index(media_type: &str) -> bool {
        media_type == INDEX || media_type == DOCKER_INDEX
    }

    /// Every manifest media type a registry may answer with, for `Accept`.
    #[must_use]
    pub fn accepted_manifests() -> String {
        [MANIFEST, DOCKER_MANIFEST, INDEX, DOCKER_INDEX].join(", ")
    }
}
