//! Error types for a policy compilation run.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`PolicyError`].
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors that abort a compilation run.
#[derive(Error, Diagnostic, Debug)]
pub enum PolicyError {
    /// Missing or malformed tool configuration.
    #[error("Configuration error: {message}")]
    #[diagnostic(
        code(secpol::config),
        help("Check the file passed with --config (or SECPOL_CONFIG)")
    )]
    Config {
        /// The error message.
        message: String,
    },

    /// The input policy document could not be parsed.
    #[error("Failed to parse policy input: {message}")]
    #[diagnostic(code(secpol::input::parse))]
    SpecParse {
        /// The error message.
        message: String,
    },

    /// The input policy document parsed but is not valid.
    #[error("Invalid policy input: {message}")]
    #[diagnostic(code(secpol::input::invalid))]
    InvalidSpec {
        /// The error message.
        message: String,
    },

    /// Malformed image reference.
    #[error("Invalid image reference '{reference}': {reason}")]
    #[diagnostic(
        code(secpol::registry::invalid_reference),
        help("Use formats like 'alpine', 'alpine:3.19', 'ghcr.io/org/app@sha256:...'")
    )]
    InvalidReference {
        /// The reference as written.
        reference: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Image not found in the registry.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(secpol::registry::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// The registry rejected the supplied (or missing) credentials.
    #[error("Authentication failed for {registry}: {message}")]
    #[diagnostic(
        code(secpol::registry::auth),
        help("Set auth.username/auth.password or auth.token on the container")
    )]
    Auth {
        /// Registry host.
        registry: String,
        /// The error message.
        message: String,
    },

    /// Transport failure talking to a registry.
    #[error("Network error: {message}")]
    #[diagnostic(code(secpol::registry::network))]
    Network {
        /// The error message.
        message: String,
    },

    /// Any other registry protocol failure.
    #[error("Registry error: {message}")]
    #[diagnostic(code(secpol::registry))]
    Registry {
        /// The error message.
        message: String,
    },

    /// A layer blob could not be decompressed.
    #[error("Failed to decompress layer {digest}: {message}")]
    #[diagnostic(code(secpol::layer::decompression))]
    Decompression {
        /// Digest of the layer blob.
        digest: String,
        /// The error message.
        message: String,
    },

    /// A layer could not be reconstructed or hashed.
    #[error("Failed to hash layer {digest}: {message}")]
    #[diagnostic(code(secpol::layer::conversion))]
    LayerConversion {
        /// Digest of the layer blob.
        digest: String,
        /// The error message.
        message: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(secpol::serialization))]
    Serialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(secpol::io))]
    Io(#[from] std::io::Error),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(secpol::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

/// Coarse classification of a [`PolicyError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Tool configuration problems.
    Configuration,
    /// Input document problems.
    SpecParse,
    /// Reference, auth, transport or registry protocol problems.
    Registry,
    /// Decompression or canonicalization problems.
    LayerConversion,
    /// Output encoding problems.
    Serialization,
    /// Local I/O and internal failures.
    Internal,
}

impl PolicyError {
    /// Classify this error.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::Configuration,
            Self::SpecParse { .. } | Self::InvalidSpec { .. } => ErrorCategory::SpecParse,
            Self::InvalidReference { .. }
            | Self::ImageNotFound { .. }
            | Self::Auth { .. }
            | Self::Network { .. }
            | Self::Registry { .. } => ErrorCategory::Registry,
            Self::Decompression { .. } | Self::LayerConversion { .. } => {
                ErrorCategory::LayerConversion
            }
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Io(_) | Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = PolicyError::ImageNotFound {
            reference: "docker.io/library/nope:latest".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Image not found: docker.io/library/nope:latest"
        );
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: PolicyError = io_err.into();
        assert!(matches!(err, PolicyError::Io(_)));
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    fn registry_failures_share_a_category() {
        let errors = [
            PolicyError::Auth {
                registry: "ghcr.io".to_string(),
                message: "denied".to_string(),
            },
            PolicyError::Network {
                message: "connection refused".to_string(),
            },
            PolicyError::InvalidReference {
                reference: String::new(),
                reason: "empty".to_string(),
            },
        ];
        for err in &errors {
            assert_eq!(err.category(), ErrorCategory::Registry);
        }
    }

    #[test]
    fn invalid_spec_is_a_parse_failure() {
        let err = PolicyError::InvalidSpec {
            message: "image_name is empty".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::SpecParse);
    }
}
