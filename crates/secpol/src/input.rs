//! The container group input document.
//!
//! ```toml
//! allow_all = false
//!
//! [[container]]
//! image_name = "ghcr.io/org/app:1.2"
//! command = ["/bin/app", "--serve"]
//!
//! [[container.env_rule]]
//! name = "PATH"
//! value = "/usr/bin:/bin"
//!
//! [[container.mount]]
//! mount_type = "azureFile"
//! mount_path = "/data"
//! readonly = true
//! ```

use std::fs;
use std::path::Path;

use secpol_common::{PolicyError, PolicyResult};
use secpol_image::RegistryCredential;
use secpol_oci::{EnvRule, EnvRuleStrategy};
use serde::{Deserialize, Serialize};

use crate::document::DocumentFormat;

/// A container group to compile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyInput {
    /// Emit the open-door policy and ignore everything else.
    pub allow_all: bool,
    /// Containers, in matching order.
    #[serde(alias = "container")]
    pub containers: Vec<InputContainer>,
}

/// One container as written by the author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputContainer {
    /// Image reference.
    pub image_name: String,
    /// Explicit argv; empty means "use the image's".
    pub command: Vec<String>,
    /// Registry credentials.
    pub auth: InputAuth,
    /// Permitted environment variables.
    #[serde(alias = "env_rule")]
    pub env_rules: Vec<InputEnvRule>,
    /// Working directory override.
    pub working_dir: String,
    /// Mount points to wait on.
    pub wait_mount_points: Vec<String>,
    /// Requested mounts.
    #[serde(alias = "mount")]
    pub mounts: Vec<InputMount>,
    /// Whether the container may run privileged.
    pub allow_elevated: bool,
}

/// Registry credentials for a container image.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputAuth {
    /// Basic auth username.
    pub username: String,
    /// Basic auth password.
    pub password: String,
    /// Registry bearer token.
    pub token: String,
}

impl InputAuth {
    /// The credential these fields describe.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidSpec`] for conflicting or incomplete fields.
    pub fn credential(&self) -> PolicyResult<RegistryCredential> {
        RegistryCredential::from_parts(&self.username, &self.password, &self.token)
    }
}

impl std::fmt::Debug for InputAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputAuth")
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .finish()
    }
}

/// An environment variable rule as written by the author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputEnvRule {
    /// Variable name.
    pub name: String,
    /// Value, or pattern for `re2`.
    pub value: String,
    /// How the rule matches.
    pub strategy: EnvRuleStrategy,
}

impl InputEnvRule {
    /// Shorthand for an exact-match rule.
    #[must_use]
    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            strategy: EnvRuleStrategy::String,
        }
    }

    /// The compiled rule.
    #[must_use]
    pub fn compile(&self) -> EnvRule {
        EnvRule::from_pair(&self.name, &self.value, self.strategy)
    }
}

/// A mount requested by type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InputMount {
    /// Abstract mount type, looked up in the source table.
    pub mount_type: String,
    /// Path inside the container.
    pub mount_path: String,
    /// Read-only mount.
    pub readonly: bool,
}

impl PolicyInput {
    /// Load an input document, picking the format from the extension.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::SpecParse`] if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> PolicyResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| PolicyError::SpecParse {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;

        Self::parse(&content, DocumentFormat::from_path(path))
    }

    /// Parse an input document.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::SpecParse`] on malformed content.
    pub fn parse(content: &str, format: DocumentFormat) -> PolicyResult<Self> {
        format
            .parse(content)
            .map_err(|message| PolicyError::SpecParse {
                message: format!("{format}: {message}"),
            })
    }

    /// Check the document before any network work.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidSpec`] describing the first problem.
    pub fn validate(&self) -> PolicyResult<()> {
        if self.allow_all {
            return Ok(());
        }
        for (index, container) in self.containers.iter().enumerate() {
            container
                .validate()
                .map_err(|message| PolicyError::InvalidSpec {
                    message: format!("container {index}: {message}"),
                })?;
        }
        Ok(())
    }
}

impl InputContainer {
    /// A container for `image_name` with everything else defaulted.
    #[must_use]
    pub fn new(image_name: impl Into<String>) -> Self {
        Self {
            image_name: image_name.into(),
            ..Self::default()
        }
    }

    /// Check this container, returning a message on the first problem.
    ///
    /// # Errors
    ///
    /// Returns a description of the problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.image_name.trim().is_empty() {
            return Err("image_name is empty".to_string());
        }

        if let Err(err) = self.auth.credential() {
            return Err(format!("{}: {}", self.image_name, err_message(&err)));
        }

        for rule in &self.env_rules {
            if rule.name.is_empty() {
                return Err(format!("{}: env rule with an empty name", self.image_name));
            }
            if rule.strategy == EnvRuleStrategy::Re2 {
                let compiled = rule.compile();
                regex::Regex::new(&compiled.rule).map_err(|e| {
                    format!(
                        "{}: env rule '{}' is not a valid regular expression: {e}",
                        self.image_name, compiled.rule
                    )
                })?;
            }
        }

        for mount in &self.mounts {
            if mount.mount_path.is_empty() {
                return Err(format!(
                    "{}: mount of type '{}' has no mount_path",
                    self.image_name, mount.mount_type
                ));
            }
        }

        Ok(())
    }
}

fn err_message(err: &PolicyError) -> String {
    match err {
        PolicyError::InvalidSpec { message } => message.clone(),
        other => other.to_string(),
    }
}
