//! Input rules to policy rules.
//!
//! Translation is pure: it reads the mount settings, touches neither the
//! network nor any image, and produces the same output for the same input.

use secpol_oci::{EnvRule, MountConstraint};

use crate::config::MountSettings;
use crate::input::{InputAuth, InputContainer, InputEnvRule, InputMount};

/// A container with its rules in policy form, ready for image resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Image reference.
    pub image_name: String,
    /// Explicit argv; empty means "use the image's".
    pub command: Vec<String>,
    /// Registry credentials, resolved later.
    pub auth: InputAuth,
    /// Compiled environment rules.
    pub env_rules: Vec<EnvRule>,
    /// Working directory override.
    pub working_dir: String,
    /// Mount points to wait on.
    pub wait_mount_points: Vec<String>,
    /// Resolved mounts.
    pub mounts: Vec<MountConfig>,
    /// Whether the container may run privileged.
    pub allow_elevated: bool,
}

/// A mount with its host path resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountConfig {
    /// Path inside the container.
    pub container_path: String,
    /// Host path from the source table; empty when the type is unknown.
    pub host_path: String,
    /// Read-only mount.
    pub readonly: bool,
    /// Compiled mount type.
    pub mount_type: String,
    /// Options preceding the access mode.
    pub options: Vec<String>,
}

impl MountConfig {
    /// Access mode option for this mount.
    #[must_use]
    pub const fn access_mode(&self) -> &'static str {
        if self.readonly { "ro" } else { "rw" }
    }

    /// The compiled mount, with the access mode appended to the options.
    #[must_use]
    pub fn to_constraint(&self) -> MountConstraint {
        MountConstraint {
            source: self.host_path.clone(),
            destination: self.container_path.clone(),
            mount_type: self.mount_type.clone(),
            options: self
                .options
                .iter()
                .cloned()
                .chain(std::iter::once(self.access_mode().to_string()))
                .collect(),
        }
    }
}

/// Translate every container.
#[must_use]
pub fn translate_containers(
    containers: &[InputContainer],
    mounts: &MountSettings,
) -> Vec<ContainerConfig> {
    containers
        .iter()
        .map(|container| translate_container(container, mounts))
        .collect()
}

/// Translate one container.
#[must_use]
pub fn translate_container(container: &InputContainer, mounts: &MountSettings) -> ContainerConfig {
    ContainerConfig {
        image_name: container.image_name.clone(),
        command: container.command.clone(),
        auth: container.auth.clone(),
        env_rules: translate_env_rules(&container.image_name, &container.env_rules),
        working_dir: container.working_dir.clone(),
        wait_mount_points: container.wait_mount_points.clone(),
        mounts: translate_mounts(&container.image_name, &container.mounts, mounts),
        allow_elevated: container.allow_elevated,
    }
}

/// `name=value` rules, in order, duplicates kept.
#[must_use]
pub fn translate_env_rules(image: &str, rules: &[InputEnvRule]) -> Vec<EnvRule> {
    rules
        .iter()
        .map(|rule| {
            if rule.name.contains('=') {
                tracing::warn!(
                    image,
                    name = %rule.name,
                    "Environment variable name contains '='; the rule is ambiguous"
                );
            }
            rule.compile()
        })
        .collect()
}

/// Resolve each mount's type through the source table.
#[must_use]
pub fn translate_mounts(
    image: &str,
    requested: &[InputMount],
    settings: &MountSettings,
) -> Vec<MountConfig> {
    let options: Vec<String> = settings.default_policy.options.render().collect();

    requested
        .iter()
        .map(|mount| {
            let host_path = if let Some(source) = settings.source_table.resolve(&mount.mount_type) {
                source.to_string()
            } else {
                tracing::warn!(
                    image,
                    mount_type = %mount.mount_type,
                    path = %mount.mount_path,
                    "No source table entry for mount type; host path left empty"
                );
                String::new()
            };

            MountConfig {
                container_path: mount.mount_path.clone(),
                host_path,
                readonly: mount.readonly,
                mount_type: settings.default_policy.mount_type.clone(),
                options: options.clone(),
            }
        })
        .collect()
}
