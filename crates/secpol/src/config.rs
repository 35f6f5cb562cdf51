//! Tool configuration.
//!
//! The configuration is loaded once per run and passed by reference to every
//! stage. It carries the defaults injected into user containers, the mount
//! source table and the default (sidecar) containers.
//!
//! Unknown keys are rejected at every level. Documents written with the
//! flat layout (`openGCS`, `fabric`, `managedIdentity` and `enableRestart`
//! at the top level, `extra_containers`, `hcsshim_config` and camelCase
//! leaf keys) are accepted as well.

use std::fmt;
use std::fs;
use std::path::Path;

use secpol_common::{PolicyError, PolicyResult};
use secpol_oci::{Elements, MountConstraint};
use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::document::DocumentFormat;
use crate::input::{InputContainer, InputEnvRule, InputMount};

/// Process-wide configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "ConfigDocument")]
pub struct ToolConfig {
    /// Configuration version.
    pub version: String,
    /// Guest policy versions this configuration targets.
    pub supported_versions: VersionRange,
    /// Containers appended to every compiled group.
    pub default_containers: Vec<InputContainer>,
    /// Environment variables injected into user containers.
    pub env_defaults: EnvDefaults,
    /// Mount settings.
    pub mount: MountSettings,
}

/// A configuration document as written, in either layout.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigDocument {
    version: String,
    #[serde(alias = "hcsshim_config")]
    supported_versions: VersionRange,
    #[serde(alias = "extra_containers")]
    default_containers: Vec<InputContainer>,
    env_defaults: Option<EnvDefaults>,
    #[serde(rename = "openGCS")]
    open_gcs: Option<EnvGroup>,
    fabric: Option<EnvGroup>,
    #[serde(rename = "managedIdentity")]
    managed_identity: Option<EnvGroup>,
    #[serde(rename = "enableRestart")]
    enable_restart: Option<EnvGroup>,
    mount: MountSettings,
}

impl TryFrom<ConfigDocument> for ToolConfig {
    type Error = String;

    fn try_from(doc: ConfigDocument) -> Result<Self, Self::Error> {
        let flat = [
            &doc.open_gcs,
            &doc.fabric,
            &doc.managed_identity,
            &doc.enable_restart,
        ];
        let has_flat_groups = flat.iter().any(|group| group.is_some());

        let env_defaults = match doc.env_defaults {
            Some(_) if has_flat_groups => {
                return Err("env_defaults cannot be combined with top-level \
                            openGCS/fabric/managedIdentity/enableRestart groups"
                    .to_string());
            }
            Some(grouped) => grouped,
            None => EnvDefaults {
                platform_bootstrap: doc.open_gcs.unwrap_or_default(),
                fabric: doc.fabric.unwrap_or_default(),
                managed_identity: doc.managed_identity.unwrap_or_default(),
                restart_enablement: doc.enable_restart.unwrap_or_default(),
            },
        };

        Ok(Self {
            version: doc.version,
            supported_versions: doc.supported_versions,
            default_containers: doc.default_containers,
            env_defaults,
            mount: doc.mount,
        })
    }
}

/// Supported guest policy versions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VersionRange {
    /// Oldest supported version.
    #[serde(alias = "minVersion")]
    pub min_version: String,
    /// Newest supported version.
    #[serde(alias = "maxVersion")]
    pub max_version: String,
}

/// Default environment variable groups, injected in field order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvDefaults {
    /// Variables the guest platform needs to boot a container.
    #[serde(alias = "openGCS")]
    pub platform_bootstrap: EnvGroup,
    /// Cluster fabric variables.
    pub fabric: EnvGroup,
    /// Managed identity endpoint variables.
    #[serde(alias = "managedIdentity")]
    pub managed_identity: EnvGroup,
    /// Variables that enable container restart.
    #[serde(alias = "enableRestart")]
    pub restart_enablement: EnvGroup,
}

/// A named group of default environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvGroup {
    /// The variables.
    #[serde(alias = "environmentVariables")]
    pub environment_variables: Vec<InputEnvRule>,
}

impl EnvDefaults {
    /// Groups with their names, in injection order.
    #[must_use]
    pub fn groups(&self) -> [(&'static str, &EnvGroup); 4] {
        [
            ("platform_bootstrap", &self.platform_bootstrap),
            ("fabric", &self.fabric),
            ("managed_identity", &self.managed_identity),
            ("restart_enablement", &self.restart_enablement),
        ]
    }

    /// Every default rule, in injection order.
    pub fn rules(&self) -> impl Iterator<Item = &InputEnvRule> {
        self.groups()
            .into_iter()
            .flat_map(|(_, group)| group.environment_variables.iter())
    }
}

/// Mount configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountSettings {
    /// Mount type to host path table.
    pub source_table: SourceTable,
    /// Type and options of translated user mounts.
    pub default_policy: DefaultMountPolicy,
    /// Mounts appended to every user container before translation.
    pub default_mounts_user: Vec<DefaultUserMount>,
    /// Pre-resolved mounts appended to every compiled container.
    pub default_mounts_global_inject_policy: Vec<GlobalMount>,
    /// containerd settings.
    pub containerd: ContainerdSettings,
}

/// Ordered mount type to host path table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceTable(pub Vec<SourceEntry>);

/// One source table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceEntry {
    /// Abstract mount type.
    #[serde(alias = "mountType")]
    pub mount_type: String,
    /// Host path.
    pub source: String,
}

impl SourceTable {
    /// Host path of the first entry for `mount_type`.
    #[must_use]
    pub fn resolve(&self, mount_type: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|entry| entry.mount_type == mount_type)
            .map(|entry| entry.source.as_str())
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for SourceTable {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(mount_type, source)| SourceEntry { mount_type, source })
                .collect(),
        )
    }
}

/// Type and base options for translated user mounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultMountPolicy {
    /// Compiled mount type.
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Options preceding the access mode.
    pub options: MountOptions,
}

impl Default for DefaultMountPolicy {
    fn default() -> Self {
        Self {
            mount_type: "bind".to_string(),
            options: MountOptions::flags(["rbind", "rshared"]),
        }
    }
}

/// A mount added to every user container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DefaultUserMount {
    /// Label.
    pub name: String,
    /// Abstract mount type.
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Path inside the container.
    pub path: String,
    /// Read-only mount.
    pub readonly: bool,
}

impl DefaultUserMount {
    /// This mount as an input mount.
    #[must_use]
    pub fn to_input(&self) -> InputMount {
        InputMount {
            mount_type: self.mount_type.clone(),
            mount_path: self.path.clone(),
            readonly: self.readonly,
        }
    }
}

/// A pre-resolved mount added to every compiled container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GlobalMount {
    /// Path inside the container.
    pub destination: String,
    /// Options, rendered as given.
    pub options: MountOptions,
    /// Host path.
    pub source: String,
    /// Mount type.
    #[serde(rename = "type")]
    pub mount_type: String,
}

impl GlobalMount {
    /// The compiled mount.
    #[must_use]
    pub fn to_constraint(&self) -> MountConstraint {
        MountConstraint {
            source: self.source.clone(),
            destination: self.destination.clone(),
            mount_type: self.mount_type.clone(),
            options: self.options.render().collect(),
        }
    }
}

/// containerd settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerdSettings {
    /// Working directory when neither the container nor its image set one.
    #[serde(alias = "defaultWorkingDir")]
    pub default_working_dir: String,
}

impl Default for ContainerdSettings {
    fn default() -> Self {
        Self {
            default_working_dir: "/".to_string(),
        }
    }
}

/// Ordered mount options.
///
/// Written either as a list of option strings (`["rbind", "ro"]`) or as a
/// map (`{"rbind": "", "mode": "0755"}`); map entries render as `key` when
/// the value is empty and `key=value` otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions(Vec<(String, String)>);

impl MountOptions {
    /// Options without values.
    pub fn flags<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(flags.into_iter().map(|f| (f.into(), String::new())).collect())
    }

    /// Rendered option strings, in order.
    pub fn render(&self) -> impl Iterator<Item = String> + '_ {
        self.0.iter().map(|(key, value)| {
            if value.is_empty() {
                key.clone()
            } else {
                format!("{key}={value}")
            }
        })
    }

    /// Number of options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no options.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn check_key<E: de::Error>(key: &str) -> Result<(), E> {
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(E::custom(format!("invalid mount option '{key}'")));
        }
        Ok(())
    }
}

impl Serialize for MountOptions {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.render())
    }
}

impl<'de> Deserialize<'de> for MountOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OptionsVisitor;

        impl<'de> Visitor<'de> for OptionsVisitor {
            type Value = MountOptions;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a list of option strings or a map of option names to values")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut options = Vec::new();
                while let Some(option) = seq.next_element::<String>()? {
                    let (key, value) = option
                        .split_once('=')
                        .map_or((option.as_str(), ""), |(k, v)| (k, v));
                    MountOptions::check_key(key)?;
                    options.push((key.to_string(), value.to_string()));
                }
                Ok(MountOptions(options))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut options: Vec<(String, String)> = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, String>()? {
                    MountOptions::check_key(&key)?;
                    if options.iter().any(|(existing, _)| *existing == key) {
                        return Err(de::Error::custom(format!("duplicate mount option '{key}'")));
                    }
                    options.push((key, value));
                }
                Ok(MountOptions(options))
            }
        }

        deserializer.deserialize_any(OptionsVisitor)
    }
}

impl ToolConfig {
    /// Load and validate a configuration file, picking the format from the
    /// extension.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Config`] if the file is missing, malformed or
    /// fails validation.
    pub fn from_file(path: &Path) -> PolicyResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| PolicyError::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;

        let config = Self::parse(&content, DocumentFormat::from_path(path))?;
        tracing::debug!(
            path = %path.display(),
            version = %config.version,
            default_containers = config.default_containers.len(),
            source_table = config.mount.source_table.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Config`] on malformed or invalid content.
    pub fn parse(content: &str, format: DocumentFormat) -> PolicyResult<Self> {
        let config: Self = format.parse(content).map_err(|message| PolicyError::Config {
            message: format!("{format}: {message}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Config`] describing the first problem.
    pub fn validate(&self) -> PolicyResult<()> {
        let invalid = |message: String| PolicyError::Config { message };

        if self.version.trim().is_empty() {
            return Err(invalid("version is empty".to_string()));
        }

        let range = &self.supported_versions;
        if let (Some(min), Some(max)) = (
            numeric_version(&range.min_version),
            numeric_version(&range.max_version),
        ) {
            if min > max {
                return Err(invalid(format!(
                    "supported_versions.min_version {} is newer than max_version {}",
                    range.min_version, range.max_version
                )));
            }
        }

        for (index, entry) in self.mount.source_table.0.iter().enumerate() {
            if entry.mount_type.is_empty() {
                return Err(invalid(format!("mount.source_table[{index}] has no mount_type")));
            }
        }

        if self.mount.default_policy.mount_type.is_empty() {
            return Err(invalid("mount.default_policy.type is empty".to_string()));
        }

        for (index, mount) in self.mount.default_mounts_user.iter().enumerate() {
            if mount.path.is_empty() {
                return Err(invalid(format!(
                    "mount.default_mounts_user[{index}] ({}) has no path",
                    mount.name
                )));
            }
        }

        for (index, mount) in self.mount.default_mounts_global_inject_policy.iter().enumerate() {
            if mount.destination.is_empty() {
                return Err(invalid(format!(
                    "mount.default_mounts_global_inject_policy[{index}] has no destination"
                )));
            }
        }

        for (name, group) in self.env_defaults.groups() {
            if group.environment_variables.iter().any(|rule| rule.name.is_empty()) {
                return Err(invalid(format!("env_defaults.{name} has a rule with no name")));
            }
        }

        for (index, container) in self.default_containers.iter().enumerate() {
            container
                .validate()
                .map_err(|message| invalid(format!("default_containers[{index}]: {message}")))?;
        }

        Ok(())
    }

    /// Global mounts as compiled constraints.
    #[must_use]
    pub fn global_mounts(&self) -> Elements<MountConstraint> {
        self.mount
            .default_mounts_global_inject_policy
            .iter()
            .map(GlobalMount::to_constraint)
            .collect()
    }
}

/// `"1.2.3"` as `[1, 2, 3]`; `None` if any component is not a number.
fn numeric_version(version: &str) -> Option<Vec<u64>> {
    let version = version.trim();
    if version.is_empty() {
        return None;
    }
    version.split('.').map(|part| part.parse().ok()).collect()
}
