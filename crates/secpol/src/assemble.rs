//! Policy assembly.
//!
//! [`PolicyAssembler`] drives every container through the same stages:
//!
//! ```text
//! Translated -> AuthResolved -> ImageResolved -> LayersHashed
//!   -> CommandResolved -> WorkingDirResolved -> GlobalMountsApplied -> Compiled
//! ```
//!
//! The first failure in any container aborts the whole run; no partial
//! policy is ever returned.

use std::fmt;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, stream};
use secpol_common::{PolicyError, PolicyResult};
use secpol_image::{ImageHandle, ImageSource, LayerBlob, LayerHasher};
use secpol_oci::{ContainerPolicy, ImageConfig, SecurityPolicy};

use crate::config::ToolConfig;
use crate::defaults::{merge_env_defaults, merge_global_mounts, merge_user_mounts};
use crate::input::PolicyInput;
use crate::translate::{ContainerConfig, MountConfig, translate_containers};

/// Where a container is in its compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CompileStage {
    /// Rules translated.
    Translated,
    /// Registry credential decided.
    AuthResolved,
    /// Image manifest and config fetched.
    ImageResolved,
    /// Every layer hashed.
    LayersHashed,
    /// Command decided.
    CommandResolved,
    /// Working directory decided.
    WorkingDirResolved,
    /// Global mounts appended.
    GlobalMountsApplied,
    /// Done.
    Compiled,
}

impl fmt::Display for CompileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Translated => "translated",
            Self::AuthResolved => "auth_resolved",
            Self::ImageResolved => "image_resolved",
            Self::LayersHashed => "layers_hashed",
            Self::CommandResolved => "command_resolved",
            Self::WorkingDirResolved => "working_dir_resolved",
            Self::GlobalMountsApplied => "global_mounts_applied",
            Self::Compiled => "compiled",
        };
        f.write_str(name)
    }
}

fn enter(image: &str, stage: CompileStage) {
    tracing::debug!(image, stage = %stage, "Container stage");
}

/// Compiles container groups into security policies.
pub struct PolicyAssembler<'a> {
    config: &'a ToolConfig,
    source: Arc<dyn ImageSource>,
    hasher: Arc<dyn LayerHasher>,
    jobs: usize,
}

impl<'a> PolicyAssembler<'a> {
    /// Create an assembler compiling one container at a time.
    #[must_use]
    pub fn new(
        config: &'a ToolConfig,
        source: Arc<dyn ImageSource>,
        hasher: Arc<dyn LayerHasher>,
    ) -> Self {
        Self {
            config,
            source,
            hasher,
            jobs: 1,
        }
    }

    /// Compile up to `jobs` containers concurrently. Output order is
    /// unaffected.
    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Compile `input` into a security policy.
    ///
    /// # Errors
    ///
    /// Returns the first validation, registry or hashing error.
    pub async fn assemble(&self, input: PolicyInput) -> PolicyResult<SecurityPolicy> {
        if input.allow_all {
            tracing::info!("allow_all set, emitting the open-door policy");
            return Ok(SecurityPolicy::open_door());
        }

        input.validate()?;

        let mut user = input.containers;
        merge_env_defaults(&mut user, &self.config.env_defaults);
        merge_user_mounts(&mut user, &self.config.mount.default_mounts_user);

        let mut configs = translate_containers(&user, &self.config.mount);
        configs.extend(translate_containers(
            &self.config.default_containers,
            &self.config.mount,
        ));

        tracing::info!(
            user_containers = user.len(),
            default_containers = self.config.default_containers.len(),
            jobs = self.jobs,
            "Compiling container group"
        );

        let containers = self.compile_all(&configs).await?;
        Ok(SecurityPolicy::new(containers))
    }

    async fn compile_all(&self, configs: &[ContainerConfig]) -> PolicyResult<Vec<ContainerPolicy>> {
        stream::iter(configs)
            .map(|config| self.compile_container(config))
            .buffered(self.jobs)
            .try_collect()
            .await
    }

    /// Compile a single translated container.
    ///
    /// # Errors
    ///
    /// Returns the first credential, registry or hashing error.
    pub async fn compile_container(&self, config: &ContainerConfig) -> PolicyResult<ContainerPolicy> {
        let image = config.image_name.as_str();
        enter(image, CompileStage::Translated);

        let credential = config.auth.credential()?;
        enter(image, CompileStage::AuthResolved);

        let handle = self.source.resolve(image, &credential).await?;
        enter(image, CompileStage::ImageResolved);

        let layers = self.hash_layers(handle.as_ref()).await?;
        enter(image, CompileStage::LayersHashed);

        let command = resolve_command(&config.command, handle.config());
        enter(image, CompileStage::CommandResolved);

        let working_dir = resolve_working_dir(
            &config.working_dir,
            handle.config(),
            &self.config.mount.containerd.default_working_dir,
        );
        enter(image, CompileStage::WorkingDirResolved);

        let mut policy = ContainerPolicy {
            command: command.into(),
            env_rules: config.env_rules.iter().cloned().collect(),
            layers: layers.into(),
            working_dir,
            mounts: config.mounts.iter().map(MountConfig::to_constraint).collect(),
            wait_mount_points: config.wait_mount_points.iter().cloned().collect(),
            allow_elevated: config.allow_elevated,
        };

        merge_global_mounts(&mut policy, &self.config.mount.default_mounts_global_inject_policy);
        enter(image, CompileStage::GlobalMountsApplied);

        enter(image, CompileStage::Compiled);
        tracing::info!(
            image = handle.reference(),
            layers = policy.layers.len(),
            mounts = policy.mounts.len(),
            "Container compiled"
        );
        Ok(policy)
    }

    /// Root digests of every layer, in manifest order.
    async fn hash_layers(&self, handle: &dyn ImageHandle) -> PolicyResult<Vec<String>> {
        let count = handle.layers().len();
        let mut digests = Vec::with_capacity(count);

        for index in 0..count {
            let blob = handle.fetch_layer(index).await?;
            let blob_digest = blob.digest().to_string();
            let hasher = Arc::clone(&self.hasher);

            let root = tokio::task::spawn_blocking(move || root_digest(hasher.as_ref(), &blob))
                .await
                .map_err(|e| PolicyError::Internal {
                    message: format!("Layer hashing task failed: {e}"),
                })??;

            tracing::debug!(
                image = handle.reference(),
                index,
                blob = %blob_digest,
                root = %root,
                "Layer hashed"
            );
            digests.push(root);
        }

        Ok(digests)
    }
}

fn root_digest(hasher: &dyn LayerHasher, blob: &LayerBlob) -> PolicyResult<String> {
    let mut content = blob.uncompressed()?;
    hasher
        .root_digest(&mut content)
        .map_err(|e| PolicyError::LayerConversion {
            digest: blob.digest().to_string(),
            message: e.to_string(),
        })
}

/// The explicit command if set, else the image's entrypoint and arguments.
#[must_use]
pub fn resolve_command(explicit: &[String], image: &ImageConfig) -> Vec<String> {
    if explicit.is_empty() {
        image.default_command()
    } else {
        explicit.to_vec()
    }
}

/// The explicit directory if set, else the image's, else `fallback`.
#[must_use]
pub fn resolve_working_dir(explicit: &str, image: &ImageConfig, fallback: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    image.working_dir().unwrap_or(fallback).to_string()
}
