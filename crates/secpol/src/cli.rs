//! secpol CLI.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::eyre::Result;
use secpol_image::{CanonicalTarHasher, RegistryClient};
use secpol_oci::{Platform, SecurityPolicy};

use crate::assemble::PolicyAssembler;
use crate::config::ToolConfig;
use crate::input::PolicyInput;
use crate::output::EncodedPolicy;

/// secpol - compile a container group into a base64 security policy
#[derive(Parser, Debug)]
#[command(name = "secpol")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Container group to compile (.json, .toml, .yaml)
    #[arg(short, long)]
    pub input: PathBuf,

    /// Tool configuration file
    #[arg(long, env = "SECPOL_CONFIG", default_value = "internal_config.json")]
    pub config: PathBuf,

    /// Also print the policy JSON before the base64 line
    #[arg(short, long)]
    pub json: bool,

    /// Containers to compile concurrently
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..))]
    pub jobs: u16,

    /// Platform picked from multi-platform images (os/arch[/variant])
    #[arg(long, default_value = "linux/amd64")]
    pub platform: Platform,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Compile the input and print the policy to stdout.
    ///
    /// # Errors
    ///
    /// Returns the first error of the run; nothing is printed in that case.
    pub async fn execute(self) -> Result<()> {
        tracing::info!(input = %self.input.display(), "Compiling security policy");

        let input = PolicyInput::from_file(&self.input)?;

        let policy = if input.allow_all {
            tracing::info!("allow_all set, skipping configuration and registries");
            SecurityPolicy::open_door()
        } else {
            let config = ToolConfig::from_file(&self.config)?;
            let source = RegistryClient::new(self.platform)?;

            PolicyAssembler::new(&config, Arc::new(source), Arc::new(CanonicalTarHasher))
                .with_jobs(usize::from(self.jobs))
                .assemble(input)
                .await?
        };

        let encoded = EncodedPolicy::encode(&policy)?;
        encoded.write_to(&mut io::stdout().lock(), self.json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn defaults() {
        let cli = Cli::try_parse_from(["secpol", "-i", "group.json"]).unwrap();
        assert_eq!(cli.jobs, 1);
        assert_eq!(cli.platform, Platform::linux_amd64());
        assert!(!cli.json);
    }

    #[test]
    fn platform_and_jobs() {
        let cli = Cli::try_parse_from([
            "secpol", "-i", "group.toml", "-j", "--jobs", "4", "--platform", "linux/arm64/v8",
        ])
        .unwrap();
        assert_eq!(cli.jobs, 4);
        assert_eq!(cli.platform.architecture, "arm64");
        assert_eq!(cli.platform.variant.as_deref(), Some("v8"));
        assert!(cli.json);
    }

    #[test]
    fn zero_jobs_is_rejected() {
        assert!(Cli::try_parse_from(["secpol", "-i", "g.json", "--jobs", "0"]).is_err());
    }
}
