//! # secpol
//!
//! Compiles a container group description into the security policy a
//! confidential-computing guest enforces.
//!
//! The pipeline:
//! - [`input`]: the author's container group (JSON, TOML or YAML)
//! - [`defaults`]: configured environment variables and mounts are merged in
//! - [`translate`]: rules are rewritten in policy form, mount types resolved
//! - [`assemble`]: images are resolved, layers hashed, containers compiled
//! - [`output`]: the policy is rendered as JSON and base64

#![warn(missing_docs)]

pub mod assemble;
pub mod cli;
pub mod config;
pub mod defaults;
pub mod document;
pub mod input;
pub mod output;
pub mod translate;

pub use assemble::{CompileStage, PolicyAssembler};
pub use config::ToolConfig;
pub use document::DocumentFormat;
pub use input::PolicyInput;
pub use output::EncodedPolicy;
