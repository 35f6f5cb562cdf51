//! # secpol-oci
//!
//! Document types for secpol.
//!
//! This crate provides Rust types for:
//! - OCI Image Specification (manifests, indexes, configs)
//! - The security policy document enforced by the guest runtime

#![warn(missing_docs)]

pub mod image;
pub mod policy;

pub use image::{Descriptor, ImageConfig, ImageIndex, ImageManifest, Platform};
pub use policy::{
    ContainerPolicy, Elements, EnvRule, EnvRuleStrategy, MountConstraint, SecurityPolicy,
};
