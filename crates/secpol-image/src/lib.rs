//! # secpol-image
//!
//! Image access for secpol.
//!
//! This crate provides:
//! - Image reference parsing and registry credentials
//! - A distribution v2 registry client behind the [`ImageSource`] seam
//! - Layer decompression and root digests via [`LayerHasher`]

#![warn(missing_docs)]

pub mod credentials;
pub mod hasher;
pub mod layer;
pub mod reference;
/// Image registry client.
pub mod registry;
pub mod source;

pub use credentials::RegistryCredential;
pub use hasher::{CanonicalTarHasher, LayerHasher};
pub use layer::{Compression, LayerBlob};
pub use reference::ImageReference;
pub use registry::RegistryClient;
pub use source::{ImageHandle, ImageSource};
