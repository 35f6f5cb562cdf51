//! Image source abstraction.
//!
//! The policy compiler only needs three things from an image: its config,
//! its layer list in manifest order and the content of each layer. These
//! traits are the seam between the compiler and a concrete registry.

use async_trait::async_trait;
use secpol_common::PolicyResult;
use secpol_oci::{Descriptor, ImageConfig};

use crate::credentials::RegistryCredential;
use crate::layer::LayerBlob;

/// Resolves image references to image handles.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Resolve `reference`, authenticating with `credential`.
    ///
    /// # Errors
    ///
    /// Fails with an invalid-reference, not-found, auth or network error.
    async fn resolve(
        &self,
        reference: &str,
        credential: &RegistryCredential,
    ) -> PolicyResult<Box<dyn ImageHandle>>;
}

/// A resolved image.
#[async_trait]
pub trait ImageHandle: Send + Sync {
    /// The fully qualified reference this handle was resolved from.
    fn reference(&self) -> &str;

    /// The image configuration.
    fn config(&self) -> &ImageConfig;

    /// Layer descriptors, base layer first.
    fn layers(&self) -> &[Descriptor];

    /// Fetch layer `index` (an index into [`ImageHandle::layers`]).
    ///
    /// # Errors
    ///
    /// Fails if the blob cannot be fetched or does not match its digest.
    async fn fetch_layer(&self, index: usize) -> PolicyResult<LayerBlob>;
}
