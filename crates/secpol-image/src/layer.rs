//! Image layer blobs.

use std::io::{self, BufReader, Read};

use bytes::Bytes;
use secpol_common::{PolicyError, PolicyResult};
use secpol_oci::Descriptor;
use tempfile::NamedTempFile;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
const MAGIC_LEN: usize = ZSTD_MAGIC.len();

/// Compression applied to a layer blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar.
    None,
    /// gzip-compressed tar.
    Gzip,
    /// zstd-compressed tar.
    Zstd,
}

impl Compression {
    /// Detect compression from the media type, falling back to magic bytes.
    ///
    /// Some registries label every layer `tar.gzip`, and some label
    /// compressed layers as plain tar, so the bytes have the final word when
    /// the media type is inconclusive.
    #[must_use]
    pub fn detect(media_type: &str, data: &[u8]) -> Self {
        if media_type.ends_with("+zstd") || media_type.ends_with(".zstd") {
            return Self::Zstd;
        }
        if data.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else if data.starts_with(&ZSTD_MAGIC) {
            Self::Zstd
        } else if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
            Self::Gzip
        } else {
            Self::None
        }
    }
}

/// A fetched layer blob.
#[derive(Debug)]
pub struct LayerBlob {
    /// Descriptor from the manifest.
    pub descriptor: Descriptor,
    content: Content,
}

/// Raw (possibly compressed) blob content.
#[derive(Debug)]
enum Content {
    Memory(Bytes),
    /// Spooled to disk; `head` holds the leading bytes for format detection.
    Spooled { file: NamedTempFile, head: Vec<u8> },
}

impl LayerBlob {
    /// Create a layer blob held in memory.
    #[must_use]
    pub const fn new(descriptor: Descriptor, data: Bytes) -> Self {
        Self {
            descriptor,
            content: Content::Memory(data),
        }
    }

    /// Create a layer blob backed by a temporary file. The file is removed
    /// when the blob is dropped.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read back.
    pub fn spooled(descriptor: Descriptor, file: NamedTempFile) -> io::Result<Self> {
        let mut head = Vec::with_capacity(MAGIC_LEN);
        file.reopen()?.take(MAGIC_LEN as u64).read_to_end(&mut head)?;
        Ok(Self {
            descriptor,
            content: Content::Spooled { file, head },
        })
    }

    fn head(&self) -> &[u8] {
        match &self.content {
            Content::Memory(data) => &data[..data.len().min(MAGIC_LEN)],
            Content::Spooled { head, .. } => head,
        }
    }

    /// Digest of the blob as listed in the manifest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.descriptor.digest
    }

    /// Compression of this blob.
    #[must_use]
    pub fn compression(&self) -> Compression {
        Compression::detect(&self.descriptor.media_type, self.head())
    }

    /// Stream the uncompressed tar content.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Decompression`] if the decoder cannot be set up,
    /// e.g. a gzip media type over bytes that are not gzip, and
    /// [`PolicyError::Io`] if a spooled blob cannot be reopened.
    pub fn uncompressed(&self) -> PolicyResult<Box<dyn Read + Send + '_>> {
        let raw: Box<dyn Read + Send + '_> = match &self.content {
            Content::Memory(data) => Box::new(&data[..]),
            Content::Spooled { file, .. } => Box::new(BufReader::new(file.reopen()?)),
        };
        let decompression_error = |message: String| PolicyError::Decompression {
            digest: self.descriptor.digest.clone(),
            message,
        };

        match self.compression() {
            Compression::None => Ok(raw),
            Compression::Gzip => {
                if !self.head().starts_with(&GZIP_MAGIC) {
                    return Err(decompression_error(
                        "media type is gzip but content has no gzip header".to_string(),
                    ));
                }
                Ok(Box::new(flate2::read::GzDecoder::new(raw)))
            }
            Compression::Zstd => {
                let decoder = zstd::stream::read::Decoder::new(raw)
                    .map_err(|e| decompression_error(e.to_string()))?;
                Ok(Box::new(decoder))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression as GzLevel;
    use flate2::write::GzEncoder;
    use secpol_oci::image::media_types;

    use super::*;

    fn blob(media_type: &str, data: Vec<u8>) -> LayerBlob {
        LayerBlob::new(Descriptor::new(media_type, "sha256:test", 0), data.into())
    }

    fn read_all(blob: &LayerBlob) -> Vec<u8> {
        let mut out = Vec::new();
        blob.uncompressed().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn gzip_layers_are_inflated() {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(b"layer content").unwrap();
        let layer = blob(media_types::DOCKER_LAYER, encoder.finish().unwrap());

        assert_eq!(layer.compression(), Compression::Gzip);
        assert_eq!(read_all(&layer), b"layer content");
    }

    #[test]
    fn zstd_layers_are_inflated() {
        let compressed = zstd::encode_all(&b"zstd layer"[..], 3).unwrap();
        let layer = blob(media_types::LAYER_TAR_ZSTD, compressed);

        assert_eq!(layer.compression(), Compression::Zstd);
        assert_eq!(read_all(&layer), b"zstd layer");
    }

    #[test]
    fn magic_bytes_override_a_plain_media_type() {
        let compressed = zstd::encode_all(&b"mislabelled"[..], 3).unwrap();
        let layer = blob(media_types::LAYER_TAR, compressed);
        assert_eq!(read_all(&layer), b"mislabelled");
    }

    #[test]
    fn plain_tar_passes_through() {
        let layer = blob(media_types::LAYER_TAR, b"plain".to_vec());
        assert_eq!(layer.compression(), Compression::None);
        assert_eq!(read_all(&layer), b"plain");
    }

    #[test]
    fn spooled_blobs_read_back_from_disk() {
        let mut encoder = GzEncoder::new(Vec::new(), GzLevel::default());
        encoder.write_all(b"spooled layer").unwrap();
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(&encoder.finish().unwrap()).unwrap();

        let layer = LayerBlob::spooled(
            Descriptor::new(media_types::LAYER_TAR, "sha256:test", 0),
            file,
        )
        .unwrap();

        assert_eq!(layer.compression(), Compression::Gzip);
        assert_eq!(read_all(&layer), b"spooled layer");
        // Each read starts from the beginning of the file.
        assert_eq!(read_all(&layer), b"spooled layer");
    }

    #[test]
    fn empty_spooled_blob_is_plain() {
        let layer = LayerBlob::spooled(
            Descriptor::new(media_types::LAYER_TAR, "sha256:test", 0),
            NamedTempFile::new().unwrap(),
        )
        .unwrap();
        assert_eq!(layer.compression(), Compression::None);
        assert!(read_all(&layer).is_empty());
    }

    #[test]
    fn gzip_label_over_garbage_fails() {
        let layer = blob(media_types::LAYER_TAR_GZIP, b"not gzip".to_vec());
        let err = layer.uncompressed().err().unwrap();
        assert!(matches!(err, PolicyError::Decompression { .. }));
    }
}
