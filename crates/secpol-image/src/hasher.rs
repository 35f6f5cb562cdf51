//! Layer root digests.
//!
//! A root digest identifies the filesystem a layer produces, not the bytes
//! of the blob that carries it. [`CanonicalTarHasher`] rebuilds the layer as
//! a path-keyed tree and hashes that tree in path order, so two layers that
//! differ only in entry order, timestamps, tar padding or compression get
//! the same digest.

use std::collections::BTreeMap;
use std::io::{self, Read};

use sha2::{Digest, Sha256};
use tar::EntryType;

/// Computes the root digest of an uncompressed layer tar stream.
pub trait LayerHasher: Send + Sync {
    /// Hash the layer read from `content`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the stream is not a readable tar archive.
    fn root_digest(&self, content: &mut dyn Read) -> io::Result<String>;
}

/// Domain separator, bumped whenever the tree encoding changes.
const TREE_VERSION: &[u8] = b"secpol-layer-tree-v1";

const XATTR_PREFIX: &str = "SCHILY.xattr.";

/// Hashes a layer as a canonical filesystem tree.
#[derive(Debug, Default, Clone, Copy)]
pub struct CanonicalTarHasher;

impl LayerHasher for CanonicalTarHasher {
    fn root_digest(&self, content: &mut dyn Read) -> io::Result<String> {
        let tree = reconstruct(content)?;
        tracing::trace!(entries = tree.len(), "Layer tree reconstructed");
        Ok(hash_tree(&tree))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    File = 1,
    Directory = 2,
    Symlink = 3,
    HardLink = 4,
    CharDevice = 5,
    BlockDevice = 6,
    Fifo = 7,
}

#[derive(Debug)]
enum Payload {
    Empty,
    Content([u8; 32]),
    Link(Vec<u8>),
    Device(u32, u32),
}

#[derive(Debug)]
struct FsNode {
    kind: NodeKind,
    mode: u32,
    uid: u64,
    gid: u64,
    payload: Payload,
    xattrs: BTreeMap<String, Vec<u8>>,
}

fn reconstruct(content: &mut dyn Read) -> io::Result<BTreeMap<String, FsNode>> {
    let mut archive = tar::Archive::new(content);
    let mut tree = BTreeMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();

        let kind = match entry_type {
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse => NodeKind::File,
            EntryType::Directory => NodeKind::Directory,
            EntryType::Symlink => NodeKind::Symlink,
            EntryType::Link => NodeKind::HardLink,
            EntryType::Char => NodeKind::CharDevice,
            EntryType::Block => NodeKind::BlockDevice,
            EntryType::Fifo => NodeKind::Fifo,
            t if t.is_pax_global_extensions() => continue,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported tar entry type {:?}", other.as_byte() as char),
                ));
            }
        };

        let path = normalize_path(&entry.path_bytes());
        if path.is_empty() {
            continue;
        }

        let header = entry.header().clone();
        let mode = header.mode()? & 0o7777;
        let uid = header.uid()?;
        let gid = header.gid()?;

        let mut xattrs = BTreeMap::new();
        if let Some(extensions) = entry.pax_extensions()? {
            for extension in extensions {
                let extension = extension?;
                let Ok(key) = extension.key() else { continue };
                if let Some(name) = key.strip_prefix(XATTR_PREFIX) {
                    xattrs.insert(name.to_string(), extension.value_bytes().to_vec());
                }
            }
        }

        let payload = match kind {
            NodeKind::File => {
                let mut hasher = Sha256::new();
                io::copy(&mut entry, &mut hasher)?;
                Payload::Content(hasher.finalize().into())
            }
            NodeKind::Symlink => Payload::Link(
                entry
                    .link_name_bytes()
                    .map(|target| target.into_owned())
                    .unwrap_or_default(),
            ),
            NodeKind::HardLink => Payload::Link(
                entry
                    .link_name_bytes()
                    .map(|target| normalize_path(&target).into_bytes())
                    .unwrap_or_default(),
            ),
            // Only device entries carry device numbers; GNU tar leaves the
            // fields NUL-filled on everything else.
            NodeKind::CharDevice | NodeKind::BlockDevice => Payload::Device(
                header.device_major()?.unwrap_or(0),
                header.device_minor()?.unwrap_or(0),
            ),
            NodeKind::Directory | NodeKind::Fifo => Payload::Empty,
        };

        // Later entries for a path replace earlier ones, as on extraction.
        tree.insert(
            path,
            FsNode {
                kind,
                mode,
                uid,
                gid,
                payload,
                xattrs,
            },
        );
    }

    Ok(tree)
}

/// Strip `./`, leading and trailing slashes and empty components.
fn normalize_path(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

fn hash_tree(tree: &BTreeMap<String, FsNode>) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, TREE_VERSION);
    hasher.update((tree.len() as u64).to_be_bytes());

    for (path, node) in tree {
        update_field(&mut hasher, path.as_bytes());
        hasher.update([node.kind as u8]);
        hasher.update(node.mode.to_be_bytes());
        hasher.update(node.uid.to_be_bytes());
        hasher.update(node.gid.to_be_bytes());

        match &node.payload {
            Payload::Empty => hasher.update([0u8]),
            Payload::Content(digest) => {
                hasher.update([1u8]);
                hasher.update(digest);
            }
            Payload::Link(target) => {
                hasher.update([2u8]);
                update_field(&mut hasher, target);
            }
            Payload::Device(major, minor) => {
                hasher.update([3u8]);
                hasher.update(major.to_be_bytes());
                hasher.update(minor.to_be_bytes());
            }
        }

        hasher.update((node.xattrs.len() as u64).to_be_bytes());
        for (name, value) in &node.xattrs {
            update_field(&mut hasher, name.as_bytes());
            update_field(&mut hasher, value);
        }
    }

    hex::encode(hasher.finalize())
}
