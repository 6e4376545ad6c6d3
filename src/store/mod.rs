//! Content-addressable storage for OCI images.
//!
//! An [`Engine`] stores immutable blobs keyed by their digest plus a single
//! mutable top-level [`Index`]. Named references are not a separate store:
//! they are entries of that index, see [`reference`].
//!
//! Two backends exist: [`dir::DirEngine`] for an on-disk OCI image layout
//! and [`memory::MemoryEngine`], which keeps everything in memory.
pub mod dir;
pub mod memory;
pub mod reference;
#[cfg(test)]
mod tests;

pub use dir::{DirEngine, create_layout};
pub use memory::MemoryEngine;
pub use reference::References;

use crate::{
    cancel::CancelToken,
    digest::{Digest, DigestAlgorithm},
    error::{Error, Result},
    image::{
        Descriptor, DescriptorPath, ImageConfig, Index, MEDIA_TYPE_IMAGE_CONFIG,
        MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST, Manifest,
    },
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::io::{self, Read, Write};

/// Size of the buffer used when streaming blobs in and out of a store.
const COPY_CHUNK_SIZE: usize = 32 * 1024;

/// Nested indexes deeper than this are treated as malformed.
const MAX_INDEX_DEPTH: usize = 16;

/// Store-wide settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub digest_algorithm: DigestAlgorithm,
}

/// A content-addressable blob store with a single top-level index.
///
/// Every operation takes a [`CancelToken`] and returns [`Error::Cancelled`]
/// once it has been cancelled. After [`Engine::close`] every operation fails
/// with [`Error::Closed`].
pub trait Engine: Send + Sync {
    /// The algorithm blobs written through this engine are hashed with.
    fn algorithm(&self) -> DigestAlgorithm;

    /// Streams `reader` into the store and returns the digest and size of
    /// what was written. Writing a blob that already exists is a no-op.
    fn put_blob(&self, ctx: &CancelToken, reader: &mut dyn Read) -> Result<(Digest, u64)>;

    /// Atomically replaces the top-level index.
    fn put_index(&self, ctx: &CancelToken, index: &Index) -> Result<()>;

    /// Opens a blob for reading. The reader fails at EOF if the content
    /// does not match `digest`.
    fn get_blob(&self, ctx: &CancelToken, digest: &Digest) -> Result<Box<dyn Read + Send>>;

    /// Reads the top-level index. A store without one reads as empty.
    fn get_index(&self, ctx: &CancelToken) -> Result<Index>;

    /// Removes a blob. Deleting a missing blob succeeds.
    fn delete_blob(&self, ctx: &CancelToken, digest: &Digest) -> Result<()>;

    /// A snapshot of every blob currently in the store.
    fn list_blobs(&self, ctx: &CancelToken) -> Result<Vec<Digest>>;

    /// Removes leftovers from engines that exited without closing.
    ///
    /// Never touches blobs, the index, or anything owned by a live engine.
    fn clean(&self, ctx: &CancelToken) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Helpers built on top of the raw [`Engine`] operations.
pub trait EngineExt: Engine {
    /// Serialises `value` canonically and stores it.
    fn put_blob_json<T: Serialize + ?Sized>(
        &self,
        ctx: &CancelToken,
        value: &T,
    ) -> Result<(Digest, u64)> {
        let data = canonical_json(value)?;
        self.put_blob(ctx, &mut data.as_slice())
    }

    /// Reads a whole blob, verifying its digest.
    fn read_blob(&self, ctx: &CancelToken, digest: &Digest) -> Result<Vec<u8>> {
        let mut reader = self.get_blob(ctx, digest)?;
        let mut data = Vec::new();
        copy_chunked(ctx, &mut reader, &mut data).map_err(|e| match e {
            Error::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
                Error::Invalid(format!("blob {digest}: {e}"))
            }
            other => other,
        })?;
        Ok(data)
    }

    fn get_blob_json<T: DeserializeOwned>(&self, ctx: &CancelToken, digest: &Digest) -> Result<T> {
        let data = self.read_blob(ctx, digest)?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::Invalid(format!("blob {digest} is not valid JSON: {e}")))
    }

    fn read_manifest(&self, ctx: &CancelToken, descriptor: &Descriptor) -> Result<Manifest> {
        expect_media_type(descriptor, MEDIA_TYPE_IMAGE_MANIFEST)?;
        self.get_blob_json(ctx, &descriptor.digest)
    }

    fn read_config(&self, ctx: &CancelToken, descriptor: &Descriptor) -> Result<ImageConfig> {
        if descriptor.media_type != MEDIA_TYPE_IMAGE_CONFIG {
            return Err(Error::Invalid(format!(
                "config descriptor {} has media type {}",
                descriptor.digest, descriptor.media_type
            )));
        }
        self.get_blob_json(ctx, &descriptor.digest)
    }

    fn read_index_blob(&self, ctx: &CancelToken, descriptor: &Descriptor) -> Result<Index> {
        expect_media_type(descriptor, MEDIA_TYPE_IMAGE_INDEX)?;
        self.get_blob_json(ctx, &descriptor.digest)
    }

    /// Every path from an index entry named `name` down to an image manifest.
    ///
    /// Nested indexes are walked. Descriptors of unknown media types are
    /// skipped. An unknown name resolves to an empty list.
    #[tracing::instrument(level = "debug", skip(self, ctx))]
    fn resolve_reference(&self, ctx: &CancelToken, name: &str) -> Result<Vec<DescriptorPath>> {
        let index = self.get_index(ctx)?;
        let mut resolved = Vec::new();
        for entry in index.manifests.iter().filter(|d| d.ref_name() == Some(name)) {
            walk_to_manifests(self, ctx, DescriptorPath::new(entry.clone()), &mut resolved, 0)?;
        }
        tracing::debug!(count = resolved.len(), "Resolved reference");
        Ok(resolved)
    }
}

impl<E: Engine + ?Sized> EngineExt for E {}

fn walk_to_manifests<E: Engine + ?Sized>(
    engine: &E,
    ctx: &CancelToken,
    path: DescriptorPath,
    out: &mut Vec<DescriptorPath>,
    depth: usize,
) -> Result<()> {
    let descriptor = path.descriptor();
    match descriptor.media_type.as_str() {
        MEDIA_TYPE_IMAGE_MANIFEST => out.push(path),
        MEDIA_TYPE_IMAGE_INDEX => {
            if depth >= MAX_INDEX_DEPTH {
                return Err(Error::Invalid(format!(
                    "index nesting deeper than {MAX_INDEX_DEPTH} at {}",
                    descriptor.digest
                )));
            }
            let index = engine.read_index_blob(ctx, descriptor)?;
            for child in index.manifests {
                walk_to_manifests(engine, ctx, path.child(child), out, depth + 1)?;
            }
        }
        other => {
            tracing::debug!(
                digest = %descriptor.digest,
                media_type = other,
                "Skipping descriptor of unknown media type"
            );
        }
    }
    Ok(())
}

fn expect_media_type(descriptor: &Descriptor, media_type: &str) -> Result<()> {
    if descriptor.media_type != media_type {
        return Err(Error::UnknownType(format!(
            "{} is {}, expected {media_type}",
            descriptor.digest, descriptor.media_type
        )));
    }
    Ok(())
}

/// Canonical JSON encoding: object keys sorted at every level, no whitespace.
///
/// Going through [`serde_json::Value`] sorts keys since its map is ordered.
pub fn canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

/// Copies `reader` into `writer` in fixed-size chunks, checking `ctx` between them.
pub fn copy_chunked<R: Read + ?Sized, W: Write + ?Sized>(
    ctx: &CancelToken,
    reader: &mut R,
    writer: &mut W,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        ctx.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}
