//! Directory-backed engine over an OCI image layout.
//!
//! ```text
//! <root>/
//!   oci-layout
//!   index.json
//!   blobs/<alg>/<hex>
//!   .repack-XXXXXX/     one per open engine, flock'd while it lives
//! ```
use super::{Engine, StoreConfig, canonical_json, copy_chunked};
use crate::{
    cancel::CancelToken,
    digest::{Digest, DigestAlgorithm, DigestReader, VerifiedReader},
    error::{Error, Result},
    image::Index,
    util::fsync_dir,
};
use rustix::fs::{FlockOperation, flock};
use serde::{Deserialize, Serialize};
use std::{
    fs::{self, File},
    io::{self, BufReader, Read, Write},
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use tempfile::{NamedTempFile, TempDir};

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const TEMP_PREFIX: &str = ".repack-";
const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
struct ImageLayout {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// Creates a fresh, empty image layout at `path`.
///
/// The directory may already exist but must not already contain a layout.
#[tracing::instrument(level = "debug")]
pub fn create_layout(path: &Path, config: StoreConfig) -> Result<()> {
    fs::create_dir_all(path)?;
    let layout_path = path.join(LAYOUT_FILE);
    if layout_path.exists() {
        return Err(Error::Clobber(format!(
            "{} already contains an image layout",
            path.display()
        )));
    }

    fs::create_dir_all(path.join(BLOBS_DIR).join(config.digest_algorithm.name()))?;

    let index = canonical_json(&Index::default())?;
    fs::write(path.join(INDEX_FILE), index)?;

    let layout = serde_json::to_vec(&ImageLayout {
        image_layout_version: IMAGE_LAYOUT_VERSION.to_owned(),
    })?;
    fs::write(&layout_path, layout)?;
    fsync_dir(path)?;

    tracing::info!("Created image layout at {}", path.display());
    Ok(())
}

/// The private scratch directory of one open engine.
///
/// The lock is held on the directory itself for as long as the engine is
/// open, which is how [`DirEngine::clean`] tells live directories from stale
/// ones.
struct EngineTemp {
    lock: File,
    dir: TempDir,
}

impl EngineTemp {
    /// Attempts before giving up on racing cleaners.
    const CREATE_ATTEMPTS: usize = 8;

    fn create(root: &Path) -> Result<Self> {
        for _ in 0..Self::CREATE_ATTEMPTS {
            let dir = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempdir_in(root)?;
            if let Some(temp) = Self::lock(dir)? {
                return Ok(temp);
            }
        }
        Err(Error::Io(io::Error::other(format!(
            "could not claim a temp dir in {} after {} attempts",
            root.display(),
            Self::CREATE_ATTEMPTS
        ))))
    }

    /// Locks a freshly created temp dir.
    ///
    /// The dir is visible to [`DirEngine::clean`] before the lock is taken, so
    /// a cleaner may remove it first. Returns `None` when that happened, after
    /// checking that the locked inode is still the one at the dir's path.
    fn lock(dir: TempDir) -> Result<Option<Self>> {
        let lock = match File::open(dir.path()) {
            Ok(lock) => lock,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("Temp dir {} vanished before locking", dir.path().display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = flock(&lock, FlockOperation::NonBlockingLockExclusive) {
            // Held by a cleaner that is about to remove it.
            tracing::debug!("Temp dir {} is locked ({e})", dir.path().display());
            return Ok(None);
        }

        let locked = lock.metadata()?;
        let current = match fs::symlink_metadata(dir.path()) {
            Ok(current) => current,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("Temp dir {} removed while locking", dir.path().display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if (locked.dev(), locked.ino()) != (current.dev(), current.ino()) {
            return Ok(None);
        }
        Ok(Some(Self { lock, dir }))
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn close(self) -> Result<()> {
        let Self { lock, dir } = self;
        dir.close()?;
        drop(lock);
        Ok(())
    }
}

pub struct DirEngine {
    root: PathBuf,
    config: StoreConfig,
    temp: Option<EngineTemp>,
}

impl DirEngine {
    /// Opens the image layout at `root`.
    ///
    /// Fails with [`Error::Invalid`] if `root` is not an image layout of a
    /// supported version. Never creates layout files, see [`create_layout`].
    #[tracing::instrument(level = "debug", skip(config))]
    pub fn open(root: &Path, config: StoreConfig) -> Result<Self> {
        let layout_path = root.join(LAYOUT_FILE);
        let data = match fs::read(&layout_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::Invalid(format!(
                    "{} is not an image layout: missing {LAYOUT_FILE}",
                    root.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let layout: ImageLayout = serde_json::from_slice(&data)
            .map_err(|e| Error::Invalid(format!("malformed {LAYOUT_FILE}: {e}")))?;
        if layout.image_layout_version != IMAGE_LAYOUT_VERSION {
            return Err(Error::Invalid(format!(
                "unsupported image layout version {}",
                layout.image_layout_version
            )));
        }

        let temp = EngineTemp::create(root)?;
        tracing::debug!("Opened image layout, scratch dir {}", temp.path().display());
        Ok(Self {
            root: root.to_path_buf(),
            config,
            temp: Some(temp),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn temp(&self) -> Result<&EngineTemp> {
        self.temp.as_ref().ok_or(Error::Closed)
    }

    fn blobs_path(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_path()
            .join(digest.algorithm().name())
            .join(digest.encoded())
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    /// Moves a fully written temp file to `target`, syncing it first.
    fn publish(temp: NamedTempFile, target: &Path) -> Result<()> {
        rustix::fs::fsync(temp.as_file()).map_err(io::Error::from)?;
        temp.persist(target).map_err(|e| e.error)?;
        if let Some(parent) = target.parent() {
            fsync_dir(parent)?;
        }
        Ok(())
    }
}

impl Engine for DirEngine {
    fn algorithm(&self) -> DigestAlgorithm {
        self.config.digest_algorithm
    }

    #[tracing::instrument(level = "debug", skip_all)]
    fn put_blob(&self, ctx: &CancelToken, reader: &mut dyn Read) -> Result<(Digest, u64)> {
        ctx.check()?;
        let temp = self.temp()?;

        let mut file = NamedTempFile::new_in(temp.path())?;
        let mut hashing = DigestReader::new(reader, self.algorithm());
        copy_chunked(ctx, &mut hashing, file.as_file_mut())?;
        file.as_file_mut().flush()?;
        let (digest, size) = hashing.finish();

        let target = self.blob_path(&digest);
        if target.exists() {
            tracing::debug!(%digest, "Blob already present");
            return Ok((digest, size));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        ctx.check()?;
        Self::publish(file, &target)?;

        tracing::debug!(%digest, size, "Stored blob");
        Ok((digest, size))
    }

    #[tracing::instrument(level = "debug", skip_all)]
    fn put_index(&self, ctx: &CancelToken, index: &Index) -> Result<()> {
        ctx.check()?;
        let temp = self.temp()?;

        let data = canonical_json(index)?;
        let mut file = NamedTempFile::new_in(temp.path())?;
        copy_chunked(ctx, &mut data.as_slice(), file.as_file_mut())?;
        Self::publish(file, &self.index_path())?;

        tracing::debug!(entries = index.manifests.len(), "Replaced index");
        Ok(())
    }

    fn get_blob(&self, ctx: &CancelToken, digest: &Digest) -> Result<Box<dyn Read + Send>> {
        ctx.check()?;
        self.temp()?;

        let file = match File::open(self.blob_path(digest)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(digest.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::new(VerifiedReader::new(
            BufReader::new(file),
            digest.clone(),
        )))
    }

    fn get_index(&self, ctx: &CancelToken) -> Result<Index> {
        ctx.check()?;
        self.temp()?;

        let data = match fs::read(self.index_path()) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Index::default()),
            Err(e) => return Err(e.into()),
        };
        let index: Index = serde_json::from_slice(&data)
            .map_err(|e| Error::Invalid(format!("malformed {INDEX_FILE}: {e}")))?;
        if index.schema_version != 2 {
            return Err(Error::Invalid(format!(
                "unsupported index schema version {}",
                index.schema_version
            )));
        }
        Ok(index)
    }

    fn delete_blob(&self, ctx: &CancelToken, digest: &Digest) -> Result<()> {
        ctx.check()?;
        self.temp()?;

        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => {
                tracing::debug!(%digest, "Deleted blob");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_blobs(&self, ctx: &CancelToken) -> Result<Vec<Digest>> {
        ctx.check()?;
        self.temp()?;

        let algorithms = match fs::read_dir(self.blobs_path()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut digests = Vec::new();
        for entry in algorithms {
            let entry = entry?;
            let Some(algorithm) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<DigestAlgorithm>().ok())
            else {
                tracing::debug!("Skipping unknown blob directory {}", entry.path().display());
                continue;
            };
            for blob in fs::read_dir(entry.path())? {
                ctx.check()?;
                let blob = blob?;
                let name = blob.file_name();
                match name.to_str().map(|hex| Digest::new(algorithm, hex)) {
                    Some(Ok(digest)) => digests.push(digest),
                    _ => tracing::debug!("Skipping stray file {}", blob.path().display()),
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    fn clean(&self, ctx: &CancelToken) -> Result<()> {
        ctx.check()?;
        let own = self.temp()?.path();

        for entry in fs::read_dir(&self.root)? {
            ctx.check()?;
            let entry = entry?;
            let path = entry.path();
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(TEMP_PREFIX));
            if !is_temp || path == own || !entry.file_type()?.is_dir() {
                continue;
            }

            let handle = match File::open(&path) {
                Ok(handle) => handle,
                // Removed by another cleaner in the meantime.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if let Err(e) = flock(&handle, FlockOperation::NonBlockingLockExclusive) {
                tracing::debug!("Temp dir {} is in use ({e}), leaving it", path.display());
                continue;
            }

            tracing::info!("Removing stale temp dir {}", path.display());
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let temp = self.temp.take().ok_or(Error::Closed)?;
        temp.close()
    }
}
