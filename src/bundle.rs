//! Bundle metadata: which image a rootfs was unpacked from.
//!
//! ```text
//! <bundle>/
//!   repack.json                      BundleMeta
//!   rootfs/                          the editable filesystem
//!   sha256_<hex>.baseline.json       baseline, keyed by manifest digest
//! ```
use crate::{
    baseline::Baseline,
    digest::Digest,
    error::{Error, Result},
    image::DescriptorPath,
    layer::MapOptions,
};
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};

pub const BUNDLE_META_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMeta {
    pub version: String,
    /// The manifest the rootfs currently corresponds to.
    pub from: DescriptorPath,
    #[serde(default)]
    pub map_options: MapOptions,
}

impl BundleMeta {
    pub fn new(from: DescriptorPath, map_options: MapOptions) -> Self {
        Self {
            version: BUNDLE_META_VERSION.to_owned(),
            from,
            map_options,
        }
    }
}

pub struct Bundle {
    path: PathBuf,
}

impl Bundle {
    const META_FILE: &'static str = "repack.json";
    const ROOTFS_DIR: &'static str = "rootfs";
    const BASELINE_SUFFIX: &'static str = ".baseline.json";

    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn meta_path(&self) -> PathBuf {
        self.path.join(Self::META_FILE)
    }

    pub fn rootfs_path(&self) -> PathBuf {
        self.path.join(Self::ROOTFS_DIR)
    }

    /// Where the baseline for the manifest `digest` lives.
    pub fn baseline_path(&self, digest: &Digest) -> PathBuf {
        self.path
            .join(format!("{}{}", digest.to_file_stem(), Self::BASELINE_SUFFIX))
    }

    pub fn read_meta(&self) -> Result<BundleMeta> {
        let path = self.meta_path();
        let data = fs::read(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(format!("bundle metadata {}", path.display()))
            } else {
                e.into()
            }
        })?;
        let meta: BundleMeta = serde_json::from_slice(&data)
            .map_err(|e| Error::Invalid(format!("malformed {}: {e}", path.display())))?;
        if meta.version != BUNDLE_META_VERSION {
            return Err(Error::Invalid(format!(
                "unsupported bundle metadata version {}",
                meta.version
            )));
        }
        Ok(meta)
    }

    /// Replaces the bundle metadata atomically.
    pub fn write_meta(&self, meta: &BundleMeta) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&self.path)?;
        serde_json::to_writer_pretty(&mut file, meta)?;
        file.flush()?;
        file.persist(self.meta_path()).map_err(|e| e.error)?;
        tracing::debug!("Wrote bundle metadata to {}", self.meta_path().display());
        Ok(())
    }

    pub fn read_baseline(&self, digest: &Digest) -> Result<Baseline> {
        let path = self.baseline_path(digest);
        if !path.exists() {
            return Err(Error::NotFound(format!("baseline {}", path.display())));
        }
        Baseline::load(&path)
    }

    /// Captures the rootfs as the baseline for manifest `digest`.
    pub fn record_baseline(&self, digest: &Digest) -> Result<Baseline> {
        let baseline = Baseline::capture(&self.rootfs_path())?;
        baseline.save(&self.baseline_path(digest))?;
        tracing::info!(entries = baseline.len(), %digest, "Recorded baseline");
        Ok(baseline)
    }

    /// Removes the baseline for manifest `digest`, if there is one.
    pub fn remove_baseline(&self, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.baseline_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
