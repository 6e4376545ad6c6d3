//! Recorded filesystem state of a bundle's rootfs.
//!
//! A [`Baseline`] is captured right after a rootfs is bound to an image and
//! stored next to it. Diffing the rootfs against it later yields the
//! change-set a repack turns into a layer.
mod path_key;

use crate::{
    diff::{Change, ChangeDetector, ChangeKind, rooted},
    digest::{Digest, DigestAlgorithm, DigestReader},
    error::{Error, Result},
    util::read_xattrs,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::{self, Write},
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};

const BASELINE_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Directory,
    File,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl EntryKind {
    fn of(file_type: fs::FileType) -> Option<Self> {
        if file_type.is_dir() {
            Some(Self::Directory)
        } else if file_type.is_symlink() {
            Some(Self::Symlink)
        } else if file_type.is_file() {
            Some(Self::File)
        } else if file_type.is_char_device() {
            Some(Self::CharDevice)
        } else if file_type.is_block_device() {
            Some(Self::BlockDevice)
        } else if file_type.is_fifo() {
            Some(Self::Fifo)
        } else if file_type.is_socket() {
            Some(Self::Socket)
        } else {
            None
        }
    }
}

/// Everything recorded about one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub kind: EntryKind,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Digest>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "path_key::option")]
    pub link: Option<PathBuf>,
    #[serde(default)]
    pub rdev: u64,
    /// Digest over the sorted extended attributes, if there are any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xattrs: Option<Digest>,
}

impl EntryRecord {
    fn capture(path: &Path, meta: &fs::Metadata) -> Result<Option<Self>> {
        let Some(kind) = EntryKind::of(meta.file_type()) else {
            return Ok(None);
        };
        let content = if kind == EntryKind::File {
            let mut reader = DigestReader::new(File::open(path)?, DigestAlgorithm::Sha256);
            io::copy(&mut reader, &mut io::sink())?;
            Some(reader.finish().0)
        } else {
            None
        };
        let link = if kind == EntryKind::Symlink {
            Some(fs::read_link(path)?)
        } else {
            None
        };
        Ok(Some(Self {
            kind,
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            size: if kind == EntryKind::File { meta.len() } else { 0 },
            mtime: meta.mtime(),
            mtime_nsec: meta.mtime_nsec(),
            content,
            link,
            rdev: meta.rdev(),
            xattrs: xattrs_digest(path)?,
        }))
    }
}

fn xattrs_digest(path: &Path) -> Result<Option<Digest>> {
    let attrs = match read_xattrs(path) {
        Ok(attrs) => attrs,
        Err(e) if matches!(e.raw_os_error(), Some(libc::EPERM | libc::EACCES)) => {
            tracing::warn!("Cannot read xattrs of {}: {e}", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if attrs.is_empty() {
        return Ok(None);
    }
    let mut digester = DigestAlgorithm::Sha256.digester();
    for (name, value) in &attrs {
        digester.update(name.as_bytes());
        digester.update(&[0]);
        digester.update(&(value.len() as u64).to_le_bytes());
        digester.update(value);
    }
    Ok(Some(digester.finish()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    version: u32,
    #[serde(with = "path_key::map")]
    entries: BTreeMap<PathBuf, EntryRecord>,
}

impl Baseline {
    /// Records the current state of every path under `rootfs`.
    #[tracing::instrument(level = "debug")]
    pub fn capture(rootfs: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(rootfs)?;
        if !meta.is_dir() {
            return Err(Error::Invalid(format!(
                "rootfs {} is not a directory",
                rootfs.display()
            )));
        }

        let walker = jwalk::WalkDir::new(rootfs)
            .follow_links(false)
            .skip_hidden(false)
            .sort(true);

        let mut entries = BTreeMap::new();
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            let path = entry.path();
            let relative = path.strip_prefix(rootfs).unwrap_or(&path);
            let key = rooted(relative);

            let meta = fs::symlink_metadata(&path)?;
            match EntryRecord::capture(&path, &meta)? {
                Some(record) => {
                    tracing::trace!(path = %key.display(), kind = ?record.kind, "Recorded entry");
                    entries.insert(key, record);
                }
                None => tracing::warn!("Not recording {} of unknown type", path.display()),
            }
        }

        tracing::debug!(entries = entries.len(), "Captured baseline");
        Ok(Self {
            version: BASELINE_VERSION,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&EntryRecord> {
        self.entries.get(&rooted(path))
    }

    /// Compares `rootfs` against this baseline.
    ///
    /// Entries come out sorted by path, which puts parents before children.
    /// An entry whose type changed is reported as a replaced modification.
    pub fn diff(&self, rootfs: &Path) -> Result<Vec<Change>> {
        let current = Self::capture(rootfs)?;
        let paths: BTreeSet<&PathBuf> = self
            .entries
            .keys()
            .chain(current.entries.keys())
            .collect();

        let mut changes = Vec::new();
        for path in paths {
            let change = match (self.entries.get(path), current.entries.get(path)) {
                (Some(old), Some(new)) if old.kind != new.kind => {
                    Change::new(path, ChangeKind::Modified).replaced()
                }
                (Some(old), Some(new)) if old != new => Change::new(path, ChangeKind::Modified),
                (Some(_), Some(_)) | (None, None) => continue,
                (None, Some(_)) => Change::new(path, ChangeKind::Added),
                (Some(_), None) => Change::new(path, ChangeKind::Removed),
            };
            tracing::debug!(path = %path.display(), kind = ?change.kind, "Detected change");
            changes.push(change);
        }
        Ok(changes)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let baseline: Self = serde_json::from_slice(&data)
            .map_err(|e| Error::Invalid(format!("malformed baseline {}: {e}", path.display())))?;
        if baseline.version != BASELINE_VERSION {
            return Err(Error::Invalid(format!(
                "unsupported baseline version {}",
                baseline.version
            )));
        }
        Ok(baseline)
    }

    /// Writes the baseline to `path`, replacing any previous file atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer(&mut file, self)?;
        file.flush()?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl ChangeDetector for Baseline {
    fn changes(&self, rootfs: &Path) -> Result<Vec<Change>> {
        self.diff(rootfs)
    }
}
