//! Tar emission for a change-set.
use super::idmap::MapOptions;
use crate::{
    cancel::CancelToken,
    diff::{Change, ChangeKind, rooted},
    error::{Error, Result},
    util::read_xattrs,
};
use std::{
    collections::{HashMap, HashSet},
    ffi::OsString,
    fs::{self, File, Metadata},
    io::{self, Read, Write},
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
};
use tar::{Builder, EntryType, Header};

/// Prefix marking a whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Name of the marker hiding every lower entry of a directory.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Writes the layer archive for `changes` into `writer` and returns it.
///
/// `changes` must be ordered parents first. Removed paths become whiteouts,
/// everything else is read from `rootfs` with ownership translated through
/// `options`.
#[tracing::instrument(level = "debug", skip_all, fields(rootfs = %rootfs.display(), changes = changes.len()))]
pub fn write_layer<W: Write>(
    ctx: &CancelToken,
    rootfs: &Path,
    changes: &[Change],
    options: &MapOptions,
    writer: W,
) -> Result<W> {
    let mut packer = Packer {
        rootfs,
        options,
        builder: Builder::new(writer),
        hardlinks: HashMap::new(),
        covered: HashSet::new(),
    };
    for change in changes {
        ctx.check()?;
        packer.add(change)?;
    }
    Ok(packer.builder.into_inner()?)
}

struct Packer<'a, W: Write> {
    rootfs: &'a Path,
    options: &'a MapOptions,
    builder: Builder<W>,
    /// First archive name seen for each multiply-linked inode.
    hardlinks: HashMap<(u64, u64), PathBuf>,
    /// Paths whose lower contents are already hidden (whited out, made
    /// opaque or replaced by another file type).
    covered: HashSet<PathBuf>,
}

impl<W: Write> Packer<'_, W> {
    fn add(&mut self, change: &Change) -> Result<()> {
        let path = rooted(&change.path);
        match change.kind {
            ChangeKind::Removed => self.add_whiteout(&path),
            ChangeKind::Added | ChangeKind::Modified => {
                self.add_entry(&path, change.meta.replaced)?;
                if change.meta.replaced {
                    self.covered.insert(path);
                }
                Ok(())
            }
        }
    }

    /// Whether a strict ancestor of `path` already hides it.
    fn is_covered(&self, path: &Path) -> bool {
        path.ancestors().skip(1).any(|a| self.covered.contains(a))
    }

    fn add_whiteout(&mut self, path: &Path) -> Result<()> {
        if self.is_covered(path) {
            tracing::debug!("{} is already hidden, no whiteout needed", path.display());
            return Ok(());
        }
        let archived = archive_name(path);
        let (Some(parent), Some(name)) = (archived.parent(), path.file_name()) else {
            return Err(Error::Invalid(format!(
                "cannot white out {}",
                path.display()
            )));
        };

        let mut whiteout_name = OsString::from(WHITEOUT_PREFIX);
        whiteout_name.push(name);
        let whiteout = parent.join(whiteout_name);
        tracing::debug!("Whiteout {}", whiteout.display());
        self.append_marker(&whiteout)?;

        self.covered.insert(path.to_path_buf());
        Ok(())
    }

    /// Appends an empty regular file used as a whiteout marker.
    fn append_marker(&mut self, name: &Path) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(0);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        self.builder.append_data(&mut header, name, io::empty())?;
        Ok(())
    }

    fn add_entry(&mut self, path: &Path, replaced: bool) -> Result<()> {
        let name = archive_name(path);
        if name.as_os_str().is_empty() {
            tracing::debug!("Skipping rootfs root directory");
            return Ok(());
        }

        let fs_path = self.rootfs.join(&name);
        let meta = match fs::symlink_metadata(&fs_path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!(
                    "{} changed but is no longer in the rootfs",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let file_type = meta.file_type();
        if file_type.is_socket() {
            tracing::warn!("Skipping socket {}", path.display());
            return Ok(());
        }
        let known = file_type.is_dir()
            || file_type.is_symlink()
            || file_type.is_file()
            || file_type.is_char_device()
            || file_type.is_block_device()
            || file_type.is_fifo();
        if !known {
            tracing::warn!("Skipping {} of unknown type", path.display());
            return Ok(());
        }

        let mut header = self.header_for(&meta).map_err(|e| {
            Error::Invalid(format!("ownership of {}: {}", path.display(), e.root()))
        })?;
        self.append_xattrs(&fs_path)?;

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            self.builder.append_data(&mut header, &name, io::empty())?;
        } else if file_type.is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            let target = fs::read_link(&fs_path)?;
            self.builder.append_link(&mut header, &name, &target)?;
        } else if file_type.is_file() {
            self.append_file(&mut header, &name, &fs_path, &meta)?;
        } else if file_type.is_char_device() || file_type.is_block_device() {
            header.set_entry_type(if file_type.is_char_device() {
                EntryType::Char
            } else {
                EntryType::Block
            });
            let rdev = meta.rdev();
            header.set_device_major(rustix::fs::major(rdev))?;
            header.set_device_minor(rustix::fs::minor(rdev))?;
            self.builder.append_data(&mut header, &name, io::empty())?;
        } else {
            header.set_entry_type(EntryType::Fifo);
            self.builder.append_data(&mut header, &name, io::empty())?;
        }
        tracing::debug!("Added {}", name.display());

        if file_type.is_dir() && replaced {
            let marker = name.join(OPAQUE_WHITEOUT);
            tracing::debug!("Opaque marker {}", marker.display());
            self.append_marker(&marker)?;
        }
        Ok(())
    }

    fn header_for(&self, meta: &Metadata) -> Result<Header> {
        let mut header = Header::new_gnu();
        header.set_mode(meta.mode() & 0o7777);
        header.set_uid(u64::from(self.options.host_uid(meta.uid())?));
        header.set_gid(u64::from(self.options.host_gid(meta.gid())?));
        header.set_mtime(u64::try_from(meta.mtime()).unwrap_or(0));
        header.set_size(0);
        Ok(header)
    }

    fn append_file(
        &mut self,
        header: &mut Header,
        name: &Path,
        fs_path: &Path,
        meta: &Metadata,
    ) -> Result<()> {
        if meta.nlink() > 1 {
            let key = (meta.dev(), meta.ino());
            if let Some(first) = self.hardlinks.get(&key) {
                header.set_entry_type(EntryType::Link);
                self.builder.append_link(header, name, first)?;
                return Ok(());
            }
            self.hardlinks.insert(key, name.to_path_buf());
        }

        header.set_entry_type(EntryType::Regular);
        header.set_size(meta.len());
        let file = File::open(fs_path)?;
        let mut content = SizedReader {
            inner: file.take(meta.len()),
            remaining: meta.len(),
            path: fs_path,
        };
        self.builder.append_data(header, name, &mut content)?;
        Ok(())
    }

    fn append_xattrs(&mut self, fs_path: &Path) -> Result<()> {
        let attrs = match read_xattrs(fs_path) {
            Ok(attrs) => attrs,
            Err(e)
                if self.options.rootless
                    && matches!(e.raw_os_error(), Some(libc::EPERM | libc::EACCES)) =>
            {
                tracing::warn!(
                    "Skipping unreadable xattrs of {} in rootless mode: {e}",
                    fs_path.display()
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if attrs.is_empty() {
            return Ok(());
        }

        let keys: Vec<String> = attrs
            .iter()
            .map(|(name, _)| format!("SCHILY.xattr.{name}"))
            .collect();
        self.builder.append_pax_extensions(
            keys.iter()
                .map(String::as_str)
                .zip(attrs.iter().map(|(_, value)| value.as_slice())),
        )?;
        Ok(())
    }
}

/// Guards against a file shrinking between `stat` and reading it, which
/// would otherwise produce an entry shorter than its header claims.
struct SizedReader<'a, R> {
    inner: R,
    remaining: u64,
    path: &'a Path,
}

impl<R: Read> Read for SizedReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && self.remaining > 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} shrank while being archived", self.path.display()),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// The name of `path` inside the archive: relative, without a leading `/`.
fn archive_name(path: &Path) -> PathBuf {
    path.strip_prefix("/").unwrap_or(path).to_path_buf()
}
