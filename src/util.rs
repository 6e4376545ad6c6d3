use std::ffi::{CStr, CString};
use std::fs::File;
use std::io;
use std::path::Path;

/// Default tag used when an image reference names no tag.
pub const DEFAULT_TAG: &str = "latest";

/// Splits an image reference of the form `<layout>[:<tag>]` into its parts.
///
/// The tag defaults to [`DEFAULT_TAG`]. Only the last `:` separates the tag,
/// and only if what follows contains no `/`, so layout paths may contain colons.
pub fn parse_image_ref(image: &str) -> Result<(String, String), String> {
    let (layout, tag) = match image.rsplit_once(':') {
        Some((layout, tag)) if !tag.contains('/') => (layout, tag),
        _ => (image, DEFAULT_TAG),
    };
    if layout.is_empty() {
        return Err(format!("Invalid image reference: {image}"));
    }
    if tag.is_empty() {
        return Err(format!("Invalid image reference, empty tag: {image}"));
    }
    Ok((layout.to_owned(), tag.to_owned()))
}

/// Flushes a directory's entries to disk, making renames into it durable.
pub fn fsync_dir(dir: &Path) -> io::Result<()> {
    tracing::trace!("Running fsync() on {}", dir.display());
    let handle = File::open(dir)?;
    rustix::fs::fsync(&handle)?;
    Ok(())
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid path"))
}

/// Reads all extended attributes of `path` without following symlinks.
///
/// Filesystems without xattr support yield an empty list.
pub fn read_xattrs(path: &Path) -> io::Result<Vec<(String, Vec<u8>)>> {
    let path_cstr = path_cstring(path)?;

    // SAFETY: `path_cstr` is a valid NUL-terminated string and a null buffer
    // with size 0 only queries the required length.
    let list_size = unsafe { libc::llistxattr(path_cstr.as_ptr(), std::ptr::null_mut(), 0) };
    if list_size < 0 {
        let err = io::Error::last_os_error();
        // ENOTSUP means the filesystem doesn't support xattrs, which is fine
        if err.raw_os_error() == Some(libc::ENOTSUP) {
            return Ok(Vec::new());
        }
        return Err(err);
    }
    if list_size == 0 {
        return Ok(Vec::new());
    }

    let mut names = vec![0u8; list_size.unsigned_abs()];
    // SAFETY: `names` is writable for `names.len()` bytes.
    let actual_size = unsafe {
        libc::llistxattr(
            path_cstr.as_ptr(),
            names.as_mut_ptr().cast::<libc::c_char>(),
            names.len(),
        )
    };
    if actual_size < 0 {
        return Err(io::Error::last_os_error());
    }
    names.truncate(actual_size.unsigned_abs());

    let mut attrs = Vec::new();
    for raw_name in names.split_inclusive(|&b| b == 0) {
        let Ok(name) = CStr::from_bytes_with_nul(raw_name) else {
            continue;
        };
        let value = read_xattr_value(&path_cstr, name)?;
        attrs.push((name.to_string_lossy().into_owned(), value));
    }
    attrs.sort();
    Ok(attrs)
}

fn read_xattr_value(path: &CStr, name: &CStr) -> io::Result<Vec<u8>> {
    // SAFETY: both strings are NUL-terminated; a null buffer with size 0 only
    // queries the value length.
    let value_size =
        unsafe { libc::lgetxattr(path.as_ptr(), name.as_ptr(), std::ptr::null_mut(), 0) };
    if value_size < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut value = vec![0u8; value_size.unsigned_abs()];
    if value.is_empty() {
        return Ok(value);
    }
    // SAFETY: `value` is writable for `value.len()` bytes.
    let actual_size = unsafe {
        libc::lgetxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_mut_ptr().cast::<libc::c_void>(),
            value.len(),
        )
    };
    if actual_size < 0 {
        return Err(io::Error::last_os_error());
    }
    value.truncate(actual_size.unsigned_abs());
    Ok(value)
}
