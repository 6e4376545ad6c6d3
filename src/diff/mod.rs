//! Filesystem change-sets and path masking.
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Extra detail attached to a change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMeta {
    /// The entry changed file type, so nothing of its previous incarnation
    /// (including a directory's old children) survives.
    pub replaced: bool,
}

/// One path-level difference between a baseline and a rootfs.
///
/// `path` is absolute within the rootfs (`/etc/passwd`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub path: PathBuf,
    pub kind: ChangeKind,
    #[serde(default)]
    pub meta: ChangeMeta,
}

impl Change {
    pub fn new<P: Into<PathBuf>>(path: P, kind: ChangeKind) -> Self {
        Self {
            path: rooted(&path.into()),
            kind,
            meta: ChangeMeta::default(),
        }
    }

    pub fn replaced(mut self) -> Self {
        self.meta.replaced = true;
        self
    }
}

/// Produces the ordered change-set of a rootfs.
///
/// Implementations must emit parents before their children.
pub trait ChangeDetector {
    fn changes(&self, rootfs: &Path) -> Result<Vec<Change>>;
}

/// Lexically normalises `path` into an absolute path.
///
/// Relative paths are taken as relative to `/`, `.` is dropped and `..`
/// never climbs above the root.
pub fn rooted(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(name) => out.push(name),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Drops every change at or below one of `masks`, keeping the rest in order.
///
/// Matching is per path segment, so `/foo` masks `/foo/bar` but not `/foo2`.
pub fn filter<P: AsRef<Path>>(changes: Vec<Change>, masks: &[P]) -> Vec<Change> {
    let masks: Vec<PathBuf> = masks.iter().map(|m| rooted(m.as_ref())).collect();
    changes
        .into_iter()
        .filter(|change| {
            let path = rooted(&change.path);
            let masked = masks.iter().any(|mask| path.starts_with(mask));
            if masked {
                tracing::debug!("Masking change to {}", change.path.display());
            }
            !masked
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(changes: &[Change]) -> Vec<&str> {
        changes
            .iter()
            .map(|c| c.path.to_str().unwrap())
            .collect()
    }

    #[test]
    fn test_filter_is_segment_aware() {
        let changes = vec![
            Change::new("/a", ChangeKind::Modified),
            Change::new("/a/b", ChangeKind::Added),
            Change::new("/ab", ChangeKind::Added),
            Change::new("/c", ChangeKind::Removed),
        ];
        let filtered = filter(changes, &["/a"]);
        assert_eq!(paths(&filtered), vec!["/ab", "/c"]);
    }

    #[test]
    fn test_filter_relative_masks_are_rooted() {
        let changes = vec![
            Change::new("/var/lib/data/x", ChangeKind::Added),
            Change::new("/var/lib/other", ChangeKind::Added),
        ];
        let filtered = filter(changes, &["var/lib/data/"]);
        assert_eq!(paths(&filtered), vec!["/var/lib/other"]);
    }

    #[test]
    fn test_filter_without_masks_keeps_order() {
        let changes = vec![
            Change::new("/z", ChangeKind::Added),
            Change::new("/a", ChangeKind::Removed),
        ];
        let filtered = filter(changes.clone(), &[] as &[&str]);
        assert_eq!(filtered, changes);
    }

    #[test]
    fn test_filter_normalises_change_paths() {
        let changes = vec![
            Change {
                path: PathBuf::from("/a/./b"),
                kind: ChangeKind::Added,
                meta: ChangeMeta::default(),
            },
            Change {
                path: PathBuf::from("a/c"),
                kind: ChangeKind::Removed,
                meta: ChangeMeta::default(),
            },
            Change::new("/d", ChangeKind::Added),
        ];
        let filtered = filter(changes, &["/a"]);
        assert_eq!(paths(&filtered), vec!["/d"]);
    }

    #[test]
    fn test_rooted() {
        assert_eq!(rooted(Path::new("a/./b/../c")), PathBuf::from("/a/c"));
        assert_eq!(rooted(Path::new("/../..")), PathBuf::from("/"));
        assert_eq!(Change::new("etc", ChangeKind::Added).path, PathBuf::from("/etc"));
    }
}
