//! Durability helpers: fsync policy and temp-file-plus-rename replacement.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Fsync policy for data, index and catalog writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync files and the parent directory after every rename.
    Always,
    /// Fsync files, leave directory entries to the OS.
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }

    fn sync_files(self) -> bool {
        self != Self::None
    }

    fn sync_dirs(self) -> bool {
        self == Self::Always
    }
}

/// Flush a file's contents to disk if the policy asks for it.
pub(crate) fn sync_file(file: &File, policy: FsyncPolicy) -> io::Result<()> {
    if policy.sync_files() {
        file.sync_data()?;
    }
    Ok(())
}

/// A unique sibling path for staging a replacement of `dest`.
pub(crate) fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!("{}.tmp-{}", name, uuid::Uuid::new_v4().simple()))
}

/// Atomically move a fully written temp file over `dest`. The temp file is
/// removed if the rename fails.
pub(crate) fn commit_rename(tmp: &Path, dest: &Path, policy: FsyncPolicy) -> io::Result<()> {
    if let Err(e) = fs::rename(tmp, dest) {
        let _ = fs::remove_file(tmp);
        return Err(e);
    }
    if policy.sync_dirs() {
        fsync_parent_dir(dest)?;
    }
    Ok(())
}

/// Write `bytes` to a temp file and rename it over `dest`.
pub(crate) fn replace_file(dest: &Path, bytes: &[u8], policy: FsyncPolicy) -> io::Result<()> {
    let tmp = temp_path(dest);
    let written = (|| {
        fs::write(&tmp, bytes)?;
        if policy.sync_files() {
            File::open(&tmp)?.sync_data()?;
        }
        Ok::<(), io::Error>(())
    })();
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    commit_rename(&tmp, dest, policy)
}

#[cfg(unix)]
fn fsync_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn fsync_parent_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fsync_policy_from_config() {
        assert_eq!(FsyncPolicy::from_str_config("always"), FsyncPolicy::Always);
        assert_eq!(FsyncPolicy::from_str_config("ALWAYS"), FsyncPolicy::Always);
        assert_eq!(FsyncPolicy::from_str_config("none"), FsyncPolicy::None);
        assert_eq!(FsyncPolicy::from_str_config("batch"), FsyncPolicy::Batch);
    }

    #[test]
    fn test_replace_file_overwrites_atomically() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("target.bin");

        replace_file(&dest, b"first", FsyncPolicy::Always).unwrap();
        replace_file(&dest, b"second", FsyncPolicy::Always).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second");

        // No staging files are left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_temp_paths_are_unique_siblings() {
        let dest = Path::new("/some/dir/key.index");
        let a = temp_path(dest);
        let b = temp_path(dest);
        assert_ne!(a, b);
        assert_eq!(a.parent(), dest.parent());
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("key.index.tmp-"));
    }

    #[test]
    fn test_failed_rename_cleans_up() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("staged");
        fs::write(&tmp, b"x").unwrap();
        let dest = dir.path().join("missing-dir").join("dest");
        assert!(commit_rename(&tmp, &dest, FsyncPolicy::None).is_err());
        assert!(!tmp.exists());
    }
}
