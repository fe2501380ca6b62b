//! Filesystem helpers shared by everything that persists state

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace `path` with `contents` so readers never observe a partial file.
///
/// The bytes go to a sibling `.tmp` file which is flushed and then renamed
/// over the destination. Parent directories are created as needed.
///
/// # Errors
/// Returns the underlying I/O error; the destination is untouched on failure.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = staging_path(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        match fs::remove_file(&tmp) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                tracing::warn!("Could not remove staging file {}: {}", tmp.display(), e);
            }
            _ => {}
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/ledger.yml");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_failed_write_keeps_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.yml");
        write_atomic(&path, b"first").unwrap();
        // a directory in the staging slot makes the write fail and resists cleanup
        fs::create_dir(staging_path(&path)).unwrap();

        assert!(write_atomic(&path, b"second").is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");
        assert!(staging_path(&path).is_dir());
    }
}
