//! Atomic file publication
//!
//! `write .part → fsync → rename` is the only way an export file becomes
//! visible. Stale partials from crashed runs are swept before a new run
//! starts.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::ExportResult;

/// Path with the in-progress suffix attached
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// Write `bytes` to `<path>.part`, fsync, then rename onto `path`
pub fn atomic_write(path: &Path, bytes: &[u8]) -> ExportResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp = part_path(path);
    let result = (|| {
        let mut file = File::create(&temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Fsync and publish a `.part` file written by an external writer
pub fn publish_part(temp: &Path, path: &Path) -> ExportResult<()> {
    let file = File::open(temp)?;
    file.sync_all()?;
    fs::rename(temp, path)?;
    Ok(())
}

/// Remove stale `*.part` files left over from prior runs
pub fn cleanup_partials(dir: &Path) -> ExportResult<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("part") {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_leaves_no_partial_behind() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("out.csv");
        atomic_write(&target, b"data").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"data");
        assert!(!part_path(&target).exists());
    }

    #[test]
    fn cleanup_removes_only_partials() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("keep.csv"), b"x").unwrap();
        fs::write(dir.path().join("stale.csv.part"), b"x").unwrap();
        cleanup_partials(dir.path()).unwrap();
        assert!(dir.path().join("keep.csv").exists());
        assert!(!dir.path().join("stale.csv.part").exists());
    }
}
