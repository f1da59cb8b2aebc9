//! Small filesystem helpers for crash-safe writes.

use std::fs::File;
use std::io::Write;
use std::path::Path;

/// fsync the directory holding `path` so a rename or create survives power loss.
pub fn sync_parent(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

/// Write `bytes` to `path` through a sibling temp file and an atomic rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        sync_parent(path)
    })();
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Park rejected bytes under `dir/name` for offline inspection.
pub fn quarantine_bytes(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    write_atomic(&dir.join(name), bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"two");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn quarantine_creates_dir() {
        let dir = tempdir().unwrap();
        let q = dir.path().join("quarantine");
        quarantine_bytes(&q, "bad.frame", &[1, 2, 3]).unwrap();
        assert_eq!(std::fs::read(q.join("bad.frame")).unwrap(), vec![1, 2, 3]);
    }
}
