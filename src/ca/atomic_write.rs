//! Atomic, create-new file writes for CA key material.
//!
//! `fs::rename` can silently overwrite an existing file on Unix, so an
//! existing CA key must never be clobbered by a racing "regenerate". The
//! approach: write to a uniquely-named temp file, fsync it, then hard-link
//! it into place (hard-link fails with `AlreadyExists` instead of
//! overwriting). Falls back to a checked rename if hard-linking isn't
//! supported by the filesystem.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

pub fn write_atomic_create_new(path: &Path, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent directory: {}", path.display()))?;

    let tmp_name = format!(
        ".{}.tmp.{}.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("ca"),
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    let tmp_path = parent.join(tmp_name);

    {
        let mut file = open_create_new_with_mode(&tmp_path, mode)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    let link_result = fs::hard_link(&tmp_path, path);
    match link_result {
        Ok(()) => {
            let _ = fs::remove_file(&tmp_path);
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&tmp_path);
            anyhow::bail!("refusing to overwrite existing file: {}", path.display());
        }
        Err(_) => {
            // Hard links unsupported on this filesystem; fall back to a
            // checked rename. This has a TOCTOU window, acceptable for a
            // private per-user config directory.
            if path.exists() {
                let _ = fs::remove_file(&tmp_path);
                anyhow::bail!("refusing to overwrite existing file: {}", path.display());
            }
            fs::rename(&tmp_path, path)?;
        }
    }

    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }

    Ok(())
}

#[cfg(unix)]
fn open_create_new_with_mode(path: &Path, mode: u32) -> anyhow::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    Ok(OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)?)
}

#[cfg(not(unix))]
fn open_create_new_with_mode(path: &Path, _mode: u32) -> anyhow::Result<File> {
    Ok(OpenOptions::new().write(true).create_new(true).open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_overwrite_existing_file() {
        let dir = std::env::temp_dir().join(format!("langley-atomic-write-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ca.key");

        write_atomic_create_new(&path, b"first", 0o600).unwrap();
        let result = write_atomic_create_new(&path, b"second", 0o600);
        assert!(result.is_err());
        assert_eq!(fs::read(&path).unwrap(), b"first");

        let _ = fs::remove_dir_all(&dir);
    }
}
