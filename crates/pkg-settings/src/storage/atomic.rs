//! Atomic file writer.
//!
//! Writes a byte payload so that a reader never observes a partially
//! written file, even after a crash mid-write: the payload goes to a
//! sibling temporary file, is forced durable, and is then renamed over the
//! target. A crash before the rename leaves the original untouched; the
//! filesystem's rename atomicity guarantees old-or-new content during it.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Write `data` to `path` atomically.
///
/// Creates the parent directory if it does not exist. On any failure the
/// previously durable content of `path` is left intact and the temporary
/// file is cleaned up on a best-effort basis.
///
/// # Errors
///
/// Returns `SettingsError::Io` for filesystem errors.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = tmp_sibling(path);
    let write_result = (|| -> std::io::Result<()> {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        // Force the payload durable before it can replace the target.
        file.sync_all()
    })();

    if let Err(e) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    Ok(())
}

/// Sibling temporary path: the target's file name with `.tmp` appended.
///
/// Appending (rather than replacing the extension) keeps distinct targets
/// in one directory from colliding on the same temporary name.
fn tmp_sibling(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| OsString::from("settings"));
    name.push(".tmp");
    path.with_file_name(name)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
