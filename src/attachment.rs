//! Attached-document storage: naming, hashing, atomic writes.
//!
//! The store never trusts a caller-supplied path. Attachment names are
//! always regenerated from confirmed deal attributes:
//! `{no}_{date}_{partner with '/' -> '_'}_{price}{ext}`, stored flat
//! inside the owning period's directory.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use crate::error::Result;

/// Upload size cap. Larger payloads are rejected at the store boundary.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Hex-encoded SHA-256 of attachment content.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// File extension including the leading dot, or `""` when absent.
pub fn extension_of(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(file_name);
    match base.rfind('.') {
        // A name like ".gitignore" has no extension.
        Some(idx) if idx > 0 => base[idx..].to_string(),
        _ => String::new(),
    }
}

/// Regenerate the canonical attachment name for a deal version.
pub fn attachment_file_name(
    no: &str,
    deal_date: &str,
    partner: &str,
    price: i64,
    ext: &str,
) -> String {
    format!(
        "{}_{}_{}_{}{}",
        no,
        deal_date,
        partner.replace('/', "_"),
        price,
        ext
    )
}

/// Write `data` atomically: temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });
    fs::write(&tmp, data)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

/// Read a file's bytes together with its modification time.
pub fn read_with_mtime(path: &Path) -> Result<(Vec<u8>, SystemTime)> {
    let bytes = fs::read(path)?;
    let mtime = fs::metadata(path)?.modified()?;
    Ok((bytes, mtime))
}

/// Set a file's modification time (used to preserve the original stamp on
/// copies made during cross-period moves).
pub fn set_mtime(path: &Path, mtime: SystemTime) -> Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(mtime)?;
    Ok(())
}

/// Copy `src` to `dst` atomically, carrying the modification time over.
pub fn copy_preserving_mtime(src: &Path, dst: &Path) -> Result<()> {
    let (bytes, mtime) = read_with_mtime(src)?;
    write_atomic(dst, &bytes)?;
    set_mtime(dst, mtime)?;
    Ok(())
}
