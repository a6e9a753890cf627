use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{LicenseError, LicenseResult};

/// Replaces the file at `path` with `bytes` so that readers see either the
/// old content or the new one, never a partial write.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> LicenseResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| LicenseError::io(dir, e))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| LicenseError::io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| LicenseError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| LicenseError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| LicenseError::io(path, e.error))?;
    Ok(())
}
