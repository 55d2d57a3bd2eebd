//! Filesystem helpers

use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Write `bytes` to `path` atomically: write to a temp file in the same
/// directory, then rename over the target. Readers observe either the
/// old content or the new content, never a partial write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| crate::error::SupervisorError::Io(e.error))?;
    Ok(())
}
