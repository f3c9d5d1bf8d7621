use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

/// Write-then-rename: every downloaded/verified file is written to a
/// sibling temp file and persisted into place only after the caller has
/// confirmed its checksum, so a crash mid-write never leaves a file that
/// looks verified but isn't.
pub fn atomic_write(target: &Path, data: &[u8]) -> Result<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).with_context(|| format!("create dir {}", parent.display()))?;
    let mut tmp = NamedTempFile::new_in(parent).context("create temp file")?;
    tmp.write_all(data).context("write temp file")?;
    tmp.as_file().sync_all().ok();
    tmp.persist(target)
        .with_context(|| format!("rename to {}", target.display()))?;
    Ok(())
}
