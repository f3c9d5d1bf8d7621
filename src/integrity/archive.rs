use std::fs::File;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};

/// Lexically normalize a path (collapse `.`/`..` without touching the
/// filesystem). Used instead of `Path::canonicalize` because destination
/// paths for not-yet-extracted entries don't exist yet.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `member_path` against `containing_dir` and check it stays inside
/// `target_resolved`.
fn destination_within(
    target_resolved: &Path,
    containing_dir: &Path,
    member_path: &Path,
) -> bool {
    if member_path.is_absolute() {
        return false;
    }
    let resolved = normalize(&containing_dir.join(member_path));
    resolved.starts_with(target_resolved)
}

/// Extract a `.tar.gz` archive into `target`, rejecting any member whose
/// destination (or, for symlinks, whose link target) would land outside
/// `target`. Defends against path traversal and absolute-path entries.
pub fn safe_extract_tar_gz(archive_path: &Path, target: &Path) -> Result<()> {
    std::fs::create_dir_all(target)
        .with_context(|| format!("create target dir {}", target.display()))?;
    let target_resolved = normalize(
        &std::env::current_dir()
            .context("resolve current dir")?
            .join(target),
    );

    let file = File::open(archive_path)
        .with_context(|| format!("open archive {}", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    for entry in archive
        .entries()
        .with_context(|| format!("read archive entries {}", archive_path.display()))?
    {
        let mut entry = entry.context("read archive entry")?;
        let entry_path = entry.path().context("read entry path")?.into_owned();

        if !destination_within(&target_resolved, &target_resolved, &entry_path) {
            bail!("Unsafe tar entry path: {:?}", entry_path);
        }

        let entry_type = entry.header().entry_type();
        if matches!(entry_type, EntryType::Symlink | EntryType::Link) {
            let link_name = entry
                .link_name()
                .context("read entry link name")?
                .ok_or_else(|| anyhow::anyhow!("Unsafe tar entry: missing link target"))?
                .into_owned();
            let containing_dir = normalize(&target_resolved.join(&entry_path))
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| target_resolved.clone());
            if !destination_within(&target_resolved, &containing_dir, &link_name) {
                bail!(
                    "Unsafe tar entry: link {:?} target {:?} escapes extraction root",
                    entry_path,
                    link_name
                );
            }
        }

        entry
            .unpack_in(target)
            .with_context(|| format!("extract entry {:?}", entry_path))?;
    }

    Ok(())
}
