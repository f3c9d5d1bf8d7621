use std::path::{Path, PathBuf};

use anyhow::Result;

pub const DEFAULT_REQUIRED_FILES: &[&str] = &[
    "dataset_release_manifest.json",
    "geometry.ffsf",
    "geometry_meta.json",
    "runtime_policy.json",
];

/// Split a version string on `.`, coercing digits to ints. Non-numeric
/// strings sort as the empty vector, i.e. lowest, after all numeric
/// versions (an empty `Vec` is lexicographically smaller than any
/// non-empty one when every element compares equal up to the shorter
/// length).
pub fn parse_version_for_sort(raw: &str) -> Vec<u64> {
    let value = raw.trim();
    let value = value.strip_prefix('v').unwrap_or(value);
    let parts: Vec<&str> = value.split('.').collect();
    if parts.is_empty() || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return Vec::new();
    }
    parts.iter().map(|p| p.parse::<u64>().unwrap_or(0)).collect()
}

pub fn required_files_present(dataset_dir: &Path, required_files: &[&str]) -> Vec<String> {
    required_files
        .iter()
        .filter(|name| !dataset_dir.join(name).exists())
        .map(|s| s.to_string())
        .collect()
}

/// Result of a successful bootstrap resolution (cached or freshly
/// downloaded), mirroring the Python bootstrap dict shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BootstrapState {
    pub country_iso2: String,
    pub dataset_id: String,
    pub dataset_version: String,
    pub dataset_dir: PathBuf,
    pub used_cached_dataset: bool,
    pub dataset_manifest_url: Option<String>,
    pub update_checked: bool,
    pub version_pinned: bool,
}

pub fn validate_cached_dataset_dir(
    dataset_dir: &Path,
    validate_dataset_dir: &dyn Fn(&Path) -> Result<()>,
    required_files: &[&str],
) -> bool {
    if !required_files_present(dataset_dir, required_files).is_empty() {
        return false;
    }
    validate_dataset_dir(dataset_dir).is_ok()
}

/// Scan `cache_root/iso2/dataset_id/*` for the highest-versioned cached
/// directory that validates, without any network call.
pub fn find_local_cached_dataset(
    iso2: &str,
    cache_root: &Path,
    dataset_id: &str,
    validate_dataset_dir: &dyn Fn(&Path) -> Result<()>,
    required_files: &[&str],
) -> Option<BootstrapState> {
    let versions_root = cache_root.join(iso2).join(dataset_id);
    if !versions_root.exists() {
        return None;
    }

    let mut candidates: Vec<(Vec<u64>, String, PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(&versions_root).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let parsed = parse_version_for_sort(&name);
        if !parsed.is_empty() {
            candidates.push((parsed, name, path));
        }
    }
    candidates.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, version, path) in candidates {
        if validate_cached_dataset_dir(&path, validate_dataset_dir, required_files) {
            return Some(BootstrapState {
                country_iso2: iso2.to_string(),
                dataset_id: dataset_id.to_string(),
                dataset_version: version,
                dataset_dir: path,
                used_cached_dataset: true,
                dataset_manifest_url: None,
                update_checked: false,
                version_pinned: false,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_version_for_sort_orders_numeric_components() {
        assert_eq!(parse_version_for_sort("1.10.0"), vec![1, 10, 0]);
        assert_eq!(parse_version_for_sort("v2.0.0"), vec![2, 0, 0]);
        assert!(parse_version_for_sort("latest").is_empty());
    }

    #[test]
    fn cache_reuse_picks_highest_version_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for version in ["1.0.0", "1.1.0"] {
            let v_dir = root.join("JP").join("jp.admin").join(version);
            std::fs::create_dir_all(&v_dir).unwrap();
            for f in DEFAULT_REQUIRED_FILES {
                std::fs::write(v_dir.join(f), b"{}").unwrap();
            }
        }

        let found = find_local_cached_dataset(
            "JP",
            root,
            "jp.admin",
            &|_path| Ok(()),
            DEFAULT_REQUIRED_FILES,
        )
        .unwrap();

        assert_eq!(found.dataset_version, "1.1.0");
        assert!(found.used_cached_dataset);
    }

    #[test]
    fn cache_reuse_skips_versions_that_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for version in ["1.0.0", "1.1.0"] {
            let v_dir = root.join("JP").join("jp.admin").join(version);
            std::fs::create_dir_all(&v_dir).unwrap();
            for f in DEFAULT_REQUIRED_FILES {
                std::fs::write(v_dir.join(f), b"{}").unwrap();
            }
        }

        let found = find_local_cached_dataset(
            "JP",
            root,
            "jp.admin",
            &|path: &Path| {
                if path.ends_with("1.1.0") {
                    anyhow::bail!("broken policy");
                }
                Ok(())
            },
            DEFAULT_REQUIRED_FILES,
        )
        .unwrap();

        assert_eq!(found.dataset_version, "1.0.0");
    }
}
