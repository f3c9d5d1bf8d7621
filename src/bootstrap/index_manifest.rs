use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use crate::integrity::{parse_sha256_file, repo_relative_url, safe_extract_tar_gz, sha256_file};

use super::atomic::atomic_write;
use super::cache::{find_local_cached_dataset, required_files_present, BootstrapState};
use super::compat::validate_runtime_compatibility;
use super::transport::{read_bytes_url, read_json_url, read_text_url};

const PACKAGE_NAME: &str = "dataset_package.tar.gz";
const PACKAGE_SIDECAR: &str = "dataset_package.tar.gz.sha256";

/// A country's routing entry in an index manifest's `countries` table:
/// `{"latest": "<v>", "manifest": "releases/ISO2/<dataset_id>/<v>/dataset_release_manifest.json"}`.
fn lookup_route_entry(index_manifest: &Value, iso2: &str, dataset_id: &str) -> Result<(String, String)> {
    let countries = index_manifest
        .get("countries")
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("Index manifest missing 'countries' object"))?;
    let country_entry = countries
        .get(iso2)
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("Index manifest has no entry for country {iso2}"))?;
    let route_entry = country_entry
        .get(dataset_id)
        .and_then(Value::as_object)
        .ok_or_else(|| anyhow!("Index manifest has no dataset {dataset_id} for country {iso2}"))?;
    let latest = route_entry
        .get("latest")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("Index manifest entry for {dataset_id}/{iso2} missing 'latest'"))?;
    let manifest_rel = route_entry
        .get("manifest")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow!("Index manifest entry for {dataset_id}/{iso2} missing 'manifest'"))?;
    Ok((manifest_rel.trim().to_string(), latest.trim().to_string()))
}

/// Resolve the release manifest URL routed for `iso2`/`dataset_id`'s
/// current `latest` pointer, along with that pointer's version string.
fn resolve_latest_release_manifest_url(
    index_manifest_url: &str,
    index_manifest: &Value,
    iso2: &str,
    dataset_id: &str,
) -> Result<(String, String)> {
    let (manifest_rel, latest) = lookup_route_entry(index_manifest, iso2, dataset_id)?;
    let url = repo_relative_url(index_manifest_url, &manifest_rel)?;
    Ok((url, latest))
}

/// Build the release manifest URL for a *pinned* version directly, the way
/// the routing manifest would have addressed it, without consulting the
/// routing table at all (a pin names an exact version; there's nothing for
/// the router to resolve).
fn pinned_release_manifest_url(
    index_manifest_url: &str,
    iso2: &str,
    dataset_id: &str,
    dataset_version: &str,
) -> Result<String> {
    let relative = format!("releases/{iso2}/{dataset_id}/{dataset_version}/dataset_release_manifest.json");
    repo_relative_url(index_manifest_url, &relative)
}

/// Verify a fetched release manifest names the expected country and
/// dataset id, matches `expected_version` when one is given (the routing
/// table's `latest` pointer, or the caller's pin), and satisfies runtime
/// compatibility. Returns the manifest's own `dataset_version` on success.
fn validate_release_manifest(
    release_manifest: &Value,
    release_manifest_url: &str,
    iso2: &str,
    dataset_id: &str,
    expected_version: Option<&str>,
    runtime_version: &str,
) -> Result<String> {
    let manifest_country = release_manifest
        .get("country_iso")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if manifest_country.trim().to_uppercase() != iso2 {
        bail!("Release manifest at {release_manifest_url} is for country {manifest_country:?}, expected {iso2}");
    }

    let manifest_dataset_id = release_manifest
        .get("dataset_id")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if manifest_dataset_id.trim() != dataset_id {
        bail!(
            "Release manifest at {release_manifest_url} is for dataset {manifest_dataset_id:?}, expected {dataset_id}"
        );
    }

    let dataset_version = release_manifest
        .get("dataset_version")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Release manifest missing dataset_version"))?
        .trim()
        .to_string();
    if let Some(expected) = expected_version {
        if dataset_version != expected.trim() {
            bail!("Release version mismatch: expected={expected} manifest={dataset_version}");
        }
    }

    let runtime_compat = release_manifest
        .get("runtime_compat")
        .ok_or_else(|| anyhow!("Release manifest missing runtime_compat"))?;
    let min = runtime_compat
        .get("min")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Release manifest runtime_compat missing min"))?;
    let max_exclusive = runtime_compat
        .get("max_exclusive")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Release manifest runtime_compat missing max_exclusive"))?;
    validate_runtime_compatibility(min, max_exclusive, runtime_version)?;

    Ok(dataset_version)
}

/// Fetch the release manifest at `release_manifest_url`, validate it (see
/// [`validate_release_manifest`]), then download and safe-extract the
/// dataset package it governs into `cache_root/iso2/dataset_id/dataset_version`.
/// Returns the validated dataset directory.
#[allow(clippy::too_many_arguments)]
fn download_and_extract_release(
    release_manifest_url: &str,
    iso2: &str,
    dataset_id: &str,
    expected_version: Option<&str>,
    runtime_version: &str,
    cache_root: &Path,
    validate_dataset_dir: &dyn Fn(&Path) -> Result<()>,
    required_files: &[&str],
    timeout_sec: u64,
) -> Result<BootstrapState> {
    let release_manifest: Value = read_json_url(release_manifest_url, timeout_sec)?;
    let dataset_version = validate_release_manifest(
        &release_manifest,
        release_manifest_url,
        iso2,
        dataset_id,
        expected_version,
        runtime_version,
    )?;

    let package_url = repo_relative_url(release_manifest_url, PACKAGE_NAME)?;
    let sidecar_url = repo_relative_url(release_manifest_url, PACKAGE_SIDECAR)?;

    let sidecar_text = read_text_url(&sidecar_url, timeout_sec)?;
    let expected_sha = parse_sha256_file(&sidecar_text)?;

    let tmp_dir = tempfile::tempdir().context("create staging dir for package download")?;
    let package_path = tmp_dir.path().join(PACKAGE_NAME);
    let package_bytes = read_bytes_url(&package_url, timeout_sec)?;
    atomic_write(&package_path, &package_bytes)?;

    let actual_sha = sha256_file(&package_path)?;
    if actual_sha != expected_sha {
        bail!("Package checksum mismatch for {package_url}: expected={expected_sha} actual={actual_sha}");
    }

    let target_dir = cache_root.join(iso2).join(dataset_id).join(&dataset_version);
    std::fs::create_dir_all(&target_dir)
        .with_context(|| format!("create dataset dir {}", target_dir.display()))?;
    safe_extract_tar_gz(&package_path, &target_dir)?;

    let missing = required_files_present(&target_dir, required_files);
    if !missing.is_empty() {
        bail!("Extracted dataset package is missing required files: {missing:?}");
    }
    validate_dataset_dir(&target_dir)?;

    Ok(BootstrapState {
        country_iso2: iso2.to_string(),
        dataset_id: dataset_id.to_string(),
        dataset_version,
        dataset_dir: target_dir,
        used_cached_dataset: false,
        dataset_manifest_url: Some(release_manifest_url.to_string()),
        update_checked: true,
        version_pinned: false,
    })
}

/// Bootstrap a dataset through the index-manifest (routing) mode of §4.B:
/// a top-level manifest routes `(country, dataset_id)` to a release
/// manifest, which in turn governs a single `dataset_package.tar.gz`.
///
/// Caching policy:
/// - `dataset_version` pinned: reuse the matching cached dir if present and
///   valid, otherwise resolve-and-download exactly that version via the
///   deterministic release-manifest path (the routing table is never
///   consulted for a pin — there's nothing to route).
/// - not pinned, `update_to_latest=false`: reuse the highest-semver cached
///   dir without any network call.
/// - not pinned, `update_to_latest=true`: always resolve the router's
///   current pointer and download if the cache doesn't already match it.
#[allow(clippy::too_many_arguments)]
pub fn bootstrap_country_dataset(
    index_manifest_url: &str,
    country: &str,
    dataset_id: &str,
    dataset_version: Option<&str>,
    update_to_latest: bool,
    runtime_version: &str,
    validate_dataset_dir: &dyn Fn(&Path) -> Result<()>,
    cache_root: &Path,
    required_files: &[&str],
    timeout_sec: u64,
) -> Result<BootstrapState> {
    let iso2 = country.trim().to_uppercase();
    if iso2.is_empty() {
        bail!("country must be a non-empty ISO2 code");
    }

    if let Some(pinned) = dataset_version {
        let pinned = pinned.trim();
        if pinned.is_empty() {
            bail!("dataset_version, if given, must be non-empty");
        }
        let pinned_dir = cache_root.join(&iso2).join(dataset_id).join(pinned);
        if super::cache::validate_cached_dataset_dir(&pinned_dir, validate_dataset_dir, required_files) {
            return Ok(BootstrapState {
                country_iso2: iso2,
                dataset_id: dataset_id.to_string(),
                dataset_version: pinned.to_string(),
                dataset_dir: pinned_dir,
                used_cached_dataset: true,
                dataset_manifest_url: None,
                update_checked: false,
                version_pinned: true,
            });
        }

        let release_manifest_url = pinned_release_manifest_url(index_manifest_url, &iso2, dataset_id, pinned)?;
        let mut state = download_and_extract_release(
            &release_manifest_url,
            &iso2,
            dataset_id,
            Some(pinned),
            runtime_version,
            cache_root,
            validate_dataset_dir,
            required_files,
            timeout_sec,
        )?;
        state.version_pinned = true;
        return Ok(state);
    }

    if !update_to_latest {
        if let Some(cached) =
            find_local_cached_dataset(&iso2, cache_root, dataset_id, validate_dataset_dir, required_files)
        {
            return Ok(cached);
        }
    }

    let index_manifest = read_json_url(index_manifest_url, timeout_sec)?;
    let (release_manifest_url, latest) =
        resolve_latest_release_manifest_url(index_manifest_url, &index_manifest, &iso2, dataset_id)?;

    if update_to_latest {
        let candidate_dir = cache_root.join(&iso2).join(dataset_id).join(&latest);
        if super::cache::validate_cached_dataset_dir(&candidate_dir, validate_dataset_dir, required_files) {
            return Ok(BootstrapState {
                country_iso2: iso2,
                dataset_id: dataset_id.to_string(),
                dataset_version: latest,
                dataset_dir: candidate_dir,
                used_cached_dataset: true,
                dataset_manifest_url: Some(release_manifest_url),
                update_checked: true,
                version_pinned: false,
            });
        }
    }

    download_and_extract_release(
        &release_manifest_url,
        &iso2,
        dataset_id,
        Some(&latest),
        runtime_version,
        cache_root,
        validate_dataset_dir,
        required_files,
        timeout_sec,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn index_manifest_fixture() -> Value {
        json!({
            "countries": {
                "JP": {
                    "jp.admin": {
                        "latest": "1.2.3",
                        "manifest": "releases/JP/jp.admin/1.2.3/dataset_release_manifest.json"
                    }
                }
            }
        })
    }

    fn release_manifest_fixture(version: &str) -> Value {
        json!({
            "country_iso": "JP",
            "dataset_id": "jp.admin",
            "dataset_version": version,
            "runtime_compat": {"min": "0.1.0", "max_exclusive": "1.0.0"},
        })
    }

    #[test]
    fn lookup_route_entry_reads_object_shaped_entry() {
        let (manifest_rel, latest) =
            lookup_route_entry(&index_manifest_fixture(), "JP", "jp.admin").unwrap();
        assert_eq!(latest, "1.2.3");
        assert_eq!(manifest_rel, "releases/JP/jp.admin/1.2.3/dataset_release_manifest.json");
    }

    #[test]
    fn lookup_route_entry_rejects_string_shaped_entry() {
        let index_manifest = json!({
            "countries": {"JP": {"jp.admin": "releases/JP/jp.admin/1.2.3/dataset_release_manifest.json"}}
        });
        assert!(lookup_route_entry(&index_manifest, "JP", "jp.admin").is_err());
    }

    #[test]
    fn resolve_latest_release_manifest_url_splices_releases_marker() {
        let index_manifest_url = "https://cdn.example.com/dataset/releases/dataset_manifest.json";
        let (url, latest) = resolve_latest_release_manifest_url(
            index_manifest_url,
            &index_manifest_fixture(),
            "JP",
            "jp.admin",
        )
        .unwrap();
        assert_eq!(latest, "1.2.3");
        assert_eq!(
            url,
            "https://cdn.example.com/dataset/releases/JP/jp.admin/1.2.3/dataset_release_manifest.json"
        );
    }

    #[test]
    fn pinned_release_manifest_url_never_consults_routing_table() {
        let index_manifest_url = "https://cdn.example.com/dataset/releases/dataset_manifest.json";
        let url = pinned_release_manifest_url(index_manifest_url, "JP", "jp.admin", "9.9.9").unwrap();
        assert_eq!(
            url,
            "https://cdn.example.com/dataset/releases/JP/jp.admin/9.9.9/dataset_release_manifest.json"
        );
    }

    #[test]
    fn validate_release_manifest_accepts_matching_manifest() {
        let version = validate_release_manifest(
            &release_manifest_fixture("1.2.3"),
            "https://cdn.example.com/releases/JP/jp.admin/1.2.3/dataset_release_manifest.json",
            "JP",
            "jp.admin",
            Some("1.2.3"),
            "0.5.0",
        )
        .unwrap();
        assert_eq!(version, "1.2.3");
    }

    #[test]
    fn validate_release_manifest_rejects_dataset_id_mismatch() {
        let mut manifest = release_manifest_fixture("1.2.3");
        manifest["dataset_id"] = json!("kr.admin");
        let err = validate_release_manifest(&manifest, "url", "JP", "jp.admin", Some("1.2.3"), "0.5.0");
        assert!(err.is_err());
    }

    #[test]
    fn validate_release_manifest_rejects_version_mismatch_against_latest() {
        let manifest = release_manifest_fixture("1.2.4");
        let err = validate_release_manifest(&manifest, "url", "JP", "jp.admin", Some("1.2.3"), "0.5.0");
        assert!(err.is_err());
    }

    #[test]
    fn validate_release_manifest_rejects_incompatible_runtime() {
        let manifest = release_manifest_fixture("1.2.3");
        let err = validate_release_manifest(&manifest, "url", "JP", "jp.admin", Some("1.2.3"), "5.0.0");
        assert!(err.is_err());
    }

    #[test]
    fn pinned_bootstrap_reuses_valid_cache_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let version_dir = root.join("JP").join("jp.admin").join("1.2.3");
        std::fs::create_dir_all(&version_dir).unwrap();
        for f in super::super::cache::DEFAULT_REQUIRED_FILES {
            std::fs::write(version_dir.join(f), b"{}").unwrap();
        }

        let state = bootstrap_country_dataset(
            "https://cdn.example.com/dataset/releases/dataset_manifest.json",
            "jp",
            "jp.admin",
            Some("1.2.3"),
            false,
            "0.5.0",
            &|_path| Ok(()),
            root,
            super::super::cache::DEFAULT_REQUIRED_FILES,
            5,
        )
        .unwrap();

        assert!(state.used_cached_dataset);
        assert!(state.version_pinned);
        assert_eq!(state.dataset_version, "1.2.3");
    }
}
