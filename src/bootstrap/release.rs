use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;

use crate::integrity::{bundle_checksum, sha256_file};

use super::atomic::atomic_write;
use super::compat::validate_runtime_compatibility;
use super::manifest::{ReleaseManifest, MANIFEST_NAME, MANIFEST_PROFILE, RUNTIME_POLICY_FILE};
use super::transport::read_bytes_url;

/// Result of release-manifest-mode bootstrap (§4.B).
#[derive(Debug, Clone)]
pub struct ReleaseBootstrapResult {
    pub country: String,
    pub dataset_url: String,
    pub manifest_url: String,
    pub dataset_dir: PathBuf,
    pub min_cadis_version: String,
    pub max_cadis_version_exclusive: String,
    pub downloaded_urls: Vec<String>,
    pub manifest: Value,
}

/// Check the header fields of a parsed release manifest (profile, schema
/// version, country, checksum algorithm) and validate runtime
/// compatibility. Returns the `(min, max_exclusive)` compatibility bounds
/// on success. Pure/no I/O so it can be exercised directly against fixture
/// manifests.
fn validate_release_manifest_header(
    manifest: &ReleaseManifest,
    iso2: &str,
    runtime_version: &str,
) -> Result<(String, String)> {
    if manifest.profile != MANIFEST_PROFILE {
        bail!("Invalid manifest profile: {:?}", manifest.profile);
    }
    if manifest.schema_version != 2 {
        bail!("Unsupported schema version: {}", manifest.schema_version);
    }
    if manifest.country_iso.trim().to_uppercase() != iso2 {
        bail!(
            "Manifest country mismatch: expected={} actual={:?}",
            iso2,
            manifest.country_iso
        );
    }
    if manifest.checksum_algo != "sha256" {
        bail!("Unsupported checksum algorithm: {:?}", manifest.checksum_algo);
    }

    validate_runtime_compatibility(
        &manifest.runtime_compat.min,
        &manifest.runtime_compat.max_exclusive,
        runtime_version,
    )
}

/// Download + verify a release-manifest-governed dataset directly from a
/// `dataset_base` URL into the local cache. Every declared file is
/// checksum-verified individually; if the manifest carries a bundle
/// checksum, the verified set is re-hashed and compared as well.
pub fn bootstrap_release_dataset(
    dataset_base: &str,
    country: &str,
    runtime_version: &str,
    validate_dataset_dir: &dyn Fn(&Path) -> Result<()>,
    cache_root: &Path,
    timeout_sec: u64,
) -> Result<ReleaseBootstrapResult> {
    let iso2 = country.trim().to_uppercase();
    if iso2.is_empty() {
        bail!("country must be a non-empty ISO2 code");
    }

    let dataset_url = dataset_base.trim_end_matches('/').to_string();
    let manifest_url = format!("{dataset_url}/{MANIFEST_NAME}");

    let manifest_text = super::transport::read_text_url(&manifest_url, timeout_sec)?;
    let manifest: ReleaseManifest = serde_json::from_str(&manifest_text)
        .with_context(|| format!("parse release manifest {manifest_url}"))?;

    let (min_cadis_version, max_cadis_version_exclusive) =
        validate_release_manifest_header(&manifest, &iso2, runtime_version)?;

    let target_dir = cache_root
        .join(&iso2)
        .join(manifest.dataset_id.trim())
        .join(manifest.dataset_version.trim());
    std::fs::create_dir_all(&target_dir)
        .with_context(|| format!("create dataset dir {}", target_dir.display()))?;

    if manifest.checksums.files.is_empty() {
        bail!("Manifest checksums.files must be a non-empty object");
    }
    let policy_entry = manifest
        .checksums
        .files
        .get(RUNTIME_POLICY_FILE)
        .ok_or_else(|| anyhow!("Manifest files must include {RUNTIME_POLICY_FILE}."))?;
    if policy_entry.sha256.trim().is_empty() {
        bail!("Manifest checksums.files.{RUNTIME_POLICY_FILE} missing sha256.");
    }

    let mut verified: BTreeMap<String, String> = BTreeMap::new();
    let mut downloaded: Vec<String> = Vec::new();
    for (rel, entry) in &manifest.checksums.files {
        let url = format!("{dataset_url}/{rel}");
        let out = target_dir.join(rel);
        let bytes = read_bytes_url(&url, timeout_sec)?;
        atomic_write(&out, &bytes)?;

        let actual_sha = sha256_file(&out)?;
        if actual_sha != entry.sha256 {
            bail!("Checksum mismatch for {rel}: expected={} actual={actual_sha}", entry.sha256);
        }
        let actual_size = out.metadata()?.len();
        if actual_size != entry.size {
            bail!("Size mismatch for {rel}: expected={} actual={actual_size}", entry.size);
        }

        verified.insert(rel.clone(), actual_sha);
        downloaded.push(url);
    }

    if let Some(expected_bundle) = manifest.declared_bundle_checksum() {
        let actual_bundle = bundle_checksum(&verified);
        if actual_bundle != expected_bundle {
            bail!("Bundle checksum mismatch: expected={expected_bundle} actual={actual_bundle}");
        }
    }

    let policy_path = target_dir.join(RUNTIME_POLICY_FILE);
    if !policy_path.exists() {
        bail!("{RUNTIME_POLICY_FILE} missing after bootstrap download.");
    }
    let actual_policy_sha = sha256_file(&policy_path)?;
    if actual_policy_sha != policy_entry.sha256 {
        bail!(
            "{RUNTIME_POLICY_FILE} checksum mismatch: expected={} actual={actual_policy_sha}",
            policy_entry.sha256
        );
    }

    validate_dataset_dir(&target_dir)?;

    atomic_write(&target_dir.join(MANIFEST_NAME), manifest_text.as_bytes())?;

    let manifest_value: Value = serde_json::from_str(&manifest_text)?;

    Ok(ReleaseBootstrapResult {
        country: iso2,
        dataset_url,
        manifest_url,
        dataset_dir: target_dir,
        min_cadis_version,
        max_cadis_version_exclusive,
        downloaded_urls: downloaded,
        manifest: manifest_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_fixture() -> ReleaseManifest {
        ReleaseManifest {
            profile: MANIFEST_PROFILE.to_string(),
            schema_version: 2,
            country_iso: "JP".to_string(),
            country_name: Some("Japan".to_string()),
            dataset_id: "jp.admin".to_string(),
            dataset_version: "1.2.3".to_string(),
            checksum_algo: "sha256".to_string(),
            runtime_compat: super::super::manifest::RuntimeCompat {
                min: "0.1.0".to_string(),
                max_exclusive: "1.0.0".to_string(),
            },
            checksums: super::super::manifest::Checksums { files: BTreeMap::new() },
            manifest_bundle_checksum: None,
            bundle_checksum: None,
        }
    }

    #[test]
    fn accepts_well_formed_matching_manifest() {
        let (min, max) = validate_release_manifest_header(&manifest_fixture(), "JP", "0.5.0").unwrap();
        assert_eq!(min, "0.1.0");
        assert_eq!(max, "1.0.0");
    }

    #[test]
    fn rejects_wrong_profile() {
        let mut manifest = manifest_fixture();
        manifest.profile = "something.else".to_string();
        assert!(validate_release_manifest_header(&manifest, "JP", "0.5.0").is_err());
    }

    #[test]
    fn rejects_wrong_schema_version() {
        let mut manifest = manifest_fixture();
        manifest.schema_version = 1;
        assert!(validate_release_manifest_header(&manifest, "JP", "0.5.0").is_err());
    }

    #[test]
    fn rejects_country_mismatch() {
        assert!(validate_release_manifest_header(&manifest_fixture(), "KR", "0.5.0").is_err());
    }

    #[test]
    fn rejects_unsupported_checksum_algo() {
        let mut manifest = manifest_fixture();
        manifest.checksum_algo = "sha1".to_string();
        assert!(validate_release_manifest_header(&manifest, "JP", "0.5.0").is_err());
    }

    #[test]
    fn rejects_incompatible_runtime_version() {
        assert!(validate_release_manifest_header(&manifest_fixture(), "JP", "5.0.0").is_err());
    }
}
