use serde::Deserialize;
use std::collections::BTreeMap;

pub const MANIFEST_NAME: &str = "dataset_release_manifest.json";
pub const MANIFEST_PROFILE: &str = "cadis.dataset.release";
pub const RUNTIME_POLICY_FILE: &str = "runtime_policy.json";

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeCompat {
    pub min: String,
    pub max_exclusive: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub sha256: String,
    pub size: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Checksums {
    pub files: BTreeMap<String, FileEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseManifest {
    pub profile: String,
    pub schema_version: u32,
    pub country_iso: String,
    #[serde(default)]
    pub country_name: Option<String>,
    pub dataset_id: String,
    pub dataset_version: String,
    pub checksum_algo: String,
    pub runtime_compat: RuntimeCompat,
    pub checksums: Checksums,
    #[serde(default)]
    pub manifest_bundle_checksum: Option<String>,
    #[serde(default)]
    pub bundle_checksum: Option<String>,
}

impl ReleaseManifest {
    pub fn declared_bundle_checksum(&self) -> Option<&str> {
        self.manifest_bundle_checksum
            .as_deref()
            .or(self.bundle_checksum.as_deref())
    }
}
