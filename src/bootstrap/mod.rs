//! Dataset bootstrap (§4): fetch, verify, and cache a country's
//! administrative-geometry dataset before a [`crate::dataset::CadisRuntime`]
//! can be constructed. Everything here does network I/O; the query path
//! (`ffsf`, `pipeline`) never touches this module at lookup time.

mod atomic;
mod cache;
mod compat;
mod manifest;

#[cfg(feature = "download")]
mod index_manifest;
#[cfg(feature = "download")]
mod release;
#[cfg(feature = "download")]
mod transport;

pub use cache::{
    find_local_cached_dataset, parse_version_for_sort, required_files_present,
    validate_cached_dataset_dir, BootstrapState, DEFAULT_REQUIRED_FILES,
};
pub use compat::{parse_semver, validate_runtime_compatibility};
pub use manifest::{ReleaseManifest, MANIFEST_NAME, MANIFEST_PROFILE, RUNTIME_POLICY_FILE};

#[cfg(feature = "download")]
pub use index_manifest::bootstrap_country_dataset;
#[cfg(feature = "download")]
pub use release::{bootstrap_release_dataset, ReleaseBootstrapResult};
