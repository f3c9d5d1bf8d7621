mod archive;
mod hash;
#[cfg(feature = "download")]
mod url;

pub use archive::safe_extract_tar_gz;
pub use hash::{bundle_checksum, parse_sha256_file, sha256_file};
#[cfg(feature = "download")]
pub use url::repo_relative_url;
