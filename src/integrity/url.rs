use anyhow::{Context, Result};
use url::Url;

/// Join `relative_path` against `base_url`, splicing at a `/releases/`
/// marker when both the relative path and the base URL's path contain one
/// (so a routing manifest's `releases/ISO2/...` entry resolves against the
/// dataset repo root rather than nesting under the manifest's own directory).
pub fn repo_relative_url(base_url: &str, relative_path: &str) -> Result<String> {
    let relative_path = relative_path.trim();
    if relative_path.starts_with("http://")
        || relative_path.starts_with("https://")
        || relative_path.starts_with("file://")
    {
        return Ok(relative_path.to_string());
    }

    let relative = relative_path.trim_start_matches('/');
    if relative.starts_with("releases/") {
        let base = Url::parse(base_url).with_context(|| format!("parse base url {base_url}"))?;
        if let Some(marker_idx) = base.path().find("/releases/") {
            let prefix = &base.path()[..marker_idx];
            let mut spliced = base.clone();
            spliced.set_path(&format!("{prefix}/{relative}"));
            return Ok(spliced.to_string());
        }
    }

    let base = Url::parse(base_url).with_context(|| format!("parse base url {base_url}"))?;
    let joined = base
        .join(relative)
        .with_context(|| format!("join {base_url} with {relative}"))?;
    Ok(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splices_at_releases_marker() {
        let base = "https://cdn.example.com/dataset/releases/dataset_manifest.json";
        let joined = repo_relative_url(
            base,
            "releases/JP/jp.admin/1.2.3/dataset_release_manifest.json",
        )
        .unwrap();
        assert_eq!(
            joined,
            "https://cdn.example.com/dataset/releases/JP/jp.admin/1.2.3/dataset_release_manifest.json"
        );
    }

    #[test]
    fn falls_back_to_ordinary_join_without_marker() {
        let base = "https://cdn.example.com/other/dataset_manifest.json";
        let joined = repo_relative_url(base, "releases/JP/manifest.json").unwrap();
        assert_eq!(joined, "https://cdn.example.com/other/releases/JP/manifest.json");
    }

    #[test]
    fn absolute_urls_pass_through() {
        let joined = repo_relative_url("https://a/b", "https://c/d.json").unwrap();
        assert_eq!(joined, "https://c/d.json");
    }
}
