use anyhow::{bail, Context, Result};

/// Parse a semver-like `MAJOR.MINOR.PATCH...` string (optional leading `v`)
/// into a tuple of integer components for ordering/comparison.
pub fn parse_semver(raw: &str, field: &str) -> Result<Vec<u64>> {
    let value = raw.trim();
    let value = value.strip_prefix('v').unwrap_or(value);
    let parts: Vec<&str> = value.split('.').collect();
    if parts.is_empty() || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        bail!("Manifest invalid {field} (expected semver-like digits, e.g. 2.0.0).");
    }
    parts
        .iter()
        .map(|p| p.parse::<u64>().with_context(|| format!("parse {field} component {p:?}")))
        .collect()
}

/// Validate `min <= runtime < max_exclusive`, returning the trimmed bound
/// strings on success.
pub fn validate_runtime_compatibility(
    min: &str,
    max_exclusive: &str,
    runtime_version: &str,
) -> Result<(String, String)> {
    let min_v = parse_semver(min, "min_cadis_version")?;
    let max_v = parse_semver(max_exclusive, "max_cadis_version_exclusive")?;
    let runtime_v = parse_semver(runtime_version, "cadis runtime version")?;

    if min_v >= max_v {
        bail!("Manifest has invalid runtime range: min_cadis_version must be < max_cadis_version_exclusive.");
    }
    if runtime_v < min_v {
        bail!("Cadis runtime {runtime_version} is lower than required min_cadis_version {min}.");
    }
    if runtime_v >= max_v {
        bail!("Cadis runtime {runtime_version} is not supported (>= max_cadis_version_exclusive {max_exclusive}).");
    }

    Ok((min.trim().to_string(), max_exclusive.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_version_inside_range() {
        let (min, max) = validate_runtime_compatibility("1.0.0", "2.0.0", "1.5.3").unwrap();
        assert_eq!(min, "1.0.0");
        assert_eq!(max, "2.0.0");
    }

    #[test]
    fn accepts_v_prefixed_versions() {
        assert!(validate_runtime_compatibility("v1.0.0", "v2.0.0", "v1.0.0").is_ok());
    }

    #[test]
    fn rejects_runtime_below_min() {
        assert!(validate_runtime_compatibility("1.0.0", "2.0.0", "0.9.0").is_err());
    }

    #[test]
    fn rejects_runtime_at_or_above_max_exclusive() {
        assert!(validate_runtime_compatibility("1.0.0", "2.0.0", "2.0.0").is_err());
        assert!(validate_runtime_compatibility("1.0.0", "2.0.0", "3.0.0").is_err());
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(validate_runtime_compatibility("2.0.0", "1.0.0", "1.5.0").is_err());
    }

    #[test]
    fn rejects_non_numeric_component() {
        assert!(parse_semver("1.x.0", "field").is_err());
    }
}
