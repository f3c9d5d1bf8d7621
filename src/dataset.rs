//! [`CadisRuntime`]: the constructed, query-ready view of one bootstrapped
//! dataset directory. Construction does all the JSON/FFSF loading; after
//! that, [`CadisRuntime::lookup`] performs no I/O (§5).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::bootstrap::{required_files_present, DEFAULT_REQUIRED_FILES};
use crate::error::{CadisError, Result};
use crate::ffsf::{FfsfIndex, Point};
use crate::pipeline::providers::{load_hierarchy_parent_map, load_repair_anchor_map, HierarchyHit};
use crate::pipeline::{run_lookup_pipeline, EvidenceNode, Provider};
use crate::policy::{
    apply_semantic_overlays, ensure_declared_overlay_files_present, load_dataset_country_name,
    load_runtime_policy, load_semantic_overlays, RuntimePolicy, SemanticOverlay,
};

pub const ENGINE_NAME: &str = "cadis";
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

fn required_policy_layer_files(dataset_dir: &Path, policy: &RuntimePolicy) -> Vec<String> {
    let mut missing = Vec::new();
    if policy.hierarchy_required && !dataset_dir.join("hierarchy.json").exists() {
        missing.push("hierarchy.json".to_string());
    }
    if policy.repair_required && !dataset_dir.join("repair.json").exists() {
        missing.push("repair.json".to_string());
    }
    missing
}

fn to_hierarchy_evidence(hit: HierarchyHit) -> EvidenceNode {
    EvidenceNode { level: hit.level, name: hit.name, osm_id: Some(hit.osm_id), source: hit.source.to_string(), evidence_type: "hierarchy_repair".to_string() }
}

/// A single bootstrapped country dataset, loaded once and held read-only
/// for the lifetime of the process. Construct with [`CadisRuntime::open`];
/// every subsequent call is a pure, I/O-free query.
#[derive(Debug)]
pub struct CadisRuntime {
    dataset_dir: PathBuf,
    policy: RuntimePolicy,
    overlays: Vec<SemanticOverlay>,
    country_name: String,
    index: FfsfIndex,
    hierarchy_parent_map: BTreeMap<String, HierarchyHit>,
    repair_anchor_map: BTreeMap<String, (String, String)>,
}

impl CadisRuntime {
    /// Load every ambient file for `dataset_dir` and build the query-ready
    /// runtime. `country_name_override`, when given, wins over whatever
    /// name the release manifest carries.
    pub fn open(dataset_dir: &Path, country_name_override: Option<&str>) -> Result<Self> {
        let missing = required_files_present(dataset_dir, DEFAULT_REQUIRED_FILES);
        if !missing.is_empty() {
            return Err(CadisError::not_bootstrapped(dataset_dir.to_path_buf(), missing).into());
        }

        let policy = load_runtime_policy(dataset_dir)?;

        let missing_layers = required_policy_layer_files(dataset_dir, &policy);
        if !missing_layers.is_empty() {
            return Err(CadisError::not_bootstrapped(dataset_dir.to_path_buf(), missing_layers).into());
        }
        ensure_declared_overlay_files_present(dataset_dir, &policy)?;
        let overlays = load_semantic_overlays(dataset_dir, &policy)?;

        let country_name = country_name_override
            .map(str::to_string)
            .unwrap_or_else(|| load_dataset_country_name(dataset_dir));

        let index = FfsfIndex::from_files(&dataset_dir.join("geometry.ffsf"), &dataset_dir.join("geometry_meta.json"))?;

        let hierarchy_parent_map = if policy.hierarchy_required {
            load_hierarchy_parent_map(dataset_dir, &policy.hierarchy_child_levels, policy.hierarchy_parent_level)?
        } else {
            BTreeMap::new()
        };
        let repair_anchor_map = if policy.repair_required {
            load_repair_anchor_map(dataset_dir)?.0
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            dataset_dir: dataset_dir.to_path_buf(),
            policy,
            overlays,
            country_name,
            index,
            hierarchy_parent_map,
            repair_anchor_map,
        })
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dataset_dir
    }

    pub fn policy(&self) -> &RuntimePolicy {
        &self.policy
    }

    /// Pick the first child level (in ascending order) whose geometry/merged
    /// evidence name resolves through `map`, returning its associated node.
    /// Mirrors the "first success wins" iteration the supplementation
    /// stages use for both hierarchy and repair lookups.
    fn resolve_via_child_levels<T>(
        evidence: &BTreeMap<i64, EvidenceNode>,
        missing_levels: &BTreeSet<i64>,
        parent_level: i64,
        child_levels: &BTreeSet<i64>,
        map: &BTreeMap<String, T>,
        to_node: impl Fn(&T) -> EvidenceNode,
    ) -> BTreeMap<i64, EvidenceNode> {
        if !missing_levels.contains(&parent_level) {
            return BTreeMap::new();
        }
        for child_level in child_levels {
            let Some(child) = evidence.get(child_level) else { continue };
            let Some(child_name) = &child.name else { continue };
            if let Some(hit) = map.get(child_name) {
                return BTreeMap::from([(parent_level, to_node(hit))]);
            }
        }
        BTreeMap::new()
    }

    fn hierarchy_provider(&self) -> impl Fn(&BTreeMap<i64, EvidenceNode>, &BTreeSet<i64>) -> BTreeMap<i64, EvidenceNode> + '_ {
        move |evidence, missing_levels| {
            if !self.policy.hierarchy_required {
                return BTreeMap::new();
            }
            Self::resolve_via_child_levels(
                evidence,
                missing_levels,
                self.policy.hierarchy_parent_level,
                &self.policy.hierarchy_child_levels,
                &self.hierarchy_parent_map,
                |hit: &HierarchyHit| to_hierarchy_evidence(hit.clone()),
            )
        }
    }

    fn repair_provider(&self) -> impl Fn(&BTreeMap<i64, EvidenceNode>, &BTreeSet<i64>) -> BTreeMap<i64, EvidenceNode> + '_ {
        move |evidence, missing_levels| {
            if !self.policy.repair_required {
                return BTreeMap::new();
            }
            Self::resolve_via_child_levels(
                evidence,
                missing_levels,
                self.policy.repair_parent_level,
                &self.policy.repair_child_levels,
                &self.repair_anchor_map,
                |(name, osm_id): &(String, String)| EvidenceNode {
                    level: self.policy.repair_parent_level,
                    name: Some(name.clone()),
                    osm_id: Some(osm_id.clone()),
                    source: "semantic_anchor".to_string(),
                    evidence_type: "semantic_anchor".to_string(),
                },
            )
        }
    }

    /// Resolve `(lat, lon)` to an administrative hierarchy. `lon` feeds the
    /// index's `x`, `lat` its `y`; out-of-range coordinates simply fail to
    /// hit any polygon and surface as `lookup_status: "failed"`.
    pub fn lookup(&self, lat: f64, lon: f64) -> Result<Value> {
        let pt = Point { x: lon, y: lat };
        let polygon_hits = self.index.query_point(pt, &self.policy.allowed_levels)?;

        let allowed_levels: BTreeSet<i64> = self.policy.allowed_levels.iter().copied().collect();
        let hierarchy_provider: &Provider<'_> = &self.hierarchy_provider();
        let repair_provider: &Provider<'_> = &self.repair_provider();

        let bundle = run_lookup_pipeline(
            polygon_hits,
            &allowed_levels,
            &self.policy.allowed_shapes,
            &self.policy.shape_status_map,
            ENGINE_NAME,
            ENGINE_VERSION,
            &self.country_name,
            Some(hierarchy_provider),
            Some(repair_provider),
        );

        Ok(apply_semantic_overlays(&bundle, &self.overlays))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write_json(path: &Path, value: &Value) {
        std::fs::write(path, serde_json::to_vec(value).unwrap()).unwrap();
    }

    fn minimal_square_geometry(dir: &Path, levels: &[i64]) {
        let ring: [(u16, u16); 5] = [(0, 0), (65535, 0), (65535, 65535), (0, 65535), (0, 0)];
        let mut blob = Vec::new();
        blob.extend_from_slice(b"FFSF");
        blob.extend_from_slice(&3u32.to_le_bytes());
        blob.extend_from_slice(&(levels.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(levels.len() as u32).to_le_bytes());
        for i in 0..levels.len() {
            blob.extend_from_slice(&0u32.to_le_bytes());
            blob.extend_from_slice(&0u32.to_le_bytes());
            blob.extend_from_slice(&(i as u32).to_le_bytes());
            blob.extend_from_slice(&1u32.to_le_bytes());
        }
        for _ in 0..levels.len() {
            blob.extend_from_slice(&0f32.to_le_bytes());
            blob.extend_from_slice(&0f32.to_le_bytes());
            blob.extend_from_slice(&1f32.to_le_bytes());
            blob.extend_from_slice(&1f32.to_le_bytes());
        }
        let ring_bytes = (ring.len() * 4) as u32;
        for i in 0..levels.len() {
            blob.extend_from_slice(&(i as u32 * ring_bytes).to_le_bytes());
            blob.extend_from_slice(&ring_bytes.to_le_bytes());
            blob.extend_from_slice(&(i as u32).to_le_bytes());
            blob.extend_from_slice(&1u32.to_le_bytes());
        }
        for _ in 0..levels.len() {
            blob.extend_from_slice(&(ring.len() as u32).to_le_bytes());
        }
        for _ in 0..levels.len() {
            for &(x, y) in &ring {
                blob.extend_from_slice(&x.to_le_bytes());
                blob.extend_from_slice(&y.to_le_bytes());
            }
        }
        std::fs::write(dir.join("geometry.ffsf"), blob).unwrap();

        let meta: Vec<Value> = levels
            .iter()
            .enumerate()
            .map(|(i, &level)| json!({"level": level, "name": format!("node-{i}"), "feature_id": format!("n{i}"), "country_scope_flag": true}))
            .collect();
        write_json(&dir.join("geometry_meta.json"), &Value::Array(meta));
    }

    fn minimal_dataset(dir: &Path, levels: &[i64], hierarchy_required: bool, repair_required: bool) {
        minimal_square_geometry(dir, levels);
        write_json(
            &dir.join("dataset_release_manifest.json"),
            &json!({"country_iso": "ZZ", "country_name": "Zedland", "dataset_id": "zz.admin", "dataset_version": "1.0.0"}),
        );

        let mut shape: Vec<i64> = levels.to_vec();
        shape.sort_unstable();
        write_json(
            &dir.join("runtime_policy.json"),
            &json!({
                "runtime_policy_version": "1.0",
                "allowed_levels": levels,
                "allowed_shapes": [shape],
                "shape_status": [{"levels": shape, "status": "ok"}],
                "layers": {"hierarchy_required": hierarchy_required, "repair_required": repair_required},
                "hierarchy_repair_rules": {"parent_level": levels[0], "child_levels": if hierarchy_required { vec![levels[levels.len()-1]] } else { vec![] }},
                "repair_rules": {"parent_level": levels[0], "child_levels": if repair_required { vec![levels[levels.len()-1]] } else { vec![] }}
            }),
        );
    }

    #[test]
    fn lookup_inside_polygon_returns_ok_with_full_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        minimal_dataset(dir.path(), &[2, 4], false, false);

        let runtime = CadisRuntime::open(dir.path(), None).unwrap();
        let bundle = runtime.lookup(0.5, 0.5).unwrap();
        assert_eq!(bundle["lookup_status"], "ok");
        assert_eq!(bundle["result"]["admin_hierarchy"].as_array().unwrap().len(), 2);
        assert_eq!(bundle["result"]["country"]["name"], "Zedland");
    }

    #[test]
    fn lookup_outside_polygon_is_failed_with_empty_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        minimal_dataset(dir.path(), &[2], false, false);

        let runtime = CadisRuntime::open(dir.path(), None).unwrap();
        let bundle = runtime.lookup(99.0, 99.0).unwrap();
        assert_eq!(bundle["lookup_status"], "failed");
        assert_eq!(bundle["result"]["admin_hierarchy"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn open_fails_fast_when_required_files_are_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = CadisRuntime::open(dir.path(), None).unwrap_err();
        assert!(err.to_string().contains("not bootstrapped") || format!("{err:?}").contains("DatasetNotBootstrapped"));
    }

    #[test]
    fn country_name_override_wins_over_manifest() {
        let dir = tempfile::tempdir().unwrap();
        minimal_dataset(dir.path(), &[2], false, false);
        let runtime = CadisRuntime::open(dir.path(), Some("Overridden")).unwrap();
        let bundle = runtime.lookup(0.5, 0.5).unwrap();
        assert_eq!(bundle["result"]["country"]["name"], "Overridden");
    }
}
