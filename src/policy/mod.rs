//! Runtime policy document (§4.C): the per-dataset contract describing
//! which admin levels and shapes a country supports, how hierarchy/repair
//! supplementation is keyed, and which deterministic semantic overlays
//! apply after status is assigned.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{CadisError, Result};

pub type Shape = Vec<i64>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionalLayerDeclaration {
    pub name: String,
    pub file: String,
    pub layer_type: String,
    pub stage: String,
    pub deterministic: bool,
}

#[derive(Debug, Clone)]
pub struct RuntimePolicy {
    pub runtime_policy_version: String,
    pub allowed_levels: Vec<i64>,
    pub allowed_shapes: BTreeSet<Shape>,
    pub shape_status_map: BTreeMap<Shape, String>,
    pub hierarchy_parent_level: i64,
    pub hierarchy_child_levels: BTreeSet<i64>,
    pub repair_parent_level: i64,
    pub repair_child_levels: BTreeSet<i64>,
    pub hierarchy_required: bool,
    pub repair_required: bool,
    pub nearby_fallback_enabled: bool,
    pub nearby_max_distance_km: Option<f64>,
    pub offshore_max_distance_km: Option<f64>,
    pub optional_layers: Vec<OptionalLayerDeclaration>,
}

fn invalid(dataset_dir: &Path, reason: impl Into<String>) -> anyhow::Error {
    CadisError::policy_invalid(dataset_dir.to_path_buf(), reason).into()
}

fn as_i64(value: &Value) -> Option<i64> {
    if value.is_i64() || value.is_u64() {
        value.as_i64().or_else(|| value.as_u64().map(|v| v as i64))
    } else {
        None
    }
}

fn as_int_list(value: Option<&Value>, field: &str, dataset_dir: &Path, allow_empty: bool) -> Result<Vec<i64>> {
    let arr = value
        .and_then(Value::as_array)
        .filter(|a| allow_empty || !a.is_empty())
        .ok_or_else(|| invalid(dataset_dir, format!("{field} must be a non-empty list.")))?;
    let mut out = Vec::new();
    for item in arr {
        let n = as_i64(item).ok_or_else(|| invalid(dataset_dir, format!("{field} entries must be integers.")))?;
        if !out.contains(&n) {
            out.push(n);
        }
    }
    Ok(out)
}

fn sorted_dedup_shape(levels: &[i64]) -> Shape {
    let mut shape: Shape = levels.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
    shape.sort_unstable();
    shape
}

pub fn load_runtime_policy(dataset_dir: &Path) -> Result<RuntimePolicy> {
    let policy_path = dataset_dir.join("runtime_policy.json");
    if !policy_path.exists() {
        return Err(invalid(dataset_dir, "runtime_policy.json is missing."));
    }
    let text = std::fs::read_to_string(&policy_path)
        .map_err(|e| invalid(dataset_dir, format!("runtime_policy.json could not be read: {e}")))?;
    let raw: Value = serde_json::from_str(&text)
        .map_err(|e| invalid(dataset_dir, format!("runtime_policy.json is malformed JSON: {e}")))?;
    let raw = raw
        .as_object()
        .ok_or_else(|| invalid(dataset_dir, "runtime_policy.json must be a JSON object."))?;

    let version = raw
        .get("runtime_policy_version")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| invalid(dataset_dir, "runtime_policy_version is required."))?
        .trim()
        .to_string();

    let allowed_levels = as_int_list(raw.get("allowed_levels"), "allowed_levels", dataset_dir, false)?;
    let allowed_set: BTreeSet<i64> = allowed_levels.iter().copied().collect();

    let allowed_shapes_raw = raw
        .get("allowed_shapes")
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| invalid(dataset_dir, "allowed_shapes must be a non-empty list."))?;
    let mut allowed_shapes: BTreeSet<Shape> = BTreeSet::new();
    for entry in allowed_shapes_raw {
        let items = entry
            .as_array()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| invalid(dataset_dir, "allowed_shapes entries must be non-empty integer lists."))?;
        let mut levels = Vec::with_capacity(items.len());
        for item in items {
            levels.push(
                as_i64(item)
                    .ok_or_else(|| invalid(dataset_dir, "allowed_shapes entries must contain integers only."))?,
            );
        }
        let shape = sorted_dedup_shape(&levels);
        if shape.iter().any(|l| !allowed_set.contains(l)) {
            return Err(invalid(dataset_dir, "allowed_shapes contains levels outside allowed_levels."));
        }
        allowed_shapes.insert(shape);
    }
    if allowed_shapes.is_empty() {
        return Err(invalid(dataset_dir, "allowed_shapes resolved to empty set."));
    }

    let shape_status_raw = raw
        .get("shape_status")
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| invalid(dataset_dir, "shape_status must be a non-empty list."))?;
    let mut shape_status_map: BTreeMap<Shape, String> = BTreeMap::new();
    for entry in shape_status_raw {
        let obj = entry
            .as_object()
            .ok_or_else(|| invalid(dataset_dir, "shape_status entries must be objects."))?;
        let levels = as_int_list(obj.get("levels"), "shape_status.levels", dataset_dir, false)?;
        let status = obj
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(dataset_dir, "shape_status.status must be one of ok/partial/failed."))?;
        if !matches!(status, "ok" | "partial" | "failed") {
            return Err(invalid(dataset_dir, "shape_status.status must be one of ok/partial/failed."));
        }
        let shape = sorted_dedup_shape(&levels);
        if !allowed_shapes.contains(&shape) {
            return Err(invalid(dataset_dir, "shape_status references shape not in allowed_shapes."));
        }
        shape_status_map.insert(shape, status.to_string());
    }
    if shape_status_map.is_empty() {
        return Err(invalid(dataset_dir, "shape_status map resolved to empty."));
    }

    let layers_raw = raw
        .get("layers")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid(dataset_dir, "layers must be an object."))?;
    let hierarchy_required = layers_raw
        .get("hierarchy_required")
        .and_then(Value::as_bool)
        .ok_or_else(|| invalid(dataset_dir, "layers.hierarchy_required must be boolean."))?;
    let repair_required = layers_raw
        .get("repair_required")
        .and_then(Value::as_bool)
        .ok_or_else(|| invalid(dataset_dir, "layers.repair_required must be boolean."))?;

    let hierarchy_raw = raw
        .get("hierarchy_repair_rules")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid(dataset_dir, "hierarchy_repair_rules must be an object."))?;
    let hierarchy_parent_level = hierarchy_raw
        .get("parent_level")
        .and_then(as_i64)
        .ok_or_else(|| invalid(dataset_dir, "hierarchy_repair_rules.parent_level must be integer."))?;
    let hierarchy_child_levels: BTreeSet<i64> = as_int_list(
        hierarchy_raw.get("child_levels"),
        "hierarchy_repair_rules.child_levels",
        dataset_dir,
        !hierarchy_required,
    )?
    .into_iter()
    .collect();

    let repair_raw = raw
        .get("repair_rules")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid(dataset_dir, "repair_rules must be an object."))?;
    let repair_parent_level = repair_raw
        .get("parent_level")
        .and_then(as_i64)
        .ok_or_else(|| invalid(dataset_dir, "repair_rules.parent_level must be integer."))?;
    let repair_child_levels: BTreeSet<i64> = as_int_list(
        repair_raw.get("child_levels"),
        "repair_rules.child_levels",
        dataset_dir,
        !repair_required,
    )?
    .into_iter()
    .collect();

    if !allowed_set.contains(&hierarchy_parent_level) {
        return Err(invalid(dataset_dir, "hierarchy_repair_rules.parent_level must be in allowed_levels."));
    }
    if !allowed_set.contains(&repair_parent_level) {
        return Err(invalid(dataset_dir, "repair_rules.parent_level must be in allowed_levels."));
    }
    if hierarchy_child_levels.iter().any(|c| !allowed_set.contains(c)) {
        return Err(invalid(dataset_dir, "hierarchy_repair_rules.child_levels must be in allowed_levels."));
    }
    if repair_child_levels.iter().any(|c| !allowed_set.contains(c)) {
        return Err(invalid(dataset_dir, "repair_rules.child_levels must be in allowed_levels."));
    }

    let nearby_raw = raw.get("nearby_policy").cloned().unwrap_or(Value::Object(Default::default()));
    let nearby_obj = if nearby_raw.is_null() {
        serde_json::Map::new()
    } else {
        nearby_raw
            .as_object()
            .cloned()
            .ok_or_else(|| invalid(dataset_dir, "nearby_policy must be an object when present."))?
    };

    let nearby_fallback_enabled = match nearby_obj.get("enabled") {
        None => true,
        Some(v) => v
            .as_bool()
            .ok_or_else(|| invalid(dataset_dir, "nearby_policy.enabled must be boolean."))?,
    };

    let nearby_max_distance_km = parse_optional_positive_distance(
        nearby_obj.get("max_distance_km"),
        Some(2.0),
        "nearby_policy.max_distance_km",
        dataset_dir,
    )?;
    let offshore_max_distance_km = parse_optional_positive_distance(
        nearby_obj.get("offshore_max_distance_km"),
        Some(20.0),
        "nearby_policy.offshore_max_distance_km",
        dataset_dir,
    )?;

    if let (Some(near), Some(offshore)) = (nearby_max_distance_km, offshore_max_distance_km) {
        if near > offshore {
            return Err(invalid(
                dataset_dir,
                "nearby_policy.max_distance_km must be <= nearby_policy.offshore_max_distance_km.",
            ));
        }
    }

    let optional_layers_raw = match raw.get("optional_layers") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(a)) => a.clone(),
        Some(_) => return Err(invalid(dataset_dir, "optional_layers must be a list when present.")),
    };
    let mut optional_layers = Vec::new();
    let mut seen_names: BTreeSet<String> = BTreeSet::new();
    for (idx, entry) in optional_layers_raw.iter().enumerate() {
        let obj = entry
            .as_object()
            .ok_or_else(|| invalid(dataset_dir, format!("optional_layers[{idx}] must be an object.")))?;
        let name = obj
            .get("name")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid(dataset_dir, format!("optional_layers[{idx}].name is required.")))?
            .trim()
            .to_string();
        if !seen_names.insert(name.clone()) {
            return Err(invalid(dataset_dir, format!("optional_layers has duplicate name: {name:?}.")));
        }
        let file_name = obj
            .get("file")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid(dataset_dir, format!("optional_layers[{idx}].file is required.")))?
            .trim();
        let rel = PathBuf::from(file_name);
        if rel.is_absolute() || rel.components().any(|c| c.as_os_str() == "..") {
            return Err(invalid(
                dataset_dir,
                format!("optional_layers[{idx}].file must be a relative path within dataset root."),
            ));
        }
        let layer_type = obj.get("type").and_then(Value::as_str).unwrap_or_default();
        if layer_type != "semantic_overlay" {
            return Err(invalid(dataset_dir, format!("optional_layers[{idx}].type must be 'semantic_overlay'.")));
        }
        let stage = obj.get("stage").and_then(Value::as_str).unwrap_or_default();
        if stage != "post_status" {
            return Err(invalid(dataset_dir, format!("optional_layers[{idx}].stage must be 'post_status'.")));
        }
        if obj.get("deterministic").and_then(Value::as_bool) != Some(true) {
            return Err(invalid(dataset_dir, format!("optional_layers[{idx}].deterministic must be true.")));
        }
        optional_layers.push(OptionalLayerDeclaration {
            name,
            file: rel.to_string_lossy().replace('\\', "/"),
            layer_type: layer_type.to_string(),
            stage: stage.to_string(),
            deterministic: true,
        });
    }

    Ok(RuntimePolicy {
        runtime_policy_version: version,
        allowed_levels: allowed_set.into_iter().collect(),
        allowed_shapes,
        shape_status_map,
        hierarchy_parent_level,
        hierarchy_child_levels,
        repair_parent_level,
        repair_child_levels,
        hierarchy_required,
        repair_required,
        nearby_fallback_enabled,
        nearby_max_distance_km,
        offshore_max_distance_km,
        optional_layers,
    })
}

fn parse_optional_positive_distance(
    value: Option<&Value>,
    default: Option<f64>,
    field: &str,
    dataset_dir: &Path,
) -> Result<Option<f64>> {
    let value = match value {
        None => return Ok(default),
        Some(Value::Null) => return Ok(None),
        Some(v) => v,
    };
    let n = value
        .as_f64()
        .ok_or_else(|| invalid(dataset_dir, format!("{field} must be number or null.")))?;
    if n <= 0.0 {
        return Err(invalid(dataset_dir, format!("{field} must be > 0 when present.")));
    }
    Ok(Some(n))
}

pub fn load_dataset_country_name(dataset_dir: &Path) -> String {
    let manifest_path = dataset_dir.join("dataset_release_manifest.json");
    let Ok(text) = std::fs::read_to_string(&manifest_path) else {
        return "Unknown Country".to_string();
    };
    let Ok(raw) = serde_json::from_str::<Value>(&text) else {
        return "Unknown Country".to_string();
    };
    if let Some(name) = raw.get("country_name").and_then(Value::as_str) {
        if !name.trim().is_empty() {
            return name.trim().to_string();
        }
    }
    if let Some(iso) = raw.get("country_iso").and_then(Value::as_str) {
        if !iso.trim().is_empty() {
            return iso.trim().to_uppercase();
        }
    }
    if let Some(id) = raw.get("dataset_id").and_then(Value::as_str) {
        if !id.trim().is_empty() {
            return id.trim().to_string();
        }
    }
    "Unknown Country".to_string()
}

pub fn ensure_declared_overlay_files_present(dataset_dir: &Path, policy: &RuntimePolicy) -> Result<()> {
    let mut missing: Vec<String> = policy
        .optional_layers
        .iter()
        .filter(|decl| !dataset_dir.join(&decl.file).exists())
        .map(|decl| decl.file.clone())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort();
    Err(CadisError::not_bootstrapped(dataset_dir.to_path_buf(), missing).into())
}

#[derive(Debug, Clone)]
pub struct SemanticOverlay {
    pub name: String,
    pub file: String,
    pub result_metadata: serde_json::Map<String, Value>,
    pub name_overrides_by_osm_id: BTreeMap<String, String>,
}

impl SemanticOverlay {
    /// Apply this overlay's deterministic transforms to a public result
    /// bundle (the JSON shape returned to callers). Only `result.*` keys
    /// this overlay declares are touched.
    pub fn apply(&self, bundle: &Value) -> Value {
        let mut out = bundle.clone();
        let Some(result) = out.get_mut("result").and_then(Value::as_object_mut) else {
            return out;
        };
        if !self.result_metadata.is_empty() {
            let overlays = result
                .entry("semantic_overlays")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(overlays) = overlays.as_object_mut() {
                overlays.insert(self.name.clone(), Value::Object(self.result_metadata.clone()));
            }
        }
        if !self.name_overrides_by_osm_id.is_empty() {
            if let Some(hierarchy) = result.get_mut("admin_hierarchy").and_then(Value::as_array_mut) {
                for node in hierarchy.iter_mut() {
                    let Some(node) = node.as_object_mut() else { continue };
                    let osm_id = node.get("osm_id").and_then(Value::as_str).map(str::to_string);
                    if let Some(osm_id) = osm_id {
                        if let Some(new_name) = self.name_overrides_by_osm_id.get(&osm_id) {
                            node.insert("name".to_string(), Value::String(new_name.clone()));
                        }
                    }
                }
            }
        }
        out
    }
}

fn load_overlay_file(path: &Path, dataset_dir: &Path, overlay_name: &str) -> Result<SemanticOverlay> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| invalid(dataset_dir, format!("optional overlay {overlay_name:?} could not be read: {e}")))?;
    let raw: Value = serde_json::from_str(&text)
        .map_err(|e| invalid(dataset_dir, format!("optional overlay {overlay_name:?} is malformed JSON: {e}")))?;
    let obj = raw
        .as_object()
        .ok_or_else(|| invalid(dataset_dir, format!("optional overlay {overlay_name:?} must be a JSON object.")))?;

    const ALLOWED_KEYS: [&str; 3] = ["overlay_version", "result_metadata", "name_overrides_by_osm_id"];
    let unknown: Vec<&String> = obj.keys().filter(|k| !ALLOWED_KEYS.contains(&k.as_str())).collect();
    if !unknown.is_empty() {
        let mut unknown: Vec<String> = unknown.into_iter().cloned().collect();
        unknown.sort();
        return Err(invalid(
            dataset_dir,
            format!("optional overlay {overlay_name:?} contains unsupported keys: {unknown:?}"),
        ));
    }

    let result_metadata = match obj.get("result_metadata") {
        None => serde_json::Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(_) => {
            return Err(invalid(
                dataset_dir,
                format!("optional overlay {overlay_name:?} result_metadata must be an object."),
            ))
        }
    };
    let name_overrides_raw = match obj.get("name_overrides_by_osm_id") {
        None => serde_json::Map::new(),
        Some(Value::Object(m)) => m.clone(),
        Some(_) => {
            return Err(invalid(
                dataset_dir,
                format!("optional overlay {overlay_name:?} name_overrides_by_osm_id must be an object."),
            ))
        }
    };
    let mut name_overrides_by_osm_id = BTreeMap::new();
    for (k, v) in &name_overrides_raw {
        let v = v
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| invalid(dataset_dir, format!("optional overlay {overlay_name:?} override values must be non-empty strings.")))?;
        if k.is_empty() {
            return Err(invalid(dataset_dir, format!("optional overlay {overlay_name:?} override keys must be non-empty strings.")));
        }
        name_overrides_by_osm_id.insert(k.clone(), v.to_string());
    }
    if result_metadata.is_empty() && name_overrides_by_osm_id.is_empty() {
        return Err(invalid(
            dataset_dir,
            format!("optional overlay {overlay_name:?} must define at least one deterministic transform."),
        ));
    }

    Ok(SemanticOverlay {
        name: overlay_name.to_string(),
        file: path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
        result_metadata,
        name_overrides_by_osm_id,
    })
}

pub fn load_semantic_overlays(dataset_dir: &Path, policy: &RuntimePolicy) -> Result<Vec<SemanticOverlay>> {
    policy
        .optional_layers
        .iter()
        .map(|decl| load_overlay_file(&dataset_dir.join(&decl.file), dataset_dir, &decl.name))
        .collect()
}

fn hierarchy_fingerprint(bundle: &Value) -> (Option<Value>, usize, Vec<Option<String>>, Vec<Option<Value>>, Vec<Value>) {
    let status = bundle.get("lookup_status").cloned();
    let nodes: Vec<&serde_json::Map<String, Value>> = bundle
        .get("result")
        .and_then(|r| r.get("admin_hierarchy"))
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default();
    let count = nodes.len();
    let osm_ids = nodes.iter().map(|n| n.get("osm_id").and_then(Value::as_str).map(str::to_string)).collect();
    let levels = nodes.iter().map(|n| n.get("level").cloned()).collect();
    let ranks = nodes
        .iter()
        .map(|n| n.get("rank").cloned().unwrap_or(Value::String("__MISSING__".to_string())))
        .collect();
    (status, count, osm_ids, levels, ranks)
}

/// Apply every declared overlay in order, then assert the structural
/// hierarchy (status, node count, osm_id/level/rank sequences) is
/// byte-for-byte unchanged. A violation is a programmer error in an
/// overlay file, not a recoverable runtime condition, so it panics.
pub fn apply_semantic_overlays(bundle: &Value, overlays: &[SemanticOverlay]) -> Value {
    if overlays.is_empty() {
        return bundle.clone();
    }
    let before = hierarchy_fingerprint(bundle);

    let mut out = bundle.clone();
    for overlay in overlays {
        out = overlay.apply(&out);
    }

    let after = hierarchy_fingerprint(&out);
    assert_eq!(after.0, before.0, "semantic overlay must not modify lookup_status.");
    assert_eq!(after.1, before.1, "semantic overlay must not change hierarchy node count.");
    assert_eq!(after.2, before.2, "semantic overlay must not modify/reorder osm_id sequence.");
    assert_eq!(after.3, before.3, "semantic overlay must not modify structural hierarchy levels.");
    assert_eq!(after.4, before.4, "semantic overlay must not modify/reorder rank sequence.");
    out
}
