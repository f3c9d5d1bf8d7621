//! Hierarchy/repair anchor maps: flat lookup tables built once from the
//! dataset's `hierarchy.json`/`repair.json` side files, consumed by the
//! supplementation stages of the lookup pipeline via closures so the
//! pipeline itself never touches JSON (§4.C/§4.E).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyHit {
    pub level: i64,
    pub name: Option<String>,
    pub osm_id: String,
    pub source: &'static str,
}

/// Maps a level-`child_levels` node's `name` to its ancestor at
/// `parent_level`, by walking the exported admin tree's `parent_id` links.
pub fn load_hierarchy_parent_map(
    dataset_dir: &Path,
    child_levels: &BTreeSet<i64>,
    parent_level: i64,
) -> Result<BTreeMap<String, HierarchyHit>> {
    let path = dataset_dir.join("hierarchy.json");
    let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let raw: Value = serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    let nodes = raw.get("nodes").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut node_by_id: BTreeMap<String, &Value> = BTreeMap::new();
    for node in &nodes {
        if let Some(id) = node.get("id").and_then(Value::as_str) {
            if !id.is_empty() {
                node_by_id.insert(id.to_string(), node);
            }
        }
    }

    let mut by_child_name = BTreeMap::new();
    for node in &nodes {
        let Some(level) = node.get("level").and_then(Value::as_i64) else { continue };
        if !child_levels.contains(&level) {
            continue;
        }
        let Some(parent_id) = node.get("parent_id").and_then(Value::as_str) else { continue };
        let Some(parent) = node_by_id.get(parent_id) else { continue };
        if parent.get("level").and_then(Value::as_i64) != Some(parent_level) {
            continue;
        }
        let Some(child_name) = node.get("name").and_then(Value::as_str).filter(|s| !s.is_empty()) else { continue };
        let Some(parent_osm_id) = parent.get("id").and_then(Value::as_str) else { continue };
        by_child_name.insert(
            child_name.to_string(),
            HierarchyHit {
                level: parent_level,
                name: parent.get("name").and_then(Value::as_str).map(str::to_string),
                osm_id: parent_osm_id.to_string(),
                source: "admin_tree_name",
            },
        );
    }
    Ok(by_child_name)
}

/// `l8 name -> (l4 name, l4 osm_id)` built from `repair.json`'s
/// `l8_to_l4_anchor` map, accepting either the flat `{l8: l4_id}` shape or
/// the structured `{l8: {l4_semantic_id, l4_name}}` shape, falling back
/// to `canonical_l4[l4_id]` when a name is absent.
pub fn load_repair_anchor_map(dataset_dir: &Path) -> Result<(BTreeMap<String, (String, String)>, &'static str)> {
    let path = dataset_dir.join("repair.json");
    let text = std::fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let raw: Value = serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;

    let anchors = raw.get("l8_to_l4_anchor").and_then(Value::as_object).cloned().unwrap_or_default();
    let canonical = raw.get("canonical_l4").and_then(Value::as_object).cloned().unwrap_or_default();

    let mut normalized = BTreeMap::new();
    for (l8_name, mapping) in &anchors {
        if l8_name.is_empty() {
            continue;
        }
        let (l4_id, l4_name_hint) = match mapping {
            Value::String(l4_id) => (l4_id.clone(), canonical.get(l4_id).and_then(Value::as_str).map(str::to_string)),
            Value::Object(obj) => (
                obj.get("l4_semantic_id").and_then(Value::as_str).unwrap_or_default().to_string(),
                obj.get("l4_name").and_then(Value::as_str).map(str::to_string),
            ),
            _ => continue,
        };
        if l4_id.is_empty() {
            continue;
        }
        let l4_name = l4_name_hint
            .filter(|s| !s.is_empty())
            .or_else(|| canonical.get(&l4_id).and_then(Value::as_str).map(str::to_string))
            .filter(|s| !s.is_empty());
        let Some(l4_name) = l4_name else { continue };
        normalized.insert(l8_name.clone(), (l4_name, l4_id));
    }
    Ok((normalized, "loaded_external"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hierarchy_map_links_child_name_to_parent() {
        let dir = tempfile::tempdir().unwrap();
        let hierarchy = json!({
            "nodes": [
                {"id": "p1", "level": 4, "name": "Province One", "parent_id": null},
                {"id": "c1", "level": 8, "name": "District One", "parent_id": "p1"}
            ]
        });
        std::fs::write(dir.path().join("hierarchy.json"), serde_json::to_vec(&hierarchy).unwrap()).unwrap();

        let map = load_hierarchy_parent_map(dir.path(), &BTreeSet::from([8]), 4).unwrap();
        let hit = map.get("District One").unwrap();
        assert_eq!(hit.osm_id, "p1");
        assert_eq!(hit.name.as_deref(), Some("Province One"));
    }

    #[test]
    fn repair_map_accepts_flat_and_structured_shapes_with_canonical_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let repair = json!({
            "l8_to_l4_anchor": {
                "Flat District": "l4-1",
                "Structured District": {"l4_semantic_id": "l4-2", "l4_name": "Explicit Name"},
                "Fallback District": {"l4_semantic_id": "l4-3"}
            },
            "canonical_l4": {"l4-1": "Canonical One", "l4-3": "Canonical Three"}
        });
        std::fs::write(dir.path().join("repair.json"), serde_json::to_vec(&repair).unwrap()).unwrap();

        let (map, source) = load_repair_anchor_map(dir.path()).unwrap();
        assert_eq!(source, "loaded_external");
        assert_eq!(map.get("Flat District").unwrap(), &("Canonical One".to_string(), "l4-1".to_string()));
        assert_eq!(map.get("Structured District").unwrap(), &("Explicit Name".to_string(), "l4-2".to_string()));
        assert_eq!(map.get("Fallback District").unwrap(), &("Canonical Three".to_string(), "l4-3".to_string()));
    }
}
