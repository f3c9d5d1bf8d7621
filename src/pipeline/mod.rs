//! The five-stage evidence pipeline (§4.E): geometry hits, hierarchy
//! supplementation, repair supplementation, merge/filter/dedupe/sort, and
//! result assembly. This module has no knowledge of JSON files on disk —
//! hierarchy/repair lookups are injected as provider closures so it stays
//! decoupled from `policy`/`pipeline::providers`.

pub mod providers;

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};

use crate::ffsf::GeometryHit;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceNode {
    pub level: i64,
    pub name: Option<String>,
    pub osm_id: Option<String>,
    pub source: String,
    pub evidence_type: String,
}

/// What a hierarchy/repair provider receives and returns: the evidence
/// accumulated so far (so it can read a child level's name) and the set
/// of levels still missing, producing at most one supplementary node.
pub type Provider<'a> = dyn Fn(&BTreeMap<i64, EvidenceNode>, &BTreeSet<i64>) -> BTreeMap<i64, EvidenceNode> + 'a;

/// Stage 1: tag every polygon hit as geometry evidence. Level order is
/// ascending because `BTreeMap` iterates its keys in order.
pub fn collect_geometry_evidence(polygon_hits: BTreeMap<i64, GeometryHit>) -> BTreeMap<i64, EvidenceNode> {
    polygon_hits
        .into_iter()
        .map(|(level, hit)| {
            (
                level,
                EvidenceNode {
                    level,
                    name: hit.name,
                    osm_id: hit.osm_id,
                    source: hit.source.to_string(),
                    evidence_type: "geometry".to_string(),
                },
            )
        })
        .collect()
}

fn normalize_supplement_nodes(
    supplement: BTreeMap<i64, EvidenceNode>,
    source_default: &str,
    evidence_type_default: &str,
    allowed_levels: &BTreeSet<i64>,
    existing_levels: &BTreeSet<i64>,
) -> BTreeMap<i64, EvidenceNode> {
    supplement
        .into_iter()
        .filter(|(level, _)| !existing_levels.contains(level) && allowed_levels.contains(level))
        .map(|(level, mut node)| {
            node.level = level;
            if node.source.is_empty() {
                node.source = source_default.to_string();
            }
            node.evidence_type = evidence_type_default.to_string();
            (level, node)
        })
        .collect()
}

/// Stage 2: if `parent_level` is missing and hierarchy is required, ask
/// the provider for it; the provider itself decides which child level to
/// anchor on.
pub fn supplement_from_hierarchy(
    geometry_evidence: &BTreeMap<i64, EvidenceNode>,
    allowed_levels: &BTreeSet<i64>,
    hierarchy_provider: Option<&Provider<'_>>,
) -> BTreeMap<i64, EvidenceNode> {
    let existing_levels: BTreeSet<i64> = geometry_evidence.keys().copied().collect();
    let missing_levels: BTreeSet<i64> = allowed_levels.difference(&existing_levels).copied().collect();

    let raw = match hierarchy_provider {
        Some(provider) if !missing_levels.is_empty() => provider(geometry_evidence, &missing_levels),
        _ => BTreeMap::new(),
    };
    normalize_supplement_nodes(raw, "admin_tree_name", "hierarchy_repair", allowed_levels, &existing_levels)
}

/// Stage 3: same shape as stage 2, against the repair anchor dataset.
pub fn supplement_from_repair_dataset(
    merged_evidence: &BTreeMap<i64, EvidenceNode>,
    allowed_levels: &BTreeSet<i64>,
    repair_provider: Option<&Provider<'_>>,
) -> BTreeMap<i64, EvidenceNode> {
    let existing_levels: BTreeSet<i64> = merged_evidence.keys().copied().collect();
    let missing_levels: BTreeSet<i64> = allowed_levels.difference(&existing_levels).copied().collect();

    let raw = match repair_provider {
        Some(provider) if !missing_levels.is_empty() => provider(merged_evidence, &missing_levels),
        _ => BTreeMap::new(),
    };
    normalize_supplement_nodes(raw, "semantic_anchor", "semantic_anchor", allowed_levels, &existing_levels)
}

/// First-seen-wins merge across layers, in `geometry > hierarchy > repair`
/// priority order.
fn merge_evidence_in_priority_order(layers: &[&BTreeMap<i64, EvidenceNode>]) -> BTreeMap<i64, EvidenceNode> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (level, node) in layer.iter() {
            merged.entry(*level).or_insert_with(|| node.clone());
        }
    }
    merged
}

/// Stage 4: filter to `allowed_levels` and deduplicate by
/// `(level, osm_id, name, source)`. Levels are already unique map keys,
/// so ascending order and per-level uniqueness fall out of iterating a
/// `BTreeMap`; the explicit key dedup guards against a provider that
/// somehow produced a byte-identical duplicate.
fn filter_and_dedupe(merged: BTreeMap<i64, EvidenceNode>, allowed_levels: &BTreeSet<i64>) -> Vec<EvidenceNode> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for (level, node) in merged {
        if !allowed_levels.contains(&level) {
            continue;
        }
        let key = (node.level, node.osm_id.clone(), node.name.clone(), node.source.clone());
        if seen.insert(key) {
            out.push(node);
        }
    }
    out
}

/// Stage 5: `failed` unless the node-level shape is declared in
/// `allowed_shapes`; otherwise the declared status, defaulting to
/// `partial` for shapes the operator didn't enumerate explicitly.
pub fn evaluate_lookup_status(
    nodes: &[EvidenceNode],
    allowed_shapes: &BTreeSet<Vec<i64>>,
    shape_status_map: &BTreeMap<Vec<i64>, String>,
) -> String {
    if nodes.is_empty() {
        return "failed".to_string();
    }
    let shape: Vec<i64> = nodes.iter().map(|n| n.level).collect::<BTreeSet<_>>().into_iter().collect();
    if !allowed_shapes.contains(&shape) {
        return "failed".to_string();
    }
    shape_status_map.get(&shape).cloned().unwrap_or_else(|| "partial".to_string())
}

fn assign_rank(nodes: Vec<EvidenceNode>) -> Vec<(usize, EvidenceNode)> {
    nodes.into_iter().enumerate().collect()
}

/// Stage 6: the public result envelope (§3). Nodes must already be
/// sorted ascending by level — callers get that for free from `BTreeMap`
/// iteration order.
pub fn assemble_result(
    nodes: Vec<EvidenceNode>,
    status: &str,
    engine: &str,
    version: &str,
    country_name: &str,
    result_source: Option<&str>,
    context_anchor: Option<Value>,
) -> Value {
    let ranked = assign_rank(nodes);
    let admin_hierarchy: Vec<Value> = ranked
        .into_iter()
        .map(|(rank, node)| {
            json!({
                "rank": rank,
                "osm_id": node.osm_id,
                "level": node.level,
                "name": node.name,
                "source": node.source,
            })
        })
        .collect();

    let mut result = Map::new();
    result.insert("country".to_string(), json!({"level": 2, "name": country_name}));
    result.insert("admin_hierarchy".to_string(), Value::Array(admin_hierarchy));
    if let Some(source) = result_source {
        result.insert("source".to_string(), Value::String(source.to_string()));
    }
    if let Some(anchor) = context_anchor {
        result.insert("context_anchor".to_string(), anchor);
    }

    json!({
        "lookup_status": status,
        "engine": engine,
        "version": version,
        "result": Value::Object(result),
    })
}

/// Run all five stages against one set of polygon hits, producing the
/// public result bundle ready for [`crate::policy::apply_semantic_overlays`].
#[allow(clippy::too_many_arguments)]
pub fn run_lookup_pipeline(
    polygon_hits: BTreeMap<i64, GeometryHit>,
    allowed_levels: &BTreeSet<i64>,
    allowed_shapes: &BTreeSet<Vec<i64>>,
    shape_status_map: &BTreeMap<Vec<i64>, String>,
    engine: &str,
    version: &str,
    country_name: &str,
    hierarchy_provider: Option<&Provider<'_>>,
    repair_provider: Option<&Provider<'_>>,
) -> Value {
    let geometry = collect_geometry_evidence(polygon_hits);

    let hierarchy_supplement = supplement_from_hierarchy(&geometry, allowed_levels, hierarchy_provider);
    let merged_after_hierarchy = merge_evidence_in_priority_order(&[&geometry, &hierarchy_supplement]);

    let repair_supplement = supplement_from_repair_dataset(&merged_after_hierarchy, allowed_levels, repair_provider);
    let merged = merge_evidence_in_priority_order(&[&geometry, &hierarchy_supplement, &repair_supplement]);

    let nodes = filter_and_dedupe(merged, allowed_levels);
    let status = evaluate_lookup_status(&nodes, allowed_shapes, shape_status_map);

    let final_nodes = if status == "failed" { Vec::new() } else { nodes };
    assemble_result(final_nodes, &status, engine, version, country_name, None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(level: i64, name: &str, osm_id: &str, source: &str) -> EvidenceNode {
        EvidenceNode {
            level,
            name: Some(name.to_string()),
            osm_id: Some(osm_id.to_string()),
            source: source.to_string(),
            evidence_type: "geometry".to_string(),
        }
    }

    fn hit(level: i64, name: &str, osm_id: &str) -> GeometryHit {
        GeometryHit { level, name: Some(name.to_string()), osm_id: Some(osm_id.to_string()), source: "polygon" }
    }

    fn levels(set: &[i64]) -> BTreeSet<i64> {
        set.iter().copied().collect()
    }

    #[test]
    fn full_geometry_hit_at_every_level_yields_ok_status() {
        let hits = BTreeMap::from([(2, hit(2, "Country", "n2")), (4, hit(4, "Province", "n4")), (8, hit(8, "District", "n8"))]);
        let allowed_levels = levels(&[2, 4, 8]);
        let allowed_shapes = BTreeSet::from([vec![2, 4, 8]]);
        let shape_status_map = BTreeMap::from([(vec![2, 4, 8], "ok".to_string())]);

        let bundle = run_lookup_pipeline(
            hits, &allowed_levels, &allowed_shapes, &shape_status_map, "cadis", "0.1.0", "Testland", None, None,
        );
        assert_eq!(bundle["lookup_status"], "ok");
        assert_eq!(bundle["result"]["admin_hierarchy"].as_array().unwrap().len(), 3);
        assert_eq!(bundle["result"]["admin_hierarchy"][2]["rank"], 2);
    }

    #[test]
    fn missing_required_shape_yields_failed_with_empty_hierarchy() {
        let hits = BTreeMap::from([(8, hit(8, "District", "n8"))]);
        let allowed_levels = levels(&[2, 4, 8]);
        let allowed_shapes = BTreeSet::from([vec![2, 4, 8]]);
        let shape_status_map = BTreeMap::from([(vec![2, 4, 8], "ok".to_string())]);

        let bundle = run_lookup_pipeline(
            hits, &allowed_levels, &allowed_shapes, &shape_status_map, "cadis", "0.1.0", "Testland", None, None,
        );
        assert_eq!(bundle["lookup_status"], "failed");
        assert_eq!(bundle["result"]["admin_hierarchy"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn hierarchy_provider_fills_missing_parent_from_child_name() {
        let hits = BTreeMap::from([(8, hit(8, "District One", "n8"))]);
        let allowed_levels = levels(&[4, 8]);
        let allowed_shapes = BTreeSet::from([vec![4, 8]]);
        let shape_status_map = BTreeMap::from([(vec![4, 8], "ok".to_string())]);

        let provider = |evidence: &BTreeMap<i64, EvidenceNode>, missing: &BTreeSet<i64>| -> BTreeMap<i64, EvidenceNode> {
            if !missing.contains(&4) {
                return BTreeMap::new();
            }
            let Some(child) = evidence.get(&8) else { return BTreeMap::new() };
            if child.name.as_deref() == Some("District One") {
                BTreeMap::from([(4, node(4, "Province One", "p1", "admin_tree_name"))])
            } else {
                BTreeMap::new()
            }
        };

        let bundle = run_lookup_pipeline(
            hits, &allowed_levels, &allowed_shapes, &shape_status_map, "cadis", "0.1.0", "Testland",
            Some(&provider), None,
        );
        assert_eq!(bundle["lookup_status"], "ok");
        assert_eq!(bundle["result"]["admin_hierarchy"][0]["osm_id"], "p1");
        assert_eq!(bundle["result"]["admin_hierarchy"][0]["rank"], 0);
    }

    #[test]
    fn geometry_evidence_wins_over_hierarchy_supplement_at_same_level() {
        let hits = BTreeMap::from([(4, hit(4, "Direct Hit", "direct"))]);
        let allowed_levels = levels(&[4]);
        let allowed_shapes = BTreeSet::from([vec![4]]);
        let shape_status_map = BTreeMap::from([(vec![4], "ok".to_string())]);

        let provider = |_: &BTreeMap<i64, EvidenceNode>, _: &BTreeSet<i64>| {
            BTreeMap::from([(4, node(4, "Should Not Win", "shadow", "admin_tree_name"))])
        };

        let bundle = run_lookup_pipeline(
            hits, &allowed_levels, &allowed_shapes, &shape_status_map, "cadis", "0.1.0", "Testland",
            Some(&provider), None,
        );
        assert_eq!(bundle["result"]["admin_hierarchy"][0]["osm_id"], "direct");
    }

    #[test]
    fn unenumerated_shape_defaults_to_partial() {
        let hits = BTreeMap::from([(2, hit(2, "Country", "n2"))]);
        let allowed_levels = levels(&[2, 4]);
        let allowed_shapes = BTreeSet::from([vec![2], vec![2, 4]]);
        let shape_status_map = BTreeMap::new();

        let bundle = run_lookup_pipeline(
            hits, &allowed_levels, &allowed_shapes, &shape_status_map, "cadis", "0.1.0", "Testland", None, None,
        );
        assert_eq!(bundle["lookup_status"], "partial");
    }

    #[test]
    fn no_geometry_hits_at_all_is_failed() {
        let bundle = run_lookup_pipeline(
            BTreeMap::new(), &levels(&[2]), &BTreeSet::from([vec![2]]), &BTreeMap::new(),
            "cadis", "0.1.0", "Testland", None, None,
        );
        assert_eq!(bundle["lookup_status"], "failed");
    }
}
