//! FFSF v3 binary polygon index (§4.D): a flat, quantized ring format
//! read straight off disk with no parsing crate, matching the format the
//! exporter writes. Every query here is pure computation over bytes
//! already in memory — no I/O happens on this path.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Cursor, Read};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

const MAGIC: &[u8; 4] = b"FFSF";
const SUPPORTED_VERSION: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct FeatureIndexEntry {
    part_start_idx: u32,
    part_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct PartBBox {
    minx: f32,
    miny: f32,
    maxx: f32,
    maxy: f32,
}

#[derive(Debug, Clone, Copy)]
struct GeomIndexEntry {
    byte_offset: u32,
    byte_len: u32,
    ring_start_idx: u32,
    ring_count: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureMeta {
    pub level: i64,
    #[serde(default)]
    pub name: Option<String>,
    pub feature_id: Option<String>,
    #[serde(default)]
    pub country_scope_flag: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeometryHit {
    pub level: i64,
    pub name: Option<String>,
    pub osm_id: Option<String>,
    pub source: &'static str,
}

fn round_half_up(value: f64) -> i64 {
    (value + 0.5).floor() as i64
}

fn quantize(value: f64, min_value: f64, span: f64) -> u32 {
    if span == 0.0 {
        return 0;
    }
    let scaled = (value - min_value) / span * 65535.0;
    if scaled <= 0.0 {
        return 0;
    }
    if scaled >= 65535.0 {
        return 65535;
    }
    round_half_up(scaled) as u32
}

fn point_on_segment(px: i64, py: i64, x1: i64, y1: i64, x2: i64, y2: i64) -> bool {
    if px < x1.min(x2) || px > x1.max(x2) {
        return false;
    }
    if py < y1.min(y2) || py > y1.max(y2) {
        return false;
    }
    (x2 - x1) * (py - y1) == (y2 - y1) * (px - x1)
}

/// Even-odd ray cast in quantized integer space. Boundary counts as
/// inside, matching shapely's `covers()` semantics.
fn point_in_ring(qx: u32, qy: u32, ring: &[(u32, u32)]) -> bool {
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let (qx, qy) = (qx as i64, qy as i64);
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = (ring[i].0 as i64, ring[i].1 as i64);
        let (xj, yj) = (ring[j].0 as i64, ring[j].1 as i64);

        if point_on_segment(qx, qy, xj, yj, xi, yi) {
            return true;
        }

        let intersects = (yi > qy) != (yj > qy);
        if intersects {
            let den = yj - yi;
            if den != 0 {
                let x_cross = (xj - xi) as f64 * (qy - yi) as f64 / den as f64 + xi as f64;
                if (qx as f64) < x_cross {
                    inside = !inside;
                }
            }
        }
        j = i;
    }
    inside
}

fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const R: f64 = 6371.0;
    let lat1_r = lat1.to_radians();
    let lon1_r = lon1.to_radians();
    let lat2_r = lat2.to_radians();
    let lon2_r = lon2.to_radians();

    let dlat = lat2_r - lat1_r;
    let dlon = lon2_r - lon1_r;

    let a = (dlat / 2.0).sin().powi(2) + lat1_r.cos() * lat2_r.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    R * c
}

fn nearest_point_on_segment(px: f64, py: f64, x1: f64, y1: f64, x2: f64, y2: f64) -> (f64, f64) {
    let dx = x2 - x1;
    let dy = y2 - y1;
    if dx == 0.0 && dy == 0.0 {
        return (x1, y1);
    }
    let t = ((px - x1) * dx + (py - y1) * dy) / (dx * dx + dy * dy);
    if t <= 0.0 {
        (x1, y1)
    } else if t >= 1.0 {
        (x2, y2)
    } else {
        (x1 + t * dx, y1 + t * dy)
    }
}

fn read_u32le(cursor: &mut Cursor<&[u8]>) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).context("[ffsf] unexpected end of file")?;
    Ok(u32::from_le_bytes(buf))
}

fn read_f32le(cursor: &mut Cursor<&[u8]>) -> Result<f32> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf).context("[ffsf] unexpected end of file")?;
    Ok(f32::from_le_bytes(buf))
}

/// In-memory runtime for an FFSF v3 dataset: quantized polygon rings plus
/// a nearest-polygon operator, with no external index (rtree, etc) — the
/// exporter's part bboxes are the only pre-filter.
#[derive(Debug)]
pub struct FfsfIndex {
    feature_index: Vec<FeatureIndexEntry>,
    part_bboxes: Vec<PartBBox>,
    geom_index: Vec<GeomIndexEntry>,
    ring_index: Vec<u32>,
    geometry_data: Vec<u8>,
    feature_meta: Vec<FeatureMeta>,
    part_feature_index: Vec<i64>,
    feature_id_to_index: HashMap<String, usize>,
}

impl FfsfIndex {
    pub fn from_files(ffsf_path: &Path, feature_meta_path: &Path) -> Result<Self> {
        let blob = std::fs::read(ffsf_path)
            .with_context(|| format!("[ffsf] read {}", ffsf_path.display()))?;
        if blob.len() < 16 {
            bail!("Invalid FFSF file (too small): {}", ffsf_path.display());
        }
        if &blob[0..4] != MAGIC {
            bail!("Invalid FFSF magic in {}", ffsf_path.display());
        }

        let mut cursor = Cursor::new(&blob[4..]);
        let version = read_u32le(&mut cursor)?;
        if version != SUPPORTED_VERSION {
            bail!(
                "Unsupported FFSF version {version} in {}; expected v{SUPPORTED_VERSION}",
                ffsf_path.display()
            );
        }
        let feature_count = read_u32le(&mut cursor)? as usize;
        let total_part_count = read_u32le(&mut cursor)? as usize;

        let mut feature_index = Vec::with_capacity(feature_count);
        for _ in 0..feature_count {
            let _reserved0 = read_u32le(&mut cursor)?;
            let _reserved1 = read_u32le(&mut cursor)?;
            let part_start_idx = read_u32le(&mut cursor)?;
            let part_count = read_u32le(&mut cursor)?;
            feature_index.push(FeatureIndexEntry { part_start_idx, part_count });
        }

        let mut part_bboxes = Vec::with_capacity(total_part_count);
        for _ in 0..total_part_count {
            let minx = read_f32le(&mut cursor)?;
            let miny = read_f32le(&mut cursor)?;
            let maxx = read_f32le(&mut cursor)?;
            let maxy = read_f32le(&mut cursor)?;
            part_bboxes.push(PartBBox { minx, miny, maxx, maxy });
        }

        let mut geom_index = Vec::with_capacity(total_part_count);
        let mut total_ring_count: usize = 0;
        for _ in 0..total_part_count {
            let byte_offset = read_u32le(&mut cursor)?;
            let byte_len = read_u32le(&mut cursor)?;
            let ring_start_idx = read_u32le(&mut cursor)?;
            let ring_count = read_u32le(&mut cursor)?;
            total_ring_count += ring_count as usize;
            geom_index.push(GeomIndexEntry { byte_offset, byte_len, ring_start_idx, ring_count });
        }

        let mut ring_index = Vec::with_capacity(total_ring_count);
        for _ in 0..total_ring_count {
            ring_index.push(read_u32le(&mut cursor)?);
        }

        let consumed = 4 + cursor.position() as usize;
        let geometry_data = blob[consumed..].to_vec();

        let meta_text = std::fs::read_to_string(feature_meta_path)
            .with_context(|| format!("[ffsf] read {}", feature_meta_path.display()))?;
        let feature_meta: Vec<FeatureMeta> = serde_json::from_str(&meta_text)
            .with_context(|| format!("[ffsf] parse {}", feature_meta_path.display()))?;

        if feature_meta.len() != feature_index.len() {
            bail!("feature_meta_by_index length must match FFSF FeatureCount");
        }

        let mut part_feature_index = vec![-1i64; part_bboxes.len()];
        for (feature_idx, feature) in feature_index.iter().enumerate() {
            let start = feature.part_start_idx as usize;
            let end = start + feature.part_count as usize;
            for part_idx in start..end {
                part_feature_index[part_idx] = feature_idx as i64;
            }
        }

        let mut feature_id_to_index = HashMap::new();
        for (feature_idx, meta) in feature_meta.iter().enumerate() {
            if let Some(feature_id) = meta.feature_id.as_ref().filter(|s| !s.is_empty()) {
                feature_id_to_index.insert(feature_id.clone(), feature_idx);
            }
        }

        Ok(Self {
            feature_index,
            part_bboxes,
            geom_index,
            ring_index,
            geometry_data,
            feature_meta,
            part_feature_index,
            feature_id_to_index,
        })
    }

    fn read_rings(&self, geom: &GeomIndexEntry) -> Result<(Vec<(u32, u32)>, Vec<Vec<(u32, u32)>>)> {
        let start = geom.byte_offset as usize;
        let end = start + geom.byte_len as usize;
        let data = &self.geometry_data[start..end];
        if data.len() % 2 != 0 {
            bail!("GeometryData byte length must be even");
        }
        let values: Vec<u16> = data.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();

        let mut cursor = 0usize;
        let mut rings: Vec<Vec<(u32, u32)>> = Vec::with_capacity(geom.ring_count as usize);
        for ring_idx in geom.ring_start_idx..geom.ring_start_idx + geom.ring_count {
            let point_count = self.ring_index[ring_idx as usize] as usize;
            let mut ring = Vec::with_capacity(point_count);
            for _ in 0..point_count {
                let x = values[cursor] as u32;
                let y = values[cursor + 1] as u32;
                cursor += 2;
                ring.push((x, y));
            }
            rings.push(ring);
        }

        if rings.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        let outer = rings.remove(0);
        Ok((outer, rings))
    }

    fn part_contains_point(&self, part_idx: usize, pt: Point) -> Result<bool> {
        let bbox = self.part_bboxes[part_idx];
        let (minx, miny, maxx, maxy) = (bbox.minx as f64, bbox.miny as f64, bbox.maxx as f64, bbox.maxy as f64);
        if !(minx <= pt.x && pt.x <= maxx && miny <= pt.y && pt.y <= maxy) {
            return Ok(false);
        }

        let spanx = maxx - minx;
        let spany = maxy - miny;
        let qx = quantize(pt.x, minx, spanx);
        let qy = quantize(pt.y, miny, spany);

        let geom = self.geom_index[part_idx];
        if geom.ring_count == 0 {
            return Ok(false);
        }
        let (outer, holes) = self.read_rings(&geom)?;
        if outer.is_empty() {
            return Ok(false);
        }
        if !point_in_ring(qx, qy, &outer) {
            return Ok(false);
        }
        for hole in &holes {
            if !hole.is_empty() && point_in_ring(qx, qy, hole) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn feature_contains_point(&self, feature: &FeatureIndexEntry, pt: Point) -> Result<bool> {
        let start = feature.part_start_idx as usize;
        let end = start + feature.part_count as usize;
        for part_idx in start..end {
            if self.part_contains_point(part_idx, pt)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn decode_ring_points(&self, ring: &[(u32, u32)], minx: f64, miny: f64, spanx: f64, spany: f64) -> Vec<(f64, f64)> {
        if ring.is_empty() {
            return Vec::new();
        }
        let spanx = if spanx == 0.0 { 1.0 } else { spanx };
        let spany = if spany == 0.0 { 1.0 } else { spany };
        ring.iter()
            .map(|&(qx, qy)| {
                let x = minx + (qx as f64 / 65535.0) * spanx;
                let y = miny + (qy as f64 / 65535.0) * spany;
                (x, y)
            })
            .collect()
    }

    fn distance_km_to_ring(&self, pt: Point, ring_points: &[(f64, f64)]) -> f64 {
        let count = ring_points.len();
        if count < 2 {
            return f64::INFINITY;
        }
        let closed = ring_points[0] == ring_points[count - 1];
        let limit = if closed { count - 1 } else { count };

        let mut min_dist = f64::INFINITY;
        for i in 0..limit {
            let (x1, y1) = ring_points[i];
            let (x2, y2) = ring_points[(i + 1) % count];
            let (nx, ny) = nearest_point_on_segment(pt.x, pt.y, x1, y1, x2, y2);
            let dist = haversine_km(pt.y, pt.x, ny, nx);
            if dist < min_dist {
                min_dist = dist;
            }
        }
        min_dist
    }

    fn distance_km_to_part(&self, pt: Point, part_idx: usize, bbox: PartBBox) -> Result<f64> {
        let (minx, miny, maxx, maxy) = (bbox.minx as f64, bbox.miny as f64, bbox.maxx as f64, bbox.maxy as f64);
        let spanx = maxx - minx;
        let spany = maxy - miny;
        let geom = self.geom_index[part_idx];
        if geom.ring_count == 0 {
            return Ok(f64::INFINITY);
        }
        let (outer, holes) = self.read_rings(&geom)?;
        let mut min_dist = f64::INFINITY;
        if !outer.is_empty() {
            let points = self.decode_ring_points(&outer, minx, miny, spanx, spany);
            min_dist = min_dist.min(self.distance_km_to_ring(pt, &points));
        }
        for hole in &holes {
            if hole.is_empty() {
                continue;
            }
            let points = self.decode_ring_points(hole, minx, miny, spanx, spany);
            min_dist = min_dist.min(self.distance_km_to_ring(pt, &points));
        }
        Ok(min_dist)
    }

    /// First matching feature per level, in feature-index order — a tie
    /// between overlapping polygons at the same level resolves to whichever
    /// was written first by the exporter.
    pub fn query_point(&self, pt: Point, levels: &[i64]) -> Result<BTreeMap<i64, GeometryHit>> {
        let level_set: BTreeSet<i64> = levels.iter().copied().collect();
        let mut hits: BTreeMap<i64, GeometryHit> = BTreeMap::new();

        for (feature_idx, feature) in self.feature_index.iter().enumerate() {
            let meta = &self.feature_meta[feature_idx];
            if !level_set.contains(&meta.level) || hits.contains_key(&meta.level) {
                continue;
            }
            if self.feature_contains_point(feature, pt)? {
                hits.insert(
                    meta.level,
                    GeometryHit {
                        level: meta.level,
                        name: meta.name.clone(),
                        osm_id: meta.feature_id.clone(),
                        source: "polygon",
                    },
                );
            }
            if hits.len() == level_set.len() {
                break;
            }
        }
        Ok(hits)
    }

    /// Nearest feature per level within `max_distance_km`, restricted to a
    /// degree-space bounding window around `pt` for speed; distance itself
    /// is haversine over a planar nearest-point-on-segment approximation.
    pub fn query_point_nearest(&self, pt: Point, max_distance_km: f64, levels: &[i64]) -> Result<BTreeMap<i64, GeometryHit>> {
        if max_distance_km <= 0.0 {
            return Ok(BTreeMap::new());
        }
        let level_set: BTreeSet<i64> = levels.iter().copied().collect();
        let threshold_deg = max_distance_km / 111.0;
        let qminx = pt.x - threshold_deg;
        let qmaxx = pt.x + threshold_deg;
        let qminy = pt.y - threshold_deg;
        let qmaxy = pt.y + threshold_deg;

        let mut nearest_by_level: BTreeMap<i64, (f64, usize)> = BTreeMap::new();

        for (part_idx, bbox) in self.part_bboxes.iter().enumerate() {
            if (bbox.maxx as f64) < qminx
                || (bbox.minx as f64) > qmaxx
                || (bbox.maxy as f64) < qminy
                || (bbox.miny as f64) > qmaxy
            {
                continue;
            }
            let feature_idx = self.part_feature_index[part_idx];
            if feature_idx < 0 {
                continue;
            }
            let feature_idx = feature_idx as usize;
            let meta = &self.feature_meta[feature_idx];
            if !level_set.contains(&meta.level) {
                continue;
            }

            let dist_km = self.distance_km_to_part(pt, part_idx, *bbox)?;
            if dist_km > max_distance_km {
                continue;
            }

            let better = nearest_by_level
                .get(&meta.level)
                .map(|&(best, _)| dist_km < best)
                .unwrap_or(true);
            if better {
                nearest_by_level.insert(meta.level, (dist_km, feature_idx));
            }
        }

        let mut hits = BTreeMap::new();
        for (level, (_, feature_idx)) in nearest_by_level {
            let meta = &self.feature_meta[feature_idx];
            hits.insert(
                level,
                GeometryHit {
                    level,
                    name: meta.name.clone(),
                    osm_id: meta.feature_id.clone(),
                    source: "nearby",
                },
            );
        }
        Ok(hits)
    }

    pub fn distance_km_to_feature_id(&self, pt: Point, feature_id: &str) -> Result<f64> {
        let Some(&feature_idx) = self.feature_id_to_index.get(feature_id) else {
            return Ok(f64::INFINITY);
        };
        let feature = self.feature_index[feature_idx];
        let start = feature.part_start_idx as usize;
        let end = start + feature.part_count as usize;
        let mut min_dist = f64::INFINITY;
        for part_idx in start..end {
            let bbox = self.part_bboxes[part_idx];
            let dist = self.distance_km_to_part(pt, part_idx, bbox)?;
            if dist < min_dist {
                min_dist = dist;
            }
        }
        Ok(min_dist)
    }

    /// Per-level set of feature IDs the exporter flagged as belonging to
    /// the dataset's own country (used to scope nearby-fallback hits so
    /// they never point at a foreign administrative unit).
    pub fn country_scope_allowlist(&self, levels: &[i64]) -> BTreeMap<i64, BTreeSet<String>> {
        let level_set: BTreeSet<i64> = levels.iter().copied().collect();
        let mut allowlist: BTreeMap<i64, BTreeSet<String>> = levels.iter().map(|&l| (l, BTreeSet::new())).collect();
        for meta in &self.feature_meta {
            if !level_set.contains(&meta.level) {
                continue;
            }
            let Some(feature_id) = meta.feature_id.as_ref().filter(|s| !s.is_empty()) else {
                continue;
            };
            if meta.country_scope_flag == Some(true) {
                allowlist.entry(meta.level).or_default().insert(feature_id.clone());
            }
        }
        allowlist
    }
}
