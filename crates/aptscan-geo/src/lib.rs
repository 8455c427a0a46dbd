//! Neighborhood Tabulation Area lookup: GeoJSON boundary loading plus first-match
//! point-in-polygon classification behind a lazily initialised, process-wide cache.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "aptscan-geo";

const NAME_KEYS: [&str; 3] = ["ntaname", "NTAName", "name"];
const BOROUGH_KEYS: [&str; 3] = ["boroname", "BoroName", "borough"];
const UNKNOWN: &str = "Unknown";

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("invalid GeoJSON: {0}")]
    InvalidGeoJson(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BoundingBox {
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
}

impl BoundingBox {
    fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    fn extend(&mut self, p: Point) {
        self.min_x = self.min_x.min(p.x);
        self.min_y = self.min_y.min(p.y);
        self.max_x = self.max_x.max(p.x);
        self.max_y = self.max_y.max(p.y);
    }

    fn covers(&self, p: Point) -> bool {
        p.x >= self.min_x && p.x <= self.max_x && p.y >= self.min_y && p.y <= self.max_y
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Polygon {
    exterior: Vec<Point>,
    holes: Vec<Vec<Point>>,
}

impl Polygon {
    fn contains(&self, p: Point) -> bool {
        ring_contains(&self.exterior, p) && !self.holes.iter().any(|hole| ring_contains(hole, p))
    }
}

/// Even-odd ray cast. Points exactly on an edge are not guaranteed either way.
fn ring_contains(ring: &[Point], p: Point) -> bool {
    if ring.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = ring.len() - 1;
    for i in 0..ring.len() {
        let (a, b) = (ring[i], ring[j]);
        if (a.y > p.y) != (b.y > p.y) && p.x < (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// One named boundary, possibly made of several parts.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborhoodPolygon {
    pub name: String,
    pub borough: String,
    parts: Vec<Polygon>,
    bbox: BoundingBox,
}

impl NeighborhoodPolygon {
    /// `parts` is a list of polygons, each a list of rings (exterior first, then holes),
    /// each ring a list of `[lon, lat]` positions.
    pub fn new(
        name: impl Into<String>,
        borough: impl Into<String>,
        parts: Vec<Vec<Vec<[f64; 2]>>>,
    ) -> Self {
        let mut bbox = BoundingBox::empty();
        let parts = parts
            .into_iter()
            .filter_map(|rings| {
                let mut rings = rings.into_iter().map(|ring| {
                    ring.into_iter()
                        .map(|[x, y]| Point { x, y })
                        .collect::<Vec<_>>()
                });
                let exterior = rings.next()?;
                exterior.iter().for_each(|p| bbox.extend(*p));
                Some(Polygon {
                    exterior,
                    holes: rings.collect(),
                })
            })
            .collect();
        Self {
            name: name.into(),
            borough: borough.into(),
            parts,
            bbox,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let p = Point { x: lon, y: lat };
        self.bbox.covers(p) && self.parts.iter().any(|part| part.contains(p))
    }
}

/// Immutable, load-ordered set of neighborhood boundaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeighborhoodIndex {
    polygons: Vec<NeighborhoodPolygon>,
}

impl NeighborhoodIndex {
    pub fn new(polygons: Vec<NeighborhoodPolygon>) -> Self {
        Self { polygons }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GeoError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_geojson_str(&text)
    }

    /// Parses a GeoJSON FeatureCollection of Polygon / MultiPolygon features. Features
    /// without geometry are skipped; unsupported geometry types are an error.
    pub fn from_geojson_str(text: &str) -> Result<Self, GeoError> {
        let doc: JsonValue = serde_json::from_str(text)
            .map_err(|e| GeoError::InvalidGeoJson(e.to_string()))?;
        let features = doc
            .get("features")
            .and_then(|f| f.as_array())
            .ok_or_else(|| GeoError::InvalidGeoJson("missing features array".into()))?;

        let mut polygons = Vec::with_capacity(features.len());
        for (idx, feature) in features.iter().enumerate() {
            let props = feature.get("properties");
            let name = first_str_property(props, &NAME_KEYS).unwrap_or(UNKNOWN);
            let borough = first_str_property(props, &BOROUGH_KEYS).unwrap_or(UNKNOWN);
            let Some(geometry) = feature.get("geometry").filter(|g| !g.is_null()) else {
                continue;
            };
            let parts = parse_geometry(geometry)
                .map_err(|msg| GeoError::InvalidGeoJson(format!("feature {idx} ({name}): {msg}")))?;
            polygons.push(NeighborhoodPolygon::new(name, borough, parts));
        }
        Ok(Self { polygons })
    }

    /// Name of the first polygon, in load order, that contains the point.
    pub fn classify(&self, lat: f64, lon: f64) -> Option<&str> {
        self.polygons
            .iter()
            .find(|poly| poly.contains(lat, lon))
            .map(|poly| poly.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.polygons
            .iter()
            .map(|p| p.name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn by_borough(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for poly in &self.polygons {
            grouped
                .entry(poly.borough.clone())
                .or_default()
                .insert(poly.name.clone());
        }
        grouped
            .into_iter()
            .map(|(borough, names)| (borough, names.into_iter().collect()))
            .collect()
    }

    pub fn borough_of(&self, name: &str) -> Option<&str> {
        self.polygons
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.borough.as_str())
    }
}

fn first_str_property<'a>(props: Option<&'a JsonValue>, keys: &[&str]) -> Option<&'a str> {
    let props = props?;
    keys.iter()
        .find_map(|key| props.get(*key).and_then(|v| v.as_str()))
}

type Rings = Vec<Vec<[f64; 2]>>;

fn parse_geometry(geometry: &JsonValue) -> Result<Vec<Rings>, String> {
    let kind = geometry.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let coords = geometry
        .get("coordinates")
        .ok_or_else(|| "geometry without coordinates".to_string())?;
    match kind {
        "Polygon" => Ok(vec![parse_rings(coords)?]),
        "MultiPolygon" => coords
            .as_array()
            .ok_or_else(|| "MultiPolygon coordinates must be an array".to_string())?
            .iter()
            .map(parse_rings)
            .collect(),
        other => Err(format!("unsupported geometry type {other:?}")),
    }
}

fn parse_rings(value: &JsonValue) -> Result<Rings, String> {
    value
        .as_array()
        .ok_or_else(|| "polygon must be an array of rings".to_string())?
        .iter()
        .map(|ring| {
            ring.as_array()
                .ok_or_else(|| "ring must be an array of positions".to_string())?
                .iter()
                .map(parse_position)
                .collect()
        })
        .collect()
}

fn parse_position(value: &JsonValue) -> Result<[f64; 2], String> {
    let pos = value
        .as_array()
        .ok_or_else(|| "position must be an array".to_string())?;
    match (pos.first().and_then(|v| v.as_f64()), pos.get(1).and_then(|v| v.as_f64())) {
        (Some(lon), Some(lat)) => Ok([lon, lat]),
        _ => Err("position needs numeric lon and lat".to_string()),
    }
}

type IndexLoader = Box<dyn Fn() -> Result<NeighborhoodIndex, GeoError> + Send + Sync>;

/// Lazily loads the boundary dataset on first use. Concurrent first callers block on a
/// single initialisation; afterwards reads are lock-free.
pub struct GeoClassifier {
    origin: String,
    loader: IndexLoader,
    index: OnceLock<NeighborhoodIndex>,
}

impl fmt::Debug for GeoClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoClassifier")
            .field("origin", &self.origin)
            .field("loaded", &self.index.get().map(NeighborhoodIndex::len))
            .finish()
    }
}

impl GeoClassifier {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let origin = path.display().to_string();
        Self::with_loader(origin, move || NeighborhoodIndex::from_path(&path))
    }

    pub fn with_loader<F>(origin: impl Into<String>, loader: F) -> Self
    where
        F: Fn() -> Result<NeighborhoodIndex, GeoError> + Send + Sync + 'static,
    {
        Self {
            origin: origin.into(),
            loader: Box::new(loader),
            index: OnceLock::new(),
        }
    }

    /// Already-initialised classifier; mostly for tests and embedded datasets.
    pub fn from_index(index: NeighborhoodIndex) -> Self {
        let cell = OnceLock::new();
        let _ = cell.set(index);
        Self {
            origin: "<in-memory>".to_string(),
            loader: Box::new(|| Ok(NeighborhoodIndex::default())),
            index: cell,
        }
    }

    /// A dataset that fails to load degrades to an empty index: every lookup then
    /// resolves to `None` and listings keep their raw neighborhood text.
    pub fn index(&self) -> &NeighborhoodIndex {
        self.index.get_or_init(|| match (self.loader)() {
            Ok(index) => {
                info!(origin = %self.origin, neighborhoods = index.len(), "loaded neighborhood boundaries");
                index
            }
            Err(err) => {
                warn!(origin = %self.origin, error = %err, "failed to load neighborhood boundaries");
                NeighborhoodIndex::default()
            }
        })
    }

    pub fn classify(&self, lat: f64, lon: f64) -> Option<String> {
        if !lat.is_finite() || !lon.is_finite() {
            return None;
        }
        self.index().classify(lat, lon).map(ToString::to_string)
    }

    pub fn all_neighborhoods(&self) -> Vec<String> {
        self.index().names()
    }

    pub fn neighborhoods_by_borough(&self) -> BTreeMap<String, Vec<String>> {
        self.index().by_borough()
    }

    pub fn borough_of(&self, name: &str) -> Option<String> {
        self.index().borough_of(name).map(ToString::to_string)
    }
}
