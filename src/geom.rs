use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::impl_from_primitive;

/// Latitude in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Lat(pub f64);
impl_from_primitive!(Lat, f64);

/// Longitude in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct Lon(pub f64);
impl_from_primitive!(Lon, f64);

/// Identity tuple of an entity: position plus a sequence number that
/// disambiguates multiple entities at the same location. Immutable after
/// creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeoKey {
    lat: OrderedFloat<f64>,
    lon: OrderedFloat<f64>,
    sequence: u64,
}

impl GeoKey {
    pub fn new(lat: Lat, lon: Lon, sequence: u64) -> Self {
        Self {
            lat: OrderedFloat(lat.0),
            lon: OrderedFloat(lon.0),
            sequence,
        }
    }

    pub fn lat(&self) -> Lat {
        Lat(self.lat.0)
    }

    pub fn lon(&self) -> Lon {
        Lon(self.lon.0)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for GeoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}#{}", self.lat.0, self.lon.0, self.sequence)
    }
}

/// Spatial extent attached to patches and external-data requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    Point { lat: f64, lon: f64 },
    Rect {
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    },
    /// Convex polygon in counterclockwise vertex order, as produced by
    /// [`ConvexHull`].
    Polygon(Vec<(f64, f64)>),
}

impl Geometry {
    pub fn rect(min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Self {
        Geometry::Rect {
            min_lat,
            min_lon,
            max_lat,
            max_lon,
        }
    }

    /// Vertices contributing to a bounding hull: the point itself, rectangle
    /// corners, or polygon vertices. Coordinates are (lon, lat) pairs.
    pub fn hull_points(&self) -> Vec<(f64, f64)> {
        match self {
            Geometry::Point { lat, lon } => vec![(*lon, *lat)],
            Geometry::Rect {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => vec![
                (*min_lon, *min_lat),
                (*max_lon, *min_lat),
                (*max_lon, *max_lat),
                (*min_lon, *max_lat),
            ],
            Geometry::Polygon(points) => points.clone(),
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        match self {
            Geometry::Point {
                lat: p_lat,
                lon: p_lon,
            } => *p_lat == lat && *p_lon == lon,
            Geometry::Rect {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => lat >= *min_lat && lat <= *max_lat && lon >= *min_lon && lon <= *max_lon,
            Geometry::Polygon(points) => hull_contains(points, (lon, lat)),
        }
    }
}

/// Running convex hull over (lon, lat) points.
///
/// The priming layer feeds every requested geometry into one of these; the
/// resulting polygon becomes the priming extent injected into outgoing data
/// requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvexHull {
    points: Vec<(f64, f64)>,
}

impl ConvexHull {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of(points: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut hull = Self::new();
        hull.extend(points);
        hull
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Adds points and recomputes the hull (Andrew's monotone chain).
    pub fn extend(&mut self, points: impl IntoIterator<Item = (f64, f64)>) {
        self.points.extend(points);
        self.points = monotone_chain(std::mem::take(&mut self.points));
    }

    pub fn geometry(&self) -> Option<Geometry> {
        match self.points.len() {
            0 => None,
            1 => Some(Geometry::Point {
                lon: self.points[0].0,
                lat: self.points[0].1,
            }),
            _ => Some(Geometry::Polygon(self.points.clone())),
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        hull_contains(&self.points, (lon, lat))
    }
}

fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
}

/// Andrew's monotone chain. Returns hull vertices in counterclockwise order
/// without the closing point.
fn monotone_chain(mut points: Vec<(f64, f64)>) -> Vec<(f64, f64)> {
    points.sort_by(|a, b| a.partial_cmp(b).expect("finite coordinates"));
    points.dedup();
    if points.len() <= 2 {
        return points;
    }

    let mut hull: Vec<(f64, f64)> = Vec::with_capacity(points.len() * 2);
    for &p in &points {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }

    // Upper chain; pops must not eat into the lower chain.
    let lower_len = hull.len() + 1;
    for &p in points.iter().rev().skip(1) {
        while hull.len() >= lower_len && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(p);
    }
    // The chain closes on the starting vertex; drop the duplicate.
    hull.pop();
    hull
}

fn hull_contains(hull: &[(f64, f64)], p: (f64, f64)) -> bool {
    match hull.len() {
        0 => false,
        1 => hull[0] == p,
        2 => {
            // Degenerate hull: a segment.
            let (a, b) = (hull[0], hull[1]);
            cross(a, b, p).abs() < 1e-12
                && p.0 >= a.0.min(b.0)
                && p.0 <= a.0.max(b.0)
                && p.1 >= a.1.min(b.1)
                && p.1 <= a.1.max(b.1)
        }
        _ => hull
            .iter()
            .zip(hull.iter().cycle().skip(1))
            .all(|(&a, &b)| cross(a, b, p) >= -1e-12),
    }
}
