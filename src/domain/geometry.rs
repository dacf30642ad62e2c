// Geometry utilities - great-circle distance, planar helpers, simplification
use geo::{Coord, Distance, Haversine, LineString, Point, Rect, Simplify};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Planar coordinate with longitude as x and latitude as y.
    pub fn coord(&self) -> Coord<f64> {
        Coord {
            x: self.longitude,
            y: self.latitude,
        }
    }
}

impl From<GeoPoint> for Point<f64> {
    fn from(p: GeoPoint) -> Self {
        Point::from(p.coord())
    }
}

impl From<Coord<f64>> for GeoPoint {
    fn from(c: Coord<f64>) -> Self {
        GeoPoint::new(c.y, c.x)
    }
}

/// Great-circle distance in metres.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    Haversine::distance(Point::from(a), Point::from(b))
}

/// Planar distance in degrees, used for alarm clustering thresholds.
pub fn euclidean_deg(a: GeoPoint, b: GeoPoint) -> f64 {
    (b.latitude - a.latitude).hypot(b.longitude - a.longitude)
}

pub fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lon: f64,
    pub max_lat: f64,
    pub max_lon: f64,
}

impl From<Rect<f64>> for BoundingBox {
    fn from(rect: Rect<f64>) -> Self {
        Self {
            min_lat: rect.min().y,
            min_lon: rect.min().x,
            max_lat: rect.max().y,
            max_lon: rect.max().x,
        }
    }
}

/// Douglas-Peucker simplification in degree space. Endpoints are always kept.
pub fn simplify_polyline(points: &[GeoPoint], tolerance_deg: f64) -> Vec<GeoPoint> {
    if points.len() <= 2 || tolerance_deg <= 0.0 {
        return points.to_vec();
    }
    let line: LineString<f64> = points.iter().map(GeoPoint::coord).collect();
    line.simplify(&tolerance_deg)
        .coords()
        .map(|c| GeoPoint::from(*c))
        .collect()
}
