// Map region domain models
use crate::domain::error::SourceError;
use crate::domain::geometry::{BoundingBox, GeoPoint};
use geo::{Area, BoundingRect, Contains, LineString, MultiPolygon, Point};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// GeoJSON position: `[longitude, latitude, ...]`.
pub type Position = Vec<f64>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionCollection {
    #[serde(default)]
    pub features: Vec<RegionFeature>,
}

impl RegionCollection {
    /// Decode a feature collection one feature at a time. A feature that
    /// does not decode is logged and skipped; only a document without a
    /// `features` array is an error.
    pub fn from_document(document: Value, origin: &str) -> Result<Self, SourceError> {
        let Value::Object(mut root) = document else {
            return Err(SourceError::Format {
                path: origin.to_string(),
                reason: "expected a GeoJSON object".to_string(),
            });
        };
        let items = match root.remove("features") {
            Some(Value::Array(items)) => items,
            None | Some(Value::Null) => Vec::new(),
            Some(_) => {
                return Err(SourceError::Format {
                    path: origin.to_string(),
                    reason: "\"features\" is not an array".to_string(),
                });
            }
        };

        let mut features = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            match serde_json::from_value::<RegionFeature>(item) {
                Ok(feature) => features.push(feature),
                Err(e) => tracing::warn!("Skipping feature {} in {}: {}", index, origin, e),
            }
        }
        Ok(Self { features })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionFeature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Polygon {
        coordinates: Vec<Vec<Position>>,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<Position>>>,
    },
    GeometryCollection {
        geometries: Vec<Geometry>,
    },
    /// Points and line strings enclose no area.
    #[serde(other)]
    NonAreal,
}

const CATEGORY_KEYS: [&str; 3] = ["category", "Category", "type"];
const NAME_KEYS: [&str; 3] = ["AsiName", "Name", "name"];

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl RegionFeature {
    fn property(&self, keys: &[&str]) -> Option<String> {
        let properties = self.properties.as_ref()?;
        keys.iter()
            .find_map(|key| properties.get(*key).and_then(scalar_string))
    }

    pub fn category(&self) -> Option<String> {
        self.property(&CATEGORY_KEYS)
    }

    pub fn name(&self) -> String {
        self.property(&NAME_KEYS)
            .unwrap_or_else(|| "Unnamed Shape".to_string())
    }

    pub fn id(&self, index: usize) -> String {
        self.id
            .as_ref()
            .and_then(scalar_string)
            .or_else(|| self.property(&["id"]))
            .unwrap_or_else(|| format!("shape-{}", index))
    }

    pub fn is_excluded(&self, excluded_categories: &[String]) -> bool {
        match self.category() {
            Some(category) => excluded_categories
                .iter()
                .any(|e| e.eq_ignore_ascii_case(category.trim())),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polygon {
    pub exterior: Vec<GeoPoint>,
    pub holes: Vec<Vec<GeoPoint>>,
    #[serde(skip)]
    shape: geo::Polygon<f64>,
}

impl Polygon {
    /// Builds a polygon from GeoJSON rings, dropping the closing vertex.
    /// Returns None when the exterior has fewer than 3 distinct vertices.
    pub fn from_rings(rings: &[Vec<Position>]) -> Option<Self> {
        let mut rings = rings.iter().map(|r| to_ring(r));
        let exterior = rings.next().filter(|r| has_three_distinct(r))?;
        let holes: Vec<Vec<GeoPoint>> = rings.filter(|r| has_three_distinct(r)).collect();

        let line = |ring: &[GeoPoint]| -> LineString<f64> {
            ring.iter().map(GeoPoint::coord).collect()
        };
        let shape = geo::Polygon::new(line(&exterior), holes.iter().map(|h| line(h)).collect());
        Some(Self {
            exterior,
            holes,
            shape,
        })
    }

    /// Interior test; points on an edge are outside.
    pub fn contains(&self, point: GeoPoint) -> bool {
        self.shape.contains(&Point::from(point))
    }

    pub fn area_deg2(&self) -> f64 {
        self.shape.unsigned_area()
    }
}

fn to_ring(positions: &[Position]) -> Vec<GeoPoint> {
    let mut ring: Vec<GeoPoint> = positions
        .iter()
        .filter(|p| p.len() >= 2 && p[0].is_finite() && p[1].is_finite())
        .map(|p| GeoPoint::new(p[1], p[0]))
        .collect();
    ring.dedup();
    if ring.len() > 1 && ring.first() == ring.last() {
        ring.pop();
    }
    ring
}

/// At least 3 distinct vertices anywhere in the ring.
fn has_three_distinct(ring: &[GeoPoint]) -> bool {
    let mut seen: Vec<GeoPoint> = Vec::with_capacity(3);
    for point in ring {
        if !seen.contains(point) {
            seen.push(*point);
            if seen.len() == 3 {
                return true;
            }
        }
    }
    false
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionShape {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub polygons: Vec<Polygon>,
    pub bbox: BoundingBox,
}

impl RegionShape {
    pub fn new(
        id: String,
        name: String,
        category: Option<String>,
        polygons: Vec<Polygon>,
    ) -> Option<Self> {
        let outline = MultiPolygon::new(polygons.iter().map(|p| p.shape.clone()).collect());
        let bbox = BoundingBox::from(outline.bounding_rect()?);
        Some(Self {
            id,
            name,
            category,
            polygons,
            bbox,
        })
    }

    pub fn contains(&self, point: GeoPoint) -> bool {
        self.polygons.iter().any(|p| p.contains(point))
    }

    pub fn area_deg2(&self) -> f64 {
        self.polygons.iter().map(Polygon::area_deg2).sum()
    }
}

impl PartialEq for RegionShape {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.category == other.category
            && self.polygons == other.polygons
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_parsing_and_properties() {
        let feature: RegionFeature = serde_json::from_str(
            r#"{"type": "Feature", "id": 7,
                "properties": {"AsiName": "Crusher Pad", "Name": "Other", "Category": "Zone"},
                "geometry": {"type": "Polygon",
                    "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}}"#,
        )
        .unwrap();
        assert_eq!(feature.name(), "Crusher Pad");
        assert_eq!(feature.category().as_deref(), Some("Zone"));
        assert_eq!(feature.id(3), "7");
        assert!(matches!(feature.geometry, Some(Geometry::Polygon { .. })));
    }

    #[test]
    fn test_unsupported_geometry_is_non_areal() {
        let feature: RegionFeature = serde_json::from_str(
            r#"{"properties": {},
                "geometry": {"type": "LineString", "coordinates": [[0,0],[1,1]]}}"#,
        )
        .unwrap();
        assert!(matches!(feature.geometry, Some(Geometry::NonAreal)));
        assert_eq!(feature.name(), "Unnamed Shape");
        assert_eq!(feature.id(4), "shape-4");
    }

    #[test]
    fn test_null_properties_accepted() {
        let feature: RegionFeature = serde_json::from_str(
            r#"{"type": "Feature", "properties": null,
                "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}}"#,
        )
        .unwrap();
        assert!(feature.properties.is_none());
        assert_eq!(feature.name(), "Unnamed Shape");
        assert_eq!(feature.category(), None);
        assert!(!feature.is_excluded(&["pin".to_string()]));
    }

    #[test]
    fn test_bad_feature_skipped_rest_kept() {
        let document = serde_json::json!({"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": null,
             "geometry": {"type": "Point", "coordinates": [1.0, 2.0]}},
            {"type": "Feature", "properties": {"Name": "Broken"},
             "geometry": {"type": "Polygon", "coordinates": "not rings"}},
            {"type": "Feature", "properties": {"Name": "Pit"},
             "geometry": {"type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]}}
        ]});
        let collection = RegionCollection::from_document(document, "regions.geojson").unwrap();
        assert_eq!(collection.features.len(), 2);
        assert_eq!(collection.features[1].name(), "Pit");
    }

    #[test]
    fn test_document_without_features_array() {
        let empty = RegionCollection::from_document(serde_json::json!({}), "r.geojson").unwrap();
        assert!(empty.features.is_empty());
        assert!(RegionCollection::from_document(serde_json::json!([1, 2]), "r.geojson").is_err());
        let wrong = serde_json::json!({"features": {"a": 1}});
        assert!(RegionCollection::from_document(wrong, "r.geojson").is_err());
    }

    #[test]
    fn test_excluded_category_is_case_insensitive() {
        let feature: RegionFeature =
            serde_json::from_str(r#"{"properties": {"category": "Pin"}, "geometry": null}"#)
                .unwrap();
        assert!(feature.is_excluded(&["pin".to_string()]));
        assert!(!feature.is_excluded(&["overlay".to_string()]));
    }

    #[test]
    fn test_polygon_with_hole() {
        let outer = vec![
            vec![0.0, 0.0],
            vec![10.0, 0.0],
            vec![10.0, 10.0],
            vec![0.0, 10.0],
            vec![0.0, 0.0],
        ];
        let hole = vec![
            vec![4.0, 4.0],
            vec![6.0, 4.0],
            vec![6.0, 6.0],
            vec![4.0, 6.0],
            vec![4.0, 4.0],
        ];
        let polygon = Polygon::from_rings(&[outer, hole]).unwrap();
        assert_eq!(polygon.exterior.len(), 4);
        assert!(polygon.contains(GeoPoint::new(2.0, 2.0)));
        assert!(!polygon.contains(GeoPoint::new(5.0, 5.0)));
        assert!(!polygon.contains(GeoPoint::new(15.0, 5.0)));
        assert!((polygon.area_deg2() - 96.0).abs() < 1e-9);
    }

    #[test]
    fn test_point_in_concave_polygon() {
        // U shape opening to the north
        let ring: Vec<Position> = [
            [0.0, 0.0],
            [0.0, 10.0],
            [3.0, 10.0],
            [3.0, 2.0],
            [7.0, 2.0],
            [7.0, 10.0],
            [10.0, 10.0],
            [10.0, 0.0],
            [0.0, 0.0],
        ]
        .iter()
        .map(|p| p.to_vec())
        .collect();
        let polygon = Polygon::from_rings(&[ring]).unwrap();
        assert!(polygon.contains(GeoPoint::new(1.0, 5.0)));
        assert!(!polygon.contains(GeoPoint::new(5.0, 5.0)));
        assert!(polygon.contains(GeoPoint::new(5.0, 1.0)));
    }

    #[test]
    fn test_degenerate_polygon_rejected() {
        let sliver = vec![vec![0.0, 0.0], vec![1.0, 1.0], vec![0.0, 0.0]];
        assert!(Polygon::from_rings(&[sliver]).is_none());
        assert!(Polygon::from_rings(&[]).is_none());
    }

    #[test]
    fn test_repeated_vertices_are_not_distinct() {
        let zigzag = vec![
            vec![0.0, 0.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
        ];
        assert!(Polygon::from_rings(&[zigzag]).is_none());
    }

    #[test]
    fn test_shape_bbox_spans_all_polygons() {
        let a = Polygon::from_rings(&[vec![
            vec![0.0, 0.0],
            vec![1.0, 0.0],
            vec![1.0, 1.0],
            vec![0.0, 0.0],
        ]])
        .unwrap();
        let b = Polygon::from_rings(&[vec![
            vec![5.0, 5.0],
            vec![6.0, 5.0],
            vec![6.0, 7.0],
            vec![5.0, 5.0],
        ]])
        .unwrap();
        let shape = RegionShape::new("s".into(), "S".into(), None, vec![a, b]).unwrap();
        assert_eq!(shape.bbox.min_lon, 0.0);
        assert_eq!(shape.bbox.max_lat, 7.0);
        assert!(RegionShape::new("e".into(), "E".into(), None, vec![]).is_none());
    }
}
