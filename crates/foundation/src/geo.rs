//! GeoJSON-shaped geometry shared by the data and rendering sides.
//!
//! Only the subset needed for tabular open-data rows is modelled. Serialized
//! forms match GeoJSON so collections can be handed to a render target as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bounds::LngLatBounds;

/// A WGS84 position in degrees. GeoJSON orders coordinates `[lng, lat]`.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub const fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }

    pub fn from_position(p: [f64; 2]) -> Self {
        Self::new(p[0], p[1])
    }

    pub fn to_position(self) -> [f64; 2] {
        [self.lng, self.lat]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point { coordinates: [f64; 2] },
    MultiPoint { coordinates: Vec<[f64; 2]> },
    LineString { coordinates: Vec<[f64; 2]> },
    Polygon { coordinates: Vec<Vec<[f64; 2]>> },
}

impl Geometry {
    pub fn point(p: LngLat) -> Self {
        Geometry::Point {
            coordinates: p.to_position(),
        }
    }

    /// Single position used to anchor labels and popups.
    ///
    /// Points anchor on themselves, lines on their middle vertex, polygons on
    /// the vertex average of the outer ring (closing vertex excluded).
    pub fn representative_point(&self) -> Option<LngLat> {
        match self {
            Geometry::Point { coordinates } => Some(LngLat::from_position(*coordinates)),
            Geometry::MultiPoint { coordinates } => {
                coordinates.first().copied().map(LngLat::from_position)
            }
            Geometry::LineString { coordinates } => coordinates
                .get(coordinates.len() / 2)
                .copied()
                .map(LngLat::from_position),
            Geometry::Polygon { coordinates } => {
                let outer = coordinates.first()?;
                let ring = match (outer.first(), outer.last()) {
                    (Some(a), Some(b)) if outer.len() > 1 && a == b => &outer[..outer.len() - 1],
                    _ => &outer[..],
                };
                if ring.is_empty() {
                    return None;
                }
                let n = ring.len() as f64;
                let (sx, sy) = ring
                    .iter()
                    .fold((0.0, 0.0), |(sx, sy), p| (sx + p[0], sy + p[1]));
                Some(LngLat::new(sx / n, sy / n))
            }
        }
    }

    pub fn positions(&self) -> Vec<LngLat> {
        match self {
            Geometry::Point { coordinates } => vec![LngLat::from_position(*coordinates)],
            Geometry::MultiPoint { coordinates } | Geometry::LineString { coordinates } => {
                coordinates.iter().copied().map(LngLat::from_position).collect()
            }
            Geometry::Polygon { coordinates } => coordinates
                .iter()
                .flatten()
                .copied()
                .map(LngLat::from_position)
                .collect(),
        }
    }
}

pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "Feature")]
pub struct Feature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub geometry: Geometry,
    #[serde(default)]
    pub properties: Properties,
}

impl Feature {
    pub fn new(geometry: Geometry, properties: Properties) -> Self {
        Self {
            id: None,
            geometry,
            properties,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "FeatureCollection")]
pub struct FeatureCollection {
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(features: Vec<Feature>) -> Self {
        Self { features }
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn bounds(&self) -> Option<LngLatBounds> {
        LngLatBounds::from_points(self.features.iter().flat_map(|f| f.geometry.positions()))
    }
}

/// Where a dataset row keeps its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum GeoField {
    /// A GeoJSON-like point object: `{ "type": "Point", "coordinates": [lng, lat] }`.
    Point { field: String },
    /// Two scalar columns, numbers or numeric strings.
    LatLng { lat: String, lng: String },
}

impl GeoField {
    pub fn point(field: impl Into<String>) -> Self {
        GeoField::Point {
            field: field.into(),
        }
    }

    pub fn lat_lng(lat: impl Into<String>, lng: impl Into<String>) -> Self {
        GeoField::LatLng {
            lat: lat.into(),
            lng: lng.into(),
        }
    }

    pub fn locate(&self, row: &Value) -> Option<LngLat> {
        match self {
            GeoField::Point { field } => row.get(field).and_then(extract_coordinates),
            GeoField::LatLng { lat, lng } => coords_from_fields(row.get(lat)?, row.get(lng)?),
        }
    }
}

/// Reads `[lng, lat]` out of a point object. Zero or missing components are
/// treated as "no location", which is how the source data encodes it.
pub fn extract_coordinates(point: &Value) -> Option<LngLat> {
    let coords = point.get("coordinates")?.as_array()?;
    let lng = coords.first()?.as_f64()?;
    let lat = coords.get(1)?.as_f64()?;
    usable(lng, lat)
}

pub fn coords_from_fields(lat: &Value, lng: &Value) -> Option<LngLat> {
    usable(numeric(lng)?, numeric(lat)?)
}

fn numeric(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn usable(lng: f64, lat: f64) -> Option<LngLat> {
    if lng == 0.0 || lat == 0.0 || !lng.is_finite() || !lat.is_finite() {
        return None;
    }
    Some(LngLat::new(lng, lat))
}

/// Converts raw rows into point features, skipping rows without a location.
///
/// Every column except a point-object geo field is kept as a property.
pub fn features_from_rows(rows: &[Value], geo: &GeoField) -> FeatureCollection {
    let mut features = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(obj) = row.as_object() else {
            continue;
        };
        let Some(at) = geo.locate(row) else {
            continue;
        };
        let mut properties = obj.clone();
        if let GeoField::Point { field } = geo {
            properties.remove(field);
        }
        features.push(Feature::new(Geometry::point(at), properties));
    }
    FeatureCollection::new(features)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn point_field_rows_become_features() {
        let rows = vec![
            json!({"incident_number": "1", "point": {"type": "Point", "coordinates": [-122.41, 37.77]}}),
            json!({"incident_number": "2", "point": {"type": "Point", "coordinates": [0, 0]}}),
            json!({"incident_number": "3"}),
        ];
        let fc = features_from_rows(&rows, &GeoField::point("point"));
        assert_eq!(fc.len(), 1);
        let f = &fc.features[0];
        assert_eq!(f.geometry, Geometry::point(LngLat::new(-122.41, 37.77)));
        assert_eq!(f.properties.get("incident_number"), Some(&json!("1")));
        assert!(f.properties.get("point").is_none());
    }

    #[test]
    fn lat_lng_fields_accept_numeric_strings() {
        let rows = vec![
            json!({"post_id": "a", "latitude": "37.78", "longitude": "-122.40"}),
            json!({"post_id": "b", "latitude": "not a number", "longitude": "-122.40"}),
            json!({"post_id": "c", "latitude": 37.70, "longitude": -122.45}),
        ];
        let fc = features_from_rows(&rows, &GeoField::lat_lng("latitude", "longitude"));
        let ids: Vec<_> = fc
            .features
            .iter()
            .map(|f| f.properties["post_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn serializes_as_geojson() {
        let fc = FeatureCollection::new(vec![Feature::new(
            Geometry::point(LngLat::new(1.5, 2.5)),
            Properties::new(),
        )]);
        let v = serde_json::to_value(&fc).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [1.5, 2.5]},
                    "properties": {}
                }]
            })
        );
        let back: FeatureCollection = serde_json::from_value(v).unwrap();
        assert_eq!(back, fc);
    }

    #[test]
    fn representative_points() {
        let line = Geometry::LineString {
            coordinates: vec![[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]],
        };
        assert_eq!(line.representative_point(), Some(LngLat::new(1.0, 1.0)));

        let square = Geometry::Polygon {
            coordinates: vec![vec![[0.0, 0.0], [2.0, 0.0], [2.0, 2.0], [0.0, 2.0], [0.0, 0.0]]],
        };
        assert_eq!(square.representative_point(), Some(LngLat::new(1.0, 1.0)));

        let empty = Geometry::Polygon {
            coordinates: vec![],
        };
        assert_eq!(empty.representative_point(), None);
    }
}
