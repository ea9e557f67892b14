use serde::{Deserialize, Serialize};

use crate::geo::LngLat;

/// Axis-aligned lon/lat bounding box (degrees).
///
/// Does not handle antimeridian crossing; city-scale datasets never need it.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LngLatBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl LngLatBounds {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        LngLatBounds {
            west,
            south,
            east,
            north,
        }
    }

    pub fn from_point(p: LngLat) -> Self {
        LngLatBounds::new(p.lng, p.lat, p.lng, p.lat)
    }

    /// Smallest box containing every point, `None` for an empty iterator.
    pub fn from_points(points: impl IntoIterator<Item = LngLat>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Self::from_point(first), |b, p| b.extend(p)))
    }

    pub fn extend(self, p: LngLat) -> Self {
        LngLatBounds {
            west: self.west.min(p.lng),
            south: self.south.min(p.lat),
            east: self.east.max(p.lng),
            north: self.north.max(p.lat),
        }
    }

    pub fn contains(&self, p: LngLat) -> bool {
        p.lng >= self.west && p.lng <= self.east && p.lat >= self.south && p.lat <= self.north
    }

    pub fn center(&self) -> LngLat {
        LngLat::new((self.west + self.east) / 2.0, (self.south + self.north) / 2.0)
    }
}
