//! Great-circle distances and nearest-first candidate selection.

use serde::{Deserialize, Serialize};

const EARTH_RADIUS_M: f64 = 6_371_000.0;

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

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Haversine distance in metres.
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let d_lat = (other.latitude - self.latitude).to_radians();
        let d_lon = (other.longitude - self.longitude).to_radians();

        let a = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
        EARTH_RADIUS_M * 2.0 * a.sqrt().atan2((1.0 - a).sqrt())
    }
}

/// Order `candidates` by distance from `origin`, dropping those further than
/// `max_distance_m`. Pass `None` for an unbounded search.
pub fn nearest_first<T, F>(
    origin: GeoPoint,
    candidates: Vec<T>,
    max_distance_m: Option<f64>,
    point_of: F,
) -> Vec<(T, f64)>
where
    F: Fn(&T) -> GeoPoint,
{
    let mut ranked: Vec<(T, f64)> = candidates
        .into_iter()
        .map(|c| {
            let d = origin.distance_m(&point_of(&c));
            (c, d)
        })
        .filter(|(_, d)| max_distance_m.map_or(true, |max| *d <= max))
        .collect();

    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    ranked
}
