use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Approximate ground distance in meters (equirectangular projection, fine
    /// for the few-hundred-meter scales this crate cares about).
    pub fn distance_meters(&self, other: &Coordinates) -> f64 {
        const EARTH_RADIUS_M: f64 = 6_371_000.0;
        let mean_lat = ((self.lat + other.lat) / 2.0).to_radians();
        let dx = (other.lon - self.lon).to_radians() * mean_lat.cos();
        let dy = (other.lat - self.lat).to_radians();
        (dx * dx + dy * dy).sqrt() * EARTH_RADIUS_M
    }
}

/// Rectangular lat/lon region used to reject out-of-area matches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl BoundingBox {
    pub fn new(min_lat: f64, max_lat: f64, min_lon: f64, max_lon: f64) -> AppResult<Self> {
        let finite = [min_lat, max_lat, min_lon, max_lon]
            .iter()
            .all(|value| value.is_finite());
        if !finite || min_lat >= max_lat || min_lon >= max_lon {
            return Err(AppError::Config(format!(
                "invalid bounding box: lat {min_lat}..{max_lat}, lon {min_lon}..{max_lon}"
            )));
        }
        Ok(Self {
            min_lat,
            max_lat,
            min_lon,
            max_lon,
        })
    }

    pub fn contains(&self, point: &Coordinates) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lon..=self.max_lon).contains(&point.lon)
    }

    pub fn clamp(&self, point: Coordinates) -> Coordinates {
        Coordinates {
            lat: point.lat.clamp(self.min_lat, self.max_lat),
            lon: point.lon.clamp(self.min_lon, self.max_lon),
        }
    }

    /// `south,west|north,east`, the viewport-bias format of the geocoding API.
    pub fn as_bounds_param(&self) -> String {
        format!(
            "{},{}|{},{}",
            self.min_lat, self.min_lon, self.max_lat, self.max_lon
        )
    }
}

impl Default for BoundingBox {
    fn default() -> Self {
        // Austin metro area.
        Self {
            min_lat: 30.0,
            max_lat: 30.6,
            min_lon: -98.2,
            max_lon: -97.4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_is_inclusive() {
        let bounds = BoundingBox::default();
        assert!(bounds.contains(&Coordinates::new(30.2672, -97.7431)));
        assert!(bounds.contains(&Coordinates::new(30.0, -98.2)));
        assert!(!bounds.contains(&Coordinates::new(29.99, -97.7)));
        assert!(!bounds.contains(&Coordinates::new(30.2, -97.3)));
    }

    #[test]
    fn rejects_inverted_box() {
        assert!(BoundingBox::new(30.6, 30.0, -98.2, -97.4).is_err());
        assert!(BoundingBox::new(30.0, 30.6, -97.4, -98.2).is_err());
        assert!(BoundingBox::new(f64::NAN, 30.6, -98.2, -97.4).is_err());
    }

    #[test]
    fn clamps_points_into_box() {
        let bounds = BoundingBox::default();
        let clamped = bounds.clamp(Coordinates::new(30.7, -99.0));
        assert_eq!(clamped, Coordinates::new(30.6, -98.2));
    }

    #[test]
    fn formats_bounds_param() {
        assert_eq!(
            BoundingBox::default().as_bounds_param(),
            "30,-98.2|30.6,-97.4"
        );
    }

    #[test]
    fn measures_short_distances() {
        let a = Coordinates::new(30.2672, -97.7431);
        let b = Coordinates::new(30.2674, -97.7431);
        let meters = a.distance_meters(&b);
        assert!(meters > 20.0 && meters < 25.0, "got {meters}");
    }
}
