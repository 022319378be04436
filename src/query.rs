use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kilometers per degree of latitude.
const KM_PER_DEGREE: f64 = 111.32;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CoordinateError {
    #[error("expected \"latitude, longitude\", got {0} comma-separated parts")]
    WrongArity(usize),
    #[error("'{0}' is not a number")]
    NotANumber(String),
    #[error("latitude {0} is outside [-90, 90]")]
    LatitudeOutOfRange(String),
    #[error("longitude {0} is outside [-180, 180]")]
    LongitudeOutOfRange(String),
    #[error("margin must be a positive number of kilometers, got {0}")]
    InvalidMargin(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLon {
    pub lat: f64,
    pub lon: f64,
}

/// Parse operator input of the form `"latitude, longitude"`.
pub fn parse_lat_lon(input: &str) -> Result<LatLon, CoordinateError> {
    let parts: Vec<&str> = input.split(',').collect();
    if parts.len() != 2 {
        return Err(CoordinateError::WrongArity(parts.len()));
    }

    let number = |raw: &str| -> Result<f64, CoordinateError> {
        let raw = raw.trim();
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| CoordinateError::NotANumber(raw.to_string()))
    };

    let lat = number(parts[0])?;
    let lon = number(parts[1])?;
    if !(-90.0..=90.0).contains(&lat) {
        return Err(CoordinateError::LatitudeOutOfRange(lat.to_string()));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(CoordinateError::LongitudeOutOfRange(lon.to_string()));
    }
    Ok(LatLon { lat, lon })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

/// The square region sent to the detector: `margin_km` on each side,
/// centered on `center`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryArea {
    pub center: LatLon,
    pub margin_km: f64,
}

impl QueryArea {
    pub fn new(center: LatLon, margin_km: f64) -> Result<Self, CoordinateError> {
        if !(margin_km.is_finite() && margin_km > 0.0) {
            return Err(CoordinateError::InvalidMargin(margin_km.to_string()));
        }
        Ok(Self { center, margin_km })
    }

    pub fn bounding_box(&self) -> BoundingBox {
        let half = self.margin_km / 2.0;
        let dlat = half / KM_PER_DEGREE;
        let cos_lat = self.center.lat.to_radians().cos().max(1e-6);
        let dlon = (half / (KM_PER_DEGREE * cos_lat)).min(180.0);

        BoundingBox {
            south: (self.center.lat - dlat).max(-90.0),
            west: (self.center.lon - dlon).max(-180.0),
            north: (self.center.lat + dlat).min(90.0),
            east: (self.center.lon + dlon).min(180.0),
        }
    }

    /// Link to the area on the public map, for the operator to look at.
    pub fn map_link(&self) -> String {
        format!(
            "https://www.openstreetmap.org/?mlat={lat:.4}&mlon={lon:.4}#map=15/{lat:.4}/{lon:.4}",
            lat = self.center.lat,
            lon = self.center.lon
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pasted_pair() {
        let c = parse_lat_lon("42.8075, -8.1519").unwrap();
        assert_eq!(c.lat, 42.8075);
        assert_eq!(c.lon, -8.1519);
    }

    #[test]
    fn trims_whitespace_on_both_sides() {
        let c = parse_lat_lon("  42.8075 ,\t-8.1519  ").unwrap();
        assert_eq!(c, LatLon { lat: 42.8075, lon: -8.1519 });
    }

    #[test]
    fn rejects_three_parts() {
        assert_eq!(
            parse_lat_lon("not,a,number"),
            Err(CoordinateError::WrongArity(3))
        );
    }

    #[test]
    fn rejects_non_numeric() {
        assert_eq!(
            parse_lat_lon("north, -8.15"),
            Err(CoordinateError::NotANumber("north".into()))
        );
        assert_eq!(
            parse_lat_lon("42.8, "),
            Err(CoordinateError::NotANumber("".into()))
        );
        assert!(matches!(
            parse_lat_lon("inf, 0"),
            Err(CoordinateError::NotANumber(_))
        ));
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(matches!(
            parse_lat_lon("91, 0"),
            Err(CoordinateError::LatitudeOutOfRange(_))
        ));
        assert!(matches!(
            parse_lat_lon("0, -181"),
            Err(CoordinateError::LongitudeOutOfRange(_))
        ));
    }

    #[test]
    fn bounding_box_spans_margin() {
        let area = QueryArea::new(LatLon { lat: 0.0, lon: 0.0 }, 2.0).unwrap();
        let bbox = area.bounding_box();
        let height_km = (bbox.north - bbox.south) * KM_PER_DEGREE;
        let width_km = (bbox.east - bbox.west) * KM_PER_DEGREE;
        assert!((height_km - 2.0).abs() < 1e-9);
        assert!((width_km - 2.0).abs() < 1e-9);
    }

    #[test]
    fn bounding_box_widens_in_longitude_away_from_equator() {
        let area = QueryArea::new(LatLon { lat: 60.0, lon: 10.0 }, 2.0).unwrap();
        let bbox = area.bounding_box();
        assert!((bbox.east - bbox.west) > (bbox.north - bbox.south) * 1.9);
    }

    #[test]
    fn rejects_non_positive_margin() {
        let center = LatLon { lat: 0.0, lon: 0.0 };
        assert!(QueryArea::new(center, 0.0).is_err());
        assert!(QueryArea::new(center, -1.0).is_err());
        assert!(QueryArea::new(center, f64::NAN).is_err());
    }
}
