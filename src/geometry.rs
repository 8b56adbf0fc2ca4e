//! Geographic calculations over field polygons
//!
//! Polygons are ordered `[latitude, longitude]` vertex lists in degrees.
//! Areas use a local Cartesian approximation (shoelace with cos-latitude
//! scaling), which is accurate for field-sized polygons; very large areas
//! would need a geodetic treatment.

use crate::error::{Result, ServiceError};
use serde::{Deserialize, Serialize};

/// One polygon vertex: `[latitude, longitude]` in degrees
pub type Coordinate = [f64; 2];

/// WGS84 mean Earth radius in meters
pub const EARTH_RADIUS: f64 = 6_371_000.0;

const SQM_PER_HECTARE: f64 = 10_000.0;
const SQM_PER_ACRE: f64 = 4_046.86;

/// Great-circle distance between two points in meters (haversine formula)
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS * c
}

/// Perimeter of a closed polygon in meters. Degenerate polygons (< 3
/// vertices) have zero perimeter.
pub fn polygon_perimeter(coords: &[Coordinate]) -> f64 {
    if coords.len() < 3 {
        return 0.0;
    }

    let n = coords.len();
    (0..n)
        .map(|i| {
            let [lat1, lon1] = coords[i];
            let [lat2, lon2] = coords[(i + 1) % n];
            haversine_distance(lat1, lon1, lat2, lon2)
        })
        .sum()
}

/// Polygon area in square meters.
///
/// Shoelace formula over a local Cartesian projection scaled by the cosine
/// of the mean latitude.
pub fn polygon_area_sqm(coords: &[Coordinate]) -> f64 {
    if coords.len() < 3 {
        return 0.0;
    }

    let n = coords.len();
    let avg_lat = coords.iter().map(|c| c[0]).sum::<f64>() / n as f64;
    let cos_lat = avg_lat.to_radians().cos();
    let deg_to_m = std::f64::consts::PI / 180.0 * EARTH_RADIUS;

    let mut area = 0.0;
    for i in 0..n {
        let [lat1, lon1] = coords[i];
        let [lat2, lon2] = coords[(i + 1) % n];

        let x1 = lon1 * cos_lat * deg_to_m;
        let y1 = lat1 * deg_to_m;
        let x2 = lon2 * cos_lat * deg_to_m;
        let y2 = lat2 * deg_to_m;

        area += x1 * y2 - x2 * y1;
    }

    area.abs() / 2.0
}

/// Geometric center of a polygon as `(latitude, longitude)`.
///
/// Uses the signed-area centroid formula; a degenerate polygon (collinear
/// vertices or fewer than 3) falls back to the vertex mean.
pub fn polygon_centroid(coords: &[Coordinate]) -> (f64, f64) {
    if coords.is_empty() {
        return (0.0, 0.0);
    }

    let n = coords.len();
    let vertex_mean = || {
        let lat = coords.iter().map(|c| c[0]).sum::<f64>() / n as f64;
        let lon = coords.iter().map(|c| c[1]).sum::<f64>() / n as f64;
        (lat, lon)
    };

    if n < 3 {
        return vertex_mean();
    }

    let mut signed_area = 0.0;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for i in 0..n {
        let [lat1, lon1] = coords[i];
        let [lat2, lon2] = coords[(i + 1) % n];

        let cross = lat1 * lon2 - lat2 * lon1;
        signed_area += cross;
        cx += (lat1 + lat2) * cross;
        cy += (lon1 + lon2) * cross;
    }
    signed_area *= 0.5;

    if signed_area.abs() < 1e-10 {
        return vertex_mean();
    }

    (cx / (6.0 * signed_area), cy / (6.0 * signed_area))
}

/// Axis-aligned bounds of a polygon with dimensions in meters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
    pub width_m: f64,
    pub height_m: f64,
}

/// Bounding box of a polygon. Width and height are measured through the
/// box center.
pub fn bounding_box(coords: &[Coordinate]) -> BoundingBox {
    if coords.is_empty() {
        return BoundingBox::default();
    }

    let mut min_lat = f64::INFINITY;
    let mut max_lat = f64::NEG_INFINITY;
    let mut min_lon = f64::INFINITY;
    let mut max_lon = f64::NEG_INFINITY;
    for [lat, lon] in coords {
        min_lat = min_lat.min(*lat);
        max_lat = max_lat.max(*lat);
        min_lon = min_lon.min(*lon);
        max_lon = max_lon.max(*lon);
    }

    let mid_lat = (min_lat + max_lat) / 2.0;
    let mid_lon = (min_lon + max_lon) / 2.0;

    BoundingBox {
        min_lat,
        max_lat,
        min_lon,
        max_lon,
        width_m: haversine_distance(mid_lat, min_lon, mid_lat, max_lon),
        height_m: haversine_distance(min_lat, mid_lon, max_lat, mid_lon),
    }
}

/// Ray-casting test for a point against a polygon boundary
pub fn point_in_polygon(lat: f64, lon: f64, coords: &[Coordinate]) -> bool {
    if coords.len() < 3 {
        return false;
    }

    let (x, y) = (lon, lat);
    let n = coords.len();
    let mut inside = false;

    let [mut p1y, mut p1x] = coords[0];
    for i in 1..=n {
        let [p2y, p2x] = coords[i % n];
        // Horizontal edges fail the vertical-extent test, so the division
        // below never sees a zero denominator
        if y > p1y.min(p2y) && y <= p1y.max(p2y) && x <= p1x.max(p2x) {
            let x_intersect = (y - p1y) * (p2x - p1x) / (p2y - p1y) + p1x;
            if p1x == p2x || x <= x_intersect {
                inside = !inside;
            }
        }
        p1x = p2x;
        p1y = p2y;
    }

    inside
}

/// Validate a polygon before persisting it: at least three vertices, every
/// coordinate finite and within geographic bounds.
pub fn validate_polygon(coords: &[Coordinate]) -> Result<()> {
    if coords.is_empty() {
        return Err(ServiceError::invalid_request(
            "Polygon coordinates cannot be empty",
        ));
    }
    if coords.len() < 3 {
        return Err(ServiceError::invalid_request(
            "Polygon must have at least 3 points",
        ));
    }
    for [lat, lon] in coords {
        if !lat.is_finite() || !lon.is_finite() {
            return Err(ServiceError::invalid_request(
                "Latitude and longitude must be numbers",
            ));
        }
        if !(-90.0..=90.0).contains(lat) {
            return Err(ServiceError::invalid_request(
                "Latitude must be between -90 and 90",
            ));
        }
        if !(-180.0..=180.0).contains(lon) {
            return Err(ServiceError::invalid_request(
                "Longitude must be between -180 and 180",
            ));
        }
    }
    Ok(())
}

/// Centroid in the metrics response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Centroid {
    pub lat: f64,
    pub lon: f64,
}

/// All derived measurements of one field polygon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldMetrics {
    pub area_sqm: f64,
    pub area_hectares: f64,
    pub area_acres: f64,
    pub perimeter_m: f64,
    pub centroid: Centroid,
    pub bounding_box: BoundingBox,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Compute every metric for a field polygon. Degenerate polygons yield the
/// all-zero metrics rather than an error.
pub fn field_metrics(coords: &[Coordinate]) -> FieldMetrics {
    if coords.len() < 3 {
        return FieldMetrics::default();
    }

    let area_sqm = polygon_area_sqm(coords);
    let (centroid_lat, centroid_lon) = polygon_centroid(coords);
    let bbox = bounding_box(coords);

    FieldMetrics {
        area_sqm: round_to(area_sqm, 2),
        area_hectares: round_to(area_sqm / SQM_PER_HECTARE, 4),
        area_acres: round_to(area_sqm / SQM_PER_ACRE, 4),
        perimeter_m: round_to(polygon_perimeter(coords), 2),
        centroid: Centroid {
            lat: round_to(centroid_lat, 6),
            lon: round_to(centroid_lon, 6),
        },
        bounding_box: BoundingBox {
            min_lat: round_to(bbox.min_lat, 6),
            max_lat: round_to(bbox.max_lat, 6),
            min_lon: round_to(bbox.min_lon, 6),
            max_lon: round_to(bbox.max_lon, 6),
            width_m: round_to(bbox.width_m, 2),
            height_m: round_to(bbox.height_m, 2),
        },
    }
}
