//! Geographic primitives: distance, bounds, simplification, resampling.
//!
//! Everything downstream (signatures, overlap detection, section traces)
//! works on `GpsPoint` slices that have already been filtered through
//! [`filter_valid_points`]; non-finite coordinates never survive past this
//! module.

use crate::types::{Bounds, GpsPoint};
use geo::algorithm::simplify::Simplify;
use geo::{Coord, LineString};

/// WGS-84 mean sphere radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude (approximately constant).
pub const METERS_PER_DEG_LAT: f64 = 111_320.0;

/// Haversine great-circle distance between two points in meters.
pub fn haversine_distance(p: &GpsPoint, q: &GpsPoint) -> f64 {
    let lat1 = p.latitude.to_radians();
    let lat2 = q.latitude.to_radians();
    let dlat = (q.latitude - p.latitude).to_radians();
    let dlng = (q.longitude - p.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Total length of a polyline in meters.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Drop points with non-finite coordinates or out-of-range lat/lng.
pub fn filter_valid_points(points: &[GpsPoint]) -> Vec<GpsPoint> {
    points.iter().copied().filter(|p| p.is_valid()).collect()
}

/// Compute the bounding box of a point set, skipping non-finite coordinates.
/// Returns `None` when no valid point remains.
pub fn compute_bounds(points: &[GpsPoint]) -> Option<Bounds> {
    let mut bounds: Option<Bounds> = None;
    for p in points {
        if !p.is_valid() {
            continue;
        }
        match &mut bounds {
            None => {
                bounds = Some(Bounds {
                    min_lat: p.latitude,
                    max_lat: p.latitude,
                    min_lng: p.longitude,
                    max_lng: p.longitude,
                });
            }
            Some(b) => {
                b.min_lat = b.min_lat.min(p.latitude);
                b.max_lat = b.max_lat.max(p.latitude);
                b.min_lng = b.min_lng.min(p.longitude);
                b.max_lng = b.max_lng.max(p.longitude);
            }
        }
    }
    bounds
}

/// Center of a point set (arithmetic mean).
pub fn compute_center(points: &[GpsPoint]) -> GpsPoint {
    if points.is_empty() {
        return GpsPoint::new(0.0, 0.0);
    }
    let (lat, lng) = points.iter().fold((0.0, 0.0), |(la, ln), p| {
        (la + p.latitude, ln + p.longitude)
    });
    GpsPoint::new(lat / points.len() as f64, lng / points.len() as f64)
}

/// Convert a distance in meters to degrees of latitude.
pub fn meters_to_degrees(meters: f64) -> f64 {
    meters / METERS_PER_DEG_LAT
}

/// Douglas-Peucker simplification with the tolerance expressed in meters.
///
/// Endpoints are always retained; output has at least 2 points when the
/// input does. The perpendicular distance is computed in a local projection
/// through the `geo` crate, with the meter tolerance converted to degrees at
/// the track's mean latitude.
pub fn simplify(points: &[GpsPoint], tolerance_m: f64) -> Vec<GpsPoint> {
    if points.len() <= 2 {
        return points.to_vec();
    }

    let coords: Vec<Coord> = points
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect();
    let line = LineString::new(coords);

    let tolerance_deg = meters_to_degrees(tolerance_m);
    let simplified = line.simplify(&tolerance_deg);

    let out: Vec<GpsPoint> = simplified
        .0
        .iter()
        .map(|c| GpsPoint::new(c.y, c.x))
        .collect();

    if out.len() < 2 {
        // Degenerate tolerance collapsed the line; keep the endpoints.
        vec![points[0], *points.last().unwrap()]
    } else {
        out
    }
}

/// Simplify a track down to roughly `sqrt(n)` points for use as a signature.
///
/// Starts from an 11 m tolerance and doubles until the target is reached or
/// the tolerance becomes unreasonably coarse. The exact count is not
/// important; signatures only feed the overlap primitive, which resamples.
pub fn simplify_to_signature(points: &[GpsPoint]) -> Vec<GpsPoint> {
    let valid = filter_valid_points(points);
    if valid.len() <= 2 {
        return valid;
    }

    let target = (valid.len() as f64).sqrt().ceil().max(2.0) as usize;
    let mut tolerance_m = 11.0;
    let mut simplified = simplify(&valid, tolerance_m);

    while simplified.len() > target * 4 && tolerance_m < 500.0 {
        tolerance_m *= 2.0;
        simplified = simplify(&valid, tolerance_m);
    }

    simplified
}

/// Resample a polyline to exactly `target_count` points, evenly spaced by
/// distance. Endpoints are preserved.
pub fn resample_by_distance(points: &[GpsPoint], target_count: usize) -> Vec<GpsPoint> {
    if points.len() < 2 || target_count < 2 {
        return points.to_vec();
    }

    let mut cumulative = vec![0.0];
    for w in points.windows(2) {
        let d = haversine_distance(&w[0], &w[1]);
        cumulative.push(cumulative.last().unwrap() + d);
    }

    let total = *cumulative.last().unwrap();
    if total < 1.0 {
        return points.to_vec();
    }

    let mut resampled = Vec::with_capacity(target_count);
    let mut seg = 0;
    for i in 0..target_count {
        let target = (i as f64 / (target_count - 1) as f64) * total;
        while seg + 1 < cumulative.len() - 1 && cumulative[seg + 1] < target {
            seg += 1;
        }

        let seg_start = cumulative[seg];
        let seg_len = cumulative[seg + 1] - seg_start;
        let t = if seg_len > 1e-9 {
            ((target - seg_start) / seg_len).clamp(0.0, 1.0)
        } else {
            0.0
        };

        let p1 = &points[seg];
        let p2 = &points[seg + 1];
        resampled.push(GpsPoint::new(
            p1.latitude + t * (p2.latitude - p1.latitude),
            p1.longitude + t * (p2.longitude - p1.longitude),
        ));
    }

    resampled
}

/// Average minimum distance from each point of `a` to the nearest point of
/// `b`, in meters. Asymmetric; callers average both directions when they
/// need a symmetric measure.
pub fn average_min_distance(a: &[GpsPoint], b: &[GpsPoint]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::INFINITY;
    }

    let total: f64 = a
        .iter()
        .map(|p| {
            b.iter()
                .map(|q| haversine_distance(p, q))
                .fold(f64::INFINITY, f64::min)
        })
        .sum();

    total / a.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_track(n: usize) -> Vec<GpsPoint> {
        (0..n)
            .map(|i| GpsPoint::new(0.0, i as f64 * 0.001))
            .collect()
    }

    #[test]
    fn test_haversine_known_distance() {
        let london = GpsPoint::new(51.5074, -0.1278);
        let paris = GpsPoint::new(48.8566, 2.3522);
        let d = haversine_distance(&london, &paris);
        assert!(d > 340_000.0 && d < 350_000.0, "got {d}");
    }

    #[test]
    fn test_haversine_zero() {
        let p = GpsPoint::new(45.0, 7.0);
        assert_eq!(haversine_distance(&p, &p), 0.0);
    }

    #[test]
    fn test_polyline_length_additive() {
        let track = straight_track(11);
        let full = polyline_length(&track);
        let half_a = polyline_length(&track[..6]);
        let half_b = polyline_length(&track[5..]);
        assert!((full - (half_a + half_b)).abs() < 0.01);
    }

    #[test]
    fn test_compute_bounds_skips_invalid() {
        let points = vec![
            GpsPoint::new(1.0, 2.0),
            GpsPoint::new(f64::NAN, 5.0),
            GpsPoint::new(3.0, 4.0),
        ];
        let b = compute_bounds(&points).unwrap();
        assert_eq!(b.min_lat, 1.0);
        assert_eq!(b.max_lat, 3.0);
        assert_eq!(b.max_lng, 4.0);
    }

    #[test]
    fn test_compute_bounds_all_invalid() {
        let points = vec![GpsPoint::new(f64::NAN, 0.0), GpsPoint::new(0.0, f64::INFINITY)];
        assert!(compute_bounds(&points).is_none());
    }

    #[test]
    fn test_simplify_keeps_endpoints() {
        let mut track = straight_track(50);
        // A small kink in the middle that a coarse tolerance removes.
        track[25].latitude += 0.00001;
        let simplified = simplify(&track, 50.0);
        assert!(simplified.len() >= 2);
        assert_eq!(simplified[0], track[0]);
        assert_eq!(*simplified.last().unwrap(), *track.last().unwrap());
    }

    #[test]
    fn test_signature_is_much_smaller() {
        let track: Vec<GpsPoint> = (0..1000)
            .map(|i| {
                GpsPoint::new(
                    (i as f64 * 0.0001).sin() * 0.01,
                    i as f64 * 0.0001,
                )
            })
            .collect();
        let sig = simplify_to_signature(&track);
        assert!(sig.len() >= 2);
        assert!(sig.len() < track.len() / 2, "signature {} points", sig.len());
    }

    #[test]
    fn test_resample_exact_count() {
        let track = straight_track(7);
        let resampled = resample_by_distance(&track, 20);
        assert_eq!(resampled.len(), 20);
        assert!((resampled[0].longitude - track[0].longitude).abs() < 1e-9);
        assert!(
            (resampled.last().unwrap().longitude - track.last().unwrap().longitude).abs() < 1e-6
        );
    }

    #[test]
    fn test_average_min_distance_identity() {
        let track = straight_track(10);
        assert!(average_min_distance(&track, &track) < 1e-9);
    }
}
