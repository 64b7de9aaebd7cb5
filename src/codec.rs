//! On-disk encodings: Google polylines and time-stream blobs.
//!
//! GPS tracks and section polylines persist as Google Encoded Polyline
//! strings (precision 5, ~1e-5 degrees), which is roughly 60% smaller than
//! raw doubles. Time streams persist as little-endian f32 arrays; the length
//! is derivable from the matching track's point count.

use crate::error::{EngineError, Result};
use crate::types::GpsPoint;
use geo::{Coord, LineString};

/// Encode points as a Google polyline string (precision 5).
pub fn encode_polyline(points: &[GpsPoint]) -> Result<String> {
    let coords: Vec<Coord> = points
        .iter()
        .map(|p| Coord {
            x: p.longitude,
            y: p.latitude,
        })
        .collect();

    polyline::encode_coordinates(coords, 5)
        .map_err(|e| EngineError::storage(format!("polyline encode failed: {e}")))
}

/// Decode a Google polyline string (precision 5) back to points.
pub fn decode_polyline(encoded: &str) -> Result<Vec<GpsPoint>> {
    let line: LineString<f64> = polyline::decode_polyline(encoded, 5)
        .map_err(|e| EngineError::storage(format!("polyline decode failed: {e}")))?;

    Ok(line.0.iter().map(|c| GpsPoint::new(c.y, c.x)).collect())
}

/// Encode a time stream (cumulative seconds per GPS sample) as an f32 LE blob.
pub fn encode_time_stream(times: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(times.len() * 4);
    for t in times {
        blob.extend_from_slice(&t.to_le_bytes());
    }
    blob
}

/// Decode an f32 LE blob back into a time stream.
pub fn decode_time_stream(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(EngineError::storage(format!(
            "time stream blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_polyline_round_trip() {
        let points = vec![
            GpsPoint::new(38.5, -120.2),
            GpsPoint::new(40.7, -120.95),
            GpsPoint::new(43.252, -126.453),
        ];
        let encoded = encode_polyline(&points).unwrap();
        let decoded = decode_polyline(&encoded).unwrap();
        assert_eq!(decoded.len(), points.len());
        for (a, b) in points.iter().zip(decoded.iter()) {
            // Precision 5 means ~1e-5 degrees.
            assert!((a.latitude - b.latitude).abs() < 1e-5);
            assert!((a.longitude - b.longitude).abs() < 1e-5);
        }
    }

    #[test]
    fn test_polyline_known_vector() {
        // Reference string from the Google polyline format documentation.
        let points = vec![
            GpsPoint::new(38.5, -120.2),
            GpsPoint::new(40.7, -120.95),
            GpsPoint::new(43.252, -126.453),
        ];
        let encoded = encode_polyline(&points).unwrap();
        assert_eq!(encoded, "_p~iF~ps|U_ulLnnqC_mqNvxq`@");
    }

    #[test]
    fn test_time_stream_round_trip() {
        let times: Vec<f32> = vec![0.0, 12.5, 60.0, 3600.25];
        let blob = encode_time_stream(&times);
        assert_eq!(blob.len(), 16);
        let decoded = decode_time_stream(&blob).unwrap();
        assert_eq!(decoded, times);
    }

    #[test]
    fn test_time_stream_rejects_ragged_blob() {
        assert!(decode_time_stream(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_empty_round_trips() {
        assert_eq!(decode_polyline(&encode_polyline(&[]).unwrap()).unwrap(), vec![]);
        assert_eq!(decode_time_stream(&encode_time_stream(&[])).unwrap(), Vec::<f32>::new());
    }
}
