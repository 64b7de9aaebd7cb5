//! Spatial indexing: viewport R-tree and the polyline-overlap primitive.
//!
//! Two indexes live here. The viewport index maps activity ids to bounding
//! boxes and answers coarse rectangle queries; it is rebuilt lazily after
//! mutations. The track index holds the segments of a single polyline in a
//! local meter projection and answers nearest-segment queries, which is the
//! core of `overlap_ratio` and of traversal extraction.

use crate::geo::METERS_PER_DEG_LAT;
use crate::types::{Bounds, GpsPoint};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

// ============================================================================
// Viewport index
// ============================================================================

/// Bounds wrapper for R-tree spatial indexing of whole activities.
#[derive(Debug, Clone)]
pub struct ActivityBoundsEntry {
    pub activity_id: String,
    pub bounds: Bounds,
}

impl RTreeObject for ActivityBoundsEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_lng, self.bounds.min_lat],
            [self.bounds.max_lng, self.bounds.max_lat],
        )
    }
}

/// R-tree over activity bounding boxes for viewport queries.
#[derive(Debug)]
pub struct ViewportIndex {
    tree: RTree<ActivityBoundsEntry>,
}

impl ViewportIndex {
    pub fn build(entries: Vec<ActivityBoundsEntry>) -> Self {
        Self {
            tree: RTree::bulk_load(entries),
        }
    }

    /// Every activity whose bbox intersects the query rectangle. Coarse
    /// filter; callers refine if needed.
    pub fn query_viewport(&self, query: &Bounds) -> Vec<String> {
        let envelope = AABB::from_corners(
            [query.min_lng, query.min_lat],
            [query.max_lng, query.max_lat],
        );
        self.tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|e| e.activity_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }
}

// ============================================================================
// Track index (segments in a local meter projection)
// ============================================================================

/// Equirectangular projection centered on a reference point. Good to well
/// under a meter of error at track scale, which is far below GPS noise.
#[derive(Debug, Clone, Copy)]
pub struct LocalProjection {
    ref_lat: f64,
    ref_lng: f64,
    lng_scale: f64,
}

impl LocalProjection {
    pub fn centered_on(p: &GpsPoint) -> Self {
        Self {
            ref_lat: p.latitude,
            ref_lng: p.longitude,
            lng_scale: METERS_PER_DEG_LAT * p.latitude.to_radians().cos(),
        }
    }

    pub fn to_xy(&self, p: &GpsPoint) -> [f64; 2] {
        [
            (p.longitude - self.ref_lng) * self.lng_scale,
            (p.latitude - self.ref_lat) * METERS_PER_DEG_LAT,
        ]
    }
}

/// One segment of a projected polyline.
#[derive(Debug, Clone, Copy)]
pub struct SegmentEntry {
    /// Index of the segment's first point in the source polyline.
    pub index: usize,
    pub start: [f64; 2],
    pub end: [f64; 2],
}

impl SegmentEntry {
    fn distance_2_to(&self, point: &[f64; 2]) -> f64 {
        let dx = self.end[0] - self.start[0];
        let dy = self.end[1] - self.start[1];
        let len_2 = dx * dx + dy * dy;

        let t = if len_2 > 1e-12 {
            (((point[0] - self.start[0]) * dx + (point[1] - self.start[1]) * dy) / len_2)
                .clamp(0.0, 1.0)
        } else {
            0.0
        };

        let px = self.start[0] + t * dx - point[0];
        let py = self.start[1] + t * dy - point[1];
        px * px + py * py
    }
}

impl RTreeObject for SegmentEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [
                self.start[0].min(self.end[0]),
                self.start[1].min(self.end[1]),
            ],
            [
                self.start[0].max(self.end[0]),
                self.start[1].max(self.end[1]),
            ],
        )
    }
}

impl PointDistance for SegmentEntry {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        self.distance_2_to(point)
    }
}

/// R-tree over the segments of one polyline. Memory O(|B|), nearest-segment
/// query O(log |B|).
#[derive(Debug)]
pub struct TrackIndex {
    projection: LocalProjection,
    tree: RTree<SegmentEntry>,
    point_count: usize,
}

impl TrackIndex {
    /// Build from a polyline; returns `None` for fewer than 2 points.
    pub fn build(points: &[GpsPoint]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }

        let projection = LocalProjection::centered_on(&points[0]);
        let segments: Vec<SegmentEntry> = points
            .windows(2)
            .enumerate()
            .map(|(i, w)| SegmentEntry {
                index: i,
                start: projection.to_xy(&w[0]),
                end: projection.to_xy(&w[1]),
            })
            .collect();

        Some(Self {
            projection,
            tree: RTree::bulk_load(segments),
            point_count: points.len(),
        })
    }

    pub fn point_count(&self) -> usize {
        self.point_count
    }

    /// Nearest segment within `threshold_m` of `p`, as (segment index,
    /// distance in meters), or `None` when nothing is close enough.
    pub fn nearest_within(&self, p: &GpsPoint, threshold_m: f64) -> Option<(usize, f64)> {
        let xy = self.projection.to_xy(p);
        let nearest = self.tree.nearest_neighbor(&xy)?;
        let dist_2 = nearest.distance_2(&xy);
        if dist_2 <= threshold_m * threshold_m {
            Some((nearest.index, dist_2.sqrt()))
        } else {
            None
        }
    }
}

// ============================================================================
// Overlap primitive
// ============================================================================

/// Fraction of `a`'s points within `threshold_m` of the indexed track, in
/// [0, 1]. Time O(|a| log |b|).
pub fn overlap_ratio_indexed(a: &[GpsPoint], b: &TrackIndex, threshold_m: f64) -> f64 {
    if a.is_empty() {
        return 0.0;
    }

    let matched = a
        .iter()
        .filter(|p| b.nearest_within(p, threshold_m).is_some())
        .count();

    matched as f64 / a.len() as f64
}

/// Convenience wrapper building the index for `b` on the fly.
pub fn overlap_ratio(a: &[GpsPoint], b: &[GpsPoint], threshold_m: f64) -> f64 {
    match TrackIndex::build(b) {
        Some(index) => overlap_ratio_indexed(a, &index, threshold_m),
        None => 0.0,
    }
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
    fn test_viewport_query_hits_intersecting() {
        let entries = vec![
            ActivityBoundsEntry {
                activity_id: "a".into(),
                bounds: Bounds {
                    min_lat: 0.0,
                    max_lat: 1.0,
                    min_lng: 0.0,
                    max_lng: 1.0,
                },
            },
            ActivityBoundsEntry {
                activity_id: "b".into(),
                bounds: Bounds {
                    min_lat: 10.0,
                    max_lat: 11.0,
                    min_lng: 10.0,
                    max_lng: 11.0,
                },
            },
        ];
        let index = ViewportIndex::build(entries);

        let hits = index.query_viewport(&Bounds {
            min_lat: 0.5,
            max_lat: 2.0,
            min_lng: 0.5,
            max_lng: 2.0,
        });
        assert_eq!(hits, vec!["a".to_string()]);
    }

    #[test]
    fn test_overlap_ratio_self_is_one() {
        let track = straight_track(20);
        assert_eq!(overlap_ratio(&track, &track, 50.0), 1.0);
    }

    #[test]
    fn test_overlap_ratio_disjoint_is_zero() {
        let a = straight_track(10);
        let b: Vec<GpsPoint> = (0..10)
            .map(|i| GpsPoint::new(10.0, i as f64 * 0.001))
            .collect();
        assert_eq!(overlap_ratio(&a, &b, 50.0), 0.0);
    }

    #[test]
    fn test_overlap_ratio_partial() {
        // a covers twice the span of b, so roughly half of a matches.
        let a = straight_track(21);
        let b = straight_track(11);
        let ratio = overlap_ratio(&a, &b, 50.0);
        assert!(ratio > 0.4 && ratio < 0.7, "got {ratio}");
    }

    #[test]
    fn test_overlap_symmetry_bound() {
        // Two nearly identical tracks: both directions should agree closely.
        let a = straight_track(30);
        let b: Vec<GpsPoint> = a
            .iter()
            .map(|p| GpsPoint::new(p.latitude + 0.0001, p.longitude))
            .collect();
        let ab = overlap_ratio(&a, &b, 50.0);
        let ba = overlap_ratio(&b, &a, 50.0);
        assert!((ab - ba).abs() <= 0.1, "ab={ab} ba={ba}");
        assert!((0.0..=1.0).contains(&ab));
        assert!((0.0..=1.0).contains(&ba));
    }

    #[test]
    fn test_nearest_within_reports_segment_index() {
        let track = straight_track(5);
        let index = TrackIndex::build(&track).unwrap();

        // A point right next to the fourth segment.
        let probe = GpsPoint::new(0.0001, 0.0035);
        let (seg, dist) = index.nearest_within(&probe, 50.0).unwrap();
        assert_eq!(seg, 3);
        assert!(dist < 15.0);

        // A point far away misses.
        let far = GpsPoint::new(1.0, 1.0);
        assert!(index.nearest_within(&far, 50.0).is_none());
    }

    #[test]
    fn test_track_index_rejects_degenerate() {
        assert!(TrackIndex::build(&[]).is_none());
        assert!(TrackIndex::build(&[GpsPoint::new(0.0, 0.0)]).is_none());
    }
}
