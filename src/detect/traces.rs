//! Traversal extraction: find every lap of a polyline within a GPS track.
//!
//! The core routine walks the activity's points against a segment R-tree of
//! the target polyline, collects contiguous matched runs, and classifies
//! each run's direction from the monotonicity of the nearest-segment index
//! sequence.

use crate::geo;
use crate::spatial::{overlap_ratio_indexed, TrackIndex};
use crate::types::{Direction, GpsPoint, SectionTraversal};

/// Consecutive unmatched points tolerated inside a run (GPS dropouts,
/// junction noise).
const RUN_GAP_TOLERANCE: usize = 5;

/// Minimum coverage of the target polyline for a run to count as a
/// traversal at all.
const MIN_TRAVERSAL_COVERAGE: f64 = 0.5;

/// Coverage at or above which a monotonic run is a full lap rather than a
/// partial one.
const FULL_LAP_COVERAGE: f64 = 0.8;

/// Share of index steps that must agree for a direction call.
const DIRECTION_AGREEMENT: f64 = 0.8;

/// Find every traversal of `polyline` within `track`.
///
/// Returns one entry per lap with start/end indices into `track`
/// (end inclusive), a direction, and the coverage as a 0-100 percentage.
pub fn find_traversals(
    activity_id: &str,
    track: &[GpsPoint],
    polyline: &[GpsPoint],
    threshold_m: f64,
) -> Vec<SectionTraversal> {
    let Some(index) = TrackIndex::build(polyline) else {
        return Vec::new();
    };
    if track.len() < 2 {
        return Vec::new();
    }

    // Nearest polyline segment for each track point, within threshold.
    let nearest: Vec<Option<usize>> = track
        .iter()
        .map(|p| index.nearest_within(p, threshold_m).map(|(seg, _)| seg))
        .collect();

    let mut traversals = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut last_match = 0usize;
    let mut gap = 0usize;

    for (i, seg) in nearest.iter().enumerate() {
        match seg {
            Some(_) => {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                last_match = i;
                gap = 0;
            }
            None => {
                if run_start.is_some() {
                    gap += 1;
                    if gap > RUN_GAP_TOLERANCE {
                        if let Some(start) = run_start.take() {
                            if let Some(t) = classify_run(
                                activity_id,
                                track,
                                &nearest,
                                start,
                                last_match,
                                polyline,
                                threshold_m,
                            ) {
                                traversals.push(t);
                            }
                        }
                        gap = 0;
                    }
                }
            }
        }
    }

    if let Some(start) = run_start {
        if let Some(t) = classify_run(
            activity_id,
            track,
            &nearest,
            start,
            last_match,
            polyline,
            threshold_m,
        ) {
            traversals.push(t);
        }
    }

    traversals
}

/// Turn one matched run into a traversal, or discard it when coverage of
/// the target polyline is too low.
fn classify_run(
    activity_id: &str,
    track: &[GpsPoint],
    nearest: &[Option<usize>],
    start: usize,
    end: usize,
    polyline: &[GpsPoint],
    threshold_m: f64,
) -> Option<SectionTraversal> {
    if end <= start {
        return None;
    }

    let run_points = &track[start..=end];
    let coverage = match TrackIndex::build(run_points) {
        Some(run_index) => overlap_ratio_indexed(polyline, &run_index, threshold_m),
        None => return None,
    };
    if coverage < MIN_TRAVERSAL_COVERAGE {
        return None;
    }

    let direction = classify_direction(&nearest[start..=end], coverage);

    Some(SectionTraversal {
        activity_id: activity_id.to_string(),
        start_index: start as u32,
        end_index: end as u32,
        direction,
        match_percentage: coverage * 100.0,
    })
}

/// Direction from the nearest-segment index sequence: increasing means the
/// run follows the polyline's stored orientation, decreasing means it runs
/// it backwards, anything else (or low coverage) is partial.
fn classify_direction(nearest: &[Option<usize>], coverage: f64) -> Direction {
    let indices: Vec<usize> = nearest.iter().filter_map(|s| *s).collect();
    if indices.len() < 2 {
        return Direction::Partial;
    }

    let mut increasing = 0usize;
    let mut decreasing = 0usize;
    for w in indices.windows(2) {
        if w[1] > w[0] {
            increasing += 1;
        } else if w[1] < w[0] {
            decreasing += 1;
        }
    }

    let moving = increasing + decreasing;
    if moving == 0 {
        // A polyline short enough that every point maps to one segment:
        // orientation is meaningless, call it same when fully covered.
        return if coverage >= FULL_LAP_COVERAGE {
            Direction::Same
        } else {
            Direction::Partial
        };
    }

    let inc_ratio = increasing as f64 / moving as f64;
    if coverage >= FULL_LAP_COVERAGE && inc_ratio >= DIRECTION_AGREEMENT {
        Direction::Same
    } else if coverage >= FULL_LAP_COVERAGE && inc_ratio <= 1.0 - DIRECTION_AGREEMENT {
        Direction::Reverse
    } else {
        Direction::Partial
    }
}

/// Mean pairwise overlap among contributing traces, used as the section
/// confidence score. Pairs are capped to keep this O(1) per section.
pub fn trace_confidence(traces: &[&[GpsPoint]], threshold_m: f64) -> f64 {
    if traces.len() < 2 {
        return 1.0;
    }

    let capped: Vec<&[GpsPoint]> = traces.iter().copied().take(10).collect();
    let mut total = 0.0;
    let mut pairs = 0u32;

    for i in 0..capped.len() {
        let Some(index_i) = TrackIndex::build(capped[i]) else {
            continue;
        };
        for j in (i + 1)..capped.len() {
            let forward = overlap_ratio_indexed(capped[j], &index_i, threshold_m);
            let backward = crate::spatial::overlap_ratio(capped[i], capped[j], threshold_m);
            total += (forward + backward) / 2.0;
            pairs += 1;
        }
    }

    if pairs == 0 {
        1.0
    } else {
        (total / pairs as f64).clamp(0.0, 1.0)
    }
}

/// Distance along a track between two indices (end inclusive).
pub fn span_distance(track: &[GpsPoint], start: usize, end: usize) -> f64 {
    if end <= start || end >= track.len() {
        return 0.0;
    }
    geo::polyline_length(&track[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> Vec<GpsPoint> {
        (0..n)
            .map(|i| GpsPoint::new(0.0, i as f64 * 0.001))
            .collect()
    }

    #[test]
    fn test_single_same_direction_lap() {
        let track = line(20);
        let section: Vec<GpsPoint> = track[5..15].to_vec();

        let traversals = find_traversals("a", &track, &section, 50.0);
        assert_eq!(traversals.len(), 1);
        let t = &traversals[0];
        assert_eq!(t.direction, Direction::Same);
        assert!(t.match_percentage > 80.0);
        assert!(t.start_index <= 5);
        assert!(t.end_index >= 14);
    }

    #[test]
    fn test_reverse_lap() {
        let mut track = line(20);
        track.reverse();
        let section: Vec<GpsPoint> = line(20)[5..15].to_vec();

        let traversals = find_traversals("a", &track, &section, 50.0);
        assert_eq!(traversals.len(), 1);
        assert_eq!(traversals[0].direction, Direction::Reverse);
    }

    #[test]
    fn test_two_laps_detected_separately() {
        // Out along the section, far away, and back along it again.
        let section = line(10);
        let mut track = line(10);
        // Excursion well outside the threshold.
        for i in 0..30 {
            track.push(GpsPoint::new(1.0 + i as f64 * 0.001, 0.0));
        }
        track.extend(line(10));

        let traversals = find_traversals("a", &track, &section, 50.0);
        assert_eq!(traversals.len(), 2);
    }

    #[test]
    fn test_partial_coverage_classified_partial() {
        let section = line(20);
        // Track only covers the first third of the section.
        let track: Vec<GpsPoint> = section[0..13].to_vec();

        let traversals = find_traversals("a", &track, &section, 50.0);
        assert_eq!(traversals.len(), 1);
        assert_eq!(traversals[0].direction, Direction::Partial);
        assert!(traversals[0].match_percentage < 80.0);
    }

    #[test]
    fn test_no_match_far_track() {
        let section = line(10);
        let track: Vec<GpsPoint> = (0..10)
            .map(|i| GpsPoint::new(5.0, i as f64 * 0.001))
            .collect();
        assert!(find_traversals("a", &track, &section, 50.0).is_empty());
    }

    #[test]
    fn test_trace_confidence_identical_traces() {
        let a = line(10);
        let b = line(10);
        let traces: Vec<&[GpsPoint]> = vec![&a, &b];
        let confidence = trace_confidence(&traces, 50.0);
        assert!(confidence > 0.95);
    }
}
