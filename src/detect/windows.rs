//! Multi-scale section candidates: slide windows along candidate tracks,
//! keep the ones enough distinct activities traverse, then merge within and
//! across scales.

use super::grouping::TrackData;
use crate::geo;
use crate::spatial::{overlap_ratio_indexed, TrackIndex};
use crate::types::{DetectConfig, GpsPoint, SectionScale};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

/// A window that enough activities share, before it becomes a section.
pub struct SectionCandidate {
    pub scale: SectionScale,
    pub sport: String,
    /// Track the window was cut from.
    pub source_id: String,
    pub start: usize,
    pub end: usize,
    pub polyline: Vec<GpsPoint>,
    /// Distinct activity ids traversing the window, source included.
    pub supporters: HashSet<String>,
}

/// Fraction of a window's points that must lie within the overlap threshold
/// of another track for that track to count as a visit.
const WINDOW_VISIT_RATIO: f64 = 0.8;

/// Detect candidates across every configured scale. Returns `None` when
/// cancelled. `on_track_done` ticks once per (scale, track) unit of work.
pub fn detect_candidates(
    tracks: &[TrackData],
    full_indexes: &[Option<TrackIndex>],
    config: &DetectConfig,
    cancel: &AtomicBool,
    on_track_done: impl Fn(),
) -> Option<Vec<SectionCandidate>> {
    // Indices per sport; windows only ever match same-sport tracks.
    let mut by_sport: HashMap<&str, Vec<usize>> = HashMap::new();
    for (i, t) in tracks.iter().enumerate() {
        by_sport.entry(t.sport.as_str()).or_default().push(i);
    }

    // Cumulative distance per track, shared across scales.
    let cumulative: Vec<Vec<f64>> = tracks
        .iter()
        .map(|t| {
            let mut cum = Vec::with_capacity(t.points.len());
            cum.push(0.0);
            for w in t.points.windows(2) {
                let d = geo::haversine_distance(&w[0], &w[1]);
                cum.push(cum.last().unwrap() + d);
            }
            cum
        })
        .collect();

    // Largest scales first so cross-scale containment can prefer them.
    let mut scales = config.scales.clone();
    scales.sort_by(|a, b| b.window_m.total_cmp(&a.window_m));

    let mut accepted: Vec<SectionCandidate> = Vec::new();

    for preset in &scales {
        let mut scale_candidates: Vec<SectionCandidate> = Vec::new();

        for indices in by_sport.values() {
            if (indices.len() as u32) < config.min_visits {
                continue;
            }

            for &ti in indices {
                if cancel.load(Ordering::Relaxed) {
                    return None;
                }

                let track = &tracks[ti];
                for (start, end) in cut_windows(&cumulative[ti], preset.window_m) {
                    let window = &track.points[start..=end];

                    let mut supporters: HashSet<String> = HashSet::new();
                    supporters.insert(track.id.clone());

                    for &oi in indices {
                        if oi == ti {
                            continue;
                        }
                        let Some(index) = full_indexes[oi].as_ref() else {
                            continue;
                        };
                        let ratio =
                            overlap_ratio_indexed(window, index, config.overlap_threshold_m);
                        if ratio >= WINDOW_VISIT_RATIO {
                            supporters.insert(tracks[oi].id.clone());
                        }
                    }

                    if (supporters.len() as u32) >= config.min_visits {
                        merge_into(
                            &mut scale_candidates,
                            SectionCandidate {
                                scale: preset.scale,
                                sport: track.sport.clone(),
                                source_id: track.id.clone(),
                                start,
                                end,
                                polyline: window.to_vec(),
                                supporters,
                            },
                            config.merge_overlap,
                            config.overlap_threshold_m,
                        );
                    }
                }
                on_track_done();
            }
        }

        // Across scales: a smaller candidate contained in an already
        // accepted larger one is dropped.
        for candidate in scale_candidates {
            let contained = accepted.iter().any(|bigger| {
                bigger.sport == candidate.sport
                    && overlap_contained(
                        &candidate.polyline,
                        &bigger.polyline,
                        config.containment_overlap,
                        config.overlap_threshold_m,
                    )
            });
            if !contained {
                accepted.push(candidate);
            }
        }
    }

    Some(accepted)
}

/// Cut `[start, end]` index windows of roughly `window_m` length, stepping
/// half a window at a time. Tracks shorter than a window yield nothing.
fn cut_windows(cumulative: &[f64], window_m: f64) -> Vec<(usize, usize)> {
    let total = *cumulative.last().unwrap_or(&0.0);
    if total < window_m || cumulative.len() < 2 {
        return Vec::new();
    }

    let step = window_m / 2.0;
    let mut windows = Vec::new();
    let mut anchor = 0.0;

    while anchor + window_m <= total + step {
        let target_start = anchor.min(total - window_m);
        let target_end = target_start + window_m;

        let start = cumulative.partition_point(|&d| d < target_start);
        let end = cumulative
            .partition_point(|&d| d < target_end)
            .min(cumulative.len() - 1);

        if end > start {
            windows.push((start, end));
        }
        anchor += step;
    }

    windows.dedup();
    windows
}

/// Merge a new candidate into the per-scale list: when it overlaps an
/// existing one strongly enough they are the same physical stretch, so the
/// supporter sets merge and the earlier polyline stands.
fn merge_into(
    candidates: &mut Vec<SectionCandidate>,
    candidate: SectionCandidate,
    merge_overlap: f64,
    threshold_m: f64,
) {
    for existing in candidates.iter_mut() {
        if existing.sport != candidate.sport {
            continue;
        }
        if overlap_contained(
            &candidate.polyline,
            &existing.polyline,
            merge_overlap,
            threshold_m,
        ) {
            existing.supporters.extend(candidate.supporters);
            return;
        }
    }
    candidates.push(candidate);
}

fn overlap_contained(
    smaller: &[GpsPoint],
    bigger: &[GpsPoint],
    min_ratio: f64,
    threshold_m: f64,
) -> bool {
    match TrackIndex::build(bigger) {
        Some(index) => overlap_ratio_indexed(smaller, &index, threshold_m) >= min_ratio,
        None => false,
    }
}
