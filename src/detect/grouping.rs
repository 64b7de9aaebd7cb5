//! Route grouping: overlap graph over signatures, clustered with Union-Find.
//!
//! Two activities share a group when their signatures overlap at least
//! `group_threshold` (taking the better of the two directed ratios, so a
//! slightly longer variant still matches its shorter twin). Components are
//! restricted to one sport; singletons are discarded.

use super::union_find::UnionFind;
use crate::geo;
use crate::spatial::{overlap_ratio_indexed, TrackIndex};
use crate::types::{Bounds, DetectConfig, Direction, GpsPoint, GroupMember, RouteGroup};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything the pipeline carries per candidate activity.
pub struct TrackData {
    pub id: String,
    pub sport: String,
    pub points: Vec<GpsPoint>,
    pub signature: Vec<GpsPoint>,
    pub bounds: Bounds,
}

/// One edge of the overlap graph.
#[derive(Debug, Clone)]
pub struct OverlapEdge {
    pub a: usize,
    pub b: usize,
    pub ratio: f64,
}

/// Candidate pairs: same sport, intersecting bounding boxes. The R-tree
/// prune happens implicitly through the bbox check; signatures are tiny so
/// the quadratic pair scan is bounded by the overlap computation itself.
pub fn candidate_pairs(tracks: &[TrackData]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..tracks.len() {
        for j in (i + 1)..tracks.len() {
            if tracks[i].sport != tracks[j].sport {
                continue;
            }
            if !tracks[i].bounds.intersects(&tracks[j].bounds) {
                continue;
            }
            pairs.push((i, j));
        }
    }
    pairs
}

/// Compute overlap edges for the candidate pairs in parallel. Returns
/// `None` when cancelled mid-way.
pub fn find_overlap_edges(
    tracks: &[TrackData],
    indexes: &[Option<TrackIndex>],
    pairs: &[(usize, usize)],
    config: &DetectConfig,
    cancel: &AtomicBool,
    on_pair_done: impl Fn() + Sync,
) -> Option<Vec<OverlapEdge>> {
    let edges: Vec<Option<OverlapEdge>> = pairs
        .par_iter()
        .map(|&(i, j)| {
            if cancel.load(Ordering::Relaxed) {
                return None;
            }
            let edge = overlap_edge(tracks, indexes, i, j, config);
            on_pair_done();
            edge
        })
        .collect();

    if cancel.load(Ordering::Relaxed) {
        return None;
    }
    Some(edges.into_iter().flatten().collect())
}

fn overlap_edge(
    tracks: &[TrackData],
    indexes: &[Option<TrackIndex>],
    i: usize,
    j: usize,
    config: &DetectConfig,
) -> Option<OverlapEdge> {
    let (index_i, index_j) = (indexes[i].as_ref()?, indexes[j].as_ref()?);

    let ab = overlap_ratio_indexed(&tracks[i].signature, index_j, config.overlap_threshold_m);
    let ba = overlap_ratio_indexed(&tracks[j].signature, index_i, config.overlap_threshold_m);
    let ratio = ab.max(ba);

    if ratio >= config.group_threshold {
        Some(OverlapEdge { a: i, b: j, ratio })
    } else {
        None
    }
}

/// Cluster the overlap graph into route groups. Components with fewer than
/// two members are dropped; their activities stay visible elsewhere.
pub fn cluster_groups(
    tracks: &[TrackData],
    edges: &[OverlapEdge],
    config: &DetectConfig,
) -> Vec<(RouteGroup, Vec<GroupMember>)> {
    let mut uf = UnionFind::new();
    for t in tracks {
        uf.make_set(&t.id);
    }
    for e in edges {
        uf.union(&tracks[e.a].id, &tracks[e.b].id);
    }

    let by_id: HashMap<&str, &TrackData> =
        tracks.iter().map(|t| (t.id.as_str(), t)).collect();

    let mut groups: Vec<(RouteGroup, Vec<GroupMember>)> = Vec::new();
    let mut components: Vec<Vec<String>> = uf.groups().into_values().collect();
    components.sort_by(|a, b| a[0].cmp(&b[0]));

    for members in components {
        if members.len() < 2 {
            continue;
        }

        let member_tracks: Vec<&TrackData> =
            members.iter().filter_map(|id| by_id.get(id.as_str()).copied()).collect();
        if member_tracks.len() < 2 {
            continue;
        }

        let representative_id = select_medoid(&member_tracks);
        let representative = by_id[representative_id.as_str()];
        let rep_index = TrackIndex::build(&representative.signature);

        let bounds = member_tracks
            .iter()
            .map(|t| t.bounds)
            .reduce(|a, b| a.union(&b));

        let member_rows: Vec<GroupMember> = member_tracks
            .iter()
            .map(|t| {
                if t.id == representative_id {
                    return GroupMember {
                        activity_id: t.id.clone(),
                        direction: Direction::Same,
                        match_percentage: 100.0,
                    };
                }
                let ratio = rep_index
                    .as_ref()
                    .map(|idx| {
                        overlap_ratio_indexed(&t.signature, idx, config.overlap_threshold_m)
                    })
                    .unwrap_or(0.0);
                GroupMember {
                    activity_id: t.id.clone(),
                    direction: endpoint_direction(&t.signature, &representative.signature),
                    match_percentage: (ratio * 100.0).clamp(0.0, 100.0),
                }
            })
            .collect();

        let group = RouteGroup {
            id: format!("route_{}", members[0]),
            sport_type: representative.sport.clone(),
            representative_id,
            activity_ids: members,
            bounds,
            custom_name: None,
        };
        groups.push((group, member_rows));
    }

    groups
}

/// Medoid: the member minimising mean overlap distance (symmetric AMD over
/// resampled signatures) to the others. Ties break to the lexicographically
/// smallest activity id, which the sorted member order provides for free.
pub fn select_medoid(members: &[&TrackData]) -> String {
    if members.len() == 1 {
        return members[0].id.clone();
    }

    let resampled: Vec<Vec<GpsPoint>> = members
        .iter()
        .map(|t| geo::resample_by_distance(&t.signature, 50))
        .collect();

    let mut best_id = members[0].id.clone();
    let mut best_amd = f64::INFINITY;

    for (i, t) in members.iter().enumerate() {
        let mut total = 0.0;
        for (j, other) in resampled.iter().enumerate() {
            if i != j {
                let forward = geo::average_min_distance(&resampled[i], other);
                let backward = geo::average_min_distance(other, &resampled[i]);
                total += (forward + backward) / 2.0;
            }
        }
        let mean = total / (members.len() - 1) as f64;
        if mean < best_amd || (mean == best_amd && t.id < best_id) {
            best_amd = mean;
            best_id = t.id.clone();
        }
    }

    best_id
}

/// Same/reverse from endpoint pairings; loops default to same.
fn endpoint_direction(sig: &[GpsPoint], reference: &[GpsPoint]) -> Direction {
    if sig.len() < 2 || reference.len() < 2 {
        return Direction::Same;
    }

    let (s1, e1) = (&reference[0], reference.last().unwrap());
    let (s2, e2) = (&sig[0], sig.last().unwrap());

    // Loops make orientation meaningless.
    let loop_threshold = 200.0;
    if geo::haversine_distance(s1, e1) < loop_threshold
        && geo::haversine_distance(s2, e2) < loop_threshold
    {
        return Direction::Same;
    }

    let same_score = geo::haversine_distance(s2, s1) + geo::haversine_distance(e2, e1);
    let reverse_score = geo::haversine_distance(s2, e1) + geo::haversine_distance(e2, s1);

    // Require a clear margin before calling it reverse.
    if reverse_score < same_score - 100.0 {
        Direction::Reverse
    } else {
        Direction::Same
    }
}
