//! Performance computation: laps, elapsed times, rankings, time buckets.
//!
//! Times come from cached time streams when present
//! (`stream[end] - stream[start]`); otherwise a proportional estimate over
//! the activity's moving time is used and the result is flagged
//! `estimated`. Reads never fail on missing optional data.

use crate::detect::traces::span_distance;
use crate::types::{
    Activity, BucketType, Direction, GpsPoint, GroupMember, RoutePerformance,
    RoutePerformanceResult, SectionLap, SectionPerformanceBucket, SectionPerformanceBucketResult,
    SectionPerformanceRecord, SectionPerformanceResult, SectionTraversal, DirectionStats,
};
use chrono::{Datelike, TimeZone, Utc};
use std::collections::HashMap;

const SECONDS_PER_WEEK: i64 = 7 * 86_400;

// ============================================================================
// Laps
// ============================================================================

/// Compute one lap per traversal row.
pub fn compute_laps(
    traversals: &[SectionTraversal],
    tracks: &HashMap<String, Vec<GpsPoint>>,
    time_streams: &HashMap<String, Vec<f32>>,
    activities: &HashMap<String, Activity>,
) -> Vec<SectionLap> {
    traversals
        .iter()
        .filter_map(|t| {
            let track = tracks.get(&t.activity_id)?;
            let start = t.start_index as usize;
            let end = t.end_index as usize;
            if end >= track.len() || end <= start {
                return None;
            }

            let distance = span_distance(track, start, end);
            let (time, estimated) = lap_time(
                t,
                time_streams.get(&t.activity_id).map(|s| s.as_slice()),
                activities.get(&t.activity_id),
                distance,
            );

            let speed = if time > 0.0 { distance / time } else { 0.0 };
            let pace_s_per_km = if distance > 0.0 {
                time / (distance / 1000.0)
            } else {
                0.0
            };

            Some(SectionLap {
                activity_id: t.activity_id.clone(),
                time,
                speed,
                pace_s_per_km,
                distance,
                direction: t.direction,
                start_index: t.start_index,
                end_index: t.end_index,
                estimated,
            })
        })
        .collect()
}

/// Elapsed seconds for one traversal, plus whether it was estimated.
fn lap_time(
    traversal: &SectionTraversal,
    stream: Option<&[f32]>,
    activity: Option<&Activity>,
    lap_distance: f64,
) -> (f64, bool) {
    let start = traversal.start_index as usize;
    let end = traversal.end_index as usize;

    if let Some(stream) = stream {
        if end < stream.len() {
            let elapsed = (stream[end] - stream[start]) as f64;
            if elapsed > 0.0 {
                return (elapsed, false);
            }
        }
    }

    // Proportional estimate over the whole activity.
    if let Some(activity) = activity {
        if activity.distance_m > 0.0 && activity.moving_time_s > 0 {
            let estimate =
                (lap_distance / activity.distance_m) * activity.moving_time_s as f64;
            return (estimate, true);
        }
    }

    (0.0, true)
}

// ============================================================================
// Section performance result
// ============================================================================

/// Assemble the full section performance result from computed laps.
pub fn build_section_result(
    section_distance: f64,
    laps: Vec<SectionLap>,
    activities: &HashMap<String, Activity>,
) -> SectionPerformanceResult {
    let mut by_activity: HashMap<&str, Vec<&SectionLap>> = HashMap::new();
    for lap in &laps {
        by_activity.entry(&lap.activity_id).or_default().push(lap);
    }

    let mut records: Vec<SectionPerformanceRecord> = by_activity
        .into_iter()
        .filter_map(|(activity_id, mut activity_laps)| {
            activity_laps.sort_by(|a, b| a.time.total_cmp(&b.time));
            let timed: Vec<&&SectionLap> =
                activity_laps.iter().filter(|l| l.time > 0.0).collect();
            let best = timed.first().copied().or(activity_laps.first())?;

            let avg_time = if timed.is_empty() {
                0.0
            } else {
                timed.iter().map(|l| l.time).sum::<f64>() / timed.len() as f64
            };

            let (activity_name, activity_date) = activities
                .get(activity_id)
                .map(|a| (a.name.clone(), a.start_date))
                .unwrap_or_else(|| (String::new(), 0));

            Some(SectionPerformanceRecord {
                activity_id: activity_id.to_string(),
                activity_name,
                activity_date,
                lap_count: activity_laps.len() as u32,
                best_time: best.time,
                avg_time,
                direction: best.direction,
                section_distance,
                laps: activity_laps.iter().map(|l| (**l).clone()).collect(),
            })
        })
        .collect();

    records.sort_by(|a, b| {
        a.activity_date
            .cmp(&b.activity_date)
            .then_with(|| a.activity_id.cmp(&b.activity_id))
    });

    let best_record = best_by_time(&records, None);
    let best_forward_record = best_by_time(&records, Some(Direction::Same));
    let best_reverse_record = best_by_time(&records, Some(Direction::Reverse));

    let forward_stats = direction_stats(&laps, &records, Direction::Same);
    let reverse_stats = direction_stats(&laps, &records, Direction::Reverse);

    SectionPerformanceResult {
        records,
        best_record,
        best_forward_record,
        best_reverse_record,
        forward_stats,
        reverse_stats,
    }
}

fn best_by_time(
    records: &[SectionPerformanceRecord],
    direction: Option<Direction>,
) -> Option<SectionPerformanceRecord> {
    records
        .iter()
        .filter(|r| r.best_time > 0.0)
        .filter(|r| direction.map_or(true, |d| r.direction == d))
        .min_by(|a, b| a.best_time.total_cmp(&b.best_time))
        .cloned()
}

fn direction_stats(
    laps: &[SectionLap],
    records: &[SectionPerformanceRecord],
    direction: Direction,
) -> Option<DirectionStats> {
    let matching: Vec<&SectionLap> = laps
        .iter()
        .filter(|l| l.direction == direction && l.time > 0.0)
        .collect();
    if matching.is_empty() {
        return None;
    }

    let avg_time =
        matching.iter().map(|l| l.time).sum::<f64>() / matching.len() as f64;

    let last_activity = records
        .iter()
        .filter(|r| r.laps.iter().any(|l| l.direction == direction))
        .map(|r| r.activity_date)
        .max();

    Some(DirectionStats {
        avg_time: Some(avg_time),
        last_activity,
        count: matching.len() as u32,
    })
}

// ============================================================================
// Time buckets
// ============================================================================

/// Bucket start timestamp for an activity date.
fn bucket_start(date: i64, bucket_type: BucketType) -> i64 {
    match bucket_type {
        BucketType::Weekly => date.div_euclid(SECONDS_PER_WEEK) * SECONDS_PER_WEEK,
        BucketType::Monthly => Utc
            .timestamp_opt(date, 0)
            .single()
            .and_then(|d| {
                Utc.with_ymd_and_hms(d.year(), d.month(), 1, 0, 0, 0)
                    .single()
            })
            .map(|d| d.timestamp())
            .unwrap_or(date),
    }
}

/// Partition `[now - range_days, now]` into buckets and keep the fastest
/// lap per non-empty bucket. The overall PR is reported even when it falls
/// outside the range.
pub fn build_buckets(
    laps: &[SectionLap],
    activities: &HashMap<String, Activity>,
    range_days: u32,
    bucket_type: BucketType,
    now: i64,
) -> SectionPerformanceBucketResult {
    let range_start = now - range_days as i64 * 86_400;

    let dated: Vec<(&SectionLap, i64, String)> = laps
        .iter()
        .filter(|l| l.time > 0.0)
        .filter_map(|l| {
            let a = activities.get(&l.activity_id)?;
            Some((l, a.start_date, a.name.clone()))
        })
        .collect();

    let in_range: Vec<&(&SectionLap, i64, String)> = dated
        .iter()
        .filter(|(_, date, _)| *date >= range_start && *date <= now)
        .collect();

    let mut buckets: HashMap<i64, Vec<&(&SectionLap, i64, String)>> = HashMap::new();
    for &entry in &in_range {
        buckets
            .entry(bucket_start(entry.1, bucket_type))
            .or_default()
            .push(entry);
    }

    let mut bucket_points: Vec<SectionPerformanceBucket> = buckets
        .into_iter()
        .filter_map(|(start, entries)| {
            let best = entries
                .iter()
                .min_by(|a, b| a.0.time.total_cmp(&b.0.time))?;
            Some(SectionPerformanceBucket {
                activity_id: best.0.activity_id.clone(),
                activity_name: best.2.clone(),
                activity_date: best.1,
                bucket_start: start,
                best_time: best.0.time,
                best_speed: best.0.speed,
                direction: best.0.direction,
                is_estimated: best.0.estimated,
                bucket_count: entries.len() as u32,
            })
        })
        .collect();
    bucket_points.sort_by_key(|b| b.bucket_start);

    // The all-time PR, regardless of range.
    let pr_bucket = dated
        .iter()
        .min_by(|a, b| a.0.time.total_cmp(&b.0.time))
        .map(|(lap, date, name)| SectionPerformanceBucket {
            activity_id: lap.activity_id.clone(),
            activity_name: name.clone(),
            activity_date: *date,
            bucket_start: bucket_start(*date, bucket_type),
            best_time: lap.time,
            best_speed: lap.speed,
            direction: lap.direction,
            is_estimated: lap.estimated,
            bucket_count: 1,
        });

    let forward_stats = bucket_direction_stats(&in_range, Direction::Same);
    let reverse_stats = bucket_direction_stats(&in_range, Direction::Reverse);

    SectionPerformanceBucketResult {
        buckets: bucket_points,
        total_traversals: in_range.len() as u32,
        pr_bucket,
        forward_stats,
        reverse_stats,
    }
}

fn bucket_direction_stats(
    entries: &[&(&SectionLap, i64, String)],
    direction: Direction,
) -> Option<DirectionStats> {
    let matching: Vec<&&(&SectionLap, i64, String)> = entries
        .iter()
        .filter(|(l, _, _)| l.direction == direction)
        .collect();
    if matching.is_empty() {
        return None;
    }
    Some(DirectionStats {
        avg_time: Some(
            matching.iter().map(|(l, _, _)| l.time).sum::<f64>() / matching.len() as f64,
        ),
        last_activity: matching.iter().map(|(_, date, _)| *date).max(),
        count: matching.len() as u32,
    })
}

// ============================================================================
// Route performances
// ============================================================================

/// Per-activity performances over a whole route group, ranked by speed.
pub fn build_route_result(
    activities: &[Activity],
    members: &HashMap<String, GroupMember>,
    current_activity_id: Option<&str>,
) -> RoutePerformanceResult {
    let mut performances: Vec<RoutePerformance> = activities
        .iter()
        .map(|a| {
            let member = members.get(&a.id);
            let speed = if a.moving_time_s > 0 {
                a.distance_m / a.moving_time_s as f64
            } else {
                0.0
            };
            RoutePerformance {
                activity_id: a.id.clone(),
                name: a.name.clone(),
                date: a.start_date,
                speed,
                moving_time: a.moving_time_s,
                distance: a.distance_m,
                elevation_gain: a.elevation_gain_m,
                avg_hr: a.avg_hr,
                is_current: current_activity_id == Some(a.id.as_str()),
                direction: member.map(|m| m.direction).unwrap_or(Direction::Same),
                match_percentage: member.map(|m| m.match_percentage),
            }
        })
        .collect();

    // Rank by speed before re-sorting by date for display.
    let mut by_speed: Vec<&RoutePerformance> =
        performances.iter().filter(|p| p.speed > 0.0).collect();
    by_speed.sort_by(|a, b| b.speed.total_cmp(&a.speed));

    let best = by_speed.first().map(|p| (*p).clone());
    let best_forward = by_speed
        .iter()
        .find(|p| p.direction == Direction::Same)
        .map(|p| (*p).clone());
    let best_reverse = by_speed
        .iter()
        .find(|p| p.direction == Direction::Reverse)
        .map(|p| (*p).clone());

    let current_rank = current_activity_id.and_then(|id| {
        by_speed
            .iter()
            .position(|p| p.activity_id == id)
            .map(|i| i as u32 + 1)
    });

    let forward_stats = route_direction_stats(&performances, Direction::Same);
    let reverse_stats = route_direction_stats(&performances, Direction::Reverse);

    performances.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.activity_id.cmp(&b.activity_id)));

    RoutePerformanceResult {
        performances,
        best,
        best_forward,
        best_reverse,
        forward_stats,
        reverse_stats,
        current_rank,
    }
}

fn route_direction_stats(
    performances: &[RoutePerformance],
    direction: Direction,
) -> Option<DirectionStats> {
    let matching: Vec<&RoutePerformance> = performances
        .iter()
        .filter(|p| p.direction == direction && p.moving_time > 0)
        .collect();
    if matching.is_empty() {
        return None;
    }
    Some(DirectionStats {
        avg_time: Some(
            matching.iter().map(|p| p.moving_time as f64).sum::<f64>() / matching.len() as f64,
        ),
        last_activity: matching.iter().map(|p| p.date).max(),
        count: matching.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> Vec<GpsPoint> {
        (0..n)
            .map(|i| GpsPoint::new(0.0, i as f64 * 0.001))
            .collect()
    }

    fn activity(id: &str, date: i64, distance: f64, moving: u32) -> Activity {
        Activity {
            id: id.to_string(),
            sport_type: "Run".to_string(),
            start_date: date,
            name: format!("Activity {id}"),
            distance_m: distance,
            moving_time_s: moving,
            elapsed_time_s: moving,
            elevation_gain_m: 0.0,
            avg_hr: None,
        }
    }

    fn traversal(id: &str, start: u32, end: u32) -> SectionTraversal {
        SectionTraversal {
            activity_id: id.to_string(),
            start_index: start,
            end_index: end,
            direction: Direction::Same,
            match_percentage: 100.0,
        }
    }

    #[test]
    fn test_lap_time_from_stream() {
        let track = line(10);
        let tracks = HashMap::from([("a".to_string(), track)]);
        let stream: Vec<f32> = (0..10).map(|i| i as f32 * 30.0).collect();
        let streams = HashMap::from([("a".to_string(), stream)]);
        let activities = HashMap::from([("a".to_string(), activity("a", 1000, 1000.0, 300))]);

        let laps = compute_laps(&[traversal("a", 2, 6)], &tracks, &streams, &activities);
        assert_eq!(laps.len(), 1);
        assert_eq!(laps[0].time, 120.0);
        assert!(!laps[0].estimated);
        assert!(laps[0].speed > 0.0);
    }

    #[test]
    fn test_lap_time_estimated_without_stream() {
        let track = line(11); // ~1113 m total
        let total = span_distance(&track, 0, 10);
        let half = span_distance(&track, 0, 5);
        let tracks = HashMap::from([("a".to_string(), track)]);
        let activities =
            HashMap::from([("a".to_string(), activity("a", 1000, total, 600))]);

        let laps = compute_laps(
            &[traversal("a", 0, 5)],
            &tracks,
            &HashMap::new(),
            &activities,
        );
        assert_eq!(laps.len(), 1);
        assert!(laps[0].estimated);
        let expected = (half / total) * 600.0;
        assert!((laps[0].time - expected).abs() < 1.0);
    }

    #[test]
    fn test_section_result_ranks_and_directions() {
        let track = line(10);
        let tracks = HashMap::from([
            ("fast".to_string(), track.clone()),
            ("slow".to_string(), track.clone()),
        ]);
        let streams = HashMap::from([
            (
                "fast".to_string(),
                (0..10).map(|i| i as f32 * 10.0).collect::<Vec<f32>>(),
            ),
            (
                "slow".to_string(),
                (0..10).map(|i| i as f32 * 40.0).collect::<Vec<f32>>(),
            ),
        ]);
        let activities = HashMap::from([
            ("fast".to_string(), activity("fast", 2000, 1000.0, 90)),
            ("slow".to_string(), activity("slow", 1000, 1000.0, 360)),
        ]);

        let laps = compute_laps(
            &[traversal("fast", 0, 9), traversal("slow", 0, 9)],
            &tracks,
            &streams,
            &activities,
        );
        let result = build_section_result(1000.0, laps, &activities);

        assert_eq!(result.records.len(), 2);
        // Sorted by date: slow first.
        assert_eq!(result.records[0].activity_id, "slow");
        assert_eq!(result.best_record.as_ref().unwrap().activity_id, "fast");
        let forward = result.forward_stats.unwrap();
        assert_eq!(forward.count, 2);
        assert_eq!(forward.last_activity, Some(2000));
    }

    #[test]
    fn test_buckets_keep_fastest_per_bucket_and_pr() {
        let lap = |id: &str, time: f64| SectionLap {
            activity_id: id.to_string(),
            time,
            speed: 1000.0 / time,
            pace_s_per_km: time,
            distance: 1000.0,
            direction: Direction::Same,
            start_index: 0,
            end_index: 9,
            estimated: false,
        };

        let now = 100 * SECONDS_PER_WEEK;
        let activities = HashMap::from([
            // Same week, two laps.
            ("a".to_string(), activity("a", now - 3 * 86_400, 1000.0, 300)),
            ("b".to_string(), activity("b", now - 2 * 86_400, 1000.0, 300)),
            // An old PR outside the 30-day range.
            ("old".to_string(), activity("old", now - 300 * 86_400, 1000.0, 300)),
        ]);

        let laps = vec![lap("a", 200.0), lap("b", 180.0), lap("old", 100.0)];
        let result = build_buckets(&laps, &activities, 30, BucketType::Weekly, now);

        assert_eq!(result.buckets.len(), 1);
        assert_eq!(result.buckets[0].activity_id, "b");
        assert_eq!(result.buckets[0].bucket_count, 2);
        assert_eq!(result.total_traversals, 2);
        // PR is the old lap even though it is out of range.
        assert_eq!(result.pr_bucket.as_ref().unwrap().activity_id, "old");
    }

    #[test]
    fn test_monthly_bucket_start_is_first_of_month() {
        // 2024-03-15 12:00:00 UTC
        let date = Utc
            .with_ymd_and_hms(2024, 3, 15, 12, 0, 0)
            .single()
            .unwrap()
            .timestamp();
        let start = bucket_start(date, BucketType::Monthly);
        let expected = Utc
            .with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
            .single()
            .unwrap()
            .timestamp();
        assert_eq!(start, expected);
    }

    #[test]
    fn test_route_result_current_rank() {
        let activities = vec![
            activity("a", 1000, 10_000.0, 2000), // 5 m/s
            activity("b", 2000, 10_000.0, 2500), // 4 m/s
            activity("c", 3000, 10_000.0, 4000), // 2.5 m/s
        ];
        let members: HashMap<String, GroupMember> = activities
            .iter()
            .map(|a| {
                (
                    a.id.clone(),
                    GroupMember {
                        activity_id: a.id.clone(),
                        direction: Direction::Same,
                        match_percentage: 95.0,
                    },
                )
            })
            .collect();

        let result = build_route_result(&activities, &members, Some("b"));
        assert_eq!(result.best.as_ref().unwrap().activity_id, "a");
        assert_eq!(result.current_rank, Some(2));
        assert_eq!(result.performances.len(), 3);
        // Display order is by date.
        assert_eq!(result.performances[0].activity_id, "a");
    }
}
