//! Custom sections, laps, timed vs estimated durations, buckets, references.

use paceline::{BucketType, Direction, Engine, EngineError};
use tempfile::TempDir;

fn open_engine() -> (Engine, TempDir) {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp.path().join("test.db");
    let engine = Engine::open(db_path.to_str().unwrap()).expect("failed to open engine");
    (engine, tmp)
}

fn add_track(engine: &Engine, id: &str, sport: &str, coords: &[f64]) {
    engine
        .add_activities(
            &[id.to_string()],
            coords,
            &[0, (coords.len() / 2) as u32],
            &[sport.to_string()],
        )
        .unwrap();
}

fn set_metrics(engine: &Engine, id: &str, date: i64, distance_m: f64, moving_time_s: u32) {
    engine
        .set_activity_metrics(&[paceline::ActivityMetricsUpdate {
            activity_id: id.to_string(),
            name: format!("Activity {id}"),
            start_date: date,
            distance_m,
            moving_time_s,
            elapsed_time_s: moving_time_s,
            elevation_gain_m: 0.0,
            avg_hr: None,
            tss: None,
            intensity: None,
            normalized_power: None,
            ftp: None,
            power_zone_times: vec![],
            hr_zone_times: vec![],
        }])
        .unwrap();
}

#[test]
fn test_timed_lap_from_time_stream() {
    let (engine, _tmp) = open_engine();
    add_track(&engine, "a", "Run", &[0.0, 0.0, 0.0, 0.01]);
    engine
        .set_time_streams(&[("a".to_string(), vec![0.0, 60.0])])
        .unwrap();

    let section = engine
        .create_section_from_indices("a", 0, 1, "Run", None)
        .unwrap();

    let result = engine.get_section_performances(&section.id).unwrap();
    assert_eq!(result.records.len(), 1);
    let record = &result.records[0];
    assert_eq!(record.lap_count, 1);
    assert_eq!(record.laps[0].time, 60.0);
    assert_eq!(record.laps[0].direction, Direction::Same);
    assert!(!record.laps[0].estimated);
    // Speed is distance over time.
    assert!((record.laps[0].speed - record.laps[0].distance / 60.0).abs() < 1e-9);
}

#[test]
fn test_estimated_lap_without_time_stream() {
    let (engine, _tmp) = open_engine();
    add_track(&engine, "a", "Run", &[0.0, 0.0, 0.0, 0.01]);

    let track = engine.get_gps_track("a").unwrap();
    let full_distance = paceline::geo::polyline_length(&track);
    set_metrics(&engine, "a", 1_700_000_000, full_distance, 600);

    let section = engine
        .create_section_from_indices("a", 0, 1, "Run", None)
        .unwrap();

    let result = engine.get_section_performances(&section.id).unwrap();
    assert_eq!(result.records.len(), 1);
    let lap = &result.records[0].laps[0];
    assert!(lap.estimated);
    // The lap covers the whole activity, so the estimate is the full
    // moving time.
    let expected = (lap.distance / full_distance) * 600.0;
    assert!((lap.time - expected).abs() < 1.0);
}

#[test]
fn test_multiple_activities_ranked() {
    let (engine, _tmp) = open_engine();
    let coords: Vec<f64> = (0..20).flat_map(|i| [0.0, i as f64 * 0.001]).collect();
    add_track(&engine, "fast", "Run", &coords);
    add_track(&engine, "slow", "Run", &coords);

    let stream_fast: Vec<f32> = (0..20).map(|i| i as f32 * 10.0).collect();
    let stream_slow: Vec<f32> = (0..20).map(|i| i as f32 * 30.0).collect();
    engine
        .set_time_streams(&[
            ("fast".to_string(), stream_fast),
            ("slow".to_string(), stream_slow),
        ])
        .unwrap();
    set_metrics(&engine, "fast", 2_000_000, 2000.0, 200);
    set_metrics(&engine, "slow", 1_000_000, 2000.0, 600);

    let section = engine
        .create_section_from_indices("fast", 0, 19, "Run", Some("Test Stretch"))
        .unwrap();

    let result = engine.get_section_performances(&section.id).unwrap();
    assert_eq!(result.records.len(), 2);
    // Records are date-ordered; best is by time.
    assert_eq!(result.records[0].activity_id, "slow");
    assert_eq!(result.best_record.as_ref().unwrap().activity_id, "fast");
    assert_eq!(
        result
            .best_forward_record
            .as_ref()
            .unwrap()
            .activity_id,
        "fast"
    );
    let forward = result.forward_stats.as_ref().unwrap();
    assert_eq!(forward.count, 2);
}

#[test]
fn test_reverse_traversal_direction() {
    let (engine, _tmp) = open_engine();
    let forward: Vec<f64> = (0..20).flat_map(|i| [0.0, i as f64 * 0.001]).collect();
    let backward: Vec<f64> = (0..20)
        .rev()
        .flat_map(|i| [0.0, i as f64 * 0.001])
        .collect();
    add_track(&engine, "fwd", "Run", &forward);
    add_track(&engine, "bwd", "Run", &backward);

    let section = engine
        .create_section_from_indices("fwd", 0, 19, "Run", None)
        .unwrap();

    let traversal_dirs: Vec<Direction> = engine
        .get_section_performances(&section.id)
        .unwrap()
        .records
        .iter()
        .map(|r| (r.activity_id.clone(), r.direction))
        .map(|(id, d)| {
            if id == "bwd" {
                assert_eq!(d, Direction::Reverse);
            } else {
                assert_eq!(d, Direction::Same);
            }
            d
        })
        .collect();
    assert_eq!(traversal_dirs.len(), 2);
}

#[test]
fn test_performance_buckets_weekly() {
    let (engine, _tmp) = open_engine();
    let coords: Vec<f64> = (0..20).flat_map(|i| [0.0, i as f64 * 0.001]).collect();
    add_track(&engine, "recent", "Run", &coords);
    add_track(&engine, "ancient", "Run", &coords);

    engine
        .set_time_streams(&[
            (
                "recent".to_string(),
                (0..20).map(|i| i as f32 * 20.0).collect(),
            ),
            (
                "ancient".to_string(),
                (0..20).map(|i| i as f32 * 5.0).collect(),
            ),
        ])
        .unwrap();

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    set_metrics(&engine, "recent", now - 2 * 86_400, 2000.0, 400);
    set_metrics(&engine, "ancient", now - 500 * 86_400, 2000.0, 100);

    let section = engine
        .create_section_from_indices("recent", 0, 19, "Run", None)
        .unwrap();

    let result = engine
        .get_section_performance_buckets(&section.id, 30, BucketType::Weekly)
        .unwrap();

    // Only the recent lap falls inside the 30-day range.
    assert_eq!(result.total_traversals, 1);
    assert_eq!(result.buckets.len(), 1);
    assert_eq!(result.buckets[0].activity_id, "recent");
    assert!(!result.buckets[0].is_estimated);
    // The PR belongs to the ancient, faster lap even though it is out of
    // range.
    assert_eq!(result.pr_bucket.as_ref().unwrap().activity_id, "ancient");
}

#[test]
fn test_route_performances_with_rank() {
    let (engine, _tmp) = open_engine();
    let coords: Vec<f64> = (0..30).flat_map(|i| [0.0, i as f64 * 0.001]).collect();
    add_track(&engine, "r1", "Ride", &coords);
    add_track(&engine, "r2", "Ride", &coords);
    set_metrics(&engine, "r1", 1_000_000, 10_000.0, 2000); // 5 m/s
    set_metrics(&engine, "r2", 2_000_000, 10_000.0, 2500); // 4 m/s

    let groups = engine.get_groups().unwrap();
    assert_eq!(groups.len(), 1);

    let result = engine
        .get_route_performances(&groups[0].id, Some("r2"))
        .unwrap();
    assert_eq!(result.performances.len(), 2);
    assert_eq!(result.best.as_ref().unwrap().activity_id, "r1");
    assert_eq!(result.current_rank, Some(2));
    assert!(result
        .performances
        .iter()
        .any(|p| p.is_current && p.activity_id == "r2"));
}

#[test]
fn test_section_reference_pinning() {
    let (engine, _tmp) = open_engine();
    let coords: Vec<f64> = (0..20).flat_map(|i| [0.0, i as f64 * 0.001]).collect();
    add_track(&engine, "src", "Run", &coords);
    add_track(&engine, "other", "Run", &coords);

    let section = engine
        .create_section_from_indices("src", 0, 19, "Run", None)
        .unwrap();

    // Default reference is the source activity, not user-defined.
    assert_eq!(
        engine.get_section_reference(&section.id).unwrap(),
        Some("src".to_string())
    );
    assert!(!engine
        .is_section_reference_user_defined(&section.id)
        .unwrap());

    // Pin the other contributor.
    engine.set_section_reference(&section.id, "other").unwrap();
    assert_eq!(
        engine.get_section_reference(&section.id).unwrap(),
        Some("other".to_string())
    );
    assert!(engine
        .is_section_reference_user_defined(&section.id)
        .unwrap());

    // Pinning an activity that never traverses the section is invalid.
    add_track(&engine, "faraway", "Run", &[5.0, 5.0, 5.0, 5.01]);
    assert!(matches!(
        engine.set_section_reference(&section.id, "faraway"),
        Err(EngineError::InvalidInput { .. })
    ));

    // Reset reverts to the detected reference.
    engine.reset_section_reference(&section.id).unwrap();
    assert_eq!(
        engine.get_section_reference(&section.id).unwrap(),
        Some("src".to_string())
    );
}

#[test]
fn test_delete_section() {
    let (engine, _tmp) = open_engine();
    add_track(&engine, "a", "Run", &[0.0, 0.0, 0.0, 0.01]);
    let section = engine
        .create_section_from_indices("a", 0, 1, "Run", None)
        .unwrap();

    engine.delete_section(&section.id).unwrap();
    assert!(engine.get_section_by_id(&section.id).unwrap().is_none());
    assert!(matches!(
        engine.delete_section(&section.id),
        Err(EngineError::NotFound { .. })
    ));
    assert!(engine.get_sections_for_activity("a").unwrap().is_empty());
}

#[test]
fn test_create_section_validation() {
    let (engine, _tmp) = open_engine();
    add_track(&engine, "a", "Run", &[0.0, 0.0, 0.0, 0.01]);

    // Index range out of bounds.
    assert!(matches!(
        engine.create_section_from_indices("a", 0, 5, "Run", None),
        Err(EngineError::InvalidInput { .. })
    ));
    // Degenerate range.
    assert!(matches!(
        engine.create_section_from_indices("a", 1, 1, "Run", None),
        Err(EngineError::InvalidInput { .. })
    ));
    // Unknown activity.
    assert!(matches!(
        engine.create_section_from_indices("nope", 0, 1, "Run", None),
        Err(EngineError::NotFound { .. })
    ));
}
