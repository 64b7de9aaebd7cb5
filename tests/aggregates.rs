//! Aggregate dashboard queries: period stats, roll-ups, heatmap, zones, FTP.

use chrono::{TimeZone, Utc};
use paceline::{Engine, MonthlyMetric, ZoneType};
use tempfile::TempDir;

fn open_engine() -> (Engine, TempDir) {
    let tmp = TempDir::new().expect("failed to create temp dir");
    let db_path = tmp.path().join("test.db");
    let engine = Engine::open(db_path.to_str().unwrap()).expect("failed to open engine");
    (engine, tmp)
}

fn ts(year: i32, month: u32, day: u32) -> i64 {
    Utc.with_ymd_and_hms(year, month, day, 10, 0, 0)
        .single()
        .unwrap()
        .timestamp()
}

struct MetricsFixture<'a> {
    id: &'a str,
    date: i64,
    distance_m: f64,
    moving_time_s: u32,
    elevation_gain_m: f64,
    tss: Option<f64>,
    ftp: Option<u16>,
    power_zone_times: Vec<u32>,
    hr_zone_times: Vec<u32>,
}

fn add_activity_with_metrics(engine: &Engine, fixture: MetricsFixture<'_>) {
    engine
        .add_activities(
            &[fixture.id.to_string()],
            &[0.0, 0.0, 0.0, 0.01],
            &[0, 2],
            &["Ride".to_string()],
        )
        .unwrap();
    engine
        .set_activity_metrics(&[paceline::ActivityMetricsUpdate {
            activity_id: fixture.id.to_string(),
            name: format!("Activity {}", fixture.id),
            start_date: fixture.date,
            distance_m: fixture.distance_m,
            moving_time_s: fixture.moving_time_s,
            elapsed_time_s: fixture.moving_time_s,
            elevation_gain_m: fixture.elevation_gain_m,
            avg_hr: None,
            tss: fixture.tss,
            intensity: None,
            normalized_power: None,
            ftp: fixture.ftp,
            power_zone_times: fixture.power_zone_times,
            hr_zone_times: fixture.hr_zone_times,
        }])
        .unwrap();
}

#[test]
fn test_period_stats_inclusive_bounds() {
    let (engine, _tmp) = open_engine();
    let day1 = ts(2024, 6, 1);
    let day2 = ts(2024, 6, 10);
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "a",
            date: day1,
            distance_m: 10_000.0,
            moving_time_s: 1800,
            elevation_gain_m: 120.0,
            tss: Some(50.0),
            ftp: None,
            power_zone_times: vec![],
            hr_zone_times: vec![],
        },
    );
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "b",
            date: day2,
            distance_m: 20_000.0,
            moving_time_s: 3600,
            elevation_gain_m: 300.0,
            tss: Some(100.0),
            ftp: None,
            power_zone_times: vec![],
            hr_zone_times: vec![],
        },
    );

    // Both ends inclusive: exact timestamps count.
    let stats = engine.get_period_stats(day1, day2).unwrap();
    assert_eq!(stats.activity_count, 2);
    assert_eq!(stats.total_distance_m, 30_000.0);
    assert_eq!(stats.total_moving_time_s, 5400);
    assert_eq!(stats.total_elevation_gain_m, 420.0);
    assert_eq!(stats.total_tss, 150.0);

    // A range excluding day2 by one second drops it.
    let stats = engine.get_period_stats(day1, day2 - 1).unwrap();
    assert_eq!(stats.activity_count, 1);

    // Empty range yields zeros.
    let stats = engine
        .get_period_stats(ts(2030, 1, 1), ts(2030, 2, 1))
        .unwrap();
    assert_eq!(stats.activity_count, 0);
    assert_eq!(stats.total_tss, 0.0);
}

#[test]
fn test_monthly_aggregates_zero_fill() {
    let (engine, _tmp) = open_engine();
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "feb",
            date: ts(2024, 2, 14),
            distance_m: 10_000.0,
            moving_time_s: 7200,
            elevation_gain_m: 0.0,
            tss: Some(80.0),
            ftp: None,
            power_zone_times: vec![],
            hr_zone_times: vec![],
        },
    );
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "mar",
            date: ts(2024, 3, 2),
            distance_m: 5_000.0,
            moving_time_s: 3600,
            elevation_gain_m: 0.0,
            tss: Some(40.0),
            ftp: None,
            power_zone_times: vec![],
            hr_zone_times: vec![],
        },
    );
    // An activity in a different year never leaks in.
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "other-year",
            date: ts(2023, 2, 14),
            distance_m: 99_000.0,
            moving_time_s: 100,
            elevation_gain_m: 0.0,
            tss: None,
            ftp: None,
            power_zone_times: vec![],
            hr_zone_times: vec![],
        },
    );

    let hours = engine
        .get_monthly_aggregates(2024, MonthlyMetric::Hours)
        .unwrap();
    assert_eq!(hours.len(), 12);
    assert_eq!(hours[0].month, 1);
    assert_eq!(hours[0].value, 0.0);
    assert_eq!(hours[1].value, 2.0); // February, 7200 s
    assert_eq!(hours[2].value, 1.0); // March
    assert!(hours[3..].iter().all(|m| m.value == 0.0));

    let distance = engine
        .get_monthly_aggregates(2024, MonthlyMetric::Distance)
        .unwrap();
    assert_eq!(distance[1].value, 10_000.0);

    let tss = engine
        .get_monthly_aggregates(2024, MonthlyMetric::Tss)
        .unwrap();
    assert_eq!(tss[2].value, 40.0);
}

#[test]
fn test_heatmap_day_rows_and_tss_fallback() {
    let (engine, _tmp) = open_engine();
    let day1 = ts(2024, 5, 1);
    let day3 = ts(2024, 5, 3);
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "with-tss",
            date: day1,
            distance_m: 1000.0,
            moving_time_s: 600,
            elevation_gain_m: 0.0,
            tss: Some(75.0),
            ftp: None,
            power_zone_times: vec![],
            hr_zone_times: vec![],
        },
    );
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "no-tss",
            date: day3,
            distance_m: 1000.0,
            moving_time_s: 900,
            elevation_gain_m: 0.0,
            tss: None,
            ftp: None,
            power_zone_times: vec![],
            hr_zone_times: vec![],
        },
    );

    let days = engine.get_activity_heatmap(day1, day3).unwrap();
    // One row per day in range, empty days included.
    assert_eq!(days.len(), 3);
    assert_eq!(days[0].intensity, 75.0);
    assert_eq!(days[1].intensity, 0.0);
    // Falls back to moving time when TSS is absent.
    assert_eq!(days[2].intensity, 900.0);
}

#[test]
fn test_zone_distribution_sums_vectors() {
    let (engine, _tmp) = open_engine();
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "z1",
            date: ts(2024, 1, 1),
            distance_m: 1000.0,
            moving_time_s: 600,
            elevation_gain_m: 0.0,
            tss: None,
            ftp: None,
            power_zone_times: vec![100, 200, 300],
            hr_zone_times: vec![50, 60],
        },
    );
    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "z2",
            date: ts(2024, 1, 2),
            distance_m: 1000.0,
            moving_time_s: 600,
            elevation_gain_m: 0.0,
            tss: None,
            ftp: None,
            power_zone_times: vec![10, 20, 30, 40],
            hr_zone_times: vec![5],
        },
    );

    let power = engine
        .get_zone_distribution("Ride", ZoneType::Power)
        .unwrap();
    assert_eq!(power.seconds_per_zone, vec![110, 220, 330, 40]);

    let hr = engine.get_zone_distribution("Ride", ZoneType::Hr).unwrap();
    assert_eq!(hr.seconds_per_zone, vec![55, 60]);

    // A sport with no activities yields an empty vector.
    let none = engine
        .get_zone_distribution("Swim", ZoneType::Power)
        .unwrap();
    assert!(none.seconds_per_zone.is_empty());
}

#[test]
fn test_ftp_trend_latest_and_previous_distinct() {
    let (engine, _tmp) = open_engine();
    for (id, date, ftp) in [
        ("f1", ts(2024, 1, 1), Some(240u16)),
        ("f2", ts(2024, 2, 1), Some(250)),
        // Same FTP as the latest: must be skipped as "previous".
        ("f3", ts(2024, 3, 1), Some(260)),
        ("f4", ts(2024, 4, 1), Some(260)),
        ("no-ftp", ts(2024, 5, 1), None),
    ] {
        add_activity_with_metrics(
            &engine,
            MetricsFixture {
                id,
                date,
                distance_m: 1000.0,
                moving_time_s: 600,
                elevation_gain_m: 0.0,
                tss: None,
                ftp,
                power_zone_times: vec![],
                hr_zone_times: vec![],
            },
        );
    }

    let trend = engine.get_ftp_trend().unwrap();
    let latest = trend.latest.unwrap();
    assert_eq!(latest.ftp, 260);
    assert_eq!(latest.date, ts(2024, 4, 1));

    let previous = trend.previous.unwrap();
    assert_eq!(previous.ftp, 250);
    assert_eq!(previous.date, ts(2024, 2, 1));
}

#[test]
fn test_ftp_trend_empty_and_single() {
    let (engine, _tmp) = open_engine();
    let trend = engine.get_ftp_trend().unwrap();
    assert!(trend.latest.is_none());
    assert!(trend.previous.is_none());

    add_activity_with_metrics(
        &engine,
        MetricsFixture {
            id: "only",
            date: ts(2024, 1, 1),
            distance_m: 1000.0,
            moving_time_s: 600,
            elevation_gain_m: 0.0,
            tss: None,
            ftp: Some(200),
            power_zone_times: vec![],
            hr_zone_times: vec![],
        },
    );
    let trend = engine.get_ftp_trend().unwrap();
    assert_eq!(trend.latest.unwrap().ftp, 200);
    assert!(trend.previous.is_none());
}
