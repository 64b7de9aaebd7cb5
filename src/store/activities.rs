//! Activity, track, time-stream and metrics storage.

use super::Store;
use crate::codec;
use crate::error::Result;
use crate::geo;
use crate::spatial::ActivityBoundsEntry;
use crate::types::{Activity, ActivityMetrics, ActivityMetricsUpdate, Bounds, GpsPoint, MapActivity};
use rusqlite::{params, OptionalExtension, Row};

fn activity_from_row(row: &Row<'_>) -> rusqlite::Result<Activity> {
    Ok(Activity {
        id: row.get(0)?,
        sport_type: row.get(1)?,
        start_date: row.get(2)?,
        name: row.get(3)?,
        distance_m: row.get(4)?,
        moving_time_s: row.get(5)?,
        elapsed_time_s: row.get(6)?,
        elevation_gain_m: row.get(7)?,
        avg_hr: row.get::<_, Option<i64>>(8)?.map(|v| v as u16),
    })
}

const ACTIVITY_COLUMNS: &str = "id, sport_type, start_date, name, distance_m, moving_time_s,
                                elapsed_time_s, elevation_gain_m, avg_hr";

impl Store {
    /// Insert or replace activities with their GPS tracks, one transaction.
    /// Tracks must already be validated (≥ 2 valid points each).
    pub fn insert_activities(&self, items: &[(Activity, Vec<GpsPoint>)]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        for (activity, track) in items {
            let bounds = geo::compute_bounds(track).ok_or_else(|| {
                crate::error::EngineError::internal(format!(
                    "track for '{}' has no valid bounds",
                    activity.id
                ))
            })?;
            let encoded = codec::encode_polyline(track)?;

            tx.execute(
                "INSERT OR REPLACE INTO activities
                     (id, sport_type, start_date, name, distance_m, moving_time_s,
                      elapsed_time_s, elevation_gain_m, avg_hr)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    activity.id,
                    activity.sport_type,
                    activity.start_date,
                    activity.name,
                    activity.distance_m,
                    activity.moving_time_s,
                    activity.elapsed_time_s,
                    activity.elevation_gain_m,
                    activity.avg_hr.map(|v| v as i64),
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO gps_tracks
                     (activity_id, polyline, point_count, min_lat, max_lat, min_lng, max_lng)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    activity.id,
                    encoded,
                    track.len() as i64,
                    bounds.min_lat,
                    bounds.max_lat,
                    bounds.min_lng,
                    bounds.max_lng,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Remove activities by id; cascades to tracks, streams, metrics and
    /// junction rows. Returns the number of activities removed.
    pub fn remove_activities(&self, ids: &[String]) -> Result<u32> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let mut removed = 0u32;
        for id in ids {
            removed += tx.execute("DELETE FROM activities WHERE id = ?1", params![id])? as u32;
            tx.execute(
                "DELETE FROM section_activities WHERE activity_id = ?1",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM group_activities WHERE activity_id = ?1",
                params![id],
            )?;
        }

        tx.commit()?;
        Ok(removed)
    }

    /// Delete activities older than the cutoff, cascading to all dependent
    /// rows including overrides whose targets vanish. Returns the deleted
    /// activity count.
    pub fn cleanup_before(&self, cutoff: i64) -> Result<u32> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let old_ids: Vec<String> = {
            // Activities with no fetched metadata yet carry start_date 0 and
            // are never eligible for retention cleanup.
            let mut stmt =
                tx.prepare("SELECT id FROM activities WHERE start_date > 0 AND start_date < ?1")?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        if old_ids.is_empty() {
            return Ok(0);
        }

        for id in &old_ids {
            tx.execute("DELETE FROM activities WHERE id = ?1", params![id])?;
            tx.execute(
                "DELETE FROM section_activities WHERE activity_id = ?1",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM group_activities WHERE activity_id = ?1",
                params![id],
            )?;
        }

        // Groups that lost their last member, and overrides for vanished
        // targets, must not dangle.
        tx.execute(
            "DELETE FROM route_groups WHERE id NOT IN
                 (SELECT DISTINCT group_id FROM group_activities)",
            [],
        )?;
        tx.execute(
            "DELETE FROM user_overrides WHERE target_id NOT IN (SELECT id FROM sections)
                 AND target_id NOT IN (SELECT id FROM route_groups)",
            [],
        )?;

        tx.commit()?;
        Ok(old_ids.len() as u32)
    }

    /// Delete every row of every table.
    pub fn clear_all(&self) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM section_activities;
             DELETE FROM sections;
             DELETE FROM group_activities;
             DELETE FROM route_groups;
             DELETE FROM user_overrides;
             DELETE FROM time_streams;
             DELETE FROM activity_metrics;
             DELETE FROM gps_tracks;
             DELETE FROM activities;",
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_activity_ids(&self) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT id FROM activities ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_activity_count(&self) -> Result<u32> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM activities", [], |row| row.get(0))?;
        Ok(count as u32)
    }

    pub fn get_gps_track_count(&self) -> Result<u32> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM gps_tracks", [], |row| row.get(0))?;
        Ok(count as u32)
    }

    pub fn get_activity(&self, id: &str) -> Result<Option<Activity>> {
        let conn = self.pool.get()?;
        let activity = conn
            .query_row(
                &format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1"),
                params![id],
                activity_from_row,
            )
            .optional()?;
        Ok(activity)
    }

    /// Activities for a set of ids, keyed lookup left to the caller.
    pub fn get_activities(&self, ids: &[String]) -> Result<Vec<Activity>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare(&format!("SELECT {ACTIVITY_COLUMNS} FROM activities WHERE id = ?1"))?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(a) = stmt.query_row(params![id], activity_from_row).optional()? {
                out.push(a);
            }
        }
        Ok(out)
    }

    pub fn get_gps_track(&self, id: &str) -> Result<Option<Vec<GpsPoint>>> {
        let conn = self.pool.get()?;
        let encoded: Option<String> = conn
            .query_row(
                "SELECT polyline FROM gps_tracks WHERE activity_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match encoded {
            Some(s) => Ok(Some(codec::decode_polyline(&s)?)),
            None => Ok(None),
        }
    }

    /// All track bounds for rebuilding the viewport index.
    pub fn get_track_bounds(&self) -> Result<Vec<ActivityBoundsEntry>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT activity_id, min_lat, max_lat, min_lng, max_lng FROM gps_tracks",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ActivityBoundsEntry {
                activity_id: row.get(0)?,
                bounds: Bounds {
                    min_lat: row.get(1)?,
                    max_lat: row.get(2)?,
                    min_lng: row.get(3)?,
                    max_lng: row.get(4)?,
                },
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Stream all tracks, optionally filtered by sport, decoded whole.
    /// Used by the detection pipeline's loading phase.
    pub fn get_tracks_for_sport(
        &self,
        sport_filter: Option<&str>,
    ) -> Result<Vec<(String, String, Vec<GpsPoint>)>> {
        let conn = self.pool.get()?;
        let sql = "SELECT a.id, a.sport_type, t.polyline
                   FROM activities a JOIN gps_tracks t ON t.activity_id = a.id
                   WHERE ?1 IS NULL OR a.sport_type = ?1
                   ORDER BY a.id";
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![sport_filter], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, sport, encoded) = row?;
            out.push((id, sport, codec::decode_polyline(&encoded)?));
        }
        Ok(out)
    }

    pub fn get_map_activities(&self) -> Result<Vec<MapActivity>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT a.id, a.sport_type, t.min_lat, t.max_lat, t.min_lng, t.max_lng,
                    a.start_date, a.name, a.distance_m, a.moving_time_s
             FROM activities a JOIN gps_tracks t ON t.activity_id = a.id
             ORDER BY a.start_date DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(MapActivity {
                activity_id: row.get(0)?,
                sport_type: row.get(1)?,
                bounds: Bounds {
                    min_lat: row.get(2)?,
                    max_lat: row.get(3)?,
                    min_lng: row.get(4)?,
                    max_lng: row.get(5)?,
                },
                start_date: row.get(6)?,
                name: row.get(7)?,
                distance_m: row.get(8)?,
                moving_time_s: row.get::<_, i64>(9)? as u32,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // ========================================================================
    // Time streams
    // ========================================================================

    /// Idempotent overwrite of time streams. Streams for unknown activities
    /// are skipped (the foreign key would reject them anyway).
    pub fn set_time_streams(&self, streams: &[(String, Vec<f32>)]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        for (activity_id, times) in streams {
            let exists: bool = tx
                .query_row(
                    "SELECT 1 FROM activities WHERE id = ?1",
                    params![activity_id],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if !exists {
                log::warn!("[Store] Skipping time stream for unknown activity {activity_id}");
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO time_streams (activity_id, times, point_count)
                 VALUES (?1, ?2, ?3)",
                params![
                    activity_id,
                    codec::encode_time_stream(times),
                    times.len() as i64
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_time_stream(&self, activity_id: &str) -> Result<Option<Vec<f32>>> {
        let conn = self.pool.get()?;
        let blob: Option<Vec<u8>> = conn
            .query_row(
                "SELECT times FROM time_streams WHERE activity_id = ?1",
                params![activity_id],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(b) => Ok(Some(codec::decode_time_stream(&b)?)),
            None => Ok(None),
        }
    }

    /// Subset of `ids` that have no cached time stream yet.
    pub fn get_activities_missing_time_streams(&self, ids: &[String]) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT 1 FROM time_streams WHERE activity_id = ?1")?;
        let mut missing = Vec::new();
        for id in ids {
            let present = stmt
                .query_row(params![id], |_| Ok(()))
                .optional()?
                .is_some();
            if !present {
                missing.push(id.clone());
            }
        }
        Ok(missing)
    }

    // ========================================================================
    // Metrics
    // ========================================================================

    /// Apply fetcher updates: activity metadata plus training metrics, one
    /// transaction. Unknown activities are skipped.
    pub fn set_activity_metrics(&self, updates: &[ActivityMetricsUpdate]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        for u in updates {
            let touched = tx.execute(
                "UPDATE activities
                 SET name = ?2, start_date = ?3, distance_m = ?4, moving_time_s = ?5,
                     elapsed_time_s = ?6, elevation_gain_m = ?7, avg_hr = ?8
                 WHERE id = ?1",
                params![
                    u.activity_id,
                    u.name,
                    u.start_date,
                    u.distance_m,
                    u.moving_time_s,
                    u.elapsed_time_s,
                    u.elevation_gain_m,
                    u.avg_hr.map(|v| v as i64),
                ],
            )?;
            if touched == 0 {
                log::warn!(
                    "[Store] Skipping metrics for unknown activity {}",
                    u.activity_id
                );
                continue;
            }
            tx.execute(
                "INSERT OR REPLACE INTO activity_metrics
                     (activity_id, tss, intensity, normalized_power, ftp,
                      power_zone_times, hr_zone_times)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    u.activity_id,
                    u.tss,
                    u.intensity,
                    u.normalized_power,
                    u.ftp.map(|v| v as i64),
                    serde_json::to_string(&u.power_zone_times)?,
                    serde_json::to_string(&u.hr_zone_times)?,
                ],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn get_activity_metrics(&self, activity_id: &str) -> Result<Option<ActivityMetrics>> {
        let conn = self.pool.get()?;
        let metrics = conn
            .query_row(
                "SELECT activity_id, tss, intensity, normalized_power, ftp,
                        power_zone_times, hr_zone_times
                 FROM activity_metrics WHERE activity_id = ?1",
                params![activity_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<f64>>(1)?,
                        row.get::<_, Option<f64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;

        match metrics {
            Some((activity_id, tss, intensity, normalized_power, ftp, power_json, hr_json)) => {
                Ok(Some(ActivityMetrics {
                    activity_id,
                    tss,
                    intensity,
                    normalized_power,
                    ftp: ftp.map(|v| v as u16),
                    power_zone_times: serde_json::from_str(&power_json).unwrap_or_default(),
                    hr_zone_times: serde_json::from_str(&hr_json).unwrap_or_default(),
                }))
            }
            None => Ok(None),
        }
    }

    /// Oldest and newest activity start dates, when any exist.
    pub fn get_date_range(&self) -> Result<(Option<i64>, Option<i64>)> {
        let conn = self.pool.get()?;
        let range: (Option<i64>, Option<i64>) = conn.query_row(
            "SELECT MIN(start_date), MAX(start_date) FROM activities",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(range)
    }
}
