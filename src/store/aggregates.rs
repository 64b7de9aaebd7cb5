//! Dashboard aggregate queries over activities and metrics.
//!
//! All semantics here are fixed: period totals are inclusive on both ends,
//! monthly roll-ups zero-fill missing months, and the heatmap falls back to
//! moving time for activities without a TSS.

use super::Store;
use crate::error::{EngineError, Result};
use crate::types::{
    FtpPoint, FtpTrend, HeatmapDay, MonthlyAggregate, MonthlyMetric, PeriodStats,
    ZoneDistribution, ZoneType,
};
use chrono::{Datelike, TimeZone, Utc};
use rusqlite::params;

const SECONDS_PER_DAY: i64 = 86_400;

impl Store {
    /// Totals over `[start_ts, end_ts]`, both ends inclusive.
    pub fn get_period_stats(&self, start_ts: i64, end_ts: i64) -> Result<PeriodStats> {
        let conn = self.pool.get()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(a.distance_m), 0),
                    COALESCE(SUM(a.moving_time_s), 0),
                    COALESCE(SUM(a.elevation_gain_m), 0),
                    COALESCE(SUM(m.tss), 0)
             FROM activities a
             LEFT JOIN activity_metrics m ON m.activity_id = a.id
             WHERE a.start_date BETWEEN ?1 AND ?2",
            params![start_ts, end_ts],
            |row| {
                Ok(PeriodStats {
                    activity_count: row.get::<_, i64>(0)? as u32,
                    total_distance_m: row.get(1)?,
                    total_moving_time_s: row.get::<_, i64>(2)? as u64,
                    total_elevation_gain_m: row.get(3)?,
                    total_tss: row.get(4)?,
                })
            },
        )?;
        Ok(stats)
    }

    /// One row per month 1..=12 for the given year; missing months carry 0.
    pub fn get_monthly_aggregates(
        &self,
        year: i32,
        metric: MonthlyMetric,
    ) -> Result<Vec<MonthlyAggregate>> {
        let year_start = Utc
            .with_ymd_and_hms(year, 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| EngineError::invalid(format!("invalid year {year}")))?
            .timestamp();
        let year_end = Utc
            .with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0)
            .single()
            .ok_or_else(|| EngineError::invalid(format!("invalid year {year}")))?
            .timestamp();

        let rows: Vec<(i64, f64, i64, f64)> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT a.start_date, a.distance_m, a.moving_time_s, COALESCE(m.tss, 0)
                 FROM activities a
                 LEFT JOIN activity_metrics m ON m.activity_id = a.id
                 WHERE a.start_date >= ?1 AND a.start_date < ?2",
            )?;
            let mapped = stmt.query_map(params![year_start, year_end], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let mut values = [0.0f64; 12];
        for (start_date, distance_m, moving_time_s, tss) in rows {
            let Some(date) = Utc.timestamp_opt(start_date, 0).single() else {
                continue;
            };
            let month = date.month() as usize; // 1..=12
            values[month - 1] += match metric {
                MonthlyMetric::Hours => moving_time_s as f64 / 3600.0,
                MonthlyMetric::Distance => distance_m,
                MonthlyMetric::Tss => tss,
            };
        }

        Ok(values
            .iter()
            .enumerate()
            .map(|(i, &value)| MonthlyAggregate {
                month: i as u32 + 1,
                value,
            })
            .collect())
    }

    /// One row per UTC day in `[start_ts, end_ts]`. Intensity is the sum of
    /// TSS, with moving time standing in for activities that have none.
    pub fn get_activity_heatmap(&self, start_ts: i64, end_ts: i64) -> Result<Vec<HeatmapDay>> {
        if end_ts < start_ts {
            return Err(EngineError::invalid("heatmap range end precedes start"));
        }

        let rows: Vec<(i64, Option<f64>, i64)> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT a.start_date, m.tss, a.moving_time_s
                 FROM activities a
                 LEFT JOIN activity_metrics m ON m.activity_id = a.id
                 WHERE a.start_date BETWEEN ?1 AND ?2",
            )?;
            let mapped = stmt.query_map(params![start_ts, end_ts], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let first_day = start_ts.div_euclid(SECONDS_PER_DAY);
        let last_day = end_ts.div_euclid(SECONDS_PER_DAY);
        let mut days: Vec<HeatmapDay> = (first_day..=last_day)
            .map(|d| HeatmapDay {
                day: d * SECONDS_PER_DAY,
                intensity: 0.0,
            })
            .collect();

        for (start_date, tss, moving_time_s) in rows {
            let idx = (start_date.div_euclid(SECONDS_PER_DAY) - first_day) as usize;
            if let Some(day) = days.get_mut(idx) {
                day.intensity += tss.unwrap_or(moving_time_s as f64);
            }
        }

        Ok(days)
    }

    /// Seconds per zone index summed across all activities of a sport.
    /// Vectors of differing lengths are summed padded to the longest.
    pub fn get_zone_distribution(
        &self,
        sport_type: &str,
        zone_type: ZoneType,
    ) -> Result<ZoneDistribution> {
        let column = match zone_type {
            ZoneType::Power => "m.power_zone_times",
            ZoneType::Hr => "m.hr_zone_times",
        };

        let vectors: Vec<String> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {column} FROM activity_metrics m
                 JOIN activities a ON a.id = m.activity_id
                 WHERE a.sport_type = ?1"
            ))?;
            let mapped = stmt.query_map(params![sport_type], |row| row.get(0))?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let mut seconds_per_zone: Vec<u64> = Vec::new();
        for json in vectors {
            let zones: Vec<u32> = serde_json::from_str(&json).unwrap_or_default();
            if zones.len() > seconds_per_zone.len() {
                seconds_per_zone.resize(zones.len(), 0);
            }
            for (i, s) in zones.iter().enumerate() {
                seconds_per_zone[i] += *s as u64;
            }
        }

        Ok(ZoneDistribution {
            zone_type: Some(zone_type),
            seconds_per_zone,
        })
    }

    /// Latest FTP plus the most recent distinct value strictly before it.
    pub fn get_ftp_trend(&self) -> Result<FtpTrend> {
        let rows: Vec<(i64, i64)> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT m.ftp, a.start_date
                 FROM activity_metrics m
                 JOIN activities a ON a.id = m.activity_id
                 WHERE m.ftp IS NOT NULL
                 ORDER BY a.start_date DESC, a.id DESC",
            )?;
            let mapped = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<rusqlite::Result<_>>()?
        };

        let latest = rows.first().map(|&(ftp, date)| FtpPoint {
            ftp: ftp as u16,
            date,
        });

        let previous = latest.as_ref().and_then(|l| {
            rows.iter()
                .skip(1)
                .find(|&&(ftp, date)| ftp as u16 != l.ftp && date < l.date)
                .map(|&(ftp, date)| FtpPoint {
                    ftp: ftp as u16,
                    date,
                })
        });

        Ok(FtpTrend { latest, previous })
    }
}
