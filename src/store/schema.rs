//! Schema definition and versioned migrations.
//!
//! Migrations advance monotonically through `rusqlite_migration`; the
//! current version is mirrored into the config KV table so external tooling
//! can probe a database file without linking the crate.

use crate::error::Result;
use once_cell::sync::Lazy;
use rusqlite::Connection;
use rusqlite_migration::{Migrations, M};

/// Config KV key holding the schema version.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

static MIGRATIONS: Lazy<Migrations<'static>> = Lazy::new(|| {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE activities (
            id TEXT PRIMARY KEY,
            sport_type TEXT NOT NULL,
            start_date INTEGER NOT NULL DEFAULT 0,
            name TEXT NOT NULL DEFAULT '',
            distance_m REAL NOT NULL DEFAULT 0,
            moving_time_s INTEGER NOT NULL DEFAULT 0,
            elapsed_time_s INTEGER NOT NULL DEFAULT 0,
            elevation_gain_m REAL NOT NULL DEFAULT 0,
            avg_hr INTEGER,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        CREATE INDEX idx_activities_start_date ON activities(start_date);
        CREATE INDEX idx_activities_sport ON activities(sport_type);

        CREATE TABLE gps_tracks (
            activity_id TEXT PRIMARY KEY
                REFERENCES activities(id) ON DELETE CASCADE,
            polyline TEXT NOT NULL,
            point_count INTEGER NOT NULL,
            min_lat REAL NOT NULL,
            max_lat REAL NOT NULL,
            min_lng REAL NOT NULL,
            max_lng REAL NOT NULL
        );

        CREATE TABLE time_streams (
            activity_id TEXT PRIMARY KEY
                REFERENCES activities(id) ON DELETE CASCADE,
            times BLOB NOT NULL,
            point_count INTEGER NOT NULL
        );

        CREATE TABLE activity_metrics (
            activity_id TEXT PRIMARY KEY
                REFERENCES activities(id) ON DELETE CASCADE,
            tss REAL,
            intensity REAL,
            normalized_power REAL,
            ftp INTEGER,
            power_zone_times TEXT NOT NULL DEFAULT '[]',
            hr_zone_times TEXT NOT NULL DEFAULT '[]'
        );

        CREATE TABLE sections (
            id TEXT PRIMARY KEY,
            section_type TEXT NOT NULL CHECK(section_type IN ('auto', 'custom')),
            sport_type TEXT NOT NULL,
            polyline TEXT NOT NULL,
            distance_m REAL NOT NULL,
            visit_count INTEGER NOT NULL DEFAULT 0,
            confidence REAL,
            scale TEXT,
            name TEXT,
            representative_id TEXT,
            source_activity_id TEXT,
            start_index INTEGER,
            end_index INTEGER,
            min_lat REAL,
            max_lat REAL,
            min_lng REAL,
            max_lng REAL,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );
        CREATE INDEX idx_sections_sport ON sections(sport_type);

        CREATE TABLE section_activities (
            section_id TEXT NOT NULL
                REFERENCES sections(id) ON DELETE CASCADE,
            activity_id TEXT NOT NULL,
            start_index INTEGER NOT NULL,
            end_index INTEGER NOT NULL,
            direction TEXT NOT NULL DEFAULT 'same',
            match_percentage REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (section_id, activity_id, start_index)
        );
        CREATE INDEX idx_section_activities_section ON section_activities(section_id);
        CREATE INDEX idx_section_activities_activity ON section_activities(activity_id);

        CREATE TABLE route_groups (
            id TEXT PRIMARY KEY,
            sport_type TEXT NOT NULL,
            representative_id TEXT NOT NULL,
            min_lat REAL,
            max_lat REAL,
            min_lng REAL,
            max_lng REAL
        );
        CREATE INDEX idx_groups_sport ON route_groups(sport_type);

        CREATE TABLE group_activities (
            group_id TEXT NOT NULL
                REFERENCES route_groups(id) ON DELETE CASCADE,
            activity_id TEXT NOT NULL,
            direction TEXT NOT NULL DEFAULT 'same',
            match_percentage REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (group_id, activity_id)
        );
        CREATE INDEX idx_group_activities_group ON group_activities(group_id);

        CREATE TABLE user_overrides (
            target_id TEXT PRIMARY KEY,
            custom_name TEXT,
            pinned_activity_id TEXT,
            disabled INTEGER NOT NULL DEFAULT 0,
            dismissed INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )])
});

/// Apply all pending migrations and mirror the version into config KV.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    MIGRATIONS.to_latest(conn)?;

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    conn.execute(
        "INSERT INTO config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        rusqlite::params![SCHEMA_VERSION_KEY, version.to_string()],
    )?;

    log::info!("[Store] Schema at version {version}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_validate() {
        assert!(MIGRATIONS.validate().is_ok());
    }

    #[test]
    fn test_migrate_records_version_in_config() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let value: String = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                [SCHEMA_VERSION_KEY],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, "1");
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        // Core tables exist.
        for table in [
            "activities",
            "gps_tracks",
            "time_streams",
            "activity_metrics",
            "sections",
            "section_activities",
            "route_groups",
            "group_activities",
            "user_overrides",
            "config",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
