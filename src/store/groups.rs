//! Route group storage.
//!
//! Membership lives in the `group_activities` junction table; groups carry
//! no copy of the consensus polyline, only the representative (medoid)
//! activity id it is derived from.

use super::Store;
use crate::error::{EngineError, Result};
use crate::types::{Bounds, Direction, GroupMember, GroupSummary, RouteGroup};
use rusqlite::{params, OptionalExtension, Row, Transaction};

fn bounds_from_row(row: &Row<'_>, base: usize) -> rusqlite::Result<Option<Bounds>> {
    Ok(
        match (
            row.get::<_, Option<f64>>(base)?,
            row.get::<_, Option<f64>>(base + 1)?,
            row.get::<_, Option<f64>>(base + 2)?,
            row.get::<_, Option<f64>>(base + 3)?,
        ) {
            (Some(min_lat), Some(max_lat), Some(min_lng), Some(max_lng)) => Some(Bounds {
                min_lat,
                max_lat,
                min_lng,
                max_lng,
            }),
            _ => None,
        },
    )
}

/// Replace the group set inside an open transaction (detection commit and
/// group rebuilds are all-or-nothing). With a sport filter, groups of other
/// sports are left untouched.
pub(super) fn replace_groups(
    tx: &Transaction<'_>,
    groups: &[(RouteGroup, Vec<GroupMember>)],
    sport_filter: Option<&str>,
) -> Result<()> {
    tx.execute(
        "DELETE FROM user_overrides WHERE target_id IN
             (SELECT id FROM route_groups WHERE ?1 IS NULL OR sport_type = ?1)
             AND custom_name IS NULL AND pinned_activity_id IS NULL",
        params![sport_filter],
    )?;
    tx.execute(
        "DELETE FROM route_groups WHERE ?1 IS NULL OR sport_type = ?1",
        params![sport_filter],
    )?;

    for (group, members) in groups {
        tx.execute(
            "INSERT INTO route_groups
                 (id, sport_type, representative_id, min_lat, max_lat, min_lng, max_lng)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                group.id,
                group.sport_type,
                group.representative_id,
                group.bounds.map(|b| b.min_lat),
                group.bounds.map(|b| b.max_lat),
                group.bounds.map(|b| b.min_lng),
                group.bounds.map(|b| b.max_lng),
            ],
        )?;
        for m in members {
            tx.execute(
                "INSERT OR REPLACE INTO group_activities
                     (group_id, activity_id, direction, match_percentage)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    group.id,
                    m.activity_id,
                    m.direction.as_str(),
                    m.match_percentage,
                ],
            )?;
        }
    }

    // Overrides for groups that no longer exist must not dangle.
    tx.execute(
        "DELETE FROM user_overrides WHERE target_id NOT IN (SELECT id FROM sections)
             AND target_id NOT IN (SELECT id FROM route_groups)",
        [],
    )?;

    Ok(())
}

impl Store {
    /// Atomically replace all route groups.
    pub fn set_groups(&self, groups: &[(RouteGroup, Vec<GroupMember>)]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        replace_groups(&tx, groups, None)?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_groups(&self) -> Result<Vec<RouteGroup>> {
        let mut groups: Vec<RouteGroup> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT g.id, g.sport_type, g.representative_id,
                        g.min_lat, g.max_lat, g.min_lng, g.max_lng, o.custom_name
                 FROM route_groups g
                 LEFT JOIN user_overrides o ON o.target_id = g.id
                 ORDER BY g.id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(RouteGroup {
                    id: row.get(0)?,
                    sport_type: row.get(1)?,
                    representative_id: row.get(2)?,
                    bounds: bounds_from_row(row, 3)?,
                    custom_name: row.get(7)?,
                    activity_ids: Vec::new(),
                })
            })?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for g in &mut groups {
            g.activity_ids = self.get_group_activity_ids(&g.id)?;
        }
        Ok(groups)
    }

    pub fn get_group(&self, group_id: &str) -> Result<Option<RouteGroup>> {
        let group = {
            let conn = self.pool.get()?;
            conn.query_row(
                "SELECT g.id, g.sport_type, g.representative_id,
                        g.min_lat, g.max_lat, g.min_lng, g.max_lng, o.custom_name
                 FROM route_groups g
                 LEFT JOIN user_overrides o ON o.target_id = g.id
                 WHERE g.id = ?1",
                params![group_id],
                |row| {
                    Ok(RouteGroup {
                        id: row.get(0)?,
                        sport_type: row.get(1)?,
                        representative_id: row.get(2)?,
                        bounds: bounds_from_row(row, 3)?,
                        custom_name: row.get(7)?,
                        activity_ids: Vec::new(),
                    })
                },
            )
            .optional()?
        };

        match group {
            Some(mut g) => {
                g.activity_ids = self.get_group_activity_ids(&g.id)?;
                Ok(Some(g))
            }
            None => Ok(None),
        }
    }

    pub fn get_group_summaries(&self, min_activities: u32) -> Result<Vec<GroupSummary>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT g.id, g.sport_type, g.representative_id,
                    g.min_lat, g.max_lat, g.min_lng, g.max_lng, o.custom_name,
                    (SELECT COUNT(*) FROM group_activities WHERE group_id = g.id) AS member_count
             FROM route_groups g
             LEFT JOIN user_overrides o ON o.target_id = g.id
             WHERE (SELECT COUNT(*) FROM group_activities WHERE group_id = g.id) >= ?1
             ORDER BY member_count DESC, g.id",
        )?;
        let rows = stmt.query_map(params![min_activities as i64], |row| {
            Ok(GroupSummary {
                id: row.get(0)?,
                sport_type: row.get(1)?,
                representative_id: row.get(2)?,
                bounds: bounds_from_row(row, 3)?,
                custom_name: row.get(7)?,
                activity_count: row.get::<_, i64>(8)? as u32,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_group_members(&self, group_id: &str) -> Result<Vec<GroupMember>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT activity_id, direction, match_percentage
             FROM group_activities WHERE group_id = ?1 ORDER BY activity_id",
        )?;
        let rows = stmt.query_map(params![group_id], |row| {
            let direction: String = row.get(1)?;
            Ok(GroupMember {
                activity_id: row.get(0)?,
                direction: Direction::parse(&direction).unwrap_or(Direction::Same),
                match_percentage: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_group_count(&self) -> Result<u32> {
        let conn = self.pool.get()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM route_groups", [], |row| row.get(0))?;
        Ok(count as u32)
    }

    /// All user-assigned route names, keyed by group id.
    pub fn get_all_route_names(&self) -> Result<Vec<(String, String)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT g.id, o.custom_name FROM route_groups g
             JOIN user_overrides o ON o.target_id = g.id
             WHERE o.custom_name IS NOT NULL ORDER BY g.id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Whether a route name is already taken within a sport.
    pub fn route_name_exists(
        &self,
        sport_type: &str,
        name: &str,
        exclude_id: &str,
    ) -> Result<bool> {
        let conn = self.pool.get()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM route_groups g
                 JOIN user_overrides o ON o.target_id = g.id
                 WHERE g.sport_type = ?1 AND g.id != ?3 AND o.custom_name = ?2
                 LIMIT 1",
                params![sport_type, name, exclude_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Sport type of a group, for rename conflict checks.
    pub fn get_group_sport(&self, group_id: &str) -> Result<String> {
        let conn = self.pool.get()?;
        conn.query_row(
            "SELECT sport_type FROM route_groups WHERE id = ?1",
            params![group_id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| EngineError::not_found("route group", group_id))
    }

    fn get_group_activity_ids(&self, group_id: &str) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT activity_id FROM group_activities WHERE group_id = ?1 ORDER BY activity_id",
        )?;
        let rows = stmt.query_map(params![group_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}
