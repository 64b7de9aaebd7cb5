//! Section and traversal storage.
//!
//! Auto and custom sections share one table with a `section_type`
//! discriminator. Traversals live in the `section_activities` junction table
//! (one row per lap), which gives O(1) lookup of sections by activity.

use super::Store;
use crate::codec;
use crate::error::{EngineError, Result};
use crate::types::{
    Bounds, Direction, GpsPoint, Section, SectionScale, SectionSummary, SectionTraversal,
    SectionType,
};
use rusqlite::{params, OptionalExtension, Row, Transaction};

const SECTION_COLUMNS: &str = "s.id, s.section_type, s.sport_type, s.polyline, s.distance_m,
     s.visit_count, s.confidence, s.scale, COALESCE(o.custom_name, s.name),
     s.representative_id, s.source_activity_id, s.start_index, s.end_index, s.created_at";

fn section_from_row(row: &Row<'_>) -> rusqlite::Result<Section> {
    let section_type: String = row.get(1)?;
    let scale: Option<String> = row.get(7)?;
    let polyline: String = row.get(3)?;
    Ok(Section {
        id: row.get(0)?,
        section_type: SectionType::parse(&section_type).unwrap_or(SectionType::Auto),
        sport_type: row.get(2)?,
        // Decoded below; the row closure cannot fail with a codec error.
        polyline: codec::decode_polyline(&polyline).unwrap_or_default(),
        distance_m: row.get(4)?,
        visit_count: row.get::<_, i64>(5)? as u32,
        confidence: row.get(6)?,
        scale: scale.as_deref().and_then(SectionScale::parse),
        name: row.get(8)?,
        representative_id: row.get(9)?,
        source_activity_id: row.get(10)?,
        start_index: row.get::<_, Option<i64>>(11)?.map(|v| v as u32),
        end_index: row.get::<_, Option<i64>>(12)?.map(|v| v as u32),
        created_at: row.get(13)?,
        activity_ids: Vec::new(), // filled in by the caller
    })
}

/// Write one section plus its traversals inside an open transaction.
pub(super) fn write_section(
    tx: &Transaction<'_>,
    section: &Section,
    traversals: &[SectionTraversal],
) -> Result<()> {
    let encoded = codec::encode_polyline(&section.polyline)?;
    let bounds = crate::geo::compute_bounds(&section.polyline);

    tx.execute(
        "INSERT OR REPLACE INTO sections
             (id, section_type, sport_type, polyline, distance_m, visit_count,
              confidence, scale, name, representative_id, source_activity_id,
              start_index, end_index, min_lat, max_lat, min_lng, max_lng, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            section.id,
            section.section_type.as_str(),
            section.sport_type,
            encoded,
            section.distance_m,
            traversals.len() as i64,
            section.confidence,
            section.scale.map(|s| s.as_str()),
            section.name,
            section.representative_id,
            section.source_activity_id,
            section.start_index.map(|v| v as i64),
            section.end_index.map(|v| v as i64),
            bounds.map(|b| b.min_lat),
            bounds.map(|b| b.max_lat),
            bounds.map(|b| b.min_lng),
            bounds.map(|b| b.max_lng),
            section.created_at,
        ],
    )?;

    tx.execute(
        "DELETE FROM section_activities WHERE section_id = ?1",
        params![section.id],
    )?;
    for t in traversals {
        tx.execute(
            "INSERT OR REPLACE INTO section_activities
                 (section_id, activity_id, start_index, end_index, direction, match_percentage)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                section.id,
                t.activity_id,
                t.start_index as i64,
                t.end_index as i64,
                t.direction.as_str(),
                t.match_percentage,
            ],
        )?;
    }

    Ok(())
}

/// Remove auto sections (cascading to their traversals) inside an open
/// transaction; custom sections survive detection re-runs, and a sport
/// filter leaves other sports' auto sections alone.
pub(super) fn delete_auto_sections(tx: &Transaction<'_>, sport_filter: Option<&str>) -> Result<()> {
    tx.execute(
        "DELETE FROM user_overrides WHERE target_id IN
             (SELECT id FROM sections WHERE section_type = 'auto'
                  AND (?1 IS NULL OR sport_type = ?1))
         AND custom_name IS NULL AND pinned_activity_id IS NULL",
        params![sport_filter],
    )?;
    tx.execute(
        "DELETE FROM sections WHERE section_type = 'auto'
             AND (?1 IS NULL OR sport_type = ?1)",
        params![sport_filter],
    )?;
    Ok(())
}

impl Store {
    /// Insert a single (custom) section with its initial traversals.
    pub fn insert_section(
        &self,
        section: &Section,
        traversals: &[SectionTraversal],
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        write_section(&tx, section, traversals)?;
        tx.commit()?;
        Ok(())
    }

    /// Delete a section of either type; also drops its override row.
    /// Errors with `NotFound` when the id does not exist.
    pub fn delete_section(&self, section_id: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let removed = tx.execute("DELETE FROM sections WHERE id = ?1", params![section_id])?;
        tx.execute(
            "DELETE FROM user_overrides WHERE target_id = ?1",
            params![section_id],
        )?;
        tx.commit()?;

        if removed == 0 {
            return Err(EngineError::not_found("section", section_id));
        }
        Ok(())
    }

    /// Replace the traversal rows of one section (used when re-matching a
    /// custom section against the activity set).
    pub fn replace_section_traversals(
        &self,
        section_id: &str,
        traversals: &[SectionTraversal],
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM section_activities WHERE section_id = ?1",
            params![section_id],
        )?;
        for t in traversals {
            tx.execute(
                "INSERT OR REPLACE INTO section_activities
                     (section_id, activity_id, start_index, end_index, direction, match_percentage)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    section_id,
                    t.activity_id,
                    t.start_index as i64,
                    t.end_index as i64,
                    t.direction.as_str(),
                    t.match_percentage,
                ],
            )?;
        }
        tx.execute(
            "UPDATE sections SET visit_count = ?2 WHERE id = ?1",
            params![section_id, traversals.len() as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_section(&self, section_id: &str) -> Result<Option<Section>> {
        let conn = self.pool.get()?;
        let section = conn
            .query_row(
                &format!(
                    "SELECT {SECTION_COLUMNS} FROM sections s
                     LEFT JOIN user_overrides o ON o.target_id = s.id
                     WHERE s.id = ?1"
                ),
                params![section_id],
                section_from_row,
            )
            .optional()?;

        match section {
            Some(mut s) => {
                s.activity_ids = self.get_section_activity_ids(&s.id)?;
                Ok(Some(s))
            }
            None => Ok(None),
        }
    }

    pub fn get_sections(&self) -> Result<Vec<Section>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SECTION_COLUMNS} FROM sections s
             LEFT JOIN user_overrides o ON o.target_id = s.id
             ORDER BY s.visit_count DESC, s.id"
        ))?;
        let rows = stmt.query_map([], section_from_row)?;
        let mut sections: Vec<Section> = rows.collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        for s in &mut sections {
            s.activity_ids = self.get_section_activity_ids(&s.id)?;
        }
        Ok(sections)
    }

    pub fn get_section_summaries(&self, sport: Option<&str>) -> Result<Vec<SectionSummary>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.section_type, s.sport_type, COALESCE(o.custom_name, s.name),
                    s.distance_m, s.visit_count, s.confidence, s.scale,
                    s.min_lat, s.max_lat, s.min_lng, s.max_lng,
                    (SELECT COUNT(DISTINCT activity_id) FROM section_activities
                     WHERE section_id = s.id)
             FROM sections s
             LEFT JOIN user_overrides o ON o.target_id = s.id
             WHERE ?1 IS NULL OR s.sport_type = ?1
             ORDER BY s.visit_count DESC, s.id",
        )?;
        let rows = stmt.query_map(params![sport], |row| {
            let section_type: String = row.get(1)?;
            let scale: Option<String> = row.get(7)?;
            let bounds = match (
                row.get::<_, Option<f64>>(8)?,
                row.get::<_, Option<f64>>(9)?,
                row.get::<_, Option<f64>>(10)?,
                row.get::<_, Option<f64>>(11)?,
            ) {
                (Some(min_lat), Some(max_lat), Some(min_lng), Some(max_lng)) => Some(Bounds {
                    min_lat,
                    max_lat,
                    min_lng,
                    max_lng,
                }),
                _ => None,
            };
            Ok(SectionSummary {
                id: row.get(0)?,
                section_type: SectionType::parse(&section_type).unwrap_or(SectionType::Auto),
                sport_type: row.get(2)?,
                name: row.get(3)?,
                distance_m: row.get(4)?,
                visit_count: row.get::<_, i64>(5)? as u32,
                confidence: row.get(6)?,
                scale: scale.as_deref().and_then(SectionScale::parse),
                bounds,
                activity_count: row.get::<_, i64>(12)? as u32,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Sections containing a given activity, via the junction table.
    pub fn get_sections_for_activity(&self, activity_id: &str) -> Result<Vec<Section>> {
        let section_ids: Vec<String> = {
            let conn = self.pool.get()?;
            let mut stmt = conn.prepare(
                "SELECT DISTINCT section_id FROM section_activities
                 WHERE activity_id = ?1 ORDER BY section_id",
            )?;
            let rows = stmt.query_map(params![activity_id], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut sections = Vec::with_capacity(section_ids.len());
        for id in section_ids {
            if let Some(s) = self.get_section(&id)? {
                sections.push(s);
            }
        }
        Ok(sections)
    }

    pub fn get_section_polyline(&self, section_id: &str) -> Result<Option<Vec<GpsPoint>>> {
        let conn = self.pool.get()?;
        let encoded: Option<String> = conn
            .query_row(
                "SELECT polyline FROM sections WHERE id = ?1",
                params![section_id],
                |row| row.get(0),
            )
            .optional()?;
        match encoded {
            Some(s) => Ok(Some(codec::decode_polyline(&s)?)),
            None => Ok(None),
        }
    }

    pub fn get_section_traversals(&self, section_id: &str) -> Result<Vec<SectionTraversal>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT activity_id, start_index, end_index, direction, match_percentage
             FROM section_activities WHERE section_id = ?1
             ORDER BY activity_id, start_index",
        )?;
        let rows = stmt.query_map(params![section_id], |row| {
            let direction: String = row.get(3)?;
            Ok(SectionTraversal {
                activity_id: row.get(0)?,
                start_index: row.get::<_, i64>(1)? as u32,
                end_index: row.get::<_, i64>(2)? as u32,
                direction: Direction::parse(&direction).unwrap_or(Direction::Partial),
                match_percentage: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn get_section_count(&self) -> Result<u32> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sections", [], |row| row.get(0))?;
        Ok(count as u32)
    }

    /// Custom sections only (re-matched after each detection run).
    pub fn get_custom_sections(&self) -> Result<Vec<Section>> {
        Ok(self
            .get_sections()?
            .into_iter()
            .filter(|s| s.section_type == SectionType::Custom)
            .collect())
    }

    /// Whether a display name is already taken by another section of the
    /// same sport (auto-generated or user-assigned).
    pub fn section_name_exists(
        &self,
        sport_type: &str,
        name: &str,
        exclude_id: &str,
    ) -> Result<bool> {
        let conn = self.pool.get()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sections s
                 LEFT JOIN user_overrides o ON o.target_id = s.id
                 WHERE s.sport_type = ?1 AND s.id != ?3
                   AND COALESCE(o.custom_name, s.name) = ?2
                 LIMIT 1",
                params![sport_type, name, exclude_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn get_section_activity_ids(&self, section_id: &str) -> Result<Vec<String>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT activity_id FROM section_activities
             WHERE section_id = ?1 ORDER BY activity_id",
        )?;
        let rows = stmt.query_map(params![section_id], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}
