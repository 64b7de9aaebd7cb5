//! User overrides and config KV storage.
//!
//! Overrides are keyed by target id (section or route group): custom names,
//! pinned reference activities, disabled and dismissed flags. Config KV
//! holds opaque JSON blobs owned by external providers plus the translation
//! word used when naming auto sections.

use super::Store;
use crate::error::Result;
use rusqlite::{params, OptionalExtension};

/// Config KV key for the athlete profile JSON blob.
pub const ATHLETE_PROFILE_KEY: &str = "athlete_profile_json";

/// Config KV key for the sport settings JSON blob.
pub const SPORT_SETTINGS_KEY: &str = "sport_settings_json";

/// Config KV key for the localized word used in auto section names.
pub const SECTION_WORD_KEY: &str = "section_word";

impl Store {
    /// Set or clear the custom name for a section or route group.
    pub fn set_custom_name(&self, target_id: &str, name: Option<&str>) -> Result<()> {
        let conn = self.pool.get()?;
        match name {
            Some(name) => {
                conn.execute(
                    "INSERT INTO user_overrides (target_id, custom_name) VALUES (?1, ?2)
                     ON CONFLICT(target_id) DO UPDATE SET custom_name = excluded.custom_name",
                    params![target_id, name],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE user_overrides SET custom_name = NULL WHERE target_id = ?1",
                    params![target_id],
                )?;
                self.drop_empty_override(&conn, target_id)?;
            }
        }
        Ok(())
    }

    pub fn get_custom_name(&self, target_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let name: Option<Option<String>> = conn
            .query_row(
                "SELECT custom_name FROM user_overrides WHERE target_id = ?1",
                params![target_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.flatten())
    }

    /// Pin or clear the user-chosen reference activity for a section.
    pub fn set_pinned_activity(&self, section_id: &str, activity_id: Option<&str>) -> Result<()> {
        let conn = self.pool.get()?;
        match activity_id {
            Some(activity_id) => {
                conn.execute(
                    "INSERT INTO user_overrides (target_id, pinned_activity_id) VALUES (?1, ?2)
                     ON CONFLICT(target_id) DO UPDATE
                         SET pinned_activity_id = excluded.pinned_activity_id",
                    params![section_id, activity_id],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE user_overrides SET pinned_activity_id = NULL WHERE target_id = ?1",
                    params![section_id],
                )?;
                self.drop_empty_override(&conn, section_id)?;
            }
        }
        Ok(())
    }

    pub fn get_pinned_activity(&self, section_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let pinned: Option<Option<String>> = conn
            .query_row(
                "SELECT pinned_activity_id FROM user_overrides WHERE target_id = ?1",
                params![section_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pinned.flatten())
    }

    /// Mark a target disabled or dismissed (list filtering flags).
    pub fn set_override_flags(
        &self,
        target_id: &str,
        disabled: Option<bool>,
        dismissed: Option<bool>,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO user_overrides (target_id) VALUES (?1)
             ON CONFLICT(target_id) DO NOTHING",
            params![target_id],
        )?;
        if let Some(disabled) = disabled {
            conn.execute(
                "UPDATE user_overrides SET disabled = ?2 WHERE target_id = ?1",
                params![target_id, disabled as i64],
            )?;
        }
        if let Some(dismissed) = dismissed {
            conn.execute(
                "UPDATE user_overrides SET dismissed = ?2 WHERE target_id = ?1",
                params![target_id, dismissed as i64],
            )?;
        }
        Ok(())
    }

    pub fn get_override_flags(&self, target_id: &str) -> Result<(bool, bool)> {
        let conn = self.pool.get()?;
        let flags: Option<(i64, i64)> = conn
            .query_row(
                "SELECT disabled, dismissed FROM user_overrides WHERE target_id = ?1",
                params![target_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (disabled, dismissed) = flags.unwrap_or((0, 0));
        Ok((disabled != 0, dismissed != 0))
    }

    /// An override row with no remaining content is removed entirely.
    fn drop_empty_override(&self, conn: &rusqlite::Connection, target_id: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM user_overrides WHERE target_id = ?1
                 AND custom_name IS NULL AND pinned_activity_id IS NULL
                 AND disabled = 0 AND dismissed = 0",
            params![target_id],
        )?;
        Ok(())
    }

    // ========================================================================
    // Config KV
    // ========================================================================

    /// Persist an opaque config value (JSON blobs are not parsed here).
    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let value = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// The localized section word, defaulting to "Section".
    pub fn get_section_word(&self) -> Result<String> {
        Ok(self
            .get_config(SECTION_WORD_KEY)?
            .unwrap_or_else(|| "Section".to_string()))
    }
}
