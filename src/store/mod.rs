//! Persistent store: a single-file SQLite database behind a connection pool.
//!
//! Every public mutator runs in one transaction; on failure nothing is
//! written and the caller skips cache invalidation. Reads borrow a pooled
//! handle for the duration of one query.

mod activities;
mod aggregates;
mod groups;
mod overrides;
mod pool;
mod schema;
mod sections;

pub use overrides::{ATHLETE_PROFILE_KEY, SECTION_WORD_KEY, SPORT_SETTINGS_KEY};
pub use pool::{ConnectionPool, PooledConn};
pub use schema::SCHEMA_VERSION_KEY;

use crate::error::Result;
use crate::types::{GroupMember, RouteGroup, Section, SectionTraversal};
use std::sync::Arc;

/// Handle to the on-disk store. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct Store {
    pool: Arc<ConnectionPool>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    pub fn open(path: &str) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new(path));
        {
            let mut conn = pool.get()?;
            schema::migrate(&mut conn)?;
        }
        Ok(Self { pool })
    }

    pub fn path(&self) -> &str {
        self.pool.path()
    }

    /// Drop all pooled handles; they are reopened lazily.
    pub fn invalidate_pool(&self) {
        self.pool.invalidate();
    }

    /// Commit a detection run atomically: replace route groups and auto
    /// sections in one transaction. Custom sections are untouched, and a
    /// sport-filtered run leaves other sports' results in place. Callers
    /// never observe a partially-rebuilt sections table.
    pub fn apply_detection(
        &self,
        groups: &[(RouteGroup, Vec<GroupMember>)],
        auto_sections: &[(Section, Vec<SectionTraversal>)],
        sport_filter: Option<&str>,
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        groups::replace_groups(&tx, groups, sport_filter)?;
        sections::delete_auto_sections(&tx, sport_filter)?;
        for (section, traversals) in auto_sections {
            sections::write_section(&tx, section, traversals)?;
        }

        // Overrides keyed by section ids that did not survive the rebuild
        // must not dangle.
        tx.execute(
            "DELETE FROM user_overrides WHERE target_id NOT IN (SELECT id FROM sections)
                 AND target_id NOT IN (SELECT id FROM route_groups)",
            [],
        )?;

        tx.commit()?;
        log::info!(
            "[Store] Detection commit: {} groups, {} auto sections",
            groups.len(),
            auto_sections.len()
        );
        Ok(())
    }
}
