//! Mutable engine state guarded by the engine's write lock.

use crate::spatial::ViewportIndex;

/// Dirty flags plus the lazily-built viewport index. Guarded by the
/// engine-wide `RwLock`; the detection worker takes the write half only for
/// its final commit.
pub(crate) struct EngineState {
    /// Rebuilt on first viewport query after a mutation.
    pub viewport: Option<ViewportIndex>,
    /// Route groups must be re-derived before the next read that needs them.
    pub groups_dirty: bool,
    /// Sections are stale until the next detection run commits.
    pub sections_dirty: bool,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            viewport: None,
            groups_dirty: false,
            sections_dirty: false,
        }
    }

    /// Invalidate everything derived from tracks.
    pub fn mark_tracks_changed(&mut self) {
        self.viewport = None;
        self.groups_dirty = true;
        self.sections_dirty = true;
    }
}
