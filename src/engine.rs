//! Engine facade: lifecycle, mutators, readers, subscriptions.
//!
//! The engine is a process-wide singleton with explicit
//! `init(db_path)` / `clear` / `teardown`. Mutators take the state write
//! lock, run one store transaction, invalidate derived caches, then publish
//! topic notifications strictly after commit. Readers take the shared side
//! and fall through LRU caches to the store.
//!
//! `Engine::open` is also public for embedding without the singleton (and
//! for tests that need several engines in one process).

use crate::cache::CacheLayer;
use crate::detect::{self, DetectionContext, DetectionJob, JobState};
use crate::error::{validate_identifier, EngineError, Result};
use crate::events::{deliver, Callback, SubscriberRegistry, SubscriptionId, Topic};
use crate::geo;
use crate::perf;
use crate::state::EngineState;
use crate::store::{Store, ATHLETE_PROFILE_KEY, SECTION_WORD_KEY, SPORT_SETTINGS_KEY};
use crate::types::*;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Singleton lifecycle
// ============================================================================

static ENGINE: Lazy<RwLock<Option<Engine>>> = Lazy::new(|| RwLock::new(None));

/// Initialize the process-wide engine. Idempotent for the same path;
/// a different path in the same process is an error.
pub fn init(db_path: &str) -> Result<()> {
    validate_identifier(db_path, "db path")?;

    let mut guard = ENGINE.write().expect("engine singleton lock poisoned");
    if let Some(engine) = guard.as_ref() {
        if engine.path() == db_path {
            return Ok(());
        }
        return Err(EngineError::AlreadyInitializedDifferentPath {
            existing: engine.path().to_string(),
        });
    }

    let engine = Engine::open(db_path)?;
    log::info!("[Engine] Initialized with db: {db_path}");
    *guard = Some(engine);
    Ok(())
}

/// Whether the engine is initialized in-process, or, given a path, whether
/// the database file probes as a valid engine store.
pub fn is_initialized(db_path: Option<&str>) -> bool {
    if ENGINE
        .read()
        .expect("engine singleton lock poisoned")
        .is_some()
    {
        return true;
    }

    let Some(path) = db_path else {
        return false;
    };
    if !std::path::Path::new(path).exists() {
        return false;
    }
    let Ok(conn) = rusqlite::Connection::open_with_flags(
        path,
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    ) else {
        return false;
    };
    conn.query_row(
        "SELECT value FROM config WHERE key = ?1",
        [crate::store::SCHEMA_VERSION_KEY],
        |row| row.get::<_, String>(0),
    )
    .is_ok()
}

/// Drop the process-wide engine, cancelling any running detection job.
pub fn teardown() {
    let mut guard = ENGINE.write().expect("engine singleton lock poisoned");
    if let Some(engine) = guard.take() {
        engine.cancel_detection();
        log::info!("[Engine] Teardown complete");
    }
}

/// Borrow the singleton. Errors with `NotInitialized` before `init`.
pub fn with_engine<F, R>(f: F) -> Result<R>
where
    F: FnOnce(&Engine) -> Result<R>,
{
    let guard = ENGINE.read().expect("engine singleton lock poisoned");
    match guard.as_ref() {
        Some(engine) => f(engine),
        None => Err(EngineError::NotInitialized),
    }
}

// ============================================================================
// Engine
// ============================================================================

struct EngineShared {
    store: Store,
    state: Arc<RwLock<EngineState>>,
    caches: Arc<Mutex<CacheLayer>>,
    subscribers: Mutex<SubscriberRegistry>,
    detection: Mutex<Option<DetectionJob>>,
    detect_config: DetectConfig,
    custom_section_seq: AtomicU64,
}

/// Handle to the engine; cheap to clone, all clones share state.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<EngineShared>,
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Engine {
    /// Open an engine on the database at `path` without touching the
    /// process-wide singleton.
    pub fn open(path: &str) -> Result<Self> {
        let store = Store::open(path)?;
        Ok(Self {
            shared: Arc::new(EngineShared {
                store,
                state: Arc::new(RwLock::new(EngineState::new())),
                caches: Arc::new(Mutex::new(CacheLayer::new())),
                subscribers: Mutex::new(SubscriberRegistry::new()),
                detection: Mutex::new(None),
                detect_config: DetectConfig::default(),
                custom_section_seq: AtomicU64::new(0),
            }),
        })
    }

    pub fn path(&self) -> &str {
        self.shared.store.path()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub fn subscribe(
        &self,
        topic: Topic,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .subscribe(topic, Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .unsubscribe(id)
    }

    /// Fire topics in order, strictly after the store commit. Callbacks run
    /// outside the registry lock.
    fn publish(&self, topics: &[Topic]) {
        for &topic in topics {
            let callbacks: Vec<Callback> = self
                .shared
                .subscribers
                .lock()
                .expect("subscriber lock poisoned")
                .callbacks_for(topic);
            deliver(topic, &callbacks);
        }
    }

    // ========================================================================
    // Bulk ingestion & activity mutation
    // ========================================================================

    /// Bulk ingestion from flat buffers: `all_coords` holds interleaved
    /// lat,lng doubles; activity `i` owns `[offsets[i]*2 .. offsets[i+1]*2)`.
    pub fn add_activities(
        &self,
        ids: &[String],
        all_coords: &[f64],
        offsets: &[u32],
        sports: &[String],
    ) -> Result<()> {
        if ids.len() != sports.len() {
            return Err(EngineError::invalid(format!(
                "ids ({}) and sports ({}) lengths differ",
                ids.len(),
                sports.len()
            )));
        }
        if offsets.len() != ids.len() + 1 {
            return Err(EngineError::invalid(format!(
                "offsets length {} must be ids length + 1",
                offsets.len()
            )));
        }
        if all_coords.len() % 2 != 0 {
            return Err(EngineError::invalid("all_coords length must be even"));
        }
        if offsets.first() != Some(&0) {
            return Err(EngineError::invalid("offsets must start at 0"));
        }
        if !offsets.windows(2).all(|w| w[0] < w[1]) {
            return Err(EngineError::invalid("offsets must be strictly monotonic"));
        }
        if *offsets.last().unwrap() as usize != all_coords.len() / 2 {
            return Err(EngineError::invalid(
                "offsets must end at all_coords.len() / 2",
            ));
        }

        let mut items: Vec<(Activity, Vec<GpsPoint>)> = Vec::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            validate_identifier(id, "activity id")?;
            validate_identifier(&sports[i], "sport type")?;

            let start = offsets[i] as usize;
            let end = offsets[i + 1] as usize;
            let points: Vec<GpsPoint> = all_coords[start * 2..end * 2]
                .chunks_exact(2)
                .map(|c| GpsPoint::new(c[0], c[1]))
                .collect();
            let valid = geo::filter_valid_points(&points);
            if valid.len() < 2 {
                return Err(EngineError::invalid(format!(
                    "track for '{id}' has fewer than 2 valid points"
                )));
            }

            let activity = Activity {
                id: id.clone(),
                sport_type: sports[i].clone(),
                start_date: 0,
                name: String::new(),
                distance_m: geo::polyline_length(&valid),
                moving_time_s: 0,
                elapsed_time_s: 0,
                elevation_gain_m: 0.0,
                avg_hr: None,
            };
            items.push((activity, valid));
        }

        {
            let mut state = self.shared.state.write().expect("state lock poisoned");
            self.shared.store.insert_activities(&items)?;
            state.mark_tracks_changed();
            let mut caches = self.shared.caches.lock().expect("cache lock poisoned");
            for id in ids {
                caches.evict_signature(id);
            }
            caches.clear_consensus();
        }

        log::info!("[Engine] Added {} activities", ids.len());
        self.publish(&[Topic::Activities, Topic::Groups]);
        Ok(())
    }

    /// Remove activities by id. Missing ids are ignored.
    pub fn remove_activities(&self, ids: &[String]) -> Result<u32> {
        for id in ids {
            validate_identifier(id, "activity id")?;
        }

        let removed = {
            let mut state = self.shared.state.write().expect("state lock poisoned");
            let removed = self.shared.store.remove_activities(ids)?;
            if removed > 0 {
                state.mark_tracks_changed();
                let mut caches = self.shared.caches.lock().expect("cache lock poisoned");
                for id in ids {
                    caches.evict_signature(id);
                }
                caches.clear_consensus();
            }
            removed
        };

        if removed > 0 {
            self.publish(&[Topic::Activities, Topic::Groups]);
        }
        Ok(removed)
    }

    /// Delete activities older than `retention_days`; 0 keeps everything.
    pub fn cleanup_old_activities(&self, retention_days: u32) -> Result<u32> {
        if retention_days == 0 {
            return Ok(0);
        }
        let cutoff = now_ts() - retention_days as i64 * 86_400;

        let deleted = {
            let mut state = self.shared.state.write().expect("state lock poisoned");
            let deleted = self.shared.store.cleanup_before(cutoff)?;
            if deleted > 0 {
                state.mark_tracks_changed();
                self.shared
                    .caches
                    .lock()
                    .expect("cache lock poisoned")
                    .clear();
            }
            deleted
        };

        if deleted > 0 {
            log::info!(
                "[Engine] Cleanup removed {deleted} activities older than {retention_days} days"
            );
            self.publish(&[Topic::Activities, Topic::Groups]);
        }
        Ok(deleted)
    }

    /// Apply fetcher metric updates.
    pub fn set_activity_metrics(&self, updates: &[ActivityMetricsUpdate]) -> Result<()> {
        for u in updates {
            validate_identifier(&u.activity_id, "activity id")?;
        }
        {
            let _state = self.shared.state.write().expect("state lock poisoned");
            self.shared.store.set_activity_metrics(updates)?;
        }
        self.publish(&[Topic::Activities, Topic::Groups]);
        Ok(())
    }

    /// Idempotent overwrite of time streams (one cumulative-seconds entry
    /// per GPS sample).
    pub fn set_time_streams(&self, streams: &[(String, Vec<f32>)]) -> Result<()> {
        for (id, _) in streams {
            validate_identifier(id, "activity id")?;
        }
        let _state = self.shared.state.write().expect("state lock poisoned");
        self.shared.store.set_time_streams(streams)
    }

    /// Flat-buffer variant of `set_time_streams`.
    pub fn set_time_streams_flat(
        &self,
        ids: &[String],
        all_times: &[f32],
        offsets: &[u32],
    ) -> Result<()> {
        if offsets.len() != ids.len() + 1 {
            return Err(EngineError::invalid(
                "offsets length must be ids length + 1",
            ));
        }
        if !offsets.windows(2).all(|w| w[0] <= w[1]) {
            return Err(EngineError::invalid("offsets must be monotonic"));
        }
        if *offsets.last().unwrap_or(&0) as usize != all_times.len() {
            return Err(EngineError::invalid("offsets must end at all_times.len()"));
        }

        let streams: Vec<(String, Vec<f32>)> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let start = offsets[i] as usize;
                let end = offsets[i + 1] as usize;
                (id.clone(), all_times[start..end].to_vec())
            })
            .collect();
        self.set_time_streams(&streams)
    }

    pub fn get_activities_missing_time_streams(&self, ids: &[String]) -> Result<Vec<String>> {
        self.shared.store.get_activities_missing_time_streams(ids)
    }

    /// Empty the store. The engine stays `Ready` with an empty database.
    pub fn clear(&self) -> Result<()> {
        // Reclaim the detection worker before taking the state lock; its
        // commit path acquires the same lock.
        self.cancel_detection();
        {
            let mut state = self.shared.state.write().expect("state lock poisoned");
            self.shared.store.clear_all()?;
            self.shared.store.invalidate_pool();
            state.viewport = None;
            state.groups_dirty = false;
            state.sections_dirty = false;
            self.shared
                .caches
                .lock()
                .expect("cache lock poisoned")
                .clear();
        }
        log::info!("[Engine] Cleared all state");
        self.publish(&[
            Topic::Activities,
            Topic::Groups,
            Topic::Sections,
            Topic::SyncReset,
        ]);
        Ok(())
    }

    // ========================================================================
    // Activity reads
    // ========================================================================

    pub fn get_activity_ids(&self) -> Result<Vec<String>> {
        self.shared.store.get_activity_ids()
    }

    pub fn get_activity_count(&self) -> Result<u32> {
        self.shared.store.get_activity_count()
    }

    pub fn get_gps_track(&self, activity_id: &str) -> Result<Vec<GpsPoint>> {
        self.shared
            .store
            .get_gps_track(activity_id)?
            .ok_or_else(|| EngineError::not_found("activity", activity_id))
    }

    /// Track simplified for rendering; tolerance in meters.
    pub fn get_simplified_gps_track(
        &self,
        activity_id: &str,
        tolerance_m: f64,
    ) -> Result<Vec<GpsPoint>> {
        let track = self.get_gps_track(activity_id)?;
        Ok(geo::simplify(&track, tolerance_m))
    }

    pub fn get_map_activities(&self) -> Result<Vec<MapActivity>> {
        self.shared.store.get_map_activities()
    }

    /// Every activity whose bbox intersects the query rectangle.
    pub fn query_viewport(
        &self,
        min_lat: f64,
        max_lat: f64,
        min_lng: f64,
        max_lng: f64,
    ) -> Result<Vec<String>> {
        let query = Bounds {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        };

        {
            let state = self.shared.state.read().expect("state lock poisoned");
            if let Some(index) = &state.viewport {
                return Ok(index.query_viewport(&query));
            }
        }

        // Rebuild lazily after a mutation discarded it.
        let mut state = self.shared.state.write().expect("state lock poisoned");
        if state.viewport.is_none() {
            let entries = self.shared.store.get_track_bounds()?;
            state.viewport = Some(crate::spatial::ViewportIndex::build(entries));
        }
        Ok(state
            .viewport
            .as_ref()
            .expect("viewport index just built")
            .query_viewport(&query))
    }

    // ========================================================================
    // Signatures & consensus
    // ========================================================================

    /// Signature of a track, LRU-cached.
    fn signature_for(&self, activity_id: &str) -> Result<Vec<GpsPoint>> {
        if let Some(sig) = self
            .shared
            .caches
            .lock()
            .expect("cache lock poisoned")
            .get_signature(activity_id)
        {
            return Ok(sig);
        }

        let track = self.get_gps_track(activity_id)?;
        let signature = geo::simplify_to_signature(&track);
        self.shared
            .caches
            .lock()
            .expect("cache lock poisoned")
            .put_signature(activity_id.to_string(), signature.clone());
        Ok(signature)
    }

    /// Consensus polyline of a group: the medoid activity's signature,
    /// LRU-cached per group.
    pub fn get_consensus_route(&self, group_id: &str) -> Result<Vec<GpsPoint>> {
        self.ensure_groups_fresh()?;

        if let Some(polyline) = self
            .shared
            .caches
            .lock()
            .expect("cache lock poisoned")
            .get_consensus(group_id)
        {
            return Ok(polyline);
        }

        let group = self
            .shared
            .store
            .get_group(group_id)?
            .ok_or_else(|| EngineError::not_found("route group", group_id))?;
        let polyline = self.signature_for(&group.representative_id)?;
        self.shared
            .caches
            .lock()
            .expect("cache lock poisoned")
            .put_consensus(group_id.to_string(), polyline.clone());
        Ok(polyline)
    }

    /// Polyline overlap primitive, exposed for external callers.
    pub fn overlap_ratio(&self, a: &[GpsPoint], b: &[GpsPoint], threshold_m: f64) -> f64 {
        crate::spatial::overlap_ratio(a, b, threshold_m)
    }

    // ========================================================================
    // Groups
    // ========================================================================

    /// Re-derive route groups synchronously when the dirty flag is set.
    fn ensure_groups_fresh(&self) -> Result<()> {
        if !self
            .shared
            .state
            .read()
            .expect("state lock poisoned")
            .groups_dirty
        {
            return Ok(());
        }

        let mut state = self.shared.state.write().expect("state lock poisoned");
        if !state.groups_dirty {
            return Ok(()); // Another thread rebuilt while we waited.
        }

        let raw = self.shared.store.get_tracks_for_sport(None)?;
        let mut tracks = Vec::with_capacity(raw.len());
        for (id, sport, points) in raw {
            let valid = geo::filter_valid_points(&points);
            if valid.len() < 2 {
                continue;
            }
            let signature = geo::simplify_to_signature(&valid);
            let Some(bounds) = geo::compute_bounds(&valid) else {
                continue;
            };
            tracks.push(detect::grouping::TrackData {
                id,
                sport,
                points: valid,
                signature,
                bounds,
            });
        }

        let indexes: Vec<Option<crate::spatial::TrackIndex>> = tracks
            .iter()
            .map(|t| crate::spatial::TrackIndex::build(&t.signature))
            .collect();
        let pairs = detect::grouping::candidate_pairs(&tracks);
        let cancel = AtomicBool::new(false);
        let edges = detect::grouping::find_overlap_edges(
            &tracks,
            &indexes,
            &pairs,
            &self.shared.detect_config,
            &cancel,
            || {},
        )
        .unwrap_or_default();
        let groups = detect::grouping::cluster_groups(&tracks, &edges, &self.shared.detect_config);

        self.shared.store.set_groups(&groups)?;
        state.groups_dirty = false;
        self.shared
            .caches
            .lock()
            .expect("cache lock poisoned")
            .clear_consensus();

        log::info!("[Engine] Rebuilt {} route groups", groups.len());
        Ok(())
    }

    pub fn get_groups(&self) -> Result<Vec<RouteGroup>> {
        self.ensure_groups_fresh()?;
        self.shared.store.get_groups()
    }

    pub fn get_group_summaries(&self) -> Result<Vec<GroupSummary>> {
        self.ensure_groups_fresh()?;
        self.shared.store.get_group_summaries(0)
    }

    pub fn get_group_by_id(&self, group_id: &str) -> Result<Option<RouteGroup>> {
        self.ensure_groups_fresh()?;
        self.shared.store.get_group(group_id)
    }

    pub fn get_all_route_names(&self) -> Result<Vec<(String, String)>> {
        self.shared.store.get_all_route_names()
    }

    /// Rename a route group. Empty name clears the custom name. Duplicate
    /// names within a sport are a `Conflict`.
    pub fn set_route_name(&self, group_id: &str, name: &str) -> Result<()> {
        validate_identifier(group_id, "group id")?;
        let sport = self.shared.store.get_group_sport(group_id)?;

        if name.is_empty() {
            self.shared.store.set_custom_name(group_id, None)?;
        } else {
            validate_identifier(name, "route name")?;
            if self.shared.store.route_name_exists(&sport, name, group_id)? {
                return Err(EngineError::conflict(format!(
                    "route name '{name}' already exists for sport '{sport}'"
                )));
            }
            self.shared.store.set_custom_name(group_id, Some(name))?;
        }

        self.publish(&[Topic::Groups]);
        Ok(())
    }

    // ========================================================================
    // Sections
    // ========================================================================

    pub fn get_sections(&self) -> Result<Vec<Section>> {
        self.shared.store.get_sections()
    }

    pub fn get_section_summaries(&self) -> Result<Vec<SectionSummary>> {
        self.shared.store.get_section_summaries(None)
    }

    pub fn get_section_summaries_for_sport(&self, sport: &str) -> Result<Vec<SectionSummary>> {
        self.shared.store.get_section_summaries(Some(sport))
    }

    pub fn get_section_by_id(&self, section_id: &str) -> Result<Option<Section>> {
        self.shared.store.get_section(section_id)
    }

    pub fn get_section_polyline(&self, section_id: &str) -> Result<Vec<GpsPoint>> {
        self.shared
            .store
            .get_section_polyline(section_id)?
            .ok_or_else(|| EngineError::not_found("section", section_id))
    }

    pub fn get_sections_for_activity(&self, activity_id: &str) -> Result<Vec<Section>> {
        self.shared.store.get_sections_for_activity(activity_id)
    }

    /// Rename a section; same rules as routes.
    pub fn set_section_name(&self, section_id: &str, name: &str) -> Result<()> {
        validate_identifier(section_id, "section id")?;
        let section = self
            .shared
            .store
            .get_section(section_id)?
            .ok_or_else(|| EngineError::not_found("section", section_id))?;

        if name.is_empty() {
            self.shared.store.set_custom_name(section_id, None)?;
        } else {
            validate_identifier(name, "section name")?;
            if self
                .shared
                .store
                .section_name_exists(&section.sport_type, name, section_id)?
            {
                return Err(EngineError::conflict(format!(
                    "section name '{name}' already exists for sport '{}'",
                    section.sport_type
                )));
            }
            self.shared.store.set_custom_name(section_id, Some(name))?;
        }

        self.publish(&[Topic::Sections]);
        Ok(())
    }

    /// Create a custom section by cutting `[start_index, end_index]` out of
    /// an activity's stored track, then match it against every activity of
    /// the sport.
    pub fn create_section_from_indices(
        &self,
        activity_id: &str,
        start_index: u32,
        end_index: u32,
        sport_type: &str,
        name: Option<&str>,
    ) -> Result<Section> {
        validate_identifier(activity_id, "activity id")?;
        validate_identifier(sport_type, "sport type")?;
        if let Some(name) = name {
            validate_identifier(name, "section name")?;
        }

        let track = self.get_gps_track(activity_id)?;
        let (start, end) = (start_index as usize, end_index as usize);
        if start >= end || end >= track.len() {
            return Err(EngineError::invalid(format!(
                "index range {start_index}..{end_index} out of bounds for track of {} points",
                track.len()
            )));
        }

        let polyline = track[start..=end].to_vec();
        if polyline.len() < 2 {
            return Err(EngineError::invalid("section polyline needs 2+ points"));
        }

        let seq = self.shared.custom_section_seq.fetch_add(1, Ordering::Relaxed);
        let section = Section {
            id: format!("custom_{}_{seq}", now_ts()),
            section_type: SectionType::Custom,
            sport_type: sport_type.to_string(),
            distance_m: geo::polyline_length(&polyline),
            polyline,
            visit_count: 0,
            confidence: None,
            scale: None,
            name: name.map(|s| s.to_string()),
            representative_id: Some(activity_id.to_string()),
            source_activity_id: Some(activity_id.to_string()),
            start_index: Some(start_index),
            end_index: Some(end_index),
            created_at: now_ts(),
            activity_ids: Vec::new(),
        };

        // Match against all activities of the sport, source included.
        let threshold = self.shared.detect_config.overlap_threshold_m;
        let mut traversals: Vec<SectionTraversal> = Vec::new();
        for (id, _sport, points) in self
            .shared
            .store
            .get_tracks_for_sport(Some(sport_type))?
        {
            let valid = geo::filter_valid_points(&points);
            traversals.extend(detect::traces::find_traversals(
                &id,
                &valid,
                &section.polyline,
                threshold,
            ));
        }

        {
            let _state = self.shared.state.write().expect("state lock poisoned");
            self.shared.store.insert_section(&section, &traversals)?;
        }

        log::info!(
            "[Engine] Created custom section {} with {} traversals",
            section.id,
            traversals.len()
        );
        self.publish(&[Topic::Sections]);
        self.shared
            .store
            .get_section(&section.id)?
            .ok_or_else(|| EngineError::internal("section vanished after insert"))
    }

    pub fn delete_section(&self, section_id: &str) -> Result<()> {
        validate_identifier(section_id, "section id")?;
        {
            let _state = self.shared.state.write().expect("state lock poisoned");
            self.shared.store.delete_section(section_id)?;
        }
        self.publish(&[Topic::Sections]);
        Ok(())
    }

    // ========================================================================
    // Section reference (medoid pin)
    // ========================================================================

    /// Pin the reference activity of a section.
    pub fn set_section_reference(&self, section_id: &str, activity_id: &str) -> Result<()> {
        validate_identifier(section_id, "section id")?;
        validate_identifier(activity_id, "activity id")?;

        let section = self
            .shared
            .store
            .get_section(section_id)?
            .ok_or_else(|| EngineError::not_found("section", section_id))?;
        if self.shared.store.get_activity(activity_id)?.is_none() {
            return Err(EngineError::not_found("activity", activity_id));
        }
        if !section.activity_ids.iter().any(|id| id == activity_id) {
            return Err(EngineError::invalid(format!(
                "activity '{activity_id}' does not traverse section '{section_id}'"
            )));
        }

        self.shared
            .store
            .set_pinned_activity(section_id, Some(activity_id))?;
        self.publish(&[Topic::Sections]);
        Ok(())
    }

    /// Revert to the detected medoid reference.
    pub fn reset_section_reference(&self, section_id: &str) -> Result<()> {
        validate_identifier(section_id, "section id")?;
        if self.shared.store.get_section(section_id)?.is_none() {
            return Err(EngineError::not_found("section", section_id));
        }
        self.shared.store.set_pinned_activity(section_id, None)?;
        self.publish(&[Topic::Sections]);
        Ok(())
    }

    /// The active reference: the user pin when set, the detected medoid (or
    /// custom source activity) otherwise.
    pub fn get_section_reference(&self, section_id: &str) -> Result<Option<String>> {
        if let Some(pinned) = self.shared.store.get_pinned_activity(section_id)? {
            return Ok(Some(pinned));
        }
        let section = self
            .shared
            .store
            .get_section(section_id)?
            .ok_or_else(|| EngineError::not_found("section", section_id))?;
        Ok(section.representative_id.or(section.source_activity_id))
    }

    pub fn is_section_reference_user_defined(&self, section_id: &str) -> Result<bool> {
        Ok(self.shared.store.get_pinned_activity(section_id)?.is_some())
    }

    // ========================================================================
    // Performances
    // ========================================================================

    pub fn get_section_performances(&self, section_id: &str) -> Result<SectionPerformanceResult> {
        let section = self
            .shared
            .store
            .get_section(section_id)?
            .ok_or_else(|| EngineError::not_found("section", section_id))?;
        let traversals = self.shared.store.get_section_traversals(section_id)?;
        let (tracks, streams, activities) = self.gather_lap_inputs(&traversals)?;

        let laps = perf::compute_laps(&traversals, &tracks, &streams, &activities);
        Ok(perf::build_section_result(
            section.distance_m,
            laps,
            &activities,
        ))
    }

    pub fn get_section_performance_buckets(
        &self,
        section_id: &str,
        range_days: u32,
        bucket_type: BucketType,
    ) -> Result<SectionPerformanceBucketResult> {
        if self.shared.store.get_section(section_id)?.is_none() {
            return Err(EngineError::not_found("section", section_id));
        }
        let traversals = self.shared.store.get_section_traversals(section_id)?;
        let (tracks, streams, activities) = self.gather_lap_inputs(&traversals)?;

        let laps = perf::compute_laps(&traversals, &tracks, &streams, &activities);
        Ok(perf::build_buckets(
            &laps,
            &activities,
            range_days,
            bucket_type,
            now_ts(),
        ))
    }

    pub fn get_route_performances(
        &self,
        group_id: &str,
        current_activity_id: Option<&str>,
    ) -> Result<RoutePerformanceResult> {
        self.ensure_groups_fresh()?;
        let group = self
            .shared
            .store
            .get_group(group_id)?
            .ok_or_else(|| EngineError::not_found("route group", group_id))?;

        let activities = self.shared.store.get_activities(&group.activity_ids)?;
        let members: HashMap<String, GroupMember> = self
            .shared
            .store
            .get_group_members(group_id)?
            .into_iter()
            .map(|m| (m.activity_id.clone(), m))
            .collect();

        Ok(perf::build_route_result(
            &activities,
            &members,
            current_activity_id,
        ))
    }

    #[allow(clippy::type_complexity)]
    fn gather_lap_inputs(
        &self,
        traversals: &[SectionTraversal],
    ) -> Result<(
        HashMap<String, Vec<GpsPoint>>,
        HashMap<String, Vec<f32>>,
        HashMap<String, Activity>,
    )> {
        let mut ids: Vec<String> = traversals.iter().map(|t| t.activity_id.clone()).collect();
        ids.sort();
        ids.dedup();

        let mut tracks = HashMap::new();
        let mut streams = HashMap::new();
        let mut activities = HashMap::new();
        for id in &ids {
            if let Some(track) = self.shared.store.get_gps_track(id)? {
                tracks.insert(id.clone(), track);
            }
            if let Some(stream) = self.shared.store.get_time_stream(id)? {
                streams.insert(id.clone(), stream);
            }
            if let Some(activity) = self.shared.store.get_activity(id)? {
                activities.insert(id.clone(), activity);
            }
        }
        Ok((tracks, streams, activities))
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    pub fn get_period_stats(&self, start_ts: i64, end_ts: i64) -> Result<PeriodStats> {
        self.shared.store.get_period_stats(start_ts, end_ts)
    }

    pub fn get_monthly_aggregates(
        &self,
        year: i32,
        metric: MonthlyMetric,
    ) -> Result<Vec<MonthlyAggregate>> {
        self.shared.store.get_monthly_aggregates(year, metric)
    }

    pub fn get_activity_heatmap(&self, start_ts: i64, end_ts: i64) -> Result<Vec<HeatmapDay>> {
        self.shared.store.get_activity_heatmap(start_ts, end_ts)
    }

    pub fn get_zone_distribution(
        &self,
        sport_type: &str,
        zone_type: ZoneType,
    ) -> Result<ZoneDistribution> {
        self.shared.store.get_zone_distribution(sport_type, zone_type)
    }

    pub fn get_ftp_trend(&self) -> Result<FtpTrend> {
        self.shared.store.get_ftp_trend()
    }

    // ========================================================================
    // Routes screen & stats
    // ========================================================================

    /// One round-trip payload: paginated group summaries with consensus
    /// polylines, and section summaries with polylines.
    pub fn get_routes_screen_data(
        &self,
        group_limit: u32,
        group_offset: u32,
        section_limit: u32,
        section_offset: u32,
        min_group_activities: u32,
    ) -> Result<RoutesScreenData> {
        self.ensure_groups_fresh()?;

        let all_groups = self
            .shared
            .store
            .get_group_summaries(min_group_activities)?;
        let total_groups = all_groups.len() as u32;
        let groups: Vec<GroupListItem> = all_groups
            .into_iter()
            .skip(group_offset as usize)
            .take(group_limit as usize)
            .map(|summary| {
                let consensus_polyline =
                    self.get_consensus_route(&summary.id).unwrap_or_default();
                GroupListItem {
                    summary,
                    consensus_polyline,
                }
            })
            .collect();

        let all_sections = self.shared.store.get_section_summaries(None)?;
        let total_sections = all_sections.len() as u32;
        let sections: Vec<SectionListItem> = all_sections
            .into_iter()
            .skip(section_offset as usize)
            .take(section_limit as usize)
            .map(|summary| {
                let polyline = self
                    .shared
                    .store
                    .get_section_polyline(&summary.id)
                    .ok()
                    .flatten()
                    .unwrap_or_default();
                SectionListItem { summary, polyline }
            })
            .collect();

        Ok(RoutesScreenData {
            groups,
            sections,
            total_groups,
            total_sections,
        })
    }

    pub fn get_stats(&self) -> Result<EngineStats> {
        let (oldest_date, newest_date) = self.shared.store.get_date_range()?;
        let (groups_dirty, sections_dirty) = {
            let state = self.shared.state.read().expect("state lock poisoned");
            (state.groups_dirty, state.sections_dirty)
        };
        let (signature_cache_size, consensus_cache_size) = {
            let caches = self.shared.caches.lock().expect("cache lock poisoned");
            (caches.signature_len() as u32, caches.consensus_len() as u32)
        };

        Ok(EngineStats {
            activity_count: self.shared.store.get_activity_count()?,
            gps_track_count: self.shared.store.get_gps_track_count()?,
            group_count: self.shared.store.get_group_count()?,
            section_count: self.shared.store.get_section_count()?,
            groups_dirty,
            sections_dirty,
            signature_cache_size,
            consensus_cache_size,
            oldest_date,
            newest_date,
        })
    }

    // ========================================================================
    // Config KV
    // ========================================================================

    /// Opaque athlete profile JSON; persisted, never parsed.
    pub fn set_athlete_profile(&self, json: &str) -> Result<()> {
        self.shared.store.set_config(ATHLETE_PROFILE_KEY, json)
    }

    pub fn get_athlete_profile(&self) -> Result<Option<String>> {
        self.shared.store.get_config(ATHLETE_PROFILE_KEY)
    }

    /// Opaque sport settings JSON; persisted, never parsed.
    pub fn set_sport_settings(&self, json: &str) -> Result<()> {
        self.shared.store.set_config(SPORT_SETTINGS_KEY, json)
    }

    pub fn get_sport_settings(&self) -> Result<Option<String>> {
        self.shared.store.get_config(SPORT_SETTINGS_KEY)
    }

    /// Localized word used in auto section names. Already-persisted auto
    /// names are rewritten on the next detection re-run.
    pub fn set_name_translations(&self, section_word: &str) -> Result<()> {
        validate_identifier(section_word, "section word")?;
        self.shared.store.set_config(SECTION_WORD_KEY, section_word)
    }

    // ========================================================================
    // Detection control
    // ========================================================================

    /// Start background detection. A job already in flight is cancelled and
    /// superseded; its results are never observable.
    pub fn start_section_detection(&self, sport_filter: Option<String>) -> Result<bool> {
        if let Some(sport) = &sport_filter {
            validate_identifier(sport, "sport type")?;
        }

        let mut detection = self.shared.detection.lock().expect("detection lock poisoned");
        if let Some(previous) = detection.take() {
            if previous.is_running() {
                log::info!("[Engine] Superseding running detection job");
            }
            previous.request_cancel();
            // Dropping joins the worker after the flag is observed.
        }

        let job = detect::spawn(DetectionContext {
            store: self.shared.store.clone(),
            state: Arc::clone(&self.shared.state),
            caches: Arc::clone(&self.shared.caches),
            config: self.shared.detect_config.clone(),
            sport_filter,
        });
        *detection = Some(job);
        Ok(true)
    }

    /// Poll the job: `idle`, `running`, `complete` or `error`. The first
    /// poll observing the running→complete transition publishes {sections}.
    pub fn poll_sections(&self) -> Result<String> {
        let mut publish_sections = false;

        let status = {
            let mut detection =
                self.shared.detection.lock().expect("detection lock poisoned");
            match detection.as_mut() {
                None => "idle",
                Some(job) => match job.state() {
                    JobState::Running => "running",
                    JobState::Complete => {
                        if !job.completion_published {
                            job.completion_published = true;
                            publish_sections = true;
                        }
                        "complete"
                    }
                    JobState::Cancelled | JobState::Failed(_) => "error",
                },
            }
        };

        if publish_sections {
            self.publish(&[Topic::Sections]);
        }
        Ok(status.to_string())
    }

    /// `(phase, completed, total)` of the current job, when one exists.
    pub fn get_section_detection_progress(&self) -> Option<(String, u32, u32)> {
        self.shared
            .detection
            .lock()
            .expect("detection lock poisoned")
            .as_ref()
            .map(|job| job.progress.snapshot())
    }

    /// Cancel any in-flight detection and reclaim the worker.
    pub fn cancel_detection(&self) {
        let mut detection = self.shared.detection.lock().expect("detection lock poisoned");
        if let Some(job) = detection.take() {
            job.request_cancel();
        }
    }
}
