//! Background section & group detection pipeline.
//!
//! A single job runs at a time per engine, on its own worker thread with its
//! own pooled database handle. Phases, in order: `loading`,
//! `building_rtrees`, `finding_overlaps`, `clustering`, `building_sections`,
//! `postprocessing`, `complete`. The shared cancel flag is checked in every
//! inner loop; a cancelled job commits nothing and the previously persisted
//! sections and groups remain untouched.

pub mod grouping;
pub mod traces;
pub mod union_find;
pub mod windows;

use crate::cache::CacheLayer;
use crate::error::{EngineError, Result};
use crate::geo;
use crate::spatial::TrackIndex;
use crate::state::EngineState;
use crate::store::Store;
use crate::types::{DetectConfig, Section, SectionTraversal, SectionType};
use grouping::TrackData;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Progress & job state
// ============================================================================

/// Progress state for section detection, shared between threads.
#[derive(Clone)]
pub struct DetectionProgress {
    phase: Arc<Mutex<String>>,
    completed: Arc<AtomicU32>,
    total: Arc<AtomicU32>,
}

impl DetectionProgress {
    pub fn new() -> Self {
        Self {
            phase: Arc::new(Mutex::new("loading".to_string())),
            completed: Arc::new(AtomicU32::new(0)),
            total: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn set_phase(&self, phase: &str, total: u32) {
        *self.phase.lock().expect("progress mutex poisoned") = phase.to_string();
        self.completed.store(0, Ordering::SeqCst);
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn increment(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (String, u32, u32) {
        (
            self.phase.lock().expect("progress mutex poisoned").clone(),
            self.completed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

impl Default for DetectionProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Terminal and non-terminal job states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Complete,
    Cancelled,
    Failed(String),
}

/// Handle to a running or finished detection job.
pub struct DetectionJob {
    pub progress: DetectionProgress,
    cancel: Arc<AtomicBool>,
    state: Arc<Mutex<JobState>>,
    /// Set by `poll` once the running→complete transition has fired its
    /// notification, so it fires exactly once.
    pub completion_published: bool,
    handle: Option<JoinHandle<()>>,
}

impl DetectionJob {
    pub fn state(&self) -> JobState {
        self.state.lock().expect("job state mutex poisoned").clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == JobState::Running
    }

    /// Ask the worker to stop; it finishes its current inner loop and exits
    /// without committing.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl Drop for DetectionJob {
    fn drop(&mut self) {
        self.request_cancel();
        if let Some(handle) = self.handle.take() {
            // Reclaim the worker; it exits quickly once the flag is set.
            let _ = handle.join();
        }
    }
}

// ============================================================================
// Spawning
// ============================================================================

/// Everything the worker thread needs, captured by value.
pub(crate) struct DetectionContext {
    pub store: Store,
    pub state: Arc<RwLock<EngineState>>,
    pub caches: Arc<Mutex<CacheLayer>>,
    pub config: DetectConfig,
    pub sport_filter: Option<String>,
}

/// Start the pipeline on a worker thread.
pub(crate) fn spawn(ctx: DetectionContext) -> DetectionJob {
    let progress = DetectionProgress::new();
    let cancel = Arc::new(AtomicBool::new(false));
    let state = Arc::new(Mutex::new(JobState::Running));

    let worker_progress = progress.clone();
    let worker_cancel = Arc::clone(&cancel);
    let worker_state = Arc::clone(&state);

    let handle = thread::Builder::new()
        .name("section-detect".to_string())
        .spawn(move || {
            let outcome = run_pipeline(&ctx, &worker_progress, &worker_cancel);
            let mut st = worker_state.lock().expect("job state mutex poisoned");
            *st = match outcome {
                Ok(()) => {
                    worker_progress.set_phase("complete", 0);
                    JobState::Complete
                }
                Err(EngineError::Cancelled) => {
                    log::info!("[Detect] Job cancelled");
                    JobState::Cancelled
                }
                Err(e) => {
                    log::warn!("[Detect] Job failed: {e}");
                    JobState::Failed(e.to_string())
                }
            };
        })
        .expect("failed to spawn detection thread");

    DetectionJob {
        progress,
        cancel,
        state,
        completion_published: false,
        handle: Some(handle),
    }
}

// ============================================================================
// Pipeline
// ============================================================================

fn check_cancel(cancel: &AtomicBool) -> Result<()> {
    if cancel.load(Ordering::Relaxed) {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn run_pipeline(
    ctx: &DetectionContext,
    progress: &DetectionProgress,
    cancel: &AtomicBool,
) -> Result<()> {
    // Phase 1: load candidate tracks.
    let raw = ctx
        .store
        .get_tracks_for_sport(ctx.sport_filter.as_deref())?;
    progress.set_phase("loading", raw.len() as u32);

    let mut tracks: Vec<TrackData> = Vec::with_capacity(raw.len());
    for (id, sport, points) in raw {
        check_cancel(cancel)?;
        let valid = geo::filter_valid_points(&points);
        progress.increment();
        if valid.len() < 2 {
            continue;
        }
        let signature = geo::simplify_to_signature(&valid);
        let Some(bounds) = geo::compute_bounds(&valid) else {
            continue;
        };
        tracks.push(TrackData {
            id,
            sport,
            points: valid,
            signature,
            bounds,
        });
    }
    log::info!("[Detect] Loaded {} candidate tracks", tracks.len());

    // Phase 2: spatial indexes over signatures and full tracks.
    progress.set_phase("building_rtrees", tracks.len() as u32);
    let mut sig_indexes: Vec<Option<TrackIndex>> = Vec::with_capacity(tracks.len());
    let mut full_indexes: Vec<Option<TrackIndex>> = Vec::with_capacity(tracks.len());
    for t in &tracks {
        check_cancel(cancel)?;
        sig_indexes.push(TrackIndex::build(&t.signature));
        full_indexes.push(TrackIndex::build(&t.points));
        progress.increment();
    }

    // Phase 3: pairwise overlaps, pruned by bounding box.
    let pairs = grouping::candidate_pairs(&tracks);
    progress.set_phase("finding_overlaps", pairs.len() as u32);
    let edges = grouping::find_overlap_edges(&tracks, &sig_indexes, &pairs, &ctx.config, cancel, || {
        progress.increment()
    })
    .ok_or(EngineError::Cancelled)?;
    log::info!(
        "[Detect] {} overlap edges from {} candidate pairs",
        edges.len(),
        pairs.len()
    );

    // Phase 4: connected components become route groups.
    progress.set_phase("clustering", edges.len() as u32);
    let groups = grouping::cluster_groups(&tracks, &edges, &ctx.config);
    log::info!("[Detect] {} route groups", groups.len());

    // Phase 5: multi-scale window candidates.
    let window_units = (ctx.config.scales.len() * tracks.len()) as u32;
    progress.set_phase("building_sections", window_units);
    let candidates =
        windows::detect_candidates(&tracks, &full_indexes, &ctx.config, cancel, || {
            progress.increment()
        })
        .ok_or(EngineError::Cancelled)?;
    log::info!("[Detect] {} merged section candidates", candidates.len());

    let sections = build_sections(&tracks, candidates, &ctx.config, cancel)?;

    // Phase 6: names, ordinals, commit.
    progress.set_phase("postprocessing", sections.len() as u32);
    let section_word = ctx.store.get_section_word()?;
    let sections = assign_ids_and_names(sections, &section_word, progress);

    check_cancel(cancel)?;
    {
        // The only point where the worker takes the engine's exclusive lock:
        // one transaction replacing groups and auto sections atomically.
        let mut state = ctx.state.write().expect("engine state lock poisoned");
        check_cancel(cancel)?;
        ctx.store
            .apply_detection(&groups, &sections, ctx.sport_filter.as_deref())?;
        state.groups_dirty = false;
        state.sections_dirty = false;
    }
    ctx.caches
        .lock()
        .expect("cache mutex poisoned")
        .clear_consensus();

    // Custom sections are re-matched against the (possibly new) activity
    // set so their traversal rows stay current.
    rematch_custom_sections(ctx, &tracks)?;

    Ok(())
}

/// Turn window candidates into sections with extracted traversals.
fn build_sections(
    tracks: &[TrackData],
    candidates: Vec<windows::SectionCandidate>,
    config: &DetectConfig,
    cancel: &AtomicBool,
) -> Result<Vec<(Section, Vec<SectionTraversal>)>> {
    let by_id: HashMap<&str, &TrackData> = tracks.iter().map(|t| (t.id.as_str(), t)).collect();
    let created_at = now_ts();

    let mut sections = Vec::new();
    for candidate in candidates {
        check_cancel(cancel)?;

        let mut supporters: Vec<&String> = candidate.supporters.iter().collect();
        supporters.sort();

        let mut traversals: Vec<SectionTraversal> = Vec::new();
        for supporter in supporters {
            let Some(track) = by_id.get(supporter.as_str()) else {
                continue;
            };
            traversals.extend(traces::find_traversals(
                supporter,
                &track.points,
                &candidate.polyline,
                config.overlap_threshold_m,
            ));
        }

        let mut contributing: Vec<&str> = traversals
            .iter()
            .map(|t| t.activity_id.as_str())
            .collect();
        contributing.sort();
        contributing.dedup();
        if (contributing.len() as u32) < config.min_visits {
            continue;
        }

        // First trace per contributor feeds the confidence score.
        let trace_slices: Vec<&[crate::types::GpsPoint]> = contributing
            .iter()
            .filter_map(|id| {
                traversals
                    .iter()
                    .find(|t| t.activity_id == *id)
                    .and_then(|t| {
                        let track = by_id.get(*id)?;
                        track
                            .points
                            .get(t.start_index as usize..=t.end_index as usize)
                    })
            })
            .collect();
        let confidence = traces::trace_confidence(&trace_slices, config.overlap_threshold_m);

        let section = Section {
            id: String::new(), // assigned in postprocessing
            section_type: SectionType::Auto,
            sport_type: candidate.sport.clone(),
            distance_m: geo::polyline_length(&candidate.polyline),
            polyline: candidate.polyline,
            visit_count: traversals.len() as u32,
            confidence: Some(confidence),
            scale: Some(candidate.scale),
            name: None,
            representative_id: Some(candidate.source_id.clone()),
            source_activity_id: None,
            start_index: None,
            end_index: None,
            created_at,
            activity_ids: contributing.iter().map(|s| s.to_string()).collect(),
        };
        sections.push((section, traversals));
    }

    Ok(sections)
}

/// Ordinals are assigned in order of first detection within each sport; the
/// auto name is the localized section word plus the ordinal.
fn assign_ids_and_names(
    mut sections: Vec<(Section, Vec<SectionTraversal>)>,
    section_word: &str,
    progress: &DetectionProgress,
) -> Vec<(Section, Vec<SectionTraversal>)> {
    let mut ordinals: HashMap<String, u32> = HashMap::new();
    for (section, _) in sections.iter_mut() {
        let ordinal = ordinals.entry(section.sport_type.clone()).or_insert(0);
        *ordinal += 1;
        section.id = format!(
            "sec_{}_{}",
            section.sport_type.to_lowercase().replace(' ', "_"),
            *ordinal - 1
        );
        section.name = Some(format!("{section_word} {ordinal}"));
        progress.increment();
    }
    sections
}

fn rematch_custom_sections(ctx: &DetectionContext, tracks: &[TrackData]) -> Result<()> {
    let customs = ctx.store.get_custom_sections()?;
    for section in customs {
        let mut traversals = Vec::new();
        for t in tracks.iter().filter(|t| t.sport == section.sport_type) {
            traversals.extend(traces::find_traversals(
                &t.id,
                &t.points,
                &section.polyline,
                ctx.config.overlap_threshold_m,
            ));
        }
        ctx.store
            .replace_section_traversals(&section.id, &traversals)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_phase_transitions() {
        let progress = DetectionProgress::new();
        assert_eq!(progress.snapshot().0, "loading");

        progress.set_phase("finding_overlaps", 10);
        progress.increment();
        progress.increment();
        let (phase, completed, total) = progress.snapshot();
        assert_eq!(phase, "finding_overlaps");
        assert_eq!(completed, 2);
        assert_eq!(total, 10);

        // A phase change resets the counters.
        progress.set_phase("clustering", 4);
        assert_eq!(progress.snapshot().1, 0);
    }

    #[test]
    fn test_assign_ids_and_names_per_sport_ordinals() {
        let make = |sport: &str| {
            (
                Section {
                    id: String::new(),
                    section_type: SectionType::Auto,
                    sport_type: sport.to_string(),
                    polyline: vec![],
                    distance_m: 0.0,
                    visit_count: 0,
                    confidence: None,
                    scale: None,
                    name: None,
                    representative_id: None,
                    source_activity_id: None,
                    start_index: None,
                    end_index: None,
                    created_at: 0,
                    activity_ids: vec![],
                },
                vec![],
            )
        };

        let sections = vec![make("Ride"), make("Run"), make("Ride")];
        let named = assign_ids_and_names(sections, "Segment", &DetectionProgress::new());

        assert_eq!(named[0].0.id, "sec_ride_0");
        assert_eq!(named[0].0.name.as_deref(), Some("Segment 1"));
        assert_eq!(named[1].0.id, "sec_run_0");
        assert_eq!(named[2].0.id, "sec_ride_1");
        assert_eq!(named[2].0.name.as_deref(), Some("Segment 2"));
    }
}
