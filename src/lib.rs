//! # Paceline
//!
//! Persistent, embedded analytics engine for GPS activity tracks. Given a
//! stream of activities (ordered latitude/longitude samples plus metadata),
//! it indexes tracks spatially and temporally, discovers route groups by
//! clustering whole-track similarities, detects frequently-traversed
//! sections at multiple spatial scales, computes per-activity performances
//! on each route and section, and answers aggregate dashboard queries.
//!
//! ## Architecture
//!
//! - **Store**: single-file SQLite database behind a connection pool; GPS
//!   tracks and section polylines persist as Google Encoded Polyline
//!   strings, time streams as little-endian f32 arrays.
//! - **Spatial**: an R-tree over track bounding boxes answers viewport
//!   queries; a segment R-tree powers the polyline-overlap primitive.
//! - **Caches**: LRU caches for track signatures and group consensus
//!   polylines; strictly derived state, transparent to every query.
//! - **Detection**: a cancellable background job discovers sections and
//!   route groups, reporting phase progress and committing atomically.
//! - **Engine**: a process-wide facade with explicit `init`/`clear`/
//!   `teardown`, serialized mutations, and synchronous post-commit topic
//!   notifications.
//!
//! ## Quick start
//!
//! ```no_run
//! use paceline::engine;
//!
//! engine::init("/tmp/paceline.db").unwrap();
//! engine::with_engine(|e| {
//!     e.add_activities(
//!         &["ride-1".to_string()],
//!         &[47.36, 8.54, 47.37, 8.55],
//!         &[0, 2],
//!         &["Ride".to_string()],
//!     )?;
//!     let stats = e.get_stats()?;
//!     println!("{} activities", stats.activity_count);
//!     Ok(())
//! })
//! .unwrap();
//! engine::teardown();
//! ```

pub mod cache;
pub mod codec;
pub mod detect;
pub mod engine;
pub mod error;
pub mod events;
pub mod geo;
pub mod perf;
pub mod spatial;
pub mod store;
pub mod types;

mod state;

pub use engine::{init, is_initialized, teardown, with_engine, Engine};
pub use error::{EngineError, Result};
pub use events::{SubscriptionId, Topic};
pub use spatial::overlap_ratio;
pub use types::{
    Activity, ActivityMetrics, ActivityMetricsUpdate, Bounds, BucketType, DetectConfig,
    Direction, EngineStats, FtpTrend, GpsPoint, GroupSummary, HeatmapDay, MapActivity,
    MonthlyAggregate, MonthlyMetric, PeriodStats, RouteGroup, RoutePerformanceResult,
    RoutesScreenData, ScalePreset, Section, SectionPerformanceBucketResult,
    SectionPerformanceResult, SectionScale, SectionSummary, SectionTraversal, SectionType,
    ZoneDistribution, ZoneType,
};
