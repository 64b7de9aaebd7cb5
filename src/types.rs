//! Core data types shared across the engine.
//!
//! API-facing structs use camelCase serde names so serialized output matches
//! the host application's conventions. Storage rows stay snake_case inside
//! the store module.

use serde::{Deserialize, Serialize};

// ============================================================================
// Geo primitives
// ============================================================================

/// A GPS coordinate with latitude and longitude.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check that both coordinates are finite and within WGS-84 range.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Bounding box of a track or group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
            && self.min_lng <= other.max_lng
            && self.max_lng >= other.min_lng
    }

    /// Smallest box containing both.
    pub fn union(&self, other: &Bounds) -> Bounds {
        Bounds {
            min_lat: self.min_lat.min(other.min_lat),
            max_lat: self.max_lat.max(other.max_lat),
            min_lng: self.min_lng.min(other.min_lng),
            max_lng: self.max_lng.max(other.max_lng),
        }
    }
}

// ============================================================================
// Activities
// ============================================================================

/// Stored activity metadata (one row in `activities`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    pub sport_type: String,
    /// Unix timestamp (seconds since epoch).
    pub start_date: i64,
    pub name: String,
    /// Total distance in meters.
    pub distance_m: f64,
    /// Moving time in seconds.
    pub moving_time_s: u32,
    /// Elapsed time in seconds.
    pub elapsed_time_s: u32,
    /// Total elevation gain in meters.
    pub elevation_gain_m: f64,
    /// Average heart rate (optional).
    pub avg_hr: Option<u16>,
}

/// Lightweight per-activity entry for map display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapActivity {
    pub activity_id: String,
    pub sport_type: String,
    pub bounds: Bounds,
    pub start_date: i64,
    pub name: String,
    pub distance_m: f64,
    pub moving_time_s: u32,
}

/// Per-activity training metrics, populated by the external fetcher.
///
/// Zone time vectors are seconds-per-zone, already computed against the
/// athlete's sport settings by the collaborator that owns that schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetrics {
    pub activity_id: String,
    /// Training Stress Score.
    pub tss: Option<f64>,
    /// Intensity Factor.
    pub intensity: Option<f64>,
    /// Normalized power in watts.
    pub normalized_power: Option<f64>,
    /// FTP in effect at the time of the activity.
    pub ftp: Option<u16>,
    /// Seconds spent in each power zone.
    pub power_zone_times: Vec<u32>,
    /// Seconds spent in each heart-rate zone.
    pub hr_zone_times: Vec<u32>,
}

/// Full per-activity update delivered by the fetcher: activity metadata plus
/// training metrics, applied in one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityMetricsUpdate {
    pub activity_id: String,
    pub name: String,
    pub start_date: i64,
    pub distance_m: f64,
    pub moving_time_s: u32,
    pub elapsed_time_s: u32,
    pub elevation_gain_m: f64,
    pub avg_hr: Option<u16>,
    pub tss: Option<f64>,
    pub intensity: Option<f64>,
    pub normalized_power: Option<f64>,
    pub ftp: Option<u16>,
    #[serde(default)]
    pub power_zone_times: Vec<u32>,
    #[serde(default)]
    pub hr_zone_times: Vec<u32>,
}

// ============================================================================
// Sections
// ============================================================================

/// Section discriminator: detected automatically or created by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionType {
    Auto,
    Custom,
}

impl SectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionType::Auto => "auto",
            SectionType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(SectionType::Auto),
            "custom" => Some(SectionType::Custom),
            _ => None,
        }
    }
}

/// Detection scale of an auto section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionScale {
    Short,
    Medium,
    Long,
}

impl SectionScale {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionScale::Short => "short",
            SectionScale::Medium => "medium",
            SectionScale::Long => "long",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "short" => Some(SectionScale::Short),
            "medium" => Some(SectionScale::Medium),
            "long" => Some(SectionScale::Long),
            _ => None,
        }
    }
}

/// Direction of a traversal relative to the stored polyline orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Same,
    Reverse,
    Partial,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Same => "same",
            Direction::Reverse => "reverse",
            Direction::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "same" => Some(Direction::Same),
            "reverse" => Some(Direction::Reverse),
            "partial" => Some(Direction::Partial),
            _ => None,
        }
    }
}

/// A frequently-traversed sub-path (auto) or user-created section (custom).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    pub section_type: SectionType,
    pub sport_type: String,
    pub polyline: Vec<GpsPoint>,
    pub distance_m: f64,
    /// Number of traversals across all activities.
    pub visit_count: u32,
    /// Mean pairwise overlap among contributing traces (auto only).
    pub confidence: Option<f64>,
    /// Detection scale (auto only).
    pub scale: Option<SectionScale>,
    /// Auto-generated or user-assigned name.
    pub name: Option<String>,
    /// Activity whose trace the polyline was taken from: the detection
    /// medoid for auto sections, the source activity for custom ones.
    pub representative_id: Option<String>,
    /// Activity the polyline was cut from (custom only).
    pub source_activity_id: Option<String>,
    pub start_index: Option<u32>,
    pub end_index: Option<u32>,
    /// Unix timestamp of creation.
    pub created_at: i64,
    /// Distinct activities traversing this section.
    pub activity_ids: Vec<String>,
}

/// Lightweight section metadata for list views (no polyline).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionSummary {
    pub id: String,
    pub section_type: SectionType,
    pub sport_type: String,
    pub name: Option<String>,
    pub distance_m: f64,
    pub visit_count: u32,
    pub activity_count: u32,
    pub confidence: Option<f64>,
    pub scale: Option<SectionScale>,
    pub bounds: Option<Bounds>,
}

/// One traversal of a section by an activity (one row in
/// `section_activities`). A single activity can contribute several rows when
/// it laps the section more than once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionTraversal {
    pub activity_id: String,
    /// Start index into the activity's full GPS track.
    pub start_index: u32,
    /// End index into the activity's full GPS track (inclusive).
    pub end_index: u32,
    pub direction: Direction,
    /// Fraction of the section's points within the overlap threshold of the
    /// activity's track, 0-100.
    pub match_percentage: f64,
}

// ============================================================================
// Route groups
// ============================================================================

/// A cluster of whole activities sharing the same journey.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteGroup {
    pub id: String,
    pub sport_type: String,
    /// The medoid activity; its signature is the consensus polyline.
    pub representative_id: String,
    pub activity_ids: Vec<String>,
    pub bounds: Option<Bounds>,
    pub custom_name: Option<String>,
}

/// Lightweight group metadata for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub id: String,
    pub sport_type: String,
    pub representative_id: String,
    pub activity_count: u32,
    pub custom_name: Option<String>,
    pub bounds: Option<Bounds>,
}

/// Per-activity match info within a route group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub activity_id: String,
    pub direction: Direction,
    pub match_percentage: f64,
}

// ============================================================================
// Performance results
// ============================================================================

/// A single performance point for route comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePerformance {
    pub activity_id: String,
    pub name: String,
    pub date: i64,
    /// Speed in m/s over the whole activity.
    pub speed: f64,
    /// Moving time in seconds.
    pub moving_time: u32,
    pub distance: f64,
    pub elevation_gain: f64,
    pub avg_hr: Option<u16>,
    pub is_current: bool,
    pub direction: Direction,
    pub match_percentage: Option<f64>,
}

/// Per-direction summary statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectionStats {
    pub avg_time: Option<f64>,
    /// Unix timestamp of most recent traversal in this direction.
    pub last_activity: Option<i64>,
    pub count: u32,
}

/// Complete route performance result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePerformanceResult {
    /// Performances sorted by date (oldest first).
    pub performances: Vec<RoutePerformance>,
    pub best: Option<RoutePerformance>,
    pub best_forward: Option<RoutePerformance>,
    pub best_reverse: Option<RoutePerformance>,
    pub forward_stats: Option<DirectionStats>,
    pub reverse_stats: Option<DirectionStats>,
    /// Current activity's rank (1 = fastest), when requested.
    pub current_rank: Option<u32>,
}

/// A single lap of a section by an activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionLap {
    pub activity_id: String,
    /// Lap time in seconds.
    pub time: f64,
    /// Speed in m/s.
    pub speed: f64,
    /// Pace in seconds per kilometer.
    pub pace_s_per_km: f64,
    /// Lap distance in meters.
    pub distance: f64,
    pub direction: Direction,
    pub start_index: u32,
    pub end_index: u32,
    /// True when no time stream was available and the time is a
    /// proportional estimate.
    pub estimated: bool,
}

/// Section performance record for one activity (all of its laps).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionPerformanceRecord {
    pub activity_id: String,
    pub activity_name: String,
    pub activity_date: i64,
    pub laps: Vec<SectionLap>,
    pub lap_count: u32,
    pub best_time: f64,
    pub avg_time: f64,
    pub direction: Direction,
    pub section_distance: f64,
}

/// Complete section performance result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionPerformanceResult {
    /// Records sorted by date (oldest first).
    pub records: Vec<SectionPerformanceRecord>,
    pub best_record: Option<SectionPerformanceRecord>,
    pub best_forward_record: Option<SectionPerformanceRecord>,
    pub best_reverse_record: Option<SectionPerformanceRecord>,
    pub forward_stats: Option<DirectionStats>,
    pub reverse_stats: Option<DirectionStats>,
}

/// Bucket granularity for performance charts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    Weekly,
    Monthly,
}

impl BucketType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weekly" => Some(BucketType::Weekly),
            "monthly" => Some(BucketType::Monthly),
            _ => None,
        }
    }
}

/// Best traversal within one time bucket, for chart display.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionPerformanceBucket {
    pub activity_id: String,
    pub activity_name: String,
    pub activity_date: i64,
    /// Unix timestamp of the bucket start.
    pub bucket_start: i64,
    pub best_time: f64,
    pub best_speed: f64,
    pub direction: Direction,
    pub is_estimated: bool,
    /// Number of traversals that fell into this bucket.
    pub bucket_count: u32,
}

/// Result of a bucketed section performance query.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionPerformanceBucketResult {
    pub buckets: Vec<SectionPerformanceBucket>,
    /// Total traversals in the date range, not just the bucket count.
    pub total_traversals: u32,
    /// Overall PR, included even when it falls outside the range.
    pub pr_bucket: Option<SectionPerformanceBucket>,
    pub forward_stats: Option<DirectionStats>,
    pub reverse_stats: Option<DirectionStats>,
}

// ============================================================================
// Aggregates
// ============================================================================

/// Totals over a date range (both ends inclusive).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodStats {
    pub activity_count: u32,
    pub total_distance_m: f64,
    pub total_moving_time_s: u64,
    pub total_elevation_gain_m: f64,
    pub total_tss: f64,
}

/// Which metric a monthly roll-up reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonthlyMetric {
    Hours,
    Distance,
    Tss,
}

impl MonthlyMetric {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hours" => Some(MonthlyMetric::Hours),
            "distance" => Some(MonthlyMetric::Distance),
            "tss" => Some(MonthlyMetric::Tss),
            _ => None,
        }
    }
}

/// One month of a yearly roll-up; months with no activity carry 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyAggregate {
    /// Month number 1-12.
    pub month: u32,
    pub value: f64,
}

/// One day of the activity heatmap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapDay {
    /// Unix timestamp of UTC midnight.
    pub day: i64,
    /// Sum of TSS, falling back to moving time for activities without TSS.
    pub intensity: f64,
}

/// Which zone vector a distribution query reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneType {
    Power,
    Hr,
}

impl ZoneType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "power" => Some(ZoneType::Power),
            "hr" => Some(ZoneType::Hr),
            _ => None,
        }
    }
}

/// Seconds per zone index, summed across activities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneDistribution {
    pub zone_type: Option<ZoneType>,
    pub seconds_per_zone: Vec<u64>,
}

/// One FTP observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpPoint {
    pub ftp: u16,
    pub date: i64,
}

/// Latest FTP plus the most recent distinct value before it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FtpTrend {
    pub latest: Option<FtpPoint>,
    pub previous: Option<FtpPoint>,
}

// ============================================================================
// Routes screen / stats
// ============================================================================

/// A group summary plus its consensus polyline, for the routes screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupListItem {
    #[serde(flatten)]
    pub summary: GroupSummary,
    pub consensus_polyline: Vec<GpsPoint>,
}

/// A section summary plus its polyline, for the routes screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionListItem {
    #[serde(flatten)]
    pub summary: SectionSummary,
    pub polyline: Vec<GpsPoint>,
}

/// One-round-trip payload for the routes screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutesScreenData {
    pub groups: Vec<GroupListItem>,
    pub sections: Vec<SectionListItem>,
    pub total_groups: u32,
    pub total_sections: u32,
}

/// Engine statistics snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub activity_count: u32,
    pub gps_track_count: u32,
    pub group_count: u32,
    pub section_count: u32,
    pub groups_dirty: bool,
    pub sections_dirty: bool,
    pub signature_cache_size: u32,
    pub consensus_cache_size: u32,
    pub oldest_date: Option<i64>,
    pub newest_date: Option<i64>,
}

// ============================================================================
// Configuration
// ============================================================================

/// One spatial scale for section detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalePreset {
    pub scale: SectionScale,
    /// Window length in meters.
    pub window_m: f64,
}

/// Configuration for route grouping and section detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    /// Maximum distance between a point and a track to count as overlapping.
    pub overlap_threshold_m: f64,
    /// Minimum symmetric overlap ratio for two activities to share a group.
    pub group_threshold: f64,
    /// Minimum distinct activities for a window to become a section.
    pub min_visits: u32,
    /// Within a scale, merge candidates whose polylines overlap at least
    /// this much.
    pub merge_overlap: f64,
    /// Across scales, prefer the larger scale when it contains the smaller
    /// with at least this overlap.
    pub containment_overlap: f64,
    /// Spatial scales, coarse to fine order is not required.
    pub scales: Vec<ScalePreset>,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            overlap_threshold_m: 50.0,
            group_threshold: 0.80,
            min_visits: 3,
            merge_overlap: 0.7,
            containment_overlap: 0.9,
            scales: vec![
                ScalePreset {
                    scale: SectionScale::Short,
                    window_m: 200.0,
                },
                ScalePreset {
                    scale: SectionScale::Medium,
                    window_m: 1000.0,
                },
                ScalePreset {
                    scale: SectionScale::Long,
                    window_m: 5000.0,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(51.5074, -0.1278).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, f64::NEG_INFINITY).is_valid());
    }

    #[test]
    fn test_bounds_intersects() {
        let a = Bounds {
            min_lat: 0.0,
            max_lat: 1.0,
            min_lng: 0.0,
            max_lng: 1.0,
        };
        let b = Bounds {
            min_lat: 0.5,
            max_lat: 2.0,
            min_lng: 0.5,
            max_lng: 2.0,
        };
        let c = Bounds {
            min_lat: 5.0,
            max_lat: 6.0,
            min_lng: 5.0,
            max_lng: 6.0,
        };
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_bounds_union() {
        let a = Bounds {
            min_lat: 0.0,
            max_lat: 1.0,
            min_lng: 0.0,
            max_lng: 1.0,
        };
        let b = Bounds {
            min_lat: -1.0,
            max_lat: 0.5,
            min_lng: 0.5,
            max_lng: 2.0,
        };
        let u = a.union(&b);
        assert_eq!(u.min_lat, -1.0);
        assert_eq!(u.max_lat, 1.0);
        assert_eq!(u.max_lng, 2.0);
    }

    #[test]
    fn test_enum_round_trips() {
        assert_eq!(Direction::parse("reverse"), Some(Direction::Reverse));
        assert_eq!(Direction::Reverse.as_str(), "reverse");
        assert_eq!(SectionType::parse("custom"), Some(SectionType::Custom));
        assert_eq!(SectionScale::parse("long"), Some(SectionScale::Long));
        assert_eq!(BucketType::parse("monthly"), Some(BucketType::Monthly));
        assert_eq!(MonthlyMetric::parse("hours"), Some(MonthlyMetric::Hours));
        assert_eq!(ZoneType::parse("power"), Some(ZoneType::Power));
        assert!(Direction::parse("sideways").is_none());
    }

    #[test]
    fn test_default_detect_config() {
        let config = DetectConfig::default();
        assert_eq!(config.overlap_threshold_m, 50.0);
        assert_eq!(config.group_threshold, 0.80);
        assert_eq!(config.min_visits, 3);
        assert_eq!(config.scales.len(), 3);
    }
}
