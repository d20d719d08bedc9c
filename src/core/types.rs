use super::{AppError, AppResult};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Program Year
// ============================================================================

/// A July 1 - June 30 reporting window, labelled `YYYY-YYYY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramYear {
    start_year: i32,
}

impl ProgramYear {
    pub fn starting(start_year: i32) -> Self {
        Self { start_year }
    }

    /// The program year a calendar date falls into: July onward belongs to
    /// the year starting that July, January-June to the year started the
    /// previous July.
    pub fn containing(date: NaiveDate) -> Self {
        let start_year = if date.month() >= 7 {
            date.year()
        } else {
            date.year() - 1
        };
        Self { start_year }
    }

    pub fn label(&self) -> String {
        format!("{}-{}", self.start_year, self.start_year + 1)
    }

    pub fn parse(label: &str) -> AppResult<Self> {
        let (start, end) = label
            .split_once('-')
            .ok_or_else(|| AppError::Validation(format!("invalid program year '{}'", label)))?;
        let start: i32 = start
            .parse()
            .map_err(|_| AppError::Validation(format!("invalid program year '{}'", label)))?;
        let end: i32 = end
            .parse()
            .map_err(|_| AppError::Validation(format!("invalid program year '{}'", label)))?;
        if end != start + 1 {
            return Err(AppError::Validation(format!(
                "program year '{}' must span consecutive years",
                label
            )));
        }
        Ok(Self { start_year: start })
    }
}

impl std::fmt::Display for ProgramYear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Parse a `YYYY-MM-DD` snapshot id into its calendar date.
pub fn parse_snapshot_date(snapshot_id: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(snapshot_id, "%Y-%m-%d")
        .map_err(|_| AppError::Validation(format!("invalid snapshot date '{}'", snapshot_id)))
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Success,
    Partial,
    Failed,
}

/// A collection failure scoped to one district (or the whole snapshot when
/// `district_id` is absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotError {
    pub district_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Date-keyed identifier, `YYYY-MM-DD`.
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub schema_version: u32,
    pub calculation_version: u32,
    pub status: SnapshotStatus,
    #[serde(default)]
    pub errors: Vec<SnapshotError>,
    pub district_count: usize,
}

/// One district's scraped figures for a single snapshot date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictRecord {
    pub district_id: String,
    pub as_of: NaiveDate,
    pub membership: i64,
    pub payment_base: i64,
    pub active_clubs: i64,
    pub distinguished_clubs: i64,
    /// Raw dashboard fields not modelled above; preserved verbatim.
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub snapshot_id: String,
    pub district_ids: Vec<String>,
}

/// Immutable date-keyed capture of the dashboard. Once stored with a
/// non-`failed` status the contents never change; removal is a whole-snapshot
/// cascade delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub records: Vec<DistrictRecord>,
}

impl Snapshot {
    pub fn id(&self) -> &str {
        &self.metadata.snapshot_id
    }

    pub fn date(&self) -> AppResult<NaiveDate> {
        parse_snapshot_date(&self.metadata.snapshot_id)
    }

    pub fn manifest(&self) -> SnapshotManifest {
        let mut district_ids: Vec<String> =
            self.records.iter().map(|r| r.district_id.clone()).collect();
        district_ids.sort();
        SnapshotManifest {
            snapshot_id: self.metadata.snapshot_id.clone(),
            district_ids,
        }
    }

    /// Content equality for idempotent re-writes: everything except the wall
    /// clock stamp has to match.
    pub fn same_content(&self, other: &Snapshot) -> bool {
        let mut a = self.metadata.clone();
        let b = other.metadata.clone();
        a.created_at = b.created_at;
        a == b && self.records == other.records
    }
}

/// Filters accepted by `list_snapshot_metadata`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub status: Option<SnapshotStatus>,
    pub schema_version: Option<u32>,
    pub calculation_version: Option<u32>,
    pub min_district_count: Option<usize>,
    pub limit: Option<usize>,
}

impl SnapshotFilter {
    pub fn matches(&self, meta: &SnapshotMetadata) -> bool {
        let date = match parse_snapshot_date(&meta.snapshot_id) {
            Ok(d) => d,
            Err(_) => return false,
        };
        if let Some(start) = self.start_date {
            if date < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if date > end {
                return false;
            }
        }
        if let Some(status) = self.status {
            if meta.status != status {
                return false;
            }
        }
        if let Some(v) = self.schema_version {
            if meta.schema_version != v {
                return false;
            }
        }
        if let Some(v) = self.calculation_version {
            if meta.calculation_version != v {
                return false;
            }
        }
        if let Some(min) = self.min_district_count {
            if meta.district_count < min {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Time-Series Index
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub snapshot_id: String,
    pub membership: i64,
    pub payment_base: i64,
}

/// Derived stats over one entry's data points. Always recomputed from the
/// points; never patched incrementally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesSummary {
    pub start: i64,
    pub end: i64,
    pub peak: i64,
    pub low: i64,
    pub count: usize,
}

impl SeriesSummary {
    pub fn of(points: &[DataPoint]) -> Self {
        if points.is_empty() {
            return Self::default();
        }
        let values: Vec<i64> = points.iter().map(|p| p.membership).collect();
        Self {
            start: values[0],
            end: values[values.len() - 1],
            peak: values.iter().copied().max().unwrap_or(0),
            low: values.iter().copied().min().unwrap_or(0),
            count: points.len(),
        }
    }
}

/// Per-district, per-program-year index record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesEntry {
    pub district_id: String,
    pub program_year: String,
    pub data_points: Vec<DataPoint>,
    pub summary: SeriesSummary,
}

impl TimeSeriesEntry {
    pub fn new(district_id: impl Into<String>, program_year: ProgramYear) -> Self {
        Self {
            district_id: district_id.into(),
            program_year: program_year.label(),
            data_points: Vec::new(),
            summary: SeriesSummary::default(),
        }
    }

    /// Insert or replace the point for `point.snapshot_id`, keeping the list
    /// sorted by snapshot id and the summary consistent.
    pub fn upsert_point(&mut self, point: DataPoint) {
        self.data_points
            .retain(|p| p.snapshot_id != point.snapshot_id);
        self.data_points.push(point);
        self.data_points
            .sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        self.summary = SeriesSummary::of(&self.data_points);
    }

    /// Drop every point sourced from `snapshot_id`. Returns how many were
    /// removed. An emptied entry keeps existing with a zeroed summary.
    pub fn remove_snapshot(&mut self, snapshot_id: &str) -> usize {
        let before = self.data_points.len();
        self.data_points.retain(|p| p.snapshot_id != snapshot_id);
        let removed = before - self.data_points.len();
        if removed > 0 {
            self.summary = SeriesSummary::of(&self.data_points);
        }
        removed
    }
}

// ============================================================================
// Analytics Artefacts
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictAnalytics {
    pub district_id: String,
    pub membership: i64,
    pub growth_over_base: i64,
    pub distinguished: bool,
}

/// Derived analytics for one snapshot, written by analytics-generation jobs
/// and cascade-deleted with the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsArtifact {
    pub snapshot_id: String,
    pub generated_at: DateTime<Utc>,
    pub calculation_version: u32,
    pub districts: Vec<DistrictAnalytics>,
}

// ============================================================================
// Jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    DataCollection,
    AnalyticsGeneration,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::DataCollection => write!(f, "data-collection"),
            JobType::AnalyticsGeneration => write!(f, "analytics-generation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Recovering,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States counted against the one-active-job invariant.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Running | JobStatus::Recovering
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Recovering => "recovering",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// When set, restricts collection to these districts; otherwise the
    /// upstream roster for each date is used.
    pub district_ids: Option<Vec<String>>,
    #[serde(default)]
    pub skip_existing: bool,
    /// Per-job overrides applied to the process-wide limiter for the job's
    /// duration.
    pub rate_limit: Option<RateLimitPatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitError {
    pub unit: String,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub total_units: usize,
    pub processed_units: usize,
    pub percent: f64,
    pub current_item: Option<String>,
    #[serde(default)]
    pub errors: Vec<UnitError>,
    pub eta_seconds: Option<u64>,
}

impl JobProgress {
    pub fn with_total(total_units: usize) -> Self {
        Self {
            total_units,
            ..Self::default()
        }
    }

    pub fn record_processed(&mut self, current: Option<String>) {
        self.processed_units += 1;
        self.current_item = current;
        self.percent = if self.total_units == 0 {
            100.0
        } else {
            (self.processed_units as f64 / self.total_units as f64) * 100.0
        };
    }
}

/// Smallest indivisible piece of a job's plan. Collection units order by
/// `(date, district_id)`; analytics units by snapshot id. The derived `Ord`
/// matches plan order within a job type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum WorkUnit {
    Collection {
        date: NaiveDate,
        district_id: String,
    },
    Analytics {
        snapshot_id: String,
    },
}

impl std::fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkUnit::Collection { date, district_id } => {
                write!(f, "{}/{}", date.format("%Y-%m-%d"), district_id)
            }
            WorkUnit::Analytics { snapshot_id } => write!(f, "{}", snapshot_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResultSummary {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Durable record of one backfill execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub config: JobConfig,
    pub progress: JobProgress,
    /// Next unprocessed unit in plan order; `None` before the first unit
    /// commits and after the plan is exhausted.
    pub checkpoint: Option<WorkUnit>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub result: Option<JobResultSummary>,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, job_type: JobType, config: JobConfig) -> Self {
        Self {
            job_id: job_id.into(),
            job_type,
            status: JobStatus::Pending,
            config,
            progress: JobProgress::default(),
            checkpoint: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            resumed_at: None,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests_per_minute: u32,
    pub max_concurrent: u32,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 30,
            max_concurrent: 2,
            min_delay_ms: 500,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RateLimitConfig {
    pub fn validate(&self) -> AppResult<()> {
        if self.max_requests_per_minute == 0 {
            return Err(AppError::Validation(
                "max_requests_per_minute must be positive".into(),
            ));
        }
        if self.max_concurrent == 0 {
            return Err(AppError::Validation(
                "max_concurrent must be positive".into(),
            ));
        }
        if self.min_delay_ms > self.max_delay_ms {
            return Err(AppError::Validation(
                "min_delay_ms must not exceed max_delay_ms".into(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(AppError::Validation(
                "backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    pub fn apply(&self, patch: &RateLimitPatch) -> AppResult<Self> {
        let merged = Self {
            max_requests_per_minute: patch
                .max_requests_per_minute
                .unwrap_or(self.max_requests_per_minute),
            max_concurrent: patch.max_concurrent.unwrap_or(self.max_concurrent),
            min_delay_ms: patch.min_delay_ms.unwrap_or(self.min_delay_ms),
            max_delay_ms: patch.max_delay_ms.unwrap_or(self.max_delay_ms),
            backoff_multiplier: patch.backoff_multiplier.unwrap_or(self.backoff_multiplier),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Partial update to the rate-limit configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitPatch {
    pub max_requests_per_minute: Option<u32>,
    pub max_concurrent: Option<u32>,
    pub min_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn point(id: &str, membership: i64) -> DataPoint {
        DataPoint {
            snapshot_id: id.to_string(),
            membership,
            payment_base: membership - 10,
        }
    }

    #[test]
    fn program_year_boundary_is_july_first() {
        assert_eq!(
            ProgramYear::containing(date("2024-06-30")).label(),
            "2023-2024"
        );
        assert_eq!(
            ProgramYear::containing(date("2024-07-01")).label(),
            "2024-2025"
        );
        assert_eq!(
            ProgramYear::containing(date("2024-12-31")).label(),
            "2024-2025"
        );
        assert_eq!(
            ProgramYear::containing(date("2025-01-01")).label(),
            "2024-2025"
        );
    }

    #[test]
    fn program_year_parse_round_trips() {
        let py = ProgramYear::parse("2023-2024").unwrap();
        assert_eq!(py, ProgramYear::starting(2023));
        assert!(ProgramYear::parse("2023-2025").is_err());
        assert!(ProgramYear::parse("nope").is_err());
    }

    #[test]
    fn summary_tracks_sorted_points() {
        let mut entry = TimeSeriesEntry::new("42", ProgramYear::starting(2023));
        entry.upsert_point(point("2024-01-02", 110));
        entry.upsert_point(point("2024-01-01", 100));
        entry.upsert_point(point("2024-01-03", 90));

        assert_eq!(entry.data_points[0].snapshot_id, "2024-01-01");
        assert_eq!(entry.summary.start, 100);
        assert_eq!(entry.summary.end, 90);
        assert_eq!(entry.summary.peak, 110);
        assert_eq!(entry.summary.low, 90);
        assert_eq!(entry.summary.count, 3);
    }

    #[test]
    fn upsert_replaces_point_for_same_snapshot() {
        let mut entry = TimeSeriesEntry::new("42", ProgramYear::starting(2023));
        entry.upsert_point(point("2024-01-01", 100));
        entry.upsert_point(point("2024-01-01", 120));
        assert_eq!(entry.data_points.len(), 1);
        assert_eq!(entry.summary.peak, 120);
    }

    #[test]
    fn removing_all_points_zeroes_summary() {
        let mut entry = TimeSeriesEntry::new("42", ProgramYear::starting(2023));
        entry.upsert_point(point("2024-01-01", 100));
        assert_eq!(entry.remove_snapshot("2024-01-01"), 1);
        assert_eq!(entry.summary, SeriesSummary::default());
        assert_eq!(entry.remove_snapshot("2024-01-01"), 0);
    }

    #[test]
    fn work_units_order_by_date_then_district() {
        let a = WorkUnit::Collection {
            date: date("2024-01-01"),
            district_id: "B".into(),
        };
        let b = WorkUnit::Collection {
            date: date("2024-01-02"),
            district_id: "A".into(),
        };
        let c = WorkUnit::Collection {
            date: date("2024-01-02"),
            district_id: "B".into(),
        };
        assert!(a < b && b < c);
    }

    #[test]
    fn snapshot_content_equality_ignores_created_at() {
        let record = DistrictRecord {
            district_id: "1".into(),
            as_of: date("2024-01-01"),
            membership: 100,
            payment_base: 90,
            active_clubs: 10,
            distinguished_clubs: 2,
            extra: serde_json::Value::Null,
        };
        let make = || Snapshot {
            metadata: SnapshotMetadata {
                snapshot_id: "2024-01-01".into(),
                created_at: Utc::now(),
                schema_version: 1,
                calculation_version: 1,
                status: SnapshotStatus::Success,
                errors: Vec::new(),
                district_count: 1,
            },
            records: vec![record.clone()],
        };
        let a = make();
        let mut b = make();
        assert!(a.same_content(&b));
        b.records[0].membership = 101;
        assert!(!a.same_content(&b));
    }

    #[test]
    fn rate_limit_patch_validates_merged_config() {
        let base = RateLimitConfig::default();
        let ok = base
            .apply(&RateLimitPatch {
                max_concurrent: Some(4),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(ok.max_concurrent, 4);

        let err = base.apply(&RateLimitPatch {
            min_delay_ms: Some(120_000),
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
