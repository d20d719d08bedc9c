//! End-to-end backfill scenarios over the in-memory storage backend.

use chrono::NaiveDate;
use diststats::core::{
    AppError, JobConfig, JobRecord, JobStatus, JobType, RateLimitConfig, WorkUnit,
};
use diststats::jobs::{BackfillService, CreateJobRequest};
use diststats::snapshot::IndexMaintainer;
use diststats::storage::{MemoryStorageProvider, StorageProvider};
use diststats::upstream::{FetchError, MembershipAnalytics, ScriptedFetcher};
use std::sync::Arc;
use std::time::Duration;

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn fast_limits() -> RateLimitConfig {
    RateLimitConfig {
        max_requests_per_minute: 10_000,
        max_concurrent: 2,
        min_delay_ms: 1,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
    }
}

struct Harness {
    storage: Arc<MemoryStorageProvider>,
    fetcher: Arc<ScriptedFetcher>,
    service: Arc<BackfillService>,
}

async fn harness(limits: RateLimitConfig) -> Harness {
    let storage = Arc::new(MemoryStorageProvider::new());
    let index = Arc::new(IndexMaintainer::new(storage.clone()));
    let fetcher = Arc::new(ScriptedFetcher::new(vec![]));
    let service = BackfillService::initialize(
        storage.clone(),
        index,
        fetcher.clone(),
        Arc::new(MembershipAnalytics),
        limits,
    )
    .await
    .unwrap();
    Harness {
        storage,
        fetcher,
        service,
    }
}

fn collection_request(start: &str, end: &str) -> CreateJobRequest {
    CreateJobRequest {
        job_type: JobType::DataCollection,
        start_date: date(start),
        end_date: date(end),
        district_ids: Some(vec!["A".into(), "B".into()]),
        skip_existing: false,
        rate_limit: None,
    }
}

async fn wait_for<F>(mut probe: F, what: &str)
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..1000 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// The 50ms poll interval also drives virtual time forward in paused-clock
// tests, so the loop spans well past the limiter's 60s window.
async fn wait_terminal(service: &BackfillService, job_id: &str) -> JobRecord {
    let mut last = None;
    for _ in 0..4000 {
        let job = service.get(job_id).await.unwrap();
        if job.status.is_terminal() {
            return job;
        }
        last = Some(job.status);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {} never terminal (last status {:?})", job_id, last);
}

// S1: a three-day, two-district collection runs every unit in order and
// leaves three snapshots plus six index points behind.
#[tokio::test(start_paused = true)]
async fn collection_processes_units_in_order() {
    let h = harness(RateLimitConfig {
        max_requests_per_minute: 4,
        max_concurrent: 2,
        min_delay_ms: 0,
        max_delay_ms: 1_000,
        backoff_multiplier: 2.0,
    })
    .await;

    let job = h
        .service
        .create(collection_request("2024-01-01", "2024-01-03"))
        .await
        .unwrap();
    let done = wait_terminal(&h.service, &job.job_id).await;

    assert_eq!(done.status, JobStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result.succeeded, 6);
    assert_eq!(result.failed, 0);

    assert_eq!(
        h.fetcher.fetch_log(),
        vec![
            "2024-01-01/A",
            "2024-01-01/B",
            "2024-01-02/A",
            "2024-01-02/B",
            "2024-01-03/A",
            "2024-01-03/B",
        ]
    );

    for id in ["2024-01-01", "2024-01-02", "2024-01-03"] {
        let snapshot = h.storage.get_snapshot(id).await.unwrap().unwrap();
        assert_eq!(snapshot.records.len(), 2);
    }
    for district in ["A", "B"] {
        let entry = h
            .storage
            .read_index(district, "2023-2024")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.summary.count, 3);
    }
}

// S2: two upstream 429s on one unit are retried under backoff and the unit
// lands on the third attempt.
#[tokio::test(start_paused = true)]
async fn upstream_rate_limits_are_retried() {
    let h = harness(fast_limits()).await;
    h.fetcher.script(
        date("2024-01-02"),
        "A",
        vec![Err(FetchError::RateLimited), Err(FetchError::RateLimited)],
    );

    let job = h
        .service
        .create(collection_request("2024-01-01", "2024-01-03"))
        .await
        .unwrap();
    let done = wait_terminal(&h.service, &job.job_id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result.unwrap().succeeded, 6);
    assert!(done.progress.errors.is_empty());
    // 6 units plus the two rejected attempts.
    assert_eq!(h.fetcher.fetch_count(), 8);
    let snapshot = h.storage.get_snapshot("2024-01-02").await.unwrap().unwrap();
    assert_eq!(snapshot.records.len(), 2);
}

// Retry exhaustion records a per-unit error and the job keeps going.
#[tokio::test(start_paused = true)]
async fn exhausted_unit_is_recorded_and_skipped() {
    let h = harness(fast_limits()).await;
    h.fetcher.script(
        date("2024-01-01"),
        "B",
        vec![
            Err(FetchError::Transient("503".into())),
            Err(FetchError::Transient("503".into())),
            Err(FetchError::Transient("503".into())),
        ],
    );

    let job = h
        .service
        .create(collection_request("2024-01-01", "2024-01-02"))
        .await
        .unwrap();
    let done = wait_terminal(&h.service, &job.job_id).await;

    assert_eq!(done.status, JobStatus::Completed);
    let result = done.result.unwrap();
    assert_eq!(result.succeeded, 3);
    assert_eq!(result.failed, 1);
    assert_eq!(done.progress.errors.len(), 1);
    assert_eq!(done.progress.errors[0].unit, "2024-01-01/B");
    assert_eq!(done.progress.errors[0].attempts, 3);

    // The day still committed, as a partial snapshot naming the failure.
    let snapshot = h.storage.get_snapshot("2024-01-01").await.unwrap().unwrap();
    assert_eq!(snapshot.records.len(), 1);
    assert_eq!(snapshot.metadata.errors.len(), 1);
}

// S3: cooperative cancel at a unit boundary keeps the finished day, drops the
// in-progress one, and parks the checkpoint on the next unit.
#[tokio::test]
async fn cancel_at_unit_boundary() {
    // Window of 2/min: units 1 and 2 pass, unit 3 blocks in acquire.
    let h = harness(RateLimitConfig {
        max_requests_per_minute: 2,
        max_concurrent: 2,
        min_delay_ms: 0,
        max_delay_ms: 1_000,
        backoff_multiplier: 2.0,
    })
    .await;

    let job = h
        .service
        .create(collection_request("2024-01-01", "2024-01-03"))
        .await
        .unwrap();

    // Day one flushes when the executor moves to unit 3.
    let storage = h.storage.clone();
    wait_for(
        async || storage.get_snapshot("2024-01-01").await.unwrap().is_some(),
        "first snapshot",
    )
    .await;

    assert!(h.service.cancel(&job.job_id).await.unwrap());
    let done = wait_terminal(&h.service, &job.job_id).await;

    assert_eq!(done.status, JobStatus::Cancelled);
    assert!(h.storage.get_snapshot("2024-01-01").await.unwrap().is_some());
    assert!(h.storage.get_snapshot("2024-01-02").await.unwrap().is_none());
    assert_eq!(
        done.checkpoint,
        Some(WorkUnit::Collection {
            date: date("2024-01-02"),
            district_id: "A".into(),
        })
    );
}

// S4: an orphaned running job is recovered on startup and completes exactly
// the units from its checkpoint onward.
#[tokio::test(start_paused = true)]
async fn recovery_resumes_from_checkpoint() {
    let h = harness(fast_limits()).await;

    // A crashed process left this job behind, checkpoint at day two.
    let mut orphan = JobRecord::new(
        "data-collection-orphan",
        JobType::DataCollection,
        JobConfig {
            start_date: date("2024-01-01"),
            end_date: date("2024-01-03"),
            district_ids: Some(vec!["A".into(), "B".into()]),
            skip_existing: false,
            rate_limit: None,
        },
    );
    orphan.status = JobStatus::Running;
    orphan.checkpoint = Some(WorkUnit::Collection {
        date: date("2024-01-02"),
        district_id: "A".into(),
    });
    h.storage.put_job(&orphan).await.unwrap();

    let recovered = h.service.recover_on_startup().await.unwrap();
    assert_eq!(recovered, vec!["data-collection-orphan".to_string()]);

    let done = wait_terminal(&h.service, "data-collection-orphan").await;
    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.resumed_at.is_some());

    // Only the post-checkpoint units were fetched.
    assert_eq!(
        h.fetcher.fetch_log(),
        vec![
            "2024-01-02/A",
            "2024-01-02/B",
            "2024-01-03/A",
            "2024-01-03/B",
        ]
    );
    assert!(h.storage.get_snapshot("2024-01-01").await.unwrap().is_none());
    assert!(h.storage.get_snapshot("2024-01-02").await.unwrap().is_some());
    assert!(h.storage.get_snapshot("2024-01-03").await.unwrap().is_some());
}

// Invariant: resuming from a checkpoint converges to the same stored state as
// an uninterrupted run.
#[tokio::test(start_paused = true)]
async fn resumed_run_matches_uninterrupted_run() {
    // Uninterrupted reference run.
    let reference = harness(fast_limits()).await;
    let job = reference
        .service
        .create(collection_request("2024-01-01", "2024-01-02"))
        .await
        .unwrap();
    wait_terminal(&reference.service, &job.job_id).await;

    // Interrupted run: day one already on disk, checkpoint mid-stream.
    let resumed = harness(fast_limits()).await;
    let first_day = reference
        .storage
        .get_snapshot("2024-01-01")
        .await
        .unwrap()
        .unwrap();
    resumed.storage.put_snapshot(&first_day).await.unwrap();
    let resumed_storage: Arc<dyn StorageProvider> = resumed.storage.clone();
    let index = IndexMaintainer::new(resumed_storage);
    index.apply_snapshot(&first_day).await.unwrap();

    let mut orphan = JobRecord::new(
        "data-collection-resume",
        JobType::DataCollection,
        JobConfig {
            start_date: date("2024-01-01"),
            end_date: date("2024-01-02"),
            district_ids: Some(vec!["A".into(), "B".into()]),
            skip_existing: false,
            rate_limit: None,
        },
    );
    orphan.status = JobStatus::Running;
    orphan.checkpoint = Some(WorkUnit::Collection {
        date: date("2024-01-02"),
        district_id: "A".into(),
    });
    resumed.storage.put_job(&orphan).await.unwrap();
    resumed.service.recover_on_startup().await.unwrap();
    wait_terminal(&resumed.service, "data-collection-resume").await;

    for id in ["2024-01-01", "2024-01-02"] {
        let a = reference.storage.get_snapshot(id).await.unwrap().unwrap();
        let b = resumed.storage.get_snapshot(id).await.unwrap().unwrap();
        assert!(a.same_content(&b), "snapshot {} diverged", id);
    }
    for district in ["A", "B"] {
        let a = reference
            .storage
            .read_index(district, "2023-2024")
            .await
            .unwrap()
            .unwrap();
        let b = resumed
            .storage
            .read_index(district, "2023-2024")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a, b, "index entry for {} diverged", district);
    }
}

// S6: a second job is refused while the first is active.
#[tokio::test]
async fn second_job_refused_while_one_is_active() {
    // 1/min keeps the first job active while we poke at the service.
    let h = harness(RateLimitConfig {
        max_requests_per_minute: 1,
        max_concurrent: 1,
        min_delay_ms: 0,
        max_delay_ms: 1_000,
        backoff_multiplier: 2.0,
    })
    .await;

    let first = h
        .service
        .create(collection_request("2024-01-01", "2024-01-03"))
        .await
        .unwrap();

    let err = h
        .service
        .create(collection_request("2024-02-01", "2024-02-02"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::JobAlreadyRunning(id) if id == first.job_id));

    // The running job is untouched by the rejected create.
    let still_there = h.service.get(&first.job_id).await.unwrap();
    assert!(!still_there.status.is_terminal());

    h.service.force_cancel(&first.job_id, "test").await.unwrap();
}

// Analytics generation walks stored snapshots and writes one artefact each.
#[tokio::test(start_paused = true)]
async fn analytics_job_covers_stored_snapshots() {
    let h = harness(fast_limits()).await;
    let collect = h
        .service
        .create(collection_request("2024-01-01", "2024-01-02"))
        .await
        .unwrap();
    wait_terminal(&h.service, &collect.job_id).await;

    let analytics = h
        .service
        .create(CreateJobRequest {
            job_type: JobType::AnalyticsGeneration,
            start_date: date("2024-01-01"),
            end_date: date("2024-01-31"),
            district_ids: None,
            skip_existing: false,
            rate_limit: None,
        })
        .await
        .unwrap();
    let done = wait_terminal(&h.service, &analytics.job_id).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.result.unwrap().succeeded, 2);
    for id in ["2024-01-01", "2024-01-02"] {
        let artifact = h.storage.get_analytics(id).await.unwrap().unwrap();
        assert_eq!(artifact.districts.len(), 2);
    }
}

// Checkpoint monotonicity observed from the outside while a job runs.
#[tokio::test]
async fn checkpoints_never_move_backwards() {
    let h = harness(RateLimitConfig {
        max_requests_per_minute: 10_000,
        max_concurrent: 1,
        min_delay_ms: 5,
        max_delay_ms: 50,
        backoff_multiplier: 2.0,
    })
    .await;

    let job = h
        .service
        .create(collection_request("2024-01-01", "2024-01-05"))
        .await
        .unwrap();

    let mut seen: Vec<WorkUnit> = Vec::new();
    let mut terminal = false;
    for _ in 0..4000 {
        let current = h.service.get(&job.job_id).await.unwrap();
        if let Some(cp) = current.checkpoint.clone() {
            if let Some(last) = seen.last() {
                assert!(cp >= *last, "checkpoint regressed: {} < {}", cp, last);
            }
            if seen.last() != Some(&cp) {
                seen.push(cp);
            }
        }
        if current.status.is_terminal() {
            terminal = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(terminal);
    assert!(!seen.is_empty());
}
