//! Scraper interface against the upstream performance dashboard.

use crate::core::DistrictRecord;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("upstream rate limited the request")]
    RateLimited,

    #[error("no data published for this date/district")]
    NotAvailable,

    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("fatal upstream failure: {0}")]
    Fatal(String),
}

impl FetchError {
    /// Transient failures are retried under backoff; the rest are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited | FetchError::Transient(_))
    }
}

/// The scraper dependency. Implementations must be safe to call concurrently
/// up to the limiter's concurrency bound.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    /// District roster visible on the dashboard for a date. Used to plan
    /// collection jobs that do not pin an explicit district filter.
    async fn list_districts(&self, date: NaiveDate) -> Result<Vec<String>, FetchError>;

    /// One district's figures as published for a date.
    async fn fetch(
        &self,
        date: NaiveDate,
        district_id: &str,
    ) -> Result<DistrictRecord, FetchError>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Deserialize)]
struct DashboardRow {
    district_id: String,
    membership: i64,
    payment_base: i64,
    #[serde(default)]
    active_clubs: i64,
    #[serde(default)]
    distinguished_clubs: i64,
    #[serde(default)]
    extra: serde_json::Value,
}

pub struct DashboardFetcher {
    client: Client,
    base_url: String,
}

impl DashboardFetcher {
    pub fn new(base_url: impl Into<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(concat!("diststats/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Fatal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn classify(status: StatusCode) -> FetchError {
        match status {
            StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited,
            StatusCode::NOT_FOUND => FetchError::NotAvailable,
            s if s.is_server_error() => FetchError::Transient(format!("upstream returned {}", s)),
            s => FetchError::Fatal(format!("upstream returned {}", s)),
        }
    }
}

#[async_trait]
impl UpstreamFetcher for DashboardFetcher {
    async fn list_districts(&self, date: NaiveDate) -> Result<Vec<String>, FetchError> {
        let url = format!(
            "{}/api/districts?date={}",
            self.base_url,
            date.format("%Y-%m-%d")
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        resp.json()
            .await
            .map_err(|e| FetchError::Fatal(format!("malformed roster payload: {}", e)))
    }

    async fn fetch(
        &self,
        date: NaiveDate,
        district_id: &str,
    ) -> Result<DistrictRecord, FetchError> {
        let url = format!(
            "{}/api/district-performance?date={}&district={}",
            self.base_url,
            date.format("%Y-%m-%d"),
            district_id
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        let row: DashboardRow = resp
            .json()
            .await
            .map_err(|e| FetchError::Fatal(format!("malformed performance payload: {}", e)))?;
        Ok(DistrictRecord {
            district_id: row.district_id,
            as_of: date,
            membership: row.membership,
            payment_base: row.payment_base,
            active_clubs: row.active_clubs,
            distinguished_clubs: row.distinguished_clubs,
            extra: row.extra,
        })
    }
}

// ============================================================================
// Scripted test double
// ============================================================================

type UnitKey = (NaiveDate, String);

/// Fetcher whose per-`(date, district)` outcomes are queued up front. Once a
/// queue drains, further calls for that key succeed with the default record;
/// keys with no script succeed immediately.
#[derive(Default)]
pub struct ScriptedFetcher {
    districts: Vec<String>,
    scripts: Mutex<HashMap<UnitKey, VecDeque<Result<DistrictRecord, FetchError>>>>,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new(districts: Vec<String>) -> Self {
        Self {
            districts,
            ..Self::default()
        }
    }

    pub fn default_record(date: NaiveDate, district_id: &str) -> DistrictRecord {
        DistrictRecord {
            district_id: district_id.to_string(),
            as_of: date,
            membership: 100,
            payment_base: 90,
            active_clubs: 10,
            distinguished_clubs: 2,
            extra: serde_json::Value::Null,
        }
    }

    /// Queue outcomes consumed by successive `fetch` calls for one unit.
    pub fn script(
        &self,
        date: NaiveDate,
        district_id: &str,
        outcomes: Vec<Result<DistrictRecord, FetchError>>,
    ) {
        self.scripts
            .lock()
            .unwrap()
            .entry((date, district_id.to_string()))
            .or_default()
            .extend(outcomes);
    }

    pub fn fetch_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every `fetch` call in order, rendered `YYYY-MM-DD/district`.
    pub fn fetch_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl UpstreamFetcher for ScriptedFetcher {
    async fn list_districts(&self, _date: NaiveDate) -> Result<Vec<String>, FetchError> {
        Ok(self.districts.clone())
    }

    async fn fetch(
        &self,
        date: NaiveDate,
        district_id: &str,
    ) -> Result<DistrictRecord, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push(format!("{}/{}", date.format("%Y-%m-%d"), district_id));
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&(date, district_id.to_string()))
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(outcome) => outcome,
            None => Ok(Self::default_record(date, district_id)),
        }
    }
}
