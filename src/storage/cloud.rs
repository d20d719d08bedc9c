//! Object-store-backed storage.
//!
//! Talks to an S3-compatible HTTP object store exposing `GET`/`PUT`/`DELETE`
//! on `{base_url}/{key}` plus key listing via `GET {base_url}?prefix=...`
//! (JSON array of keys). Object keys mirror the filesystem layout of the
//! local backend.
//!
//! Atomicity: individual objects are atomic on the store side, and a
//! snapshot's `metadata.json` is written last with `If-None-Match: *`, so the
//! snapshot only becomes observable once its manifest and district records
//! are already durable. A `412 Precondition Failed` on that conditional put
//! is a lost write race and surfaces as a snapshot conflict.

use crate::core::{
    AnalyticsArtifact, AppError, AppResult, JobRecord, RateLimitConfig, Snapshot, SnapshotFilter,
    SnapshotManifest, SnapshotMetadata, SnapshotStatus, TimeSeriesEntry,
};
use crate::storage::provider::{PutOutcome, StorageProvider};
use async_trait::async_trait;
use futures::future::try_join_all;
use log::warn;
use reqwest::{Client, StatusCode, header::IF_NONE_MATCH};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub struct CloudStorageProvider {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl CloudStorageProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> AppResult<Self> {
        let client = Client::builder()
            .user_agent(concat!("diststats/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Storage(format!("Failed to build object store client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_object<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        let resp = self
            .authorize(self.client.get(self.object_url(key)))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("object store get '{}': {}", key, e)))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let value = resp
                    .json()
                    .await
                    .map_err(|e| AppError::Storage(format!("object store decode '{}': {}", key, e)))?;
                Ok(Some(value))
            }
            s => Err(AppError::Storage(format!(
                "object store get '{}' returned {}",
                key, s
            ))),
        }
    }

    /// `create_only` maps to `If-None-Match: *`; a 412 means another writer
    /// committed the key first.
    async fn put_object<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        create_only: bool,
    ) -> AppResult<bool> {
        let mut req = self.authorize(self.client.put(self.object_url(key))).json(value);
        if create_only {
            req = req.header(IF_NONE_MATCH, "*");
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("object store put '{}': {}", key, e)))?;
        match resp.status() {
            StatusCode::PRECONDITION_FAILED => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(AppError::Storage(format!(
                "object store put '{}' returned {}",
                key, s
            ))),
        }
    }

    async fn delete_object(&self, key: &str) -> AppResult<bool> {
        let resp = self
            .authorize(self.client.delete(self.object_url(key)))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("object store delete '{}': {}", key, e)))?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(AppError::Storage(format!(
                "object store delete '{}' returned {}",
                key, s
            ))),
        }
    }

    async fn list_keys(&self, prefix: &str) -> AppResult<Vec<String>> {
        let resp = self
            .authorize(self.client.get(&self.base_url).query(&[("prefix", prefix)]))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("object store list '{}': {}", prefix, e)))?;
        if !resp.status().is_success() {
            return Err(AppError::Storage(format!(
                "object store list '{}' returned {}",
                prefix,
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| AppError::Storage(format!("object store list decode: {}", e)))
    }
}

fn metadata_key(snapshot_id: &str) -> String {
    format!("snapshots/{}/metadata.json", snapshot_id)
}

fn manifest_key(snapshot_id: &str) -> String {
    format!("snapshots/{}/manifest.json", snapshot_id)
}

fn district_key(snapshot_id: &str, district_id: &str) -> String {
    format!("snapshots/{}/district_{}.json", snapshot_id, district_id)
}

fn index_key(district_id: &str, program_year: &str) -> String {
    format!("time-series/district_{}/{}.json", district_id, program_year)
}

#[async_trait]
impl StorageProvider for CloudStorageProvider {
    fn backend_name(&self) -> &'static str {
        "cloud"
    }

    async fn put_snapshot(&self, snapshot: &Snapshot) -> AppResult<PutOutcome> {
        let snapshot_id = snapshot.id().to_string();

        let mut outcome = PutOutcome::Created;
        if let Some(existing) = self
            .get_object::<SnapshotMetadata>(&metadata_key(&snapshot_id))
            .await?
        {
            if existing.status != SnapshotStatus::Failed {
                return Err(AppError::SnapshotConflict(snapshot_id));
            }
            // Retract the failed attempt before rewriting its objects.
            self.delete_object(&metadata_key(&snapshot_id)).await?;
            let stale = self
                .list_keys(&format!("snapshots/{}/", snapshot_id))
                .await?;
            try_join_all(stale.iter().map(|key| self.delete_object(key))).await?;
            outcome = PutOutcome::Replaced;
        }

        try_join_all(snapshot.records.iter().map(|record| {
            let key = district_key(&snapshot_id, &record.district_id);
            async move { self.put_object(&key, record, false).await }
        }))
        .await?;
        self.put_object(&manifest_key(&snapshot_id), &snapshot.manifest(), false)
            .await?;

        // Commit point: the metadata object, created conditionally.
        if !self
            .put_object(&metadata_key(&snapshot_id), &snapshot.metadata, true)
            .await?
        {
            return Err(AppError::SnapshotConflict(snapshot_id));
        }
        Ok(outcome)
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> AppResult<Option<Snapshot>> {
        let Some(metadata) = self
            .get_object::<SnapshotMetadata>(&metadata_key(snapshot_id))
            .await?
        else {
            return Ok(None);
        };
        let manifest = self
            .get_object::<SnapshotManifest>(&manifest_key(snapshot_id))
            .await?
            .unwrap_or(SnapshotManifest {
                snapshot_id: snapshot_id.to_string(),
                district_ids: Vec::new(),
            });
        let mut records = Vec::with_capacity(manifest.district_ids.len());
        for district_id in &manifest.district_ids {
            match self
                .get_object(&district_key(snapshot_id, district_id))
                .await?
            {
                Some(record) => records.push(record),
                None => warn!(
                    "snapshot {}: manifest names district {} but its record is missing",
                    snapshot_id, district_id
                ),
            }
        }
        Ok(Some(Snapshot { metadata, records }))
    }

    async fn get_snapshot_metadata(
        &self,
        snapshot_id: &str,
    ) -> AppResult<Option<SnapshotMetadata>> {
        self.get_object(&metadata_key(snapshot_id)).await
    }

    async fn list_snapshot_metadata(
        &self,
        filter: &SnapshotFilter,
    ) -> AppResult<Vec<SnapshotMetadata>> {
        let mut out = Vec::new();
        for key in self.list_keys("snapshots/").await? {
            if !key.ends_with("/metadata.json") {
                continue;
            }
            match self.get_object::<SnapshotMetadata>(&key).await {
                Ok(Some(meta)) => {
                    if filter.matches(&meta) {
                        out.push(meta);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable snapshot object '{}': {}", key, e),
            }
        }
        out.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> AppResult<bool> {
        // Metadata first so the snapshot disappears atomically from readers.
        let existed = self.delete_object(&metadata_key(snapshot_id)).await?;
        let keys = self
            .list_keys(&format!("snapshots/{}/", snapshot_id))
            .await?;
        try_join_all(keys.iter().map(|key| self.delete_object(key))).await?;
        Ok(existed)
    }

    async fn list_districts_in_snapshot(&self, snapshot_id: &str) -> AppResult<Vec<String>> {
        Ok(self
            .get_object::<SnapshotManifest>(&manifest_key(snapshot_id))
            .await?
            .map(|m| m.district_ids)
            .unwrap_or_default())
    }

    async fn read_index(
        &self,
        district_id: &str,
        program_year: &str,
    ) -> AppResult<Option<TimeSeriesEntry>> {
        self.get_object(&index_key(district_id, program_year)).await
    }

    async fn write_index(&self, entry: &TimeSeriesEntry) -> AppResult<()> {
        self.put_object(
            &index_key(&entry.district_id, &entry.program_year),
            entry,
            false,
        )
        .await?;
        Ok(())
    }

    async fn delete_index_entry(&self, district_id: &str, program_year: &str) -> AppResult<bool> {
        self.delete_object(&index_key(district_id, program_year))
            .await
    }

    async fn put_analytics(&self, artifact: &AnalyticsArtifact) -> AppResult<()> {
        self.put_object(
            &format!("analytics/{}.json", artifact.snapshot_id),
            artifact,
            false,
        )
        .await?;
        Ok(())
    }

    async fn get_analytics(&self, snapshot_id: &str) -> AppResult<Option<AnalyticsArtifact>> {
        self.get_object(&format!("analytics/{}.json", snapshot_id))
            .await
    }

    async fn delete_analytics(&self, snapshot_id: &str) -> AppResult<bool> {
        self.delete_object(&format!("analytics/{}.json", snapshot_id))
            .await
    }

    async fn put_job(&self, job: &JobRecord) -> AppResult<()> {
        self.put_object(&format!("jobs/{}.json", job.job_id), job, false)
            .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        self.get_object(&format!("jobs/{}.json", job_id)).await
    }

    async fn list_jobs(&self) -> AppResult<Vec<JobRecord>> {
        let mut out = Vec::new();
        for key in self.list_keys("jobs/").await? {
            match self.get_object::<JobRecord>(&key).await {
                Ok(Some(job)) => out.push(job),
                Ok(None) => {}
                Err(e) => warn!("skipping unreadable job object '{}': {}", key, e),
            }
        }
        Ok(out)
    }

    async fn read_rate_limit_config(&self) -> AppResult<Option<RateLimitConfig>> {
        self.get_object("config/rate-limit.json").await
    }

    async fn write_rate_limit_config(&self, config: &RateLimitConfig) -> AppResult<()> {
        self.put_object("config/rate-limit.json", config, false)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_mirror_local_layout() {
        assert_eq!(metadata_key("2024-01-01"), "snapshots/2024-01-01/metadata.json");
        assert_eq!(
            district_key("2024-01-01", "42"),
            "snapshots/2024-01-01/district_42.json"
        );
        assert_eq!(index_key("42", "2023-2024"), "time-series/district_42/2023-2024.json");
    }

    #[test]
    fn base_url_is_normalized() {
        let store = CloudStorageProvider::new("https://store.example.com/bucket/", None).unwrap();
        assert_eq!(
            store.object_url("jobs/a.json"),
            "https://store.example.com/bucket/jobs/a.json"
        );
    }
}
