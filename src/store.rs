use std::{path::Path, sync::Arc, time::Duration, time::Instant};

use anyhow::Context;
use async_trait::async_trait;
use tokio_retry::{strategy::ExponentialBackoff, Retry};

use crate::{
    ledger::{Ledger, Status},
    types::{HarvestError, UploadOutcome},
    utils::{jitter, object_key, SESSION_MARKER},
};

/// The remote durable store, reduced to the two operations the pipeline
/// needs. Keys are opaque; overwriting an existing key is idempotent.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, key: &str) -> anyhow::Result<bool>;
    async fn put(&self, key: &str, local_path: &Path) -> anyhow::Result<()>;
}

/// Blob store spoken to over plain HTTP: HEAD for existence, PUT for
/// transfer. Probes use a short per-request timeout since they run before
/// every transfer decision; transfers get a much longer one.
pub struct HttpStore {
    endpoint: String,
    bucket: String,
    probe_client: reqwest::Client,
    transfer_client: reqwest::Client,
}

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

impl HttpStore {
    pub fn new(endpoint: &str, bucket: &str) -> anyhow::Result<Self> {
        let probe_client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .context("could not build probe client")?;
        let transfer_client = reqwest::Client::builder()
            .timeout(TRANSFER_TIMEOUT)
            .build()
            .context("could not build transfer client")?;

        Ok(HttpStore {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            probe_client,
            transfer_client,
        })
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, key)
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let resp = self
            .probe_client
            .head(self.object_url(key))
            .send()
            .await
            .context(format!("existence probe for {} failed", key))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        Err(HarvestError::StoreStatus(status.as_u16()).into())
    }

    async fn put(&self, key: &str, local_path: &Path) -> anyhow::Result<()> {
        // media files run to gigabytes; the body is streamed from disk, never
        // buffered whole. Each retry attempt reopens the file from the start.
        let file = tokio::fs::File::open(local_path)
            .await
            .context(format!("could not open file at {:?}", local_path))?;
        let len = file
            .metadata()
            .await
            .context(format!("could not stat file at {:?}", local_path))?
            .len();

        let resp = self
            .transfer_client
            .put(self.object_url(key))
            .header("Content-Type", "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(reqwest::Body::from(file))
            .send()
            .await
            .context(format!("transfer of {} failed", key))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(HarvestError::StoreStatus(status.as_u16()).into());
        }
        Ok(())
    }
}

/// Existence-check-then-transfer for one file.
///
/// The probe and the transfer each run under their own capped exponential
/// backoff. An inconclusive probe (all retries exhausted) defaults to
/// assuming the object is absent: a possible duplicate transfer is harmless
/// under the store's overwrite semantics, a stalled pipeline is not. The
/// `optimistic_on_probe_failure` switch makes that policy explicit.
pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    optimistic_on_probe_failure: bool,
    retry_base_ms: u64,
    ledger: Arc<Ledger>,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str, ledger: Arc<Ledger>) -> Self {
        Uploader {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            optimistic_on_probe_failure: true,
            retry_base_ms: 500,
            ledger,
        }
    }

    pub fn optimistic_on_probe_failure(mut self, optimistic: bool) -> Self {
        self.optimistic_on_probe_failure = optimistic;
        self
    }

    /// Shrinks the backoff schedule; used by tests to keep retries fast.
    pub fn retry_base_millis(mut self, ms: u64) -> Self {
        self.retry_base_ms = ms;
        self
    }

    pub fn key_for(&self, relative: &str) -> String {
        object_key(&self.prefix, relative)
    }

    /// Probes for the per-folder marker object a finished earlier run would
    /// have uploaded. Inconclusive probes count as "not there": the worst
    /// case is one redundant download.
    pub async fn marker_exists(&self, folder_name: &str) -> bool {
        let key = self.key_for(&format!("{}/{}", folder_name, SESSION_MARKER));
        match self.probe(&key).await {
            Ok(found) => found,
            Err(e) => {
                warn!("could not check marker {}: {:#}", key, e);
                false
            }
        }
    }

    pub async fn upload(&self, local_path: &Path, relative: &str) -> UploadOutcome {
        let started = Instant::now();
        let key = self.key_for(relative);

        let exists = match self.probe(&key).await {
            Ok(found) => found,
            Err(e) => {
                if self.optimistic_on_probe_failure {
                    warn!(
                        "existence probe for {} inconclusive, assuming absent: {:#}",
                        key, e
                    );
                    false
                } else {
                    let reason = format!("existence probe failed: {:#}", e);
                    self.ledger
                        .record(&key, "", Status::UploadFailed, started, &reason);
                    return UploadOutcome::Failed(reason);
                }
            }
        };

        if exists {
            info!("skipped (already exists): {:?} -> {}", local_path, key);
            return UploadOutcome::AlreadyExisted;
        }

        match self.transfer(&key, local_path).await {
            Ok(()) => {
                info!(
                    "uploaded: {:?} -> {} (took {:.2}s)",
                    local_path,
                    key,
                    started.elapsed().as_secs_f64()
                );
                UploadOutcome::Uploaded
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                error!("failed to upload {:?}: {}", local_path, reason);
                self.ledger
                    .record(&key, "", Status::UploadFailed, started, &reason);
                UploadOutcome::Failed(reason)
            }
        }
    }

    async fn probe(&self, key: &str) -> anyhow::Result<bool> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.retry_base_ms)
            .max_delay(Duration::from_secs(30))
            .map(jitter)
            .take(3);

        Retry::spawn(strategy, || self.store.exists(key)).await
    }

    async fn transfer(&self, key: &str, local_path: &Path) -> anyhow::Result<()> {
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(self.retry_base_ms * 2)
            .max_delay(Duration::from_secs(60))
            .map(jitter)
            .take(4);

        Retry::spawn(strategy, || self.store.put(key, local_path)).await
    }
}
