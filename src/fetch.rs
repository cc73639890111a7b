use std::{path::Path, sync::Arc, time::Duration, time::Instant};

use anyhow::{anyhow, Context};
use futures::StreamExt;
use tokio::{io::AsyncWriteExt, time::sleep};

use crate::{
    ledger::{Ledger, Status},
    types::HarvestError,
};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64)";

/// Sleep schedule between failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, cap: Duration },
}

/// One retry policy threaded through every network operation instead of an
/// ad-hoc loop per call site. `max_attempts` bounds the total number of tries,
/// not the number of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn exponential(max_attempts: usize, base: Duration, cap: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Exponential { base, cap },
        }
    }

    /// Delay to sleep after the `attempt`-th failure (zero-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => {
                let factor = 2u32.saturating_pow(attempt.min(31) as u32);
                base.saturating_mul(factor).min(cap)
            }
        }
    }
}

/// HTTP GET with classified retries. Page fetches never surface an error to
/// the caller: every terminal failure is logged, written to the ledger and
/// collapsed into `None` so sibling work continues.
pub struct Fetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
    ledger: Arc<Ledger>,
}

impl Fetcher {
    pub fn new(policy: RetryPolicy, timeout: Duration, ledger: Arc<Ledger>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("could not build http client")?;
        Ok(Fetcher {
            client,
            policy,
            ledger,
        })
    }

    /// Fetches one page body.
    ///
    /// Timeouts, connection failures and 5xx responses are retried on the
    /// policy's fixed delay; a 4xx means the resource is permanently gone and
    /// is not retried; anything else aborts this fetch only.
    pub async fn fetch_page(&self, url: &str) -> Option<String> {
        let started = Instant::now();

        for attempt in 0..self.policy.max_attempts {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        match resp.text().await {
                            Ok(body) => {
                                debug!(
                                    "request successful: {} (took {:.2}s)",
                                    url,
                                    started.elapsed().as_secs_f64()
                                );
                                return Some(body);
                            }
                            Err(e) => {
                                error!("could not read body of {}: {}", url, e);
                                self.ledger.record(
                                    url,
                                    "",
                                    Status::RequestFailed,
                                    started,
                                    &format!("body read: {}", e),
                                );
                                return None;
                            }
                        }
                    } else if status.is_server_error() {
                        warn!(
                            "attempt {} for {} failed with {}, retrying in {:?}",
                            attempt + 1,
                            url,
                            status,
                            self.policy.delay_for(attempt)
                        );
                    } else if status.is_client_error() {
                        error!("{} for {}, aborting", status, url);
                        self.ledger.record(
                            url,
                            "",
                            Status::RequestRejected,
                            started,
                            &format!("HTTP {}", status),
                        );
                        return None;
                    } else {
                        error!("unexpected status {} for {}", status, url);
                        self.ledger.record(
                            url,
                            "",
                            Status::RequestFailed,
                            started,
                            &format!("HTTP {}", status),
                        );
                        return None;
                    }
                }
                Err(e) if e.is_timeout() || e.is_connect() => {
                    warn!(
                        "attempt {} for {} failed: {}, retrying in {:?}",
                        attempt + 1,
                        url,
                        e,
                        self.policy.delay_for(attempt)
                    );
                }
                Err(e) => {
                    error!("unexpected error for {}: {}", url, e);
                    self.ledger
                        .record(url, "", Status::RequestFailed, started, &e.to_string());
                    return None;
                }
            }

            if attempt + 1 < self.policy.max_attempts {
                sleep(self.policy.delay_for(attempt)).await;
            }
        }

        self.ledger
            .record(url, "", Status::RequestFailed, started, "max retries exceeded");
        None
    }

    /// Streams one large file to disk under its own (typically exponential)
    /// retry policy. Transport resets mid-body are retryable; a 4xx is
    /// terminal immediately.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        policy: &RetryPolicy,
    ) -> anyhow::Result<()> {
        let mut last_err = None;

        for attempt in 0..policy.max_attempts {
            match self.try_download(url, dest).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if e.downcast_ref::<HarvestError>().is_some() {
                        return Err(e);
                    }
                    warn!("download attempt {} for {} failed: {:#}", attempt + 1, url, e);
                    last_err = Some(e);
                }
            }

            if attempt + 1 < policy.max_attempts {
                let delay = policy.delay_for(attempt);
                info!("retrying {} in {:?}", url, delay);
                sleep(delay).await;
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("download of {} failed", url)))
    }

    async fn try_download(&self, url: &str, dest: &Path) -> anyhow::Result<()> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();

        if status.is_client_error() {
            return Err(HarvestError::ResourceGone(format!("{} returned {}", url, status)).into());
        }
        if !status.is_success() {
            return Err(anyhow!("{} returned {}", url, status));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .context(format!("could not create file at {:?}", dest))?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk)
                .await
                .context(format!("could not write chunk to {:?}", dest))?;
        }
        file.flush()
            .await
            .context(format!("could not flush {:?}", dest))?;

        Ok(())
    }
}
