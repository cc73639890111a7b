use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use futures::StreamExt;
use tokio::time::sleep;

use crate::{
    archive::ArchiveTransfer,
    catalog::Catalog,
    fetch::{Fetcher, RetryPolicy},
    ledger::{Ledger, Status},
    store::{HttpStore, ObjectStore, Uploader},
    tracker::{FolderTracker, RunSummary},
    types::{AcquireOutcome, SummarySnapshot, UploadOutcome},
};

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct HarvesterOptions {
    /// Root of the paginated catalog.
    root_url: String,
    store_endpoint: String,
    store_bucket: String,
    #[builder(default = "self.default_save_dir()")]
    save_dir: PathBuf,
    #[builder(default = "self.default_ledger_path()")]
    ledger_path: PathBuf,
    #[builder(default = "self.default_key_prefix()")]
    key_prefix: String,
    // coarse session parallelism is kept lower than per-folder file parallelism
    #[builder(default = "3")]
    session_workers: usize,
    #[builder(default = "8")]
    file_workers: usize,
    #[builder(default = "3")]
    page_attempts: usize,
    #[builder(default = "5")]
    page_retry_delay_secs: u64,
    #[builder(default = "120")]
    request_timeout_secs: u64,
    #[builder(default = "5")]
    download_attempts: usize,
    // fixed inter-request delay between subpage fetches within one session
    #[builder(default = "1000")]
    politeness_delay_ms: u64,
    #[builder(default = "true")]
    optimistic_on_probe_failure: bool,
    #[builder(default = "500")]
    upload_retry_base_ms: u64,
}

impl HarvesterOptions {
    pub fn default_builder() -> HarvesterOptionsBuilder {
        HarvesterOptionsBuilder::default()
    }
}

impl HarvesterOptionsBuilder {
    fn default_save_dir(&self) -> PathBuf {
        PathBuf::from("./recordings")
    }
    fn default_ledger_path(&self) -> PathBuf {
        PathBuf::from("harvest_ledger.jsonl")
    }
    fn default_key_prefix(&self) -> String {
        String::from("raw_audio")
    }
}

/// Wires discovery, transfer, upload and cleanup together and fans the work
/// out across two bounded pools: one across sessions, one across the files of
/// a folder. A failing session, archive or file never stops sibling work; the
/// run always joins every worker and reports the aggregate summary.
pub struct Harvester {
    options: HarvesterOptions,
    catalog: Catalog,
    transfer: ArchiveTransfer,
    uploader: Arc<Uploader>,
    tracker: FolderTracker,
    summary: RunSummary,
    ledger: Arc<Ledger>,
}

impl Harvester {
    pub fn new(options: HarvesterOptions) -> anyhow::Result<Self> {
        let store = HttpStore::new(&options.store_endpoint, &options.store_bucket)
            .context("could not build store client")?;
        Self::with_store(options, Arc::new(store))
    }

    /// Builds the pipeline on top of any store implementation.
    pub fn with_store(
        options: HarvesterOptions,
        store: Arc<dyn ObjectStore>,
    ) -> anyhow::Result<Self> {
        let ledger = Arc::new(Ledger::open(&options.ledger_path)?);

        let page_policy = RetryPolicy::fixed(
            options.page_attempts,
            Duration::from_secs(options.page_retry_delay_secs),
        );
        let fetcher = Arc::new(Fetcher::new(
            page_policy,
            Duration::from_secs(options.request_timeout_secs),
            ledger.clone(),
        )?);

        // large-file transfers are more failure-prone than page fetches and
        // warrant a longer, exponential retry budget
        let download_policy = RetryPolicy::exponential(
            options.download_attempts,
            Duration::from_secs(2),
            Duration::from_secs(60),
        );

        let uploader = Arc::new(
            Uploader::new(store, &options.key_prefix, ledger.clone())
                .optimistic_on_probe_failure(options.optimistic_on_probe_failure)
                .retry_base_millis(options.upload_retry_base_ms),
        );

        let catalog = Catalog::new(fetcher.clone(), &options.root_url, ledger.clone());
        let transfer = ArchiveTransfer::new(
            fetcher,
            uploader.clone(),
            &options.save_dir,
            download_policy,
            ledger.clone(),
        );

        Ok(Harvester {
            options,
            catalog,
            transfer,
            uploader,
            tracker: FolderTracker::new(),
            summary: RunSummary::new(),
            ledger,
        })
    }

    pub async fn run(&self) -> anyhow::Result<SummarySnapshot> {
        info!("starting harvest of {}", self.options.root_url);

        tokio::fs::create_dir_all(&self.options.save_dir)
            .await
            .context(format!(
                "could not create save directory {:?}",
                self.options.save_dir
            ))?;

        let sessions = self.discover_sessions().await?;
        info!("found {} sessions to process", sessions.len());

        futures::stream::iter(sessions.iter())
            .for_each_concurrent(self.options.session_workers, |session| {
                self.process_session(session)
            })
            .await;

        let snapshot = self.summary.snapshot();
        info!(
            "harvest complete: {} uploaded, {} duplicates skipped, {} failed, {} folders processed, {} folders skipped",
            snapshot.uploaded,
            snapshot.skipped_duplicates,
            snapshot.failed,
            snapshot.folders_processed,
            snapshot.folders_skipped_total()
        );
        Ok(snapshot)
    }

    /// Sequential walk of the catalog pages. Page numbers must be visited in
    /// order to accumulate the session list before any fan-out begins. Only a
    /// fully unreachable catalog ends the run: individual bad pages just
    /// contribute nothing.
    async fn discover_sessions(&self) -> anyhow::Result<Vec<String>> {
        let total = self.catalog.total_pages(self.catalog.base_url()).await;

        let mut sessions = vec![];
        let mut any_page_ok = false;
        for page in 0..total {
            match self.catalog.session_links(page).await {
                Some(links) => {
                    any_page_ok = true;
                    sessions.extend(links);
                }
                None => error!("failed to parse session links for page {}", page),
            }
        }

        if !any_page_ok {
            return Err(anyhow!(
                "catalog root unreachable, no session list at {}",
                self.options.root_url
            ));
        }
        Ok(sessions)
    }

    async fn process_session(&self, session_url: &str) {
        info!("starting session processing: {}", session_url);
        let session_started = Instant::now();
        let politeness = Duration::from_millis(self.options.politeness_delay_ms);

        let subpages = self.catalog.total_pages(session_url).await;
        for subpage in 0..subpages {
            debug!(
                "processing subpage {}/{} of {}",
                subpage + 1,
                subpages,
                session_url
            );
            let (links, _counts) = self.catalog.audio_links(session_url, subpage).await;
            for link in links {
                self.process_resource(&link).await;
                sleep(politeness).await;
            }
            sleep(politeness).await;
        }

        info!(
            "session completed: {} (took {:.2}s)",
            session_url,
            session_started.elapsed().as_secs_f64()
        );
    }

    async fn process_resource(&self, page_url: &str) {
        let started = Instant::now();

        match self.transfer.acquire(page_url).await {
            AcquireOutcome::Harvested { folder, files } => {
                // every file is registered before any upload starts, so
                // releases can never interleave with registrations
                for file in &files {
                    self.tracker.register(&folder, &file.to_string_lossy());
                }

                let failed_uploads = AtomicU64::new(0);
                futures::stream::iter(files.iter())
                    .for_each_concurrent(self.options.file_workers, |file| {
                        let failed_uploads = &failed_uploads;
                        let folder = &folder;
                        async move {
                            if !self.upload_one(folder, file).await {
                                failed_uploads.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    })
                    .await;

                self.summary.record_folder_processed();
                // a folder only counts as a clean pass when every file made
                // it to the store
                let failures = failed_uploads.load(Ordering::Relaxed);
                if failures == 0 {
                    self.ledger
                        .record(page_url, "", Status::Success, started, "");
                } else {
                    self.ledger.record(
                        page_url,
                        "",
                        Status::UploadFailed,
                        started,
                        &format!("{} of {} uploads failed", failures, files.len()),
                    );
                }
            }
            AcquireOutcome::AlreadyOnStore => {
                self.summary.record_folder_skipped("already_on_store");
            }
            AcquireOutcome::Skipped(reason) => {
                self.summary.record_folder_skipped(&reason);
            }
            AcquireOutcome::Failed(reason) => {
                self.summary.record_folder_skipped(&reason);
            }
        }
    }

    /// One file's full lifecycle: upload, conditional local delete, release,
    /// and the folder delete if this release emptied the tracked set. Every
    /// exit path releases exactly once. Returns whether the file made it to
    /// the store.
    async fn upload_one(&self, folder: &Path, file: &Path) -> bool {
        let file_id = file.to_string_lossy().to_string();
        let relative = match file.strip_prefix(&self.options.save_dir) {
            Ok(rel) => rel.to_string_lossy().to_string(),
            Err(_) => file_id.clone(),
        };

        let on_store = match self.uploader.upload(file, &relative).await {
            UploadOutcome::Uploaded => {
                self.summary.record_uploaded();
                self.remove_local(file).await;
                true
            }
            UploadOutcome::AlreadyExisted => {
                self.summary.record_skipped_duplicate();
                self.remove_local(file).await;
                true
            }
            UploadOutcome::Failed(reason) => {
                // the file stays on disk for inspection, but its reference is
                // released so the rest of the folder can still be reclaimed
                self.summary.record_failed();
                error!("upload failed for {:?}: {}", file, reason);
                false
            }
        };

        if self.tracker.release(folder, &file_id) {
            match tokio::fs::remove_dir_all(folder).await {
                Ok(()) => info!("deleted folder {:?}", folder),
                Err(e) => warn!("could not delete folder {:?}: {}", folder, e),
            }
        }

        on_store
    }

    async fn remove_local(&self, file: &Path) {
        if let Err(e) = tokio::fs::remove_file(file).await {
            warn!("could not delete local file {:?}: {}", file, e);
        }
    }
}
