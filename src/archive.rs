use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::Context;
use reqwest::Url;
use scraper::{Html, Selector};
use walkdir::WalkDir;

use crate::{
    fetch::{Fetcher, RetryPolicy},
    ledger::{Ledger, Status},
    store::Uploader,
    types::{AcquireOutcome, HarvestError},
    utils::{derive_folder_name, MEDIA_EXTENSION},
};

lazy_static! {
    static ref DOWNLOAD_LINK: Selector =
        Selector::parse("a#download-all").expect("static selector is valid");
    static ref DATE_SPAN: Selector =
        Selector::parse("span.meeting-details--date").expect("static selector is valid");
    static ref TIME_SPAN: Selector =
        Selector::parse("span.meeting-details--time").expect("static selector is valid");
}

const DEFAULT_ARCHIVE_NAME: &str = "session.zip";

struct DownloadRef {
    href: String,
    filename: String,
    date_text: String,
    time_text: String,
}

/// Download-extract-enumerate for one compressed archive.
///
/// Before touching the network for the archive itself, the store is probed
/// for the folder's marker object: archives a previous run fully uploaded are
/// skipped without re-downloading gigabytes.
pub struct ArchiveTransfer {
    fetcher: Arc<Fetcher>,
    uploader: Arc<Uploader>,
    save_root: PathBuf,
    download_policy: RetryPolicy,
    ledger: Arc<Ledger>,
}

impl ArchiveTransfer {
    pub fn new(
        fetcher: Arc<Fetcher>,
        uploader: Arc<Uploader>,
        save_root: &Path,
        download_policy: RetryPolicy,
        ledger: Arc<Ledger>,
    ) -> Self {
        ArchiveTransfer {
            fetcher,
            uploader,
            save_root: save_root.to_path_buf(),
            download_policy,
            ledger,
        }
    }

    pub async fn acquire(&self, page_url: &str) -> AcquireOutcome {
        let started = Instant::now();

        let body = match self.fetcher.fetch_page(page_url).await {
            Some(b) => b,
            None => return AcquireOutcome::Failed("page_fetch_failed".into()),
        };

        let dref = match parse_download_ref(&body) {
            Some(d) => d,
            None => {
                warn!("no archive download found on {}", page_url);
                self.ledger.record(
                    page_url,
                    "",
                    Status::ArchiveNotFound,
                    started,
                    "no download link found",
                );
                return AcquireOutcome::Skipped("no_download_link".into());
            }
        };

        let folder_name = derive_folder_name(&dref.filename, &dref.date_text, &dref.time_text);

        if self.uploader.marker_exists(&folder_name).await {
            info!("archive already on store: {}", folder_name);
            self.ledger
                .record(page_url, &dref.filename, Status::AlreadyOnStore, started, "");
            return AcquireOutcome::AlreadyOnStore;
        }

        let download_url = match Url::parse(page_url).and_then(|u| u.join(&dref.href)) {
            Ok(u) => u,
            Err(e) => {
                error!("invalid download reference on {}: {}", page_url, e);
                return AcquireOutcome::Failed("invalid_download_url".into());
            }
        };

        let folder = self.save_root.join(&folder_name);
        if let Err(e) = tokio::fs::create_dir_all(&folder).await {
            error!("could not create folder {:?}: {}", folder, e);
            return AcquireOutcome::Failed("filesystem_error".into());
        }
        let zip_path = folder.join(&dref.filename);

        info!("downloading {} to {:?}", download_url, zip_path);
        match self
            .fetcher
            .download_file(download_url.as_str(), &zip_path, &self.download_policy)
            .await
        {
            Ok(()) => {
                self.ledger.record(
                    download_url.as_str(),
                    &dref.filename,
                    Status::DownloadSuccess,
                    started,
                    "",
                );
            }
            Err(e) => {
                error!("failed to download {}: {:#}", download_url, e);
                self.ledger.record(
                    download_url.as_str(),
                    &dref.filename,
                    Status::DownloadFailed,
                    started,
                    &format!("{:#}", e),
                );
                remove_folder(&folder).await;
                return AcquireOutcome::Failed("download_failed".into());
            }
        }

        let zp = zip_path.clone();
        let dest = folder.clone();
        let extracted = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<PathBuf>> {
            extract_archive(&zp, &dest)?;
            // the zip is not the artifact of value, the members are
            std::fs::remove_file(&zp).context(format!("could not delete archive {:?}", zp))?;
            Ok(enumerate_media(&dest))
        })
        .await;

        let files = match extracted {
            Ok(Ok(files)) => files,
            Ok(Err(e)) => {
                error!("failed to extract {:?}: {:#}", zip_path, e);
                self.ledger.record(
                    page_url,
                    &dref.filename,
                    Status::UploadFailed,
                    started,
                    &format!("extraction: {:#}", e),
                );
                remove_folder(&folder).await;
                return AcquireOutcome::Failed("extraction_failed".into());
            }
            Err(e) => {
                error!("extraction task panicked for {:?}: {}", zip_path, e);
                remove_folder(&folder).await;
                return AcquireOutcome::Failed("extraction_failed".into());
            }
        };

        if files.is_empty() {
            info!("no media files in archive from {}", page_url);
            remove_folder(&folder).await;
            return AcquireOutcome::Skipped("no_media_files".into());
        }

        info!("found {} media files in {:?}", files.len(), folder);
        AcquireOutcome::Harvested { folder, files }
    }
}

async fn remove_folder(folder: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(folder).await {
        warn!("could not clean up folder {:?}: {}", folder, e);
    }
}

fn parse_download_ref(html: &str) -> Option<DownloadRef> {
    let document = Html::parse_document(html);
    let link = document.select(&DOWNLOAD_LINK).next()?;
    let href = link.value().attr("href")?.to_string();
    let filename = link
        .value()
        .attr("download")
        .unwrap_or(DEFAULT_ARCHIVE_NAME)
        .to_string();

    let text_of = |sel: &Selector| {
        document
            .select(sel)
            .next()
            .map(|e| e.text().collect::<String>().trim().to_string())
            .unwrap_or_default()
    };

    Some(DownloadRef {
        href,
        filename,
        date_text: text_of(&DATE_SPAN),
        time_text: text_of(&TIME_SPAN),
    })
}

/// Extracts every member of the zip into `dest`, skipping entries whose
/// names would escape it.
fn extract_archive(zip_path: &Path, dest: &Path) -> anyhow::Result<()> {
    let file = std::fs::File::open(zip_path)
        .context(format!("could not open archive at {:?}", zip_path))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| HarvestError::Extraction(format!("{:?}: {}", zip_path, e)))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| HarvestError::Extraction(format!("entry {} of {:?}: {}", i, zip_path, e)))?;

        let out_path = match entry.enclosed_name() {
            Some(p) => dest.join(p),
            None => {
                warn!("skipping entry with unsafe path in {:?}", zip_path);
                continue;
            }
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)
                .context(format!("could not create directory {:?}", out_path))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("could not create directory {:?}", parent))?;
        }
        let mut out = std::fs::File::create(&out_path)
            .context(format!("could not create file {:?}", out_path))?;
        io::copy(&mut entry, &mut out)
            .context(format!("could not write member to {:?}", out_path))?;
    }

    Ok(())
}

/// All media files under `folder`, in a stable order.
fn enumerate_media(folder: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(folder)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case(MEDIA_EXTENSION))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    files
}
