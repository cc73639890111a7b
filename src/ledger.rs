use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::Mutex,
    time::Instant,
};

use anyhow::Context;
use chrono::Local;
use serde::{Deserialize, Serialize};

/// Status tag written alongside every terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    PageCountFailed,
    SessionLinksFailed,
    AudioLinksFailed,
    RequestFailed,
    RequestRejected,
    DownloadSuccess,
    DownloadFailed,
    ArchiveNotFound,
    AlreadyOnStore,
    UploadFailed,
    Success,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: String,
    pub locator: String,
    pub filename: String,
    pub status: Status,
    pub duration_seconds: f64,
    pub error: String,
}

/// Append-only audit trail, one JSON line per terminal event. It is consumed
/// by operators after the run, never by the pipeline itself, so writes are
/// best-effort: an IO failure here logs a warning and the work continues.
pub struct Ledger {
    file: Mutex<File>,
}

impl Ledger {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context(format!("could not open ledger file at {:?}", path))?;
        Ok(Ledger {
            file: Mutex::new(file),
        })
    }

    pub fn record(
        &self,
        locator: &str,
        filename: &str,
        status: Status,
        started: Instant,
        error: &str,
    ) {
        let entry = Entry {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            locator: locator.into(),
            filename: filename.into(),
            status,
            duration_seconds: started.elapsed().as_secs_f64(),
            error: error.into(),
        };

        let line = match serde_json::to_string(&entry) {
            Ok(l) => l,
            Err(e) => {
                warn!("could not serialize ledger entry for {}: {}", locator, e);
                return;
            }
        };

        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{}", line) {
            warn!("could not append ledger entry for {}: {}", locator, e);
        }
    }
}
