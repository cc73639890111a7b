use std::{collections::HashMap, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("resource_gone: {0}")]
    ResourceGone(String),
    #[error("store_status: unexpected response {0}")]
    StoreStatus(u16),
    #[error("extraction: {0}")]
    Extraction(String),
}

/// Terminal result of pushing one local file to the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded,
    AlreadyExisted,
    Failed(String),
}

/// Classification counters for the meeting entries found on one subpage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MeetingCounts {
    pub private: usize,
    pub unavailable: usize,
    pub total: usize,
}

/// Result of acquiring one archive-bearing resource page.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The archive was downloaded and extracted; the listed media files are
    /// ready to be uploaded out of `folder`.
    Harvested {
        folder: PathBuf,
        files: Vec<PathBuf>,
    },
    /// A marker object for this archive is already on the store, nothing to do.
    AlreadyOnStore,
    /// The page had no retrievable archive (no download link, no media members).
    Skipped(String),
    Failed(String),
}

/// Aggregate counters read once all workers have joined.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SummarySnapshot {
    pub uploaded: u64,
    pub skipped_duplicates: u64,
    pub failed: u64,
    pub folders_processed: u64,
    pub folders_skipped: HashMap<String, u64>,
}

impl SummarySnapshot {
    pub fn folders_skipped_total(&self) -> u64 {
        self.folders_skipped.values().sum()
    }
}
