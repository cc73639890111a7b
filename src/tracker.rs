use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::types::SummarySnapshot;

/// Reference-counted tracking of in-flight files per source directory.
///
/// One mutex guards the whole map and is held only for constant-time map
/// operations, never across IO. `release` removes the folder's entry inside
/// the lock the instant its set empties, so exactly one caller ever observes
/// `true` and the physical delete it then performs outside the lock cannot
/// race a second deleter.
pub struct FolderTracker {
    folders: Mutex<HashMap<PathBuf, HashSet<String>>>,
}

impl FolderTracker {
    pub fn new() -> Self {
        FolderTracker {
            folders: Mutex::new(HashMap::new()),
        }
    }

    /// Marks `file_id` as in-flight under `folder`. Must be called before the
    /// file's upload attempt starts.
    pub fn register(&self, folder: &Path, file_id: &str) {
        let mut folders = self.lock();
        folders
            .entry(folder.to_path_buf())
            .or_insert_with(HashSet::new)
            .insert(file_id.to_string());
    }

    /// Drops `file_id` from `folder`'s in-flight set. Returns `true` when the
    /// set just became empty: the caller now owns the one and only physical
    /// deletion of the directory, performed outside this lock.
    ///
    /// Releasing a file that was never registered is a programming error; it
    /// is logged and never triggers a delete.
    pub fn release(&self, folder: &Path, file_id: &str) -> bool {
        let mut folders = self.lock();
        match folders.get_mut(folder) {
            Some(files) => {
                if !files.remove(file_id) {
                    error!(
                        "release without register for {} in {:?}",
                        file_id, folder
                    );
                    return false;
                }
                if files.is_empty() {
                    folders.remove(folder);
                    return true;
                }
                false
            }
            None => {
                error!("release for untracked folder {:?} ({})", folder, file_id);
                false
            }
        }
    }

    /// Number of files still in flight for `folder`.
    pub fn outstanding(&self, folder: &Path) -> usize {
        self.lock().get(folder).map(|s| s.len()).unwrap_or(0)
    }

    pub fn tracked_folders(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, HashSet<String>>> {
        match self.folders.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for FolderTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct SummaryInner {
    uploaded: u64,
    skipped_duplicates: u64,
    failed: u64,
    folders_processed: u64,
    folders_skipped: HashMap<String, u64>,
}

/// Aggregate counters shared by every worker; the single lock is the only
/// entry point for mutation and is read only after all workers have joined.
pub struct RunSummary {
    inner: Mutex<SummaryInner>,
}

impl RunSummary {
    pub fn new() -> Self {
        RunSummary {
            inner: Mutex::new(SummaryInner::default()),
        }
    }

    pub fn record_uploaded(&self) {
        self.lock().uploaded += 1;
    }

    pub fn record_skipped_duplicate(&self) {
        self.lock().skipped_duplicates += 1;
    }

    pub fn record_failed(&self) {
        self.lock().failed += 1;
    }

    pub fn record_folder_processed(&self) {
        self.lock().folders_processed += 1;
    }

    pub fn record_folder_skipped(&self, reason: &str) {
        *self
            .lock()
            .folders_skipped
            .entry(reason.to_string())
            .or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> SummarySnapshot {
        let inner = self.lock();
        SummarySnapshot {
            uploaded: inner.uploaded,
            skipped_duplicates: inner.skipped_duplicates,
            failed: inner.failed,
            folders_processed: inner.folders_processed,
            folders_skipped: inner.folders_skipped.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SummaryInner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}
