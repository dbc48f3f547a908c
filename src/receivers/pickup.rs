//! Directory pickup poll target
//!
//! A file is claimed by renaming it to `<name>.processing`. Once the item
//! handler has run, a processed file is deleted and a faulted one is renamed
//! to `<name>.exception`; claims still open when the receiver stops are
//! renamed back. Hidden files and files still being written (`.tmp`,
//! `.part`) are skipped.

use super::scheduled::PollTarget;
use super::ReceivedItem;
use crate::error::ReceiverError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Files taken per poll unless configured otherwise
pub const DEFAULT_MAX_FILES_PER_POLL: usize = 32;

/// Property carrying the picked-up file name
pub const FILE_NAME_PROPERTY: &str = "file_name";

/// Property carrying the path the file was claimed under
pub const CLAIMED_PATH_PROPERTY: &str = "claimed_path";

/// Suffix of files claimed but not yet settled
pub const PROCESSING_SUFFIX: &str = ".processing";

/// Suffix of files whose processing faulted
pub const EXCEPTION_SUFFIX: &str = ".exception";

const SKIPPED_EXTENSIONS: &[&str] = &["tmp", "part", "processing", "exception"];

/// Polls one pickup directory
#[derive(Debug, Clone)]
pub struct DirectoryPollTarget {
    key: String,
    directory: PathBuf,
    max_files_per_poll: usize,
    claimed: Arc<Mutex<HashSet<PathBuf>>>,
}

impl DirectoryPollTarget {
    pub fn new<K: Into<String>, P: Into<PathBuf>>(key: K, directory: P) -> Self {
        Self {
            key: key.into(),
            directory: directory.into(),
            max_files_per_poll: DEFAULT_MAX_FILES_PER_POLL,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_max_files_per_poll(mut self, max: usize) -> Self {
        self.max_files_per_poll = max.max(1);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Number of files claimed and not yet settled
    pub fn claimed_count(&self) -> usize {
        self.claimed_paths().len()
    }

    fn claimed_paths(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.claimed.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn candidates(&self) -> Result<Vec<PathBuf>, ReceiverError> {
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if is_claimable(&path) {
                files.push(path);
            }
        }

        files.sort();
        files.truncate(self.max_files_per_poll);
        Ok(files)
    }

    /// Rename then read; `None` when another poller got there first
    async fn claim(&self, path: &Path) -> Result<Option<ReceivedItem>, ReceiverError> {
        let claimed = with_suffix(path, PROCESSING_SUFFIX);
        match tokio::fs::rename(path, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let body = match tokio::fs::read(&claimed).await {
            Ok(body) => body,
            Err(e) => {
                if let Err(restore) = tokio::fs::rename(&claimed, path).await {
                    warn!(path = %claimed.display(), error = %restore, "Failed to return unreadable file");
                }
                return Err(e.into());
            }
        };
        self.claimed_paths().insert(claimed.clone());

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let message_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_name.clone());

        Ok(Some(
            ReceivedItem::new(self.key.clone(), body)
                .with_message_id(message_id)
                .with_property(FILE_NAME_PROPERTY, file_name)
                .with_property(CLAIMED_PATH_PROPERTY, claimed.to_string_lossy()),
        ))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Path a claimed file had before it was claimed
fn unclaimed_path(claimed: &Path) -> Option<PathBuf> {
    let name = claimed.file_name()?.to_str()?.strip_suffix(PROCESSING_SUFFIX)?;
    Some(claimed.with_file_name(name))
}

fn is_claimable(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true);
    let skipped = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SKIPPED_EXTENSIONS.contains(&e))
        .unwrap_or(false);
    !hidden && !skipped
}

#[async_trait]
impl PollTarget for DirectoryPollTarget {
    fn key(&self) -> &str {
        &self.key
    }

    async fn poll(&self) -> Result<Vec<ReceivedItem>, ReceiverError> {
        let mut items = Vec::new();
        for path in self.candidates().await? {
            match self.claim(&path).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => debug!(path = %path.display(), "File vanished before claim"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to claim file"),
            }
        }
        Ok(items)
    }

    async fn finish_item(&self, item: &ReceivedItem, processed: bool) {
        let Some(claimed) = item.properties.get(CLAIMED_PATH_PROPERTY).map(PathBuf::from) else {
            return;
        };
        if !self.claimed_paths().remove(&claimed) {
            debug!(path = %claimed.display(), "Item was not claimed by this target");
            return;
        }

        if processed {
            if let Err(e) = tokio::fs::remove_file(&claimed).await {
                warn!(path = %claimed.display(), error = %e, "Failed to remove processed file");
            }
            return;
        }

        let original = unclaimed_path(&claimed).unwrap_or_else(|| claimed.clone());
        let parked = with_suffix(&original, EXCEPTION_SUFFIX);
        match tokio::fs::rename(&claimed, &parked).await {
            Ok(()) => info!(path = %parked.display(), "Faulted file set aside"),
            Err(e) => warn!(path = %claimed.display(), error = %e, "Failed to set aside faulted file"),
        }
    }

    fn release_pending(&self) {
        let claimed: Vec<PathBuf> = self.claimed_paths().drain().collect();
        for path in &claimed {
            let Some(original) = unclaimed_path(path) else {
                continue;
            };
            if let Err(e) = std::fs::rename(path, &original) {
                warn!(path = %path.display(), error = %e, "Failed to release claimed file");
            }
        }
        if !claimed.is_empty() {
            info!(target_key = %self.key, released = claimed.len(), "Released unprocessed files");
        }
    }
}
