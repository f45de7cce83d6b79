use std::collections::HashSet;
use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use super::filter::PathFilter;
use super::hasher::hash_file;
use super::index::{FileIndex, Freshness};
use super::paths::{relative_string, remote_key};
use super::queue::UploadQueue;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("sync root {path:?} is not readable: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("scan cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub root: PathBuf,
    pub destination: String,
    pub filter: PathFilter,
    /// Files larger than this many bytes are never uploaded.
    pub size_limit: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub scanned_files: u64,
    pub backup_size: u64,
    pub upload_size: u64,
    pub skipped_files: u64,
    pub unreadable_files: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffOutcome {
    pub queue: UploadQueue,
    pub index: FileIndex,
    pub stats: ScanStats,
}

/// Accumulator threaded through one walk.
struct ScanContext<'a> {
    previous: &'a FileIndex,
    index: FileIndex,
    queue: UploadQueue,
    touched: HashSet<String>,
    // Key prefixes of directories that could not be listed; their previous
    // entries must not turn into deletes.
    unreadable_dirs: Vec<String>,
    stats: ScanStats,
}

impl<'a> ScanContext<'a> {
    fn new(previous: &'a FileIndex) -> Self {
        Self {
            previous,
            index: previous.clone(),
            queue: UploadQueue::default(),
            touched: HashSet::new(),
            unreadable_dirs: Vec::new(),
            stats: ScanStats::default(),
        }
    }

    fn finish(mut self) -> DiffOutcome {
        let touched = &self.touched;
        let unreadable_dirs = &self.unreadable_dirs;
        self.queue.delete = self
            .previous
            .keys()
            .filter(|key| !touched.contains(*key))
            .filter(|key| !unreadable_dirs.iter().any(|dir| key.starts_with(dir.as_str())))
            .map(str::to_string)
            .collect();
        DiffOutcome {
            queue: self.queue,
            index: self.index,
            stats: self.stats,
        }
    }
}

/// Walks `settings.root` depth first and diffs it against `previous`.
///
/// `previous` is not modified. The returned index is a copy of it in which
/// hash-confirmed entries have been replaced by local mtimes; entries are
/// never removed here.
pub fn build_queue(
    settings: &ScanSettings,
    previous: &FileIndex,
    cancel: &AtomicBool,
) -> Result<DiffOutcome, ScanError> {
    let mut ctx = ScanContext::new(previous);
    let root = settings.root.as_path();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_ignored(settings, root, entry));

    for entry in walker {
        if cancel.load(Ordering::Relaxed) {
            return Err(ScanError::Cancelled);
        }
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(ScanError::Root {
                    path: root.to_path_buf(),
                    source: err,
                });
            }
            Err(err) => {
                warn!(error = %err, "cannot read directory entry");
                if let Some(relative) = err.path().and_then(|p| relative_string(root, p)) {
                    ctx.unreadable_dirs
                        .push(format!("{}/", remote_key(&settings.destination, &relative)));
                }
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        // filter_entry already rejected entries without a UTF-8 relative path.
        let Some(relative) = relative_string(root, entry.path()) else {
            continue;
        };
        visit_file(settings, &mut ctx, entry.path(), relative);
    }

    Ok(ctx.finish())
}

fn is_ignored(settings: &ScanSettings, root: &Path, entry: &DirEntry) -> bool {
    match relative_string(root, entry.path()) {
        Some(relative) => settings.filter.should_ignore(&relative),
        None => {
            debug!(path = ?entry.path(), "skipping non UTF-8 path");
            true
        }
    }
}

fn visit_file(settings: &ScanSettings, ctx: &mut ScanContext<'_>, path: &Path, relative: String) {
    let key = remote_key(&settings.destination, &relative);
    if !ctx.touched.insert(key.clone()) {
        // Another local name folds to the same remote path.
        warn!(path = %relative, "skipping file whose remote path collides with another file");
        ctx.stats.skipped_files += 1;
        return;
    }
    ctx.stats.scanned_files += 1;

    let meta = match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return,
        Err(err) => {
            warn!(path = %relative, error = %err, "cannot stat file");
            ctx.stats.unreadable_files += 1;
            return;
        }
    };

    let size = meta.len();
    if size > settings.size_limit {
        // A copy uploaded before the file grew stays in the backup.
        debug!(path = %relative, size, "skipping file above size limit");
        ctx.stats.skipped_files += 1;
        return;
    }
    ctx.stats.backup_size += size;

    let previous = ctx.previous;
    match previous.get(&key) {
        None => {
            ctx.queue.add.push_back(relative);
            ctx.stats.upload_size += size;
        }
        Some(Freshness::ContentHash(remote_hash)) => match hash_file(path) {
            Ok(local_hash) if local_hash.eq_ignore_ascii_case(remote_hash) => {
                match mtime_secs(&meta) {
                    Ok(mtime) => {
                        ctx.index.insert(key, Freshness::LocalMtime(mtime));
                    }
                    Err(err) => {
                        warn!(path = %relative, error = %err, "cannot read modification time");
                    }
                }
            }
            Ok(_) => {
                ctx.queue.update.push_back(relative);
                ctx.stats.upload_size += size;
            }
            Err(err) => {
                warn!(path = %relative, error = %err, "cannot hash file, skipping this pass");
                ctx.stats.unreadable_files += 1;
            }
        },
        Some(Freshness::LocalMtime(stored)) => match mtime_secs(&meta) {
            Ok(mtime) if mtime == *stored => {}
            Ok(_) => {
                ctx.queue.update.push_back(relative);
                ctx.stats.upload_size += size;
            }
            Err(err) => {
                warn!(path = %relative, error = %err, "cannot read modification time");
                ctx.stats.unreadable_files += 1;
            }
        },
    }
}

/// Modification time in whole Unix seconds.
pub fn mtime_secs(meta: &Metadata) -> io::Result<i64> {
    let modified = meta.modified()?;
    Ok(OffsetDateTime::from(modified).unix_timestamp())
}

#[cfg(test)]
#[path = "scanner_tests.rs"]
mod tests;
