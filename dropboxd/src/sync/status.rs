use std::fmt;

use time::OffsetDateTime;
use time::macros::format_description;

use super::store::SyncPhase;

const UNITS: &[&str] = &["B", "kB", "MB", "GB", "TB", "PB", "EB"];

/// Snapshot of the persisted engine state, suitable for printing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub pending_add: usize,
    pub pending_update: usize,
    pub pending_delete: usize,
    pub indexed_files: usize,
    pub backup_size: u64,
    pub skipped_files: u64,
    pub unreadable_files: u64,
    pub rejected_files: u64,
    pub last_finished_at: Option<i64>,
    pub sticky_error: Option<String>,
}

impl SyncStatus {
    pub fn pending(&self) -> usize {
        self.pending_add + self.pending_update + self.pending_delete
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Phase: {}", self.phase.as_str())?;
        writeln!(
            f,
            "Pending: add {}, update {}, delete {}",
            self.pending_add, self.pending_update, self.pending_delete
        )?;
        writeln!(f, "Indexed files: {}", self.indexed_files)?;
        if self.backup_size > 0 {
            writeln!(f, "Backup size: {}", format_bytes(self.backup_size))?;
        }
        if self.skipped_files > 0 {
            writeln!(f, "Skipped files: {}", self.skipped_files)?;
        }
        if self.unreadable_files > 0 {
            writeln!(f, "Unreadable files: {}", self.unreadable_files)?;
        }
        if self.rejected_files > 0 {
            writeln!(f, "Rejected by Dropbox: {}", self.rejected_files)?;
        }
        match self.last_finished_at.and_then(format_timestamp) {
            Some(at) => writeln!(f, "Last synchronization: {at}")?,
            None => writeln!(f, "Last synchronization: never")?,
        }
        if let Some(error) = &self.sticky_error {
            writeln!(f, "Error: {error}")?;
        }
        Ok(())
    }
}

/// Owner and quota of the connected account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSummary {
    pub display_name: String,
    pub used: u64,
    pub allocated: u64,
}

impl fmt::Display for AccountSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Owner: {}", self.display_name)?;
        writeln!(
            f,
            "Used space: {} / {}",
            format_bytes(self.used),
            format_bytes(self.allocated)
        )
    }
}

/// Binary-prefixed size rounded to two decimals, e.g. `1.5 kB`.
pub fn format_bytes(size: u64) -> String {
    if size == 0 {
        return "0 B".to_string();
    }
    let mut value = size as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = format!("{value:.2}");
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{trimmed} {}", UNITS[unit])
}

fn format_timestamp(unix: i64) -> Option<String> {
    let at = OffsetDateTime::from_unix_timestamp(unix).ok()?;
    at.format(format_description!(
        "[day].[month].[year] [hour]:[minute] UTC"
    ))
    .ok()
}
