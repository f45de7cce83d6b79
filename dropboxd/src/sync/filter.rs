use std::ffi::OsStr;

const JUNK_FILE_NAMES: &[&str] = &["thumbs.db", ".ds_store"];
const SESSION_SEGMENT: &str = "session";

const WINDOWS_PREFIXES: &[&str] = &["logs", "webfront", "forms", "locale", "tzdata"];
const WINDOWS_EXACT: &[&str] = &["mime.types", "cacert.pem"];
const WINDOWS_EXTENSIONS: &[&str] = &["dll", "exe"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

/// Decides which relative paths are excluded from the backup.
///
/// All comparisons are made on the lowercased path. User filters are literal
/// string prefixes, not path segments: `tmp` also excludes `tmplogs/x`.
#[derive(Debug, Clone)]
pub struct PathFilter {
    prefixes: Vec<String>,
    platform: Platform,
}

impl PathFilter {
    /// Parses a semicolon separated prefix list. Empty entries are dropped.
    pub fn new(filters: &str, platform: Platform) -> Self {
        let prefixes = filters
            .split(';')
            .filter(|filter| !filter.is_empty())
            .map(str::to_lowercase)
            .collect();
        Self { prefixes, platform }
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn should_ignore_os(&self, relative: &OsStr) -> bool {
        match relative.to_str() {
            Some(relative) => self.should_ignore(relative),
            None => true,
        }
    }

    pub fn should_ignore(&self, relative: &str) -> bool {
        let path = relative.to_lowercase();

        if self
            .prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return true;
        }

        // The API rejects these names outright.
        if path.starts_with('\\') {
            return true;
        }

        if path.split('/').next() == Some(SESSION_SEGMENT) {
            return true;
        }

        let base_name = path.rsplit('/').next().unwrap_or_default();
        if JUNK_FILE_NAMES.contains(&base_name) {
            return true;
        }

        if self.platform == Platform::Windows && windows_internal(&path, base_name) {
            return true;
        }

        false
    }
}

fn windows_internal(path: &str, base_name: &str) -> bool {
    if WINDOWS_EXACT.contains(&path) {
        return true;
    }
    if WINDOWS_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
    {
        return true;
    }
    match base_name.rsplit_once('.') {
        Some((stem, extension)) if !stem.is_empty() => WINDOWS_EXTENSIONS.contains(&extension),
        _ => false,
    }
}
