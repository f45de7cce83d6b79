use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Last known state of a file that is present remotely.
///
/// On the wire this is untagged: a JSON string is a content hash, a JSON
/// integer is a local modification time in Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Freshness {
    /// Hash reported by an authoritative remote listing.
    ContentHash(String),
    /// Local mtime recorded after this engine uploaded or hash-confirmed the file.
    LocalMtime(i64),
}

/// Map from normalized remote path to its [`Freshness`] marker.
///
/// Keys are ordered so that serialized blobs and derived delete lists are
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileIndex {
    entries: BTreeMap<String, Freshness>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Freshness> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, freshness: Freshness) -> Option<Freshness> {
        self.entries.insert(key.into(), freshness)
    }

    pub fn remove(&mut self, key: &str) -> Option<Freshness> {
        self.entries.remove(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Freshness)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, Freshness)> for FileIndex {
    fn from_iter<T: IntoIterator<Item = (String, Freshness)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}
