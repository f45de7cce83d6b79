//! Persisted sync state: the file index and upload queue blobs plus a single
//! metadata row, kept in one SQLite database.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool};
use sqlx::{Row, Sqlite, Transaction};
use thiserror::Error;
use time::OffsetDateTime;

use super::index::FileIndex;
use super::queue::UploadQueue;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub const DEFAULT_STATE_LIMIT: usize = 512 * 1024;

const INDEX_BLOB: &str = "file_index";
const QUEUE_BLOB: &str = "upload_queue";
const LENGTH_PREFIX: usize = 4;
// JSON rarely compresses better than this; bounds preallocation on decode.
const MAX_EXPANSION: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("{name} state is {size} bytes, above the {limit} byte limit")]
    TooLarge {
        name: &'static str,
        size: usize,
        limit: usize,
    },
    #[error("{name} state is corrupt: {reason}")]
    Corrupt { name: String, reason: String },
    #[error("invalid sync phase: {0}")]
    InvalidPhase(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPhase {
    #[default]
    Idle,
    Scanning,
    QueueReady,
    Draining,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Scanning => "scanning",
            SyncPhase::QueueReady => "queue_ready",
            SyncPhase::Draining => "draining",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "idle" => Ok(SyncPhase::Idle),
            "scanning" => Ok(SyncPhase::Scanning),
            "queue_ready" => Ok(SyncPhase::QueueReady),
            "draining" => Ok(SyncPhase::Draining),
            other => Err(StoreError::InvalidPhase(other.to_string())),
        }
    }
}

/// Everything about the last runs that is not the index or the queue.
/// Timestamps are Unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMeta {
    pub phase: SyncPhase,
    pub backup_size: u64,
    pub skipped_files: u64,
    pub unreadable_files: u64,
    /// Queue entries the remote refused for their path during this drain.
    pub rejected_files: u64,
    pub last_queue_built_at: Option<i64>,
    pub last_step_at: Option<i64>,
    pub last_finished_at: Option<i64>,
    pub sticky_error: Option<String>,
}

impl SyncMeta {
    /// Latest moment the drain made progress or a queue was handed to it.
    pub fn last_activity(&self) -> Option<i64> {
        self.last_step_at.max(self.last_queue_built_at)
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    pool: SqlitePool,
    limit: usize,
}

impl StateStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            limit: DEFAULT_STATE_LIMIT,
        }
    }

    /// Caps the encoded size of each blob.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::from_pool(pool);
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn load_index(&self) -> Result<FileIndex, StoreError> {
        Ok(self.load_blob(INDEX_BLOB).await?.unwrap_or_default())
    }

    pub async fn load_queue(&self) -> Result<UploadQueue, StoreError> {
        Ok(self.load_blob(QUEUE_BLOB).await?.unwrap_or_default())
    }

    /// Writes index, queue and metadata in one transaction.
    ///
    /// Both blobs are encoded before anything is written, so an oversized
    /// blob leaves the stored state exactly as it was.
    pub async fn save(
        &self,
        index: &FileIndex,
        queue: &UploadQueue,
        meta: &SyncMeta,
    ) -> Result<(), StoreError> {
        let index_blob = encode_blob(INDEX_BLOB, index, self.limit)?;
        let queue_blob = encode_blob(QUEUE_BLOB, queue, self.limit)?;

        let mut tx = self.pool.begin().await?;
        put_blob(&mut tx, INDEX_BLOB, &index_blob).await?;
        put_blob(&mut tx, QUEUE_BLOB, &queue_blob).await?;
        put_meta(&mut tx, meta).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn load_meta(&self) -> Result<SyncMeta, StoreError> {
        let row = sqlx::query(
            "SELECT phase, backup_size, skipped_files, unreadable_files, rejected_files, last_queue_built_at, last_step_at, last_finished_at, sticky_error FROM sync_meta WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(SyncMeta::default());
        };

        let phase: String = row.try_get("phase")?;
        Ok(SyncMeta {
            phase: SyncPhase::parse(&phase)?,
            backup_size: from_db_count(row.try_get("backup_size")?),
            skipped_files: from_db_count(row.try_get("skipped_files")?),
            unreadable_files: from_db_count(row.try_get("unreadable_files")?),
            rejected_files: from_db_count(row.try_get("rejected_files")?),
            last_queue_built_at: row.try_get("last_queue_built_at")?,
            last_step_at: row.try_get("last_step_at")?,
            last_finished_at: row.try_get("last_finished_at")?,
            sticky_error: row.try_get("sticky_error")?,
        })
    }

    pub async fn save_meta(&self, meta: &SyncMeta) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        put_meta(&mut tx, meta).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_sticky_error(&self, error: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE sync_meta SET sticky_error = ?1 WHERE id = 1")
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Forgets everything; the next run starts from a full Sync.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM blobs").execute(&mut *tx).await?;
        put_meta(&mut tx, &SyncMeta::default()).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn load_blob<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StoreError> {
        let row = sqlx::query("SELECT data FROM blobs WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let data: Vec<u8> = row.try_get("data")?;
                decode_blob(name, &data, self.limit).map(Some)
            }
            None => Ok(None),
        }
    }

    #[cfg(test)]
    async fn raw_blob(&self, name: &str) -> Option<Vec<u8>> {
        sqlx::query_scalar("SELECT data FROM blobs WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .unwrap()
    }
}

async fn put_blob(
    tx: &mut Transaction<'_, Sqlite>,
    name: &str,
    data: &[u8],
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO blobs (name, data, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
    )
    .bind(name)
    .bind(data)
    .bind(OffsetDateTime::now_utc().unix_timestamp())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn put_meta(tx: &mut Transaction<'_, Sqlite>, meta: &SyncMeta) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO sync_meta (id, phase, backup_size, skipped_files, unreadable_files, rejected_files, last_queue_built_at, last_step_at, last_finished_at, sticky_error)
         VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
             phase = excluded.phase,
             backup_size = excluded.backup_size,
             skipped_files = excluded.skipped_files,
             unreadable_files = excluded.unreadable_files,
             rejected_files = excluded.rejected_files,
             last_queue_built_at = excluded.last_queue_built_at,
             last_step_at = excluded.last_step_at,
             last_finished_at = excluded.last_finished_at,
             sticky_error = excluded.sticky_error",
    )
    .bind(meta.phase.as_str())
    .bind(to_db_count(meta.backup_size))
    .bind(to_db_count(meta.skipped_files))
    .bind(to_db_count(meta.unreadable_files))
    .bind(to_db_count(meta.rejected_files))
    .bind(meta.last_queue_built_at)
    .bind(meta.last_step_at)
    .bind(meta.last_finished_at)
    .bind(&meta.sticky_error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// `[u32 big-endian JSON length][gzip(JSON)]`
fn encode_blob<T: Serialize>(
    name: &'static str,
    value: &T,
    limit: usize,
) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(value)?;
    let json_len = u32::try_from(json.len()).map_err(|_| StoreError::TooLarge {
        name,
        size: json.len(),
        limit,
    })?;

    let mut out = Vec::with_capacity(LENGTH_PREFIX + json.len() / 4);
    out.extend_from_slice(&json_len.to_be_bytes());
    let mut encoder = GzEncoder::new(out, Compression::default());
    encoder.write_all(&json)?;
    let out = encoder.finish()?;

    if out.len() > limit {
        return Err(StoreError::TooLarge {
            name,
            size: out.len(),
            limit,
        });
    }
    Ok(out)
}

/// The length prefix is untrusted: preallocation is capped and decompression
/// stops one byte past the announced length.
fn decode_blob<T: DeserializeOwned>(
    name: &str,
    data: &[u8],
    limit: usize,
) -> Result<T, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        name: name.to_string(),
        reason,
    };

    let Some((prefix, compressed)) = data.split_first_chunk::<LENGTH_PREFIX>() else {
        return Err(corrupt("missing length prefix".into()));
    };
    let expected = u32::from_be_bytes(*prefix) as usize;

    let mut json = Vec::with_capacity(expected.min(limit.saturating_mul(MAX_EXPANSION)));
    GzDecoder::new(compressed)
        .take(expected as u64 + 1)
        .read_to_end(&mut json)
        .map_err(|err| corrupt(err.to_string()))?;
    if json.len() != expected {
        return Err(corrupt(format!(
            "expected {expected} bytes, decompressed {}",
            json.len()
        )));
    }
    Ok(serde_json::from_slice(&json)?)
}

fn to_db_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn from_db_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let mut path = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    path.push("dropboxd");
    path.push("state.sqlite3");
    Ok(path)
}
