use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dropbox_core::{DEFAULT_API_URL, DEFAULT_CONTENT_URL, DropboxClient, DropboxError};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use super::filter::{PathFilter, Platform};
use super::index::FileIndex;
use super::paths::PathError;
use super::queue::{Operation, UploadQueue};
use super::remote::{RemoteError, RemoteIndexFetcher};
use super::scanner::{self, DiffOutcome, ScanError, ScanSettings};
use super::status::{AccountSummary, SyncStatus, format_bytes};
use super::store::{StateStore, StoreError, SyncMeta, SyncPhase};
use crate::token_provider::{TokenProvider, TokenProviderError};

pub const FIRST_SYNC_DELAY: Duration = Duration::from_secs(10);
pub const UPLOAD_START_DELAY: Duration = Duration::from_secs(10);
pub const UPLOAD_STEP_DELAY: Duration = Duration::from_secs(1);
pub const MIN_RESYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const STALE_DRAIN_AFTER: Duration = Duration::from_secs(15 * 60);

const DEFAULT_SIZE_LIMIT: u64 = 20 * 1024 * 1024;
const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(90);
const DEFAULT_UPLOAD_RETRY: Duration = Duration::from_secs(60);
const DEFAULT_SYNC_RETRY: Duration = Duration::from_secs(5 * 60);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("state error: {0}")]
    Store(#[from] StoreError),
    #[error("api error: {0}")]
    Api(#[from] DropboxError),
    #[error("remote listing error: {0}")]
    Remote(#[from] RemoteError),
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential error: {0}")]
    Token(#[from] TokenProviderError),
    #[error("scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("run exceeded the {0:?} time limit")]
    TimeLimit(Duration),
}

impl EngineError {
    pub fn is_state_too_large(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::TooLarge { .. }))
    }

    fn api(&self) -> Option<&DropboxError> {
        match self {
            EngineError::Api(err) | EngineError::Remote(RemoteError::Api(err)) => Some(err),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.api()
            .and_then(DropboxError::retry_after_secs)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub sync_root: PathBuf,
    pub destination: String,
    pub filter: PathFilter,
    pub size_limit: u64,
    pub time_limit: Duration,
    pub resync_interval: Duration,
    pub upload_retry: Duration,
    pub sync_retry: Duration,
    pub stale_drain_after: Duration,
    pub api_url: String,
    pub content_url: String,
    pub http_timeout: Duration,
}

impl EngineConfig {
    pub fn new(sync_root: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            sync_root: sync_root.into(),
            destination: destination.into(),
            filter: PathFilter::new("", Platform::current()),
            size_limit: DEFAULT_SIZE_LIMIT,
            time_limit: DEFAULT_TIME_LIMIT,
            resync_interval: MIN_RESYNC_INTERVAL,
            upload_retry: DEFAULT_UPLOAD_RETRY,
            sync_retry: DEFAULT_SYNC_RETRY,
            stale_drain_after: STALE_DRAIN_AFTER,
            api_url: DEFAULT_API_URL.to_string(),
            content_url: DEFAULT_CONTENT_URL.to_string(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }

    /// Never shorter than an hour.
    pub fn resync_interval(&self) -> Duration {
        self.resync_interval.max(MIN_RESYNC_INTERVAL)
    }

    fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            root: self.sync_root.clone(),
            destination: self.destination.clone(),
            filter: self.filter.clone(),
            size_limit: self.size_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimerChange {
    #[default]
    Keep,
    Arm(Duration),
    Disarm,
}

/// Timer changes requested by one invocation. Timers are one-shot: a timer
/// that just fired stays idle unless it is armed again here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Schedule {
    pub sync: TimerChange,
    pub resync: TimerChange,
    pub upload: TimerChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingCredential,
    StickyError,
    DrainInProgress,
}

#[derive(Debug)]
pub enum TickOutcome {
    Skipped(SkipReason),
    QueueBuilt { pending: usize },
    Stepped { operation: Operation, remaining: usize },
    /// Nothing left to upload; `last_finished_at` was recorded.
    Finished,
    Failed(EngineError),
}

#[derive(Debug)]
pub struct Tick {
    pub outcome: TickOutcome,
    pub schedule: Schedule,
}

impl Tick {
    fn new(outcome: TickOutcome, schedule: Schedule) -> Self {
        Self { outcome, schedule }
    }
}

pub struct SyncEngine {
    config: Arc<EngineConfig>,
    store: StateStore,
    tokens: TokenProvider,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, store: StateStore, tokens: TokenProvider) -> Self {
        Self {
            config: Arc::new(config),
            store,
            tokens,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Full sync: re-seeds the index from the remote listing, diffs the local
    /// tree against it and hands the queue to the upload timer.
    pub async fn sync(&self) -> Tick {
        let resync = TimerChange::Arm(self.config.resync_interval());
        let retry = |err: &EngineError| Schedule {
            sync: TimerChange::Arm(self.retry_delay(err, self.config.sync_retry)),
            resync,
            ..Schedule::default()
        };

        let client = match self.client().await {
            Ok(client) => client,
            Err(err) => {
                let schedule = retry(&err);
                return Tick::new(credential_outcome("sync", err), schedule);
            }
        };
        let before = match self.store.load_meta().await {
            Ok(meta) => meta,
            Err(err) => {
                let err = EngineError::from(err);
                let schedule = retry(&err);
                return self.failed("sync", err, schedule);
            }
        };

        info!(destination = %self.config.destination, "sync started");
        let cancel = Arc::new(AtomicBool::new(false));
        let result = self
            .within_limit(self.run_sync(&client, before.clone(), cancel.clone()))
            .await;
        match result {
            Ok(pending) => self.queue_built(pending, resync),
            Err(err) => {
                cancel.store(true, Ordering::Relaxed);
                self.restore_meta(before, &err).await;
                let schedule = if err.is_state_too_large() {
                    Schedule {
                        resync,
                        upload: TimerChange::Disarm,
                        ..Schedule::default()
                    }
                } else {
                    retry(&err)
                };
                self.failed("sync", err, schedule)
            }
        }
    }

    /// Incremental sync against the persisted index, without listing the
    /// remote folder.
    pub async fn resync(&self) -> Tick {
        let resync = TimerChange::Arm(self.config.resync_interval());
        let skip_schedule = Schedule {
            resync,
            ..Schedule::default()
        };

        let meta = match self.store.load_meta().await {
            Ok(meta) => meta,
            Err(err) => return self.failed("resync", err.into(), skip_schedule),
        };
        if let Some(sticky) = &meta.sticky_error {
            warn!(error = %sticky, "resync refused until a full sync succeeds");
            return Tick::new(TickOutcome::Skipped(SkipReason::StickyError), skip_schedule);
        }
        if meta.last_queue_built_at.is_none() {
            info!("no previous sync recorded, running a full sync");
            return self.sync().await;
        }

        let queue = match self.store.load_queue().await {
            Ok(queue) => queue,
            Err(err) => return self.failed("resync", err.into(), skip_schedule),
        };
        if !queue.is_empty() {
            if self.drain_is_stale(&meta) {
                warn!(pending = queue.len(), "upload seems to be stuck, rebuilding the queue");
            } else {
                debug!(pending = queue.len(), "skipping resync, upload has not completed yet");
                return Tick::new(
                    TickOutcome::Skipped(SkipReason::DrainInProgress),
                    skip_schedule,
                );
            }
        }

        if let Err(err) = self.tokens.valid_access_token().await {
            return Tick::new(credential_outcome("resync", err.into()), skip_schedule);
        }

        info!("resync started");
        let cancel = Arc::new(AtomicBool::new(false));
        let result = self
            .within_limit(self.run_resync(meta.clone(), cancel.clone()))
            .await;
        match result {
            Ok(pending) => self.queue_built(pending, resync),
            Err(err) => {
                cancel.store(true, Ordering::Relaxed);
                self.restore_meta(meta, &err).await;
                self.failed("resync", err, skip_schedule)
            }
        }
    }

    /// Performs at most one queued remote operation.
    pub async fn upload_step(&self) -> Tick {
        let meta = match self.store.load_meta().await {
            Ok(meta) => meta,
            Err(err) => {
                let schedule = self.upload_retry_schedule(None);
                return self.failed("upload", err.into(), schedule);
            }
        };
        if let Some(sticky) = &meta.sticky_error {
            warn!(error = %sticky, "upload refused until a full sync succeeds");
            return Tick::new(
                TickOutcome::Skipped(SkipReason::StickyError),
                Schedule {
                    upload: TimerChange::Disarm,
                    ..Schedule::default()
                },
            );
        }

        let client = match self.client().await {
            Ok(client) => client,
            Err(err) => {
                let schedule = self.upload_retry_schedule(Some(&err));
                return Tick::new(credential_outcome("upload", err), schedule);
            }
        };

        match self.within_limit(self.run_step(&client, meta)).await {
            Ok(TickOutcome::Finished) => Tick::new(
                TickOutcome::Finished,
                Schedule {
                    upload: TimerChange::Disarm,
                    ..Schedule::default()
                },
            ),
            Ok(outcome) => Tick::new(
                outcome,
                Schedule {
                    upload: TimerChange::Arm(UPLOAD_STEP_DELAY),
                    ..Schedule::default()
                },
            ),
            Err(err) if err.is_state_too_large() => {
                self.record_sticky(&err).await;
                let schedule = Schedule {
                    upload: TimerChange::Disarm,
                    ..Schedule::default()
                };
                self.failed("upload", err, schedule)
            }
            Err(err) => {
                let schedule = self.upload_retry_schedule(Some(&err));
                self.failed("upload", err, schedule)
            }
        }
    }

    /// Runs a full sync and drains the resulting queue without waiting
    /// between steps. Returns the number of completed operations.
    pub async fn sync_and_drain(&self) -> Result<usize, EngineError> {
        match self.sync().await.outcome {
            TickOutcome::Failed(err) => return Err(err),
            TickOutcome::Skipped(SkipReason::MissingCredential) => {
                return Err(TokenProviderError::Missing.into());
            }
            TickOutcome::Finished => return Ok(0),
            _ => {}
        }

        let mut steps = 0;
        loop {
            match self.upload_step().await.outcome {
                TickOutcome::Stepped { .. } => steps += 1,
                TickOutcome::Finished => return Ok(steps),
                TickOutcome::Failed(err) => return Err(err),
                TickOutcome::Skipped(SkipReason::MissingCredential) => {
                    return Err(TokenProviderError::Missing.into());
                }
                TickOutcome::Skipped(_) | TickOutcome::QueueBuilt { .. } => return Ok(steps),
            }
        }
    }

    /// Drops all persisted state. Used when the engine is deactivated.
    pub async fn reset(&self) -> Result<(), EngineError> {
        self.store.reset().await?;
        info!("sync state cleared");
        Ok(())
    }

    pub async fn status(&self) -> Result<SyncStatus, EngineError> {
        let meta = self.store.load_meta().await?;
        let queue = self.store.load_queue().await?;
        let index = self.store.load_index().await?;
        Ok(SyncStatus {
            phase: meta.phase,
            pending_add: queue.add.len(),
            pending_update: queue.update.len(),
            pending_delete: queue.delete.len(),
            indexed_files: index.len(),
            backup_size: meta.backup_size,
            skipped_files: meta.skipped_files,
            unreadable_files: meta.unreadable_files,
            rejected_files: meta.rejected_files,
            last_finished_at: meta.last_finished_at,
            sticky_error: meta.sticky_error,
        })
    }

    pub async fn account_summary(&self) -> Result<AccountSummary, EngineError> {
        let client = self.client().await?;
        let account = client.get_current_account().await?;
        let usage = client.get_space_usage().await?;
        Ok(AccountSummary {
            display_name: account.name.display_name,
            used: usage.used,
            allocated: usage.allocation.allocated,
        })
    }

    async fn run_sync(
        &self,
        client: &DropboxClient,
        meta: SyncMeta,
        cancel: Arc<AtomicBool>,
    ) -> Result<usize, EngineError> {
        self.mark_phase(&meta, SyncPhase::Scanning).await?;
        let remote = RemoteIndexFetcher::new(client)
            .fetch(&self.config.destination)
            .await?;
        info!(files = remote.len(), "remote folder listed");
        let outcome = self.scan(remote, cancel).await?;
        self.commit_queue(meta, outcome).await
    }

    async fn run_resync(
        &self,
        meta: SyncMeta,
        cancel: Arc<AtomicBool>,
    ) -> Result<usize, EngineError> {
        let index = self.store.load_index().await?;
        self.mark_phase(&meta, SyncPhase::Scanning).await?;
        let outcome = self.scan(index, cancel).await?;
        self.commit_queue(meta, outcome).await
    }

    async fn run_step(
        &self,
        client: &DropboxClient,
        mut meta: SyncMeta,
    ) -> Result<TickOutcome, EngineError> {
        let mut queue = self.store.load_queue().await?;
        let Some(operation) = queue.peek() else {
            meta.phase = SyncPhase::Idle;
            meta.last_finished_at = Some(now_unix());
            self.store.save_meta(&meta).await?;
            info!(backup_size = %format_bytes(meta.backup_size), "upload finished");
            return Ok(TickOutcome::Finished);
        };

        let mut index = self.store.load_index().await?;
        match self.apply(client, &operation, &mut index).await {
            Ok(()) => {}
            Err(EngineError::Api(err)) if err.is_rejected_path() => {
                // Retrying cannot help this entry; anything else aborts the
                // step and leaves the queue as it was.
                warn!(
                    path = %operation.path,
                    kind = ?operation.kind,
                    error = %err,
                    "remote refused this path, dropping it from the queue"
                );
                meta.rejected_files += 1;
            }
            Err(err) => return Err(err),
        }
        queue.complete(operation.kind);

        meta.phase = SyncPhase::Draining;
        meta.last_step_at = Some(now_unix());
        self.store.save(&index, &queue, &meta).await?;
        debug!(
            add = queue.add.len(),
            update = queue.update.len(),
            delete = queue.delete.len(),
            "remaining"
        );
        Ok(TickOutcome::Stepped {
            operation,
            remaining: queue.len(),
        })
    }

    async fn scan(
        &self,
        previous: FileIndex,
        cancel: Arc<AtomicBool>,
    ) -> Result<DiffOutcome, EngineError> {
        let settings = self.config.scan_settings();
        let outcome =
            tokio::task::spawn_blocking(move || scanner::build_queue(&settings, &previous, &cancel))
                .await??;
        Ok(outcome)
    }

    /// Persists the diff result. A successful write also clears any sticky
    /// error left by an earlier oversized state.
    async fn commit_queue(
        &self,
        mut meta: SyncMeta,
        outcome: DiffOutcome,
    ) -> Result<usize, EngineError> {
        let DiffOutcome {
            queue,
            index,
            stats,
        } = outcome;
        let now = now_unix();

        meta.backup_size = stats.backup_size;
        meta.skipped_files = stats.skipped_files;
        meta.unreadable_files = stats.unreadable_files;
        meta.rejected_files = 0;
        meta.last_queue_built_at = Some(now);
        meta.sticky_error = None;
        if queue.is_empty() {
            meta.phase = SyncPhase::Idle;
            meta.last_finished_at = Some(now);
        } else {
            meta.phase = SyncPhase::QueueReady;
        }

        self.store.save(&index, &queue, &meta).await?;
        log_queue(&queue, &index, stats.upload_size, stats.skipped_files);
        Ok(queue.len())
    }

    fn queue_built(&self, pending: usize, resync: TimerChange) -> Tick {
        if pending == 0 {
            info!("everything is up to date");
            return Tick::new(
                TickOutcome::Finished,
                Schedule {
                    resync,
                    upload: TimerChange::Disarm,
                    ..Schedule::default()
                },
            );
        }
        info!(pending, "upload will start in {:?}", UPLOAD_START_DELAY);
        Tick::new(
            TickOutcome::QueueBuilt { pending },
            Schedule {
                resync,
                upload: TimerChange::Arm(UPLOAD_START_DELAY),
                ..Schedule::default()
            },
        )
    }

    async fn mark_phase(&self, meta: &SyncMeta, phase: SyncPhase) -> Result<(), StoreError> {
        let mut marked = meta.clone();
        marked.phase = phase;
        self.store.save_meta(&marked).await
    }

    /// Puts back the metadata from before an aborted run, recording the
    /// sticky error when the run failed on an oversized state.
    async fn restore_meta(&self, mut meta: SyncMeta, err: &EngineError) {
        if err.is_state_too_large() {
            meta.sticky_error = Some(err.to_string());
        }
        if let Err(store_err) = self.store.save_meta(&meta).await {
            error!(error = %store_err, "failed to restore sync metadata");
        }
    }

    async fn record_sticky(&self, err: &EngineError) {
        if let Err(store_err) = self.store.set_sticky_error(Some(&err.to_string())).await {
            error!(error = %store_err, "failed to record sticky error");
        }
    }

    fn drain_is_stale(&self, meta: &SyncMeta) -> bool {
        let Some(last) = meta.last_activity() else {
            return true;
        };
        let stale_after = i64::try_from(self.config.stale_drain_after.as_secs()).unwrap_or(i64::MAX);
        now_unix().saturating_sub(last) >= stale_after
    }

    fn retry_delay(&self, err: &EngineError, base: Duration) -> Duration {
        err.retry_after().map_or(base, |after| after.max(base))
    }

    fn upload_retry_schedule(&self, err: Option<&EngineError>) -> Schedule {
        let delay = match err {
            Some(err) => self.retry_delay(err, self.config.upload_retry),
            None => self.config.upload_retry,
        };
        Schedule {
            upload: TimerChange::Arm(delay),
            ..Schedule::default()
        }
    }

    fn failed(&self, stage: &'static str, err: EngineError, schedule: Schedule) -> Tick {
        if err.is_state_too_large() {
            error!(stage, error = %err, "sync state exceeds the storage limit");
        } else {
            warn!(stage, error = %err, "run aborted, will retry");
        }
        Tick::new(TickOutcome::Failed(err), schedule)
    }

    async fn within_limit<T>(
        &self,
        run: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let limit = self.config.time_limit;
        tokio::time::timeout(limit, run)
            .await
            .unwrap_or(Err(EngineError::TimeLimit(limit)))
    }

    async fn client(&self) -> Result<DropboxClient, EngineError> {
        let token = self.tokens.valid_access_token().await?;
        Ok(DropboxClient::with_base_urls(
            &self.config.api_url,
            &self.config.content_url,
            token,
            self.config.http_timeout,
        )?)
    }
}

fn credential_outcome(stage: &'static str, err: EngineError) -> TickOutcome {
    match err {
        EngineError::Token(TokenProviderError::Missing) => {
            warn!(stage, "no access token configured, skipping");
            TickOutcome::Skipped(SkipReason::MissingCredential)
        }
        err => {
            warn!(stage, error = %err, "cannot obtain access token");
            TickOutcome::Failed(err)
        }
    }
}

fn log_queue(queue: &UploadQueue, index: &FileIndex, upload_size: u64, skipped: u64) {
    info!(
        indexed = index.len(),
        add = queue.add.len(),
        update = queue.update.len(),
        delete = queue.delete.len(),
        upload_size = %format_bytes(upload_size),
        skipped,
        "queue built"
    );
}

pub(crate) fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

#[path = "engine_ops.rs"]
mod ops;

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
