use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::sync::engine::{
    EngineConfig, FIRST_SYNC_DELAY, Schedule, SyncEngine, Tick, TickOutcome, TimerChange,
};
use crate::sync::filter::{PathFilter, Platform};
use crate::sync::store::{StateStore, default_db_path};
use crate::token_provider::TokenProvider;

const DEFAULT_SIZE_LIMIT_MB: u64 = 20;
const DEFAULT_RESYNC_MINUTES: u64 = 60;
const DEFAULT_TIME_LIMIT_SECS: u64 = 90;
const DEFAULT_STATE_LIMIT_KB: u64 = 512;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_UPLOAD_RETRY_SECS: u64 = 60;
const DEFAULT_SYNC_RETRY_SECS: u64 = 300;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub active: bool,
    pub sync_root: PathBuf,
    pub destination: String,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub path_filter: String,
    pub size_limit_mb: u64,
    pub resync_minutes: u64,
    pub time_limit: Duration,
    pub state_limit_kb: u64,
    pub state_db: PathBuf,
    pub api_url: Option<String>,
    pub content_url: Option<String>,
    pub http_timeout: Duration,
    pub upload_retry: Duration,
    pub sync_retry: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_vars(|name| std::env::var(name).ok(), &home)
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>, home: &Path) -> anyhow::Result<Self> {
        let var = &var;
        let sync_root = var("DROPBOXD_SYNC_ROOT")
            .filter(|value| !value.trim().is_empty())
            .map(|value| expand_with_home(&value, home))
            .context("DROPBOXD_SYNC_ROOT is not set")?;
        let destination = var("DROPBOXD_DESTINATION")
            .map(|value| value.trim().trim_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .context("DROPBOXD_DESTINATION is not set")?;
        let state_db = match var("DROPBOXD_STATE_DB") {
            Some(value) => expand_with_home(&value, home),
            None => default_db_path().context("cannot resolve the state database path")?,
        };

        Ok(Self {
            active: read_bool(var, "DROPBOXD_ACTIVE", true),
            sync_root,
            destination,
            token: var("DROPBOXD_TOKEN"),
            token_file: var("DROPBOXD_TOKEN_FILE").map(|value| expand_with_home(&value, home)),
            path_filter: var("DROPBOXD_PATH_FILTER").unwrap_or_default(),
            size_limit_mb: read_u64(var, "DROPBOXD_SIZE_LIMIT_MB", DEFAULT_SIZE_LIMIT_MB),
            resync_minutes: read_u64(var, "DROPBOXD_RESYNC_MINUTES", DEFAULT_RESYNC_MINUTES)
                .max(DEFAULT_RESYNC_MINUTES),
            time_limit: Duration::from_secs(read_u64(
                var,
                "DROPBOXD_TIME_LIMIT_SECS",
                DEFAULT_TIME_LIMIT_SECS,
            )),
            state_limit_kb: read_u64(var, "DROPBOXD_STATE_LIMIT_KB", DEFAULT_STATE_LIMIT_KB),
            state_db,
            api_url: var("DROPBOXD_API_URL"),
            content_url: var("DROPBOXD_CONTENT_URL"),
            http_timeout: Duration::from_secs(read_u64(
                var,
                "DROPBOXD_HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            upload_retry: Duration::from_secs(read_u64(
                var,
                "DROPBOXD_UPLOAD_RETRY_SECS",
                DEFAULT_UPLOAD_RETRY_SECS,
            )),
            sync_retry: Duration::from_secs(read_u64(
                var,
                "DROPBOXD_SYNC_RETRY_SECS",
                DEFAULT_SYNC_RETRY_SECS,
            )),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::new(self.sync_root.clone(), self.destination.clone());
        config.filter = PathFilter::new(&self.path_filter, Platform::current());
        config.size_limit = self.size_limit_mb.saturating_mul(1024 * 1024);
        config.time_limit = self.time_limit;
        config.resync_interval = Duration::from_secs(self.resync_minutes.saturating_mul(60));
        config.upload_retry = self.upload_retry;
        config.sync_retry = self.sync_retry;
        config.http_timeout = self.http_timeout;
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }
        if let Some(url) = &self.content_url {
            config.content_url = url.clone();
        }
        config
    }

    pub fn state_limit_bytes(&self) -> usize {
        usize::try_from(self.state_limit_kb.saturating_mul(1024)).unwrap_or(usize::MAX)
    }

    pub fn token_provider(&self) -> TokenProvider {
        TokenProvider::new(self.token.clone(), self.token_file.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Sync,
    ReSync,
    Upload,
}

/// One-shot timers, at most one pending deadline per kind.
#[derive(Debug, Default)]
pub struct TimerTable {
    sync: Option<Instant>,
    resync: Option<Instant>,
    upload: Option<Instant>,
}

impl TimerTable {
    fn slot(&mut self, kind: TimerKind) -> &mut Option<Instant> {
        match kind {
            TimerKind::Sync => &mut self.sync,
            TimerKind::ReSync => &mut self.resync,
            TimerKind::Upload => &mut self.upload,
        }
    }

    pub fn arm(&mut self, kind: TimerKind, after: Duration, now: Instant) {
        *self.slot(kind) = Some(now + after);
    }

    pub fn disarm(&mut self, kind: TimerKind) {
        *self.slot(kind) = None;
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<Instant> {
        match kind {
            TimerKind::Sync => self.sync,
            TimerKind::ReSync => self.resync,
            TimerKind::Upload => self.upload,
        }
    }

    pub fn apply(&mut self, schedule: &Schedule, now: Instant) {
        for (kind, change) in [
            (TimerKind::Sync, schedule.sync),
            (TimerKind::ReSync, schedule.resync),
            (TimerKind::Upload, schedule.upload),
        ] {
            match change {
                TimerChange::Keep => {}
                TimerChange::Arm(after) => self.arm(kind, after, now),
                TimerChange::Disarm => self.disarm(kind),
            }
        }
    }

    /// Earliest armed timer. Ties go to Sync, then ReSync, then Upload.
    pub fn next_due(&self) -> Option<(TimerKind, Instant)> {
        [TimerKind::Sync, TimerKind::ReSync, TimerKind::Upload]
            .into_iter()
            .filter_map(|kind| self.deadline(kind).map(|at| (kind, at)))
            .min_by_key(|(_, at)| *at)
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: SyncEngine,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        let store = StateStore::open(&config.state_db)
            .await
            .with_context(|| format!("failed to open state database at {:?}", config.state_db))?
            .with_limit(config.state_limit_bytes());
        let engine = SyncEngine::new(config.engine_config(), store, config.token_provider());
        Ok(Self { config, engine })
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if !self.config.active {
            self.engine
                .reset()
                .await
                .context("failed to clear sync state")?;
            info!("sync is inactive, state cleared");
            return Ok(());
        }
        if !self.config.sync_root.is_dir() {
            warn!(path = ?self.config.sync_root, "sync root is not a directory, syncs will fail until it exists");
        }

        info!(
            sync_root = ?self.config.sync_root,
            destination = %self.config.destination,
            "started"
        );
        let mut timers = TimerTable::default();
        timers.arm(TimerKind::Sync, FIRST_SYNC_DELAY, Instant::now());

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            let Some((kind, due)) = timers.next_due() else {
                // Nothing armed; only a restart can trigger a new sync.
                (&mut shutdown).await;
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(due) => {}
                _ = &mut shutdown => break,
            }
            timers.disarm(kind);
            let tick = self.fire(kind).await;
            log_tick(kind, &tick);
            timers.apply(&tick.schedule, Instant::now());
        }

        info!("shutting down");
        Ok(())
    }

    pub async fn fire(&self, kind: TimerKind) -> Tick {
        match kind {
            TimerKind::Sync => self.engine.sync().await,
            TimerKind::ReSync => self.engine.resync().await,
            TimerKind::Upload => self.engine.upload_step().await,
        }
    }
}

fn log_tick(kind: TimerKind, tick: &Tick) {
    match &tick.outcome {
        TickOutcome::Stepped { operation, remaining } => {
            tracing::debug!(timer = ?kind, kind = ?operation.kind, path = %operation.path, remaining, "step done");
        }
        TickOutcome::Skipped(reason) => {
            tracing::debug!(timer = ?kind, reason = ?reason, "skipped");
        }
        _ => {}
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
