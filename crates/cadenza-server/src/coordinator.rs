//! Model availability coordinator.
//!
//! Owns the readiness state of the model artifacts and guarantees that at
//! most one download runs at a time. Two locks are involved:
//!
//! - a short `std::sync::Mutex` around [`Inner`], never held across I/O or
//!   `.await`, so status reads stay cheap while a download is running;
//! - a `tokio::sync::Mutex<()>` serialising download attempts.
//!
//! `completed_attempts` lets a caller that queued behind an attempt tell
//! whether that attempt finished while it waited, so N concurrent triggers
//! result in one fetch and all N observe the same outcome. `ready_epoch`
//! plays the same role for disk checks: a READY state is only demoted by
//! an inspection that started after it was set.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use cadenza_common::{now_ms, ArtifactStatus, ModelReadinessState, ModelStatus};

use crate::artifacts::Artifact;
use crate::fetcher::ArtifactFetcher;
use crate::retry::RetryPolicy;

pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("model download failed: {0}")]
    Download(String),

    #[error("model verification failed: {0}")]
    Verification(String),

    #[error("model download timed out after {0:?}")]
    Timeout(Duration),

    #[error("gave up waiting {0:?} for the in-flight model download")]
    LockTimeout(Duration),
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub retry: RetryPolicy,
    /// Bound on a single fetch + verify attempt.
    pub download_timeout: Duration,
    /// Bound on waiting for another caller's download. `None` waits forever.
    pub lock_wait_timeout: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            lock_wait_timeout: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: ModelReadinessState,
    error: Option<CoordinatorError>,
    completed_attempts: u64,
    /// Bumped every time the state becomes READY.
    ready_epoch: u64,
    download_started_at_ms: Option<u64>,
    ready_at_ms: Option<u64>,
}

impl Inner {
    fn mark_ready(&mut self) {
        self.state = ModelReadinessState::Ready;
        self.error = None;
        self.ready_epoch += 1;
        self.ready_at_ms = Some(now_ms());
    }
}

/// Counters exported on `/metrics`.
#[derive(Debug, Default)]
pub struct DownloadCounters {
    pub started: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    /// Calls into the fetcher, one per attempt that found missing artifacts.
    pub fetches: AtomicU64,
}

pub struct ModelCoordinator {
    artifacts: Vec<Artifact>,
    fetcher: Arc<dyn ArtifactFetcher>,
    config: CoordinatorConfig,
    inner: Mutex<Inner>,
    download_lock: tokio::sync::Mutex<()>,
    pub counters: DownloadCounters,
}

impl ModelCoordinator {
    pub fn new(
        artifacts: Vec<Artifact>,
        fetcher: Arc<dyn ArtifactFetcher>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            artifacts,
            fetcher,
            config,
            inner: Mutex::new(Inner {
                state: ModelReadinessState::NotLoaded,
                error: None,
                completed_attempts: 0,
                ready_epoch: 0,
                download_started_at_ms: None,
                ready_at_ms: None,
            }),
            download_lock: tokio::sync::Mutex::new(()),
            counters: DownloadCounters::default(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn artifacts(&self) -> &[Artifact] {
        &self.artifacts
    }

    /// Current state without touching the disk.
    pub fn state(&self) -> ModelReadinessState {
        self.inner().state
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Readiness plus the on-disk view of every artifact. Never waits on an
    /// in-flight download. A READY state whose directories have gone missing
    /// is demoted to NOT_LOADED so the next caller fetches again.
    pub fn get_status(&self) -> ModelStatus {
        let epoch = self.inner().ready_epoch;
        let artifacts: Vec<ArtifactStatus> = self.artifacts.iter().map(Artifact::inspect).collect();
        if !artifacts.iter().all(|a| a.ready) {
            self.demote_if_current(epoch);
        }

        let inner = self.inner();

        let message = match (&inner.error, inner.state) {
            (Some(err), ModelReadinessState::Failed) => {
                format!("{}: {}", inner.state.describe(), err)
            }
            _ => inner.state.describe().to_string(),
        };

        ModelStatus {
            state: inner.state,
            message,
            error: inner.error.as_ref().map(|e| e.to_string()),
            artifacts,
            completed_attempts: inner.completed_attempts,
            download_started_at_ms: inner.download_started_at_ms,
            ready_at_ms: inner.ready_at_ms,
        }
    }

    /// Marks the models READY if every artifact already verifies on disk.
    /// Returns whether they did. Skipped while a download holds the lock.
    pub fn verify_on_startup(&self) -> bool {
        let Ok(_guard) = self.download_lock.try_lock() else {
            return false;
        };
        if !self.artifacts.iter().all(Artifact::is_ready) {
            tracing::info!("model artifacts not present, they will be fetched on first use");
            return false;
        }
        self.inner().mark_ready();
        tracing::info!("model artifacts verified on disk");
        true
    }

    /// Drops READY back to NOT_LOADED after a disk check found artifacts
    /// missing, unless the state was set READY again after `observed_epoch`
    /// was read. Returns whether it demoted.
    fn demote_if_current(&self, observed_epoch: u64) -> bool {
        let mut inner = self.inner();
        if inner.state != ModelReadinessState::Ready || inner.ready_epoch != observed_epoch {
            return false;
        }
        tracing::warn!("model artifacts disappeared from disk, marking models not loaded");
        inner.state = ModelReadinessState::NotLoaded;
        inner.ready_at_ms = None;
        true
    }

    // -----------------------------------------------------------------------
    // Ensure
    // -----------------------------------------------------------------------

    /// Returns once the models are READY, downloading them if needed.
    ///
    /// A READY state is re-checked against the disk first, so artifacts
    /// deleted behind the server's back are fetched again.
    ///
    /// Concurrent callers share one download. The download itself runs on
    /// its own task, so dropping the returned future (e.g. a client hanging
    /// up) never leaves the state stuck in DOWNLOADING.
    pub async fn ensure_models_available(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        let (ready, epoch) = {
            let inner = self.inner();
            (inner.state == ModelReadinessState::Ready, inner.ready_epoch)
        };
        if ready {
            if self.artifacts.iter().all(Artifact::is_ready) {
                return Ok(());
            }
            self.demote_if_current(epoch);
        }
        let seen = self.inner().completed_attempts;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.ensure_locked(seen).await })
            .await
            .unwrap_or_else(|e| Err(CoordinatorError::Download(format!("download task aborted: {e}"))))
    }

    /// Starts a download in the background if models are not READY.
    pub fn spawn_preload(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.ensure_models_available().await {
                tracing::error!(error=%e, "model preload failed");
            }
        });
    }

    async fn ensure_locked(&self, seen: u64) -> Result<(), CoordinatorError> {
        let _guard = match self.config.lock_wait_timeout {
            Some(limit) => tokio::time::timeout(limit, self.download_lock.lock())
                .await
                .map_err(|_| CoordinatorError::LockTimeout(limit))?,
            None => self.download_lock.lock().await,
        };

        {
            let mut inner = self.inner();
            match inner.state {
                ModelReadinessState::Ready => return Ok(()),
                ModelReadinessState::Failed if inner.completed_attempts != seen => {
                    // The attempt we queued behind failed; report its error
                    // instead of starting another one.
                    return Err(inner
                        .error
                        .clone()
                        .unwrap_or_else(|| CoordinatorError::Download("unknown error".into())));
                }
                _ => {}
            }
            inner.state = ModelReadinessState::Downloading;
            inner.download_started_at_ms = Some(now_ms());
        }
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(fetcher = self.fetcher.name(), "model download started");

        let mut attempt_guard = AttemptGuard { coordinator: self, finished: false };
        let outcome = self
            .config
            .retry
            .run("model_download", |attempt| self.attempt(attempt))
            .await;
        attempt_guard.finished = true;
        self.finish(&outcome);
        outcome
    }

    /// One bounded verify → fetch → verify pass.
    async fn attempt(&self, attempt: u32) -> Result<(), CoordinatorError> {
        let limit = self.config.download_timeout;
        match tokio::time::timeout(limit, self.fetch_and_verify(attempt)).await {
            Ok(res) => res,
            Err(_) => Err(CoordinatorError::Timeout(limit)),
        }
    }

    async fn fetch_and_verify(&self, attempt: u32) -> Result<(), CoordinatorError> {
        let missing: Vec<Artifact> = self
            .artifacts
            .iter()
            .filter(|a| !a.is_ready())
            .cloned()
            .collect();
        if missing.is_empty() {
            tracing::info!("model artifacts already present");
            return Ok(());
        }

        let names: Vec<&str> = missing.iter().map(|a| a.name.as_str()).collect();
        tracing::info!(attempt, artifacts=?names, "fetching model artifacts");
        self.counters.fetches.fetch_add(1, Ordering::Relaxed);
        self.fetcher
            .fetch(&missing)
            .await
            .map_err(|e| CoordinatorError::Download(e.to_string()))?;

        self.verify()
    }

    fn verify(&self) -> Result<(), CoordinatorError> {
        let problems: Vec<String> = self
            .artifacts
            .iter()
            .map(Artifact::inspect)
            .filter(|s| !s.ready)
            .map(|s| {
                if s.exists {
                    format!("{} ({}) is empty", s.name, s.path)
                } else {
                    format!("{} ({}) is missing", s.name, s.path)
                }
            })
            .collect();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoordinatorError::Verification(problems.join("; ")))
        }
    }

    fn finish(&self, outcome: &Result<(), CoordinatorError>) {
        let mut inner = self.inner();
        inner.completed_attempts += 1;
        inner.download_started_at_ms = None;
        match outcome {
            Ok(()) => {
                inner.mark_ready();
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!("models ready");
            }
            Err(e) => {
                inner.state = ModelReadinessState::Failed;
                inner.error = Some(e.clone());
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error=%e, "model download failed");
            }
        }
    }
}

/// Moves the state to FAILED if a download unwinds before recording its
/// outcome.
struct AttemptGuard<'a> {
    coordinator: &'a ModelCoordinator,
    finished: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.coordinator.finish(&Err(CoordinatorError::Download(
                "download interrupted".to_string(),
            )));
        }
    }
}
