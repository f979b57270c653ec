//! Generation job sequencer: a bounded FIFO queue drained by one worker so
//! that GPU work never overlaps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cadenza_common::{GenerationRequest, JobAccepted, JobStatus};

use crate::coordinator::ModelCoordinator;
use crate::registry::{JobOutput, JobRegistry};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("queue full ({capacity} jobs waiting), try again later")]
    QueueFull { capacity: usize },

    #[error("job queue is shut down")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("lyrics generation failed: {0}")]
    Lyrics(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("inference produced no audio output in {0}")]
    NoOutput(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("models unavailable: {0}")]
    ModelsUnavailable(String),
}

/// A job as handed to the worker.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub request_id: String,
    pub request: GenerationRequest,
}

/// Lets a backend publish intermediate states of the job it is running.
#[derive(Clone)]
pub struct JobProgress {
    registry: Arc<JobRegistry>,
    request_id: String,
}

impl JobProgress {
    pub fn new(registry: Arc<JobRegistry>, request_id: impl Into<String>) -> Self {
        Self {
            registry,
            request_id: request_id.into(),
        }
    }

    pub fn set_status(&self, status: JobStatus) {
        tracing::info!(request_id=%self.request_id, %status, "job status");
        self.registry.set_status(&self.request_id, status);
    }

    pub fn set_inputs(&self, lyrics: &str, genre: &str) {
        self.registry.set_inputs(&self.request_id, lyrics, genre);
    }
}

/// Does the actual work of one job.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, job: &QueuedJob, progress: &JobProgress) -> Result<JobOutput, JobError>;
}

#[derive(Debug, Default)]
pub struct JobCounters {
    pub admitted: AtomicU64,
    pub rejected: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

pub struct JobSequencer {
    tx: mpsc::Sender<QueuedJob>,
    /// Held from reservation to send so ticket order matches channel order.
    admit_lock: Mutex<()>,
    capacity: usize,
    registry: Arc<JobRegistry>,
    cancel: CancellationToken,
    pub counters: Arc<JobCounters>,
}

impl JobSequencer {
    /// Creates the queue and spawns its worker. The worker stops after the
    /// current job once [`JobSequencer::shutdown`] is called.
    pub fn start(
        capacity: usize,
        registry: Arc<JobRegistry>,
        coordinator: Arc<ModelCoordinator>,
        backend: Arc<dyn GenerationBackend>,
    ) -> (Self, JoinHandle<()>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let counters = Arc::new(JobCounters::default());

        let worker = Worker {
            registry: registry.clone(),
            coordinator,
            backend,
            cancel: cancel.clone(),
            counters: counters.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));

        (
            Self {
                tx,
                admit_lock: Mutex::new(()),
                capacity,
                registry,
                cancel,
                counters,
            },
            handle,
        )
    }

    /// Admits a job, or rejects it when the queue is full.
    pub fn submit(&self, request: GenerationRequest) -> Result<JobAccepted, AdmissionError> {
        let guard = self.admit_lock.lock().unwrap_or_else(|e| e.into_inner());
        let permit = match self.tx.try_reserve() {
            Ok(p) => p,
            Err(mpsc::error::TrySendError::Full(())) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(capacity = self.capacity, "job rejected, queue full");
                return Err(AdmissionError::QueueFull {
                    capacity: self.capacity,
                });
            }
            Err(mpsc::error::TrySendError::Closed(())) => return Err(AdmissionError::Closed),
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        let rec = self.registry.admit(request_id.clone(), &request);
        permit.send(QueuedJob {
            request_id: request_id.clone(),
            request,
        });
        drop(guard);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);

        let position = rec.queue_position.unwrap_or(0);
        tracing::info!(%request_id, user_id=%rec.user_id, song_name=%rec.song_name, position, "job queued");
        Ok(JobAccepted {
            request_id,
            status: JobStatus::Queued,
            queue_position: position,
            estimated_wait_time_seconds: rec.estimated_wait_time_seconds.unwrap_or(0),
            message: format!("Song generation request queued. Position in queue: {position}"),
            user_id: rec.user_id,
            song_name: rec.song_name,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn depth(&self) -> u64 {
        self.registry.queue_depth()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

struct Worker {
    registry: Arc<JobRegistry>,
    coordinator: Arc<ModelCoordinator>,
    backend: Arc<dyn GenerationBackend>,
    cancel: CancellationToken,
    counters: Arc<JobCounters>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<QueuedJob>) {
        tracing::info!("generation worker started");
        loop {
            let job = tokio::select! {
                _ = self.cancel.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.process(job).await;
        }
        tracing::info!("generation worker stopped");
    }

    async fn process(&self, job: QueuedJob) {
        let request_id = job.request_id.clone();
        self.registry.mark_started(&request_id);
        tracing::info!(%request_id, "job started");

        let result = match self.coordinator.ensure_models_available().await {
            Err(e) => Err(JobError::ModelsUnavailable(e.to_string())),
            Ok(()) => {
                // Own task so a panicking backend only fails this job.
                let backend = self.backend.clone();
                let progress = JobProgress::new(self.registry.clone(), request_id.clone());
                tokio::spawn(async move { backend.generate(&job, &progress).await })
                    .await
                    .unwrap_or_else(|e| Err(JobError::Inference(format!("generation task aborted: {e}"))))
            }
        };

        match result {
            Ok(output) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(%request_id, output=?output.output_file, "job complete");
                self.registry.complete(&request_id, output);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(%request_id, error=%e, "job failed");
                self.registry.fail(&request_id, e.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::Artifact;
    use crate::coordinator::CoordinatorConfig;
    use crate::fetcher::{ArtifactFetcher, FetchError};
    use crate::retry::RetryPolicy;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Backend that fails jobs whose song name starts with "fail", panics on
    /// "panic", and records start/end order.
    struct ScriptedBackend {
        delay: Duration,
        busy: AtomicBool,
        overlapped: AtomicBool,
        log: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(delay_ms: u64) -> Self {
            Self {
                delay: Duration::from_millis(delay_ms),
                busy: AtomicBool::new(false),
                overlapped: AtomicBool::new(false),
                log: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(&self, job: &QueuedJob, progress: &JobProgress) -> Result<JobOutput, JobError> {
            if self.busy.swap(true, Ordering::SeqCst) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            let name = job.request.song_name_or_default();
            self.log.lock().unwrap().push(name.clone());
            progress.set_status(JobStatus::GeneratingAudio);
            tokio::time::sleep(self.delay).await;
            self.busy.store(false, Ordering::SeqCst);

            if name.starts_with("panic") {
                panic!("backend blew up");
            }
            if name.starts_with("fail") {
                return Err(JobError::Inference("exit status 1".into()));
            }
            Ok(JobOutput {
                output_dir: PathBuf::from(format!("/out/{}", job.request_id)),
                output_file: Some(PathBuf::from(format!("/out/{}/{name}.wav", job.request_id))),
                ..Default::default()
            })
        }
    }

    struct SlowFetcher(Duration);

    #[async_trait]
    impl ArtifactFetcher for SlowFetcher {
        fn name(&self) -> &str {
            "slow"
        }
        async fn fetch(&self, artifacts: &[Artifact]) -> Result<(), FetchError> {
            tokio::time::sleep(self.0).await;
            for a in artifacts {
                std::fs::create_dir_all(&a.dir)?;
                std::fs::write(a.dir.join("w.bin"), b"w")?;
            }
            Ok(())
        }
    }

    struct BrokenFetcher;

    #[async_trait]
    impl ArtifactFetcher for BrokenFetcher {
        fn name(&self) -> &str {
            "broken"
        }
        async fn fetch(&self, _: &[Artifact]) -> Result<(), FetchError> {
            Err(FetchError::SourceMissing(PathBuf::from("/nowhere")))
        }
    }

    fn coordinator(root: &Path, fetcher: Arc<dyn ArtifactFetcher>) -> Arc<ModelCoordinator> {
        Arc::new(ModelCoordinator::new(
            vec![
                Artifact::new("stage1", "org/s1", root),
                Artifact::new("stage2", "org/s2", root),
            ],
            fetcher,
            CoordinatorConfig {
                retry: RetryPolicy::none(),
                ..Default::default()
            },
        ))
    }

    fn ready_coordinator(root: &Path) -> Arc<ModelCoordinator> {
        let c = coordinator(root, Arc::new(SlowFetcher(Duration::ZERO)));
        for name in ["stage1", "stage2"] {
            std::fs::create_dir_all(root.join(name)).unwrap();
            std::fs::write(root.join(name).join("w.bin"), b"w").unwrap();
        }
        assert!(c.verify_on_startup());
        c
    }

    fn song(name: &str) -> GenerationRequest {
        GenerationRequest {
            song_name: Some(name.to_string()),
            lyrics: Some("[verse]\nla".into()),
            genre: Some("pop".into()),
            ..Default::default()
        }
    }

    async fn wait_terminal(registry: &JobRegistry, id: &str) -> JobStatus {
        for _ in 0..500 {
            if let Some(rec) = registry.get(id) {
                if rec.status.is_terminal() {
                    return rec.status;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn test_failing_job_does_not_affect_others() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(120));
        let backend = Arc::new(ScriptedBackend::new(20));
        let (seq, _worker) = JobSequencer::start(8, registry.clone(), ready_coordinator(tmp.path()), backend.clone());

        let j1 = seq.submit(song("fail-1")).unwrap();
        let j2 = seq.submit(song("ok-2")).unwrap();
        let j3 = seq.submit(song("ok-3")).unwrap();
        assert_eq!(j1.queue_position, 0);
        assert_eq!(j3.queue_position, 2);
        assert_eq!(j3.estimated_wait_time_seconds, 240);

        assert_eq!(wait_terminal(&registry, &j1.request_id).await, JobStatus::Error);
        assert_eq!(wait_terminal(&registry, &j2.request_id).await, JobStatus::Complete);
        assert_eq!(wait_terminal(&registry, &j3.request_id).await, JobStatus::Complete);

        let rec = registry.get(&j1.request_id).unwrap();
        assert!(rec.error.unwrap().contains("exit status 1"));
        assert_eq!(*backend.log.lock().unwrap(), vec!["fail-1", "ok-2", "ok-3"]);
        assert!(!backend.overlapped.load(Ordering::SeqCst));
        assert_eq!(seq.counters.completed.load(Ordering::Relaxed), 2);
        assert_eq!(seq.counters.failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_panicking_backend_fails_only_that_job() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(120));
        let backend = Arc::new(ScriptedBackend::new(1));
        let (seq, _worker) = JobSequencer::start(4, registry.clone(), ready_coordinator(tmp.path()), backend);

        let bad = seq.submit(song("panic-now")).unwrap();
        let good = seq.submit(song("ok")).unwrap();
        assert_eq!(wait_terminal(&registry, &bad.request_id).await, JobStatus::Error);
        assert_eq!(wait_terminal(&registry, &good.request_id).await, JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_admission() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(120));
        let backend = Arc::new(ScriptedBackend::new(300));
        let (seq, _worker) = JobSequencer::start(2, registry.clone(), ready_coordinator(tmp.path()), backend);

        let first = seq.submit(song("a")).unwrap();
        // Wait until the worker holds the first job so the channel is empty.
        for _ in 0..100 {
            if registry.get(&first.request_id).unwrap().status != JobStatus::Queued {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seq.submit(song("b")).unwrap();
        seq.submit(song("c")).unwrap();
        let err = seq.submit(song("d")).unwrap_err();
        assert!(matches!(err, AdmissionError::QueueFull { capacity: 2 }));
        assert_eq!(seq.counters.rejected.load(Ordering::Relaxed), 1);
        assert_eq!(registry.len(), 3);
        assert_eq!(seq.depth(), 2);
    }

    #[tokio::test]
    async fn test_job_waits_for_models_to_download() {
        let tmp = tempfile::tempdir().unwrap();
        let coordinator = coordinator(tmp.path(), Arc::new(SlowFetcher(Duration::from_millis(100))));
        let registry = Arc::new(JobRegistry::new(120));
        let backend = Arc::new(ScriptedBackend::new(1));

        let download = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.ensure_models_available().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(coordinator.state(), cadenza_common::ModelReadinessState::Downloading);

        let (seq, _worker) = JobSequencer::start(4, registry.clone(), coordinator.clone(), backend.clone());
        let job = seq.submit(song("waits")).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(backend.log.lock().unwrap().is_empty());

        assert_eq!(wait_terminal(&registry, &job.request_id).await, JobStatus::Complete);
        download.await.unwrap().unwrap();
        assert!(coordinator.get_status().is_ready());
    }

    #[tokio::test]
    async fn test_job_fails_when_models_cannot_load() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(120));
        let backend = Arc::new(ScriptedBackend::new(1));
        let (seq, _worker) =
            JobSequencer::start(4, registry.clone(), coordinator(tmp.path(), Arc::new(BrokenFetcher)), backend.clone());

        let job = seq.submit(song("doomed")).unwrap();
        assert_eq!(wait_terminal(&registry, &job.request_id).await, JobStatus::Error);
        let rec = registry.get(&job.request_id).unwrap();
        assert!(rec.error.unwrap().starts_with("models unavailable"));
        assert!(backend.log.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters_run_in_ticket_order() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(120));
        let backend = Arc::new(ScriptedBackend::new(0));
        let (seq, _worker) = JobSequencer::start(64, registry.clone(), ready_coordinator(tmp.path()), backend.clone());
        let seq = Arc::new(seq);

        let mut submitters = Vec::new();
        for t in 0..8 {
            let seq = seq.clone();
            submitters.push(tokio::task::spawn_blocking(move || {
                (0..6)
                    .map(|i| seq.submit(song(&format!("t{t}-{i}"))).unwrap().request_id)
                    .collect::<Vec<_>>()
            }));
        }
        let mut ids = Vec::new();
        for s in submitters {
            ids.extend(s.await.unwrap());
        }
        for id in &ids {
            assert_eq!(wait_terminal(&registry, id).await, JobStatus::Complete);
        }

        let by_name: std::collections::HashMap<String, u64> = ids
            .iter()
            .map(|id| {
                let rec = registry.get(id).unwrap();
                (rec.song_name, rec.ticket)
            })
            .collect();
        let processed: Vec<u64> = backend.log.lock().unwrap().iter().map(|n| by_name[n]).collect();
        assert_eq!(processed.len(), 48);
        assert!(processed.windows(2).all(|w| w[0] < w[1]), "{processed:?}");
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(120));
        let (seq, worker) = JobSequencer::start(
            4,
            registry,
            ready_coordinator(tmp.path()),
            Arc::new(ScriptedBackend::new(1)),
        );
        seq.shutdown();
        tokio::time::timeout(Duration::from_secs(1), worker).await.unwrap().unwrap();
    }
}
