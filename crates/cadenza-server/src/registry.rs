use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use cadenza_common::{now_ms, GenerationRequest, JobRecord, JobStatus};

pub const DEFAULT_JOB_ESTIMATE_SECS: u64 = 120;

pub const DEFAULT_MAX_FINISHED_JOBS: usize = 1000;

/// Transitions arriving within this window are written in one go.
const PERSIST_DEBOUNCE: Duration = Duration::from_millis(200);

const INTERRUPTED: &str = "interrupted by server restart";

/// Files produced by a finished job.
#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub output_dir: PathBuf,
    pub output_file: Option<PathBuf>,
    pub file_paths: BTreeMap<String, String>,
    pub lyrics: Option<String>,
    pub genre: Option<String>,
}

/// All known jobs keyed by request id.
///
/// Tickets are handed out in admission order; `started` counts jobs the
/// worker has picked up, so a queued job's position is `ticket - started`.
///
/// Only the newest `max_finished` completed or failed jobs are kept. When a
/// results file is attached, transitions mark the registry dirty and a
/// background task writes the whole map after [`PERSIST_DEBOUNCE`].
pub struct JobRegistry {
    jobs: Arc<DashMap<String, JobRecord>>,
    next_ticket: AtomicU64,
    started: AtomicU64,
    job_estimate_secs: u64,
    max_finished: usize,
    /// Finished request ids, oldest first.
    finished: Mutex<VecDeque<String>>,
    writer: Option<ResultsWriter>,
}

impl JobRegistry {
    pub fn new(job_estimate_secs: u64) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            next_ticket: AtomicU64::new(0),
            started: AtomicU64::new(0),
            job_estimate_secs,
            max_finished: DEFAULT_MAX_FINISHED_JOBS,
            finished: Mutex::new(VecDeque::new()),
            writer: None,
        }
    }

    /// Bound on retained finished jobs. 0 keeps everything.
    pub fn with_max_finished(mut self, max_finished: usize) -> Self {
        self.max_finished = max_finished;
        self
    }

    /// Loads previously persisted jobs from `path` (if it exists) and keeps
    /// writing to it. Jobs that never finished are marked as errors since the
    /// queue itself does not survive a restart.
    ///
    /// Must be called inside a Tokio runtime, which hosts the writer task.
    pub fn with_results_file(mut self, path: PathBuf) -> std::io::Result<Self> {
        let handle = tokio::runtime::Handle::try_current().map_err(std::io::Error::other)?;
        let mut max_ticket = None;
        let mut interrupted = 0usize;
        let mut evicted = 0usize;

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let saved: BTreeMap<String, JobRecord> = if raw.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&raw)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            };
            for (id, mut rec) in saved {
                if !rec.status.is_terminal() {
                    rec.status = JobStatus::Error;
                    rec.error = Some(INTERRUPTED.to_string());
                    rec.completed_at_ms.get_or_insert_with(now_ms);
                    interrupted += 1;
                }
                rec.clear_computed();
                max_ticket = max_ticket.max(Some(rec.ticket));
                self.jobs.insert(id, rec);
            }

            let mut done: Vec<(u64, u64, String)> = self
                .jobs
                .iter()
                .map(|r| (r.completed_at_ms.unwrap_or(0), r.ticket, r.key().clone()))
                .collect();
            done.sort();
            evicted = {
                let mut finished = self.finished();
                finished.extend(done.into_iter().map(|(_, _, id)| id));
                self.evict_over_limit(&mut finished)
            };
            tracing::info!(path=%path.display(), jobs=self.jobs.len(), interrupted, evicted, "loaded job results");
        }

        let next = max_ticket.map(|t| t + 1).unwrap_or(0);
        self.next_ticket = AtomicU64::new(next);
        self.started = AtomicU64::new(next);

        let writer = ResultsWriter::spawn(&handle, path, self.jobs.clone());
        if interrupted > 0 || evicted > 0 {
            writer.mark_dirty();
        }
        self.writer = Some(writer);
        Ok(self)
    }

    /// Records a newly admitted job and returns it with its queue position.
    pub fn admit(&self, request_id: String, req: &GenerationRequest) -> JobRecord {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let rec = JobRecord::new(request_id.clone(), ticket, req, now_ms());
        self.jobs.insert(request_id.clone(), rec);
        self.persist();
        self.get(&request_id).unwrap_or_else(|| JobRecord::new(request_id, ticket, req, now_ms()))
    }

    pub fn mark_started(&self, request_id: &str) {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.update(request_id, |rec| {
            rec.status = JobStatus::Processing;
            rec.started_at_ms = Some(now_ms());
        });
    }

    pub fn set_status(&self, request_id: &str, status: JobStatus) {
        self.update(request_id, |rec| rec.status = status);
    }

    /// Stores lyrics and genre resolved while processing.
    pub fn set_inputs(&self, request_id: &str, lyrics: &str, genre: &str) {
        self.update(request_id, |rec| {
            rec.lyrics = Some(lyrics.to_string());
            rec.genre = Some(genre.to_string());
        });
    }

    pub fn complete(&self, request_id: &str, output: JobOutput) {
        self.finish(request_id, |rec| {
            rec.status = JobStatus::Complete;
            rec.completed_at_ms = Some(now_ms());
            rec.output_dir = Some(output.output_dir.to_string_lossy().to_string());
            rec.output_file = output.output_file.map(|p| p.to_string_lossy().to_string());
            rec.file_paths = output.file_paths;
            if output.lyrics.is_some() {
                rec.lyrics = output.lyrics;
            }
            if output.genre.is_some() {
                rec.genre = output.genre;
            }
        });
    }

    pub fn fail(&self, request_id: &str, error: String) {
        self.finish(request_id, |rec| {
            rec.status = JobStatus::Error;
            rec.error = Some(error);
            rec.completed_at_ms = Some(now_ms());
        });
    }

    /// Job record with the live fields filled in.
    pub fn get(&self, request_id: &str) -> Option<JobRecord> {
        let mut rec = self.jobs.get(request_id)?.clone();
        let now = now_ms();
        let secs = |from: u64, to: u64| to.saturating_sub(from) as f64 / 1000.0;

        match rec.status {
            JobStatus::Queued => {
                let position = rec.ticket.saturating_sub(self.started.load(Ordering::SeqCst));
                rec.queue_position = Some(position);
                rec.estimated_wait_time_seconds = Some(position * self.job_estimate_secs);
                rec.time_in_queue_secs = Some(secs(rec.queued_at_ms, now));
            }
            _ => {
                let started = rec.started_at_ms.unwrap_or(rec.queued_at_ms);
                rec.time_in_queue_secs = Some(secs(rec.queued_at_ms, started));
                if rec.started_at_ms.is_some() {
                    rec.processing_time_secs = Some(secs(started, rec.completed_at_ms.unwrap_or(now)));
                }
            }
        }
        if rec.status == JobStatus::Complete && rec.output_file.is_some() {
            rec.download_url = Some(format!("/download/{}?type=wav", rec.request_id));
        }
        Some(rec)
    }

    /// Jobs admitted but not yet picked up by the worker.
    pub fn queue_depth(&self) -> u64 {
        self.next_ticket
            .load(Ordering::SeqCst)
            .saturating_sub(self.started.load(Ordering::SeqCst))
    }

    pub fn job_estimate_secs(&self) -> u64 {
        self.job_estimate_secs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs.iter().filter(|r| r.status == status).count()
    }

    fn update(&self, request_id: &str, f: impl FnOnce(&mut JobRecord)) -> bool {
        match self.jobs.get_mut(request_id) {
            Some(mut rec) => f(rec.value_mut()),
            None => {
                tracing::warn!(%request_id, "update for unknown job");
                return false;
            }
        }
        self.persist();
        true
    }

    /// Applies a terminal transition and evicts the oldest finished jobs
    /// beyond the retention bound.
    fn finish(&self, request_id: &str, f: impl FnOnce(&mut JobRecord)) {
        if !self.update(request_id, f) {
            return;
        }
        let evicted = {
            let mut finished = self.finished();
            finished.push_back(request_id.to_string());
            self.evict_over_limit(&mut finished)
        };
        if evicted > 0 {
            tracing::debug!(evicted, "dropped oldest finished jobs");
            self.persist();
        }
    }

    fn finished(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.finished.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn evict_over_limit(&self, finished: &mut VecDeque<String>) -> usize {
        if self.max_finished == 0 {
            return 0;
        }
        let mut evicted = 0;
        while finished.len() > self.max_finished {
            if let Some(id) = finished.pop_front() {
                self.jobs.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn persist(&self) {
        if let Some(writer) = &self.writer {
            writer.mark_dirty();
        }
    }

    /// Writes the current map now if anything changed since the last write.
    /// Called at shutdown so the final transitions are not lost.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }
}

impl Drop for JobRegistry {
    fn drop(&mut self) {
        if let Some(writer) = &self.writer {
            writer.cancel.cancel();
        }
    }
}

/// Background writer for the results file. Marking dirty wakes the task,
/// which waits out the debounce window and then writes one snapshot on the
/// blocking pool.
struct ResultsWriter {
    shared: Arc<WriterShared>,
    cancel: CancellationToken,
}

struct WriterShared {
    path: PathBuf,
    jobs: Arc<DashMap<String, JobRecord>>,
    dirty: AtomicBool,
    wake: Notify,
    /// Serialises snapshot + write so an older snapshot never lands last.
    write_lock: tokio::sync::Mutex<()>,
}

impl ResultsWriter {
    fn spawn(handle: &tokio::runtime::Handle, path: PathBuf, jobs: Arc<DashMap<String, JobRecord>>) -> Self {
        let shared = Arc::new(WriterShared {
            path,
            jobs,
            dirty: AtomicBool::new(false),
            wake: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        });
        let cancel = CancellationToken::new();
        handle.spawn(run_writer(shared.clone(), cancel.clone()));
        Self { shared, cancel }
    }

    fn mark_dirty(&self) {
        self.shared.dirty.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    async fn flush(&self) {
        self.shared.write_if_dirty().await;
    }
}

async fn run_writer(shared: Arc<WriterShared>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.wake.notified() => {}
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(PERSIST_DEBOUNCE) => {}
        }
        shared.write_if_dirty().await;
    }
    shared.write_if_dirty().await;
}

impl WriterShared {
    async fn write_if_dirty(&self) {
        let _guard = self.write_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let snapshot: BTreeMap<String, JobRecord> = self
            .jobs
            .iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect();
        let path = self.path.clone();
        let written = tokio::task::spawn_blocking(move || write_atomic(&path, &snapshot))
            .await
            .unwrap_or_else(|e| Err(std::io::Error::other(e)));
        if let Err(e) = written {
            tracing::error!(path=%self.path.display(), error=%e, "failed to persist job results");
            self.dirty.store(true, Ordering::SeqCst);
        }
    }
}

fn write_atomic(path: &Path, jobs: &BTreeMap<String, JobRecord>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_vec_pretty(jobs)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(song: &str) -> GenerationRequest {
        GenerationRequest {
            song_name: Some(song.to_string()),
            lyrics: Some("[verse]\nla".into()),
            genre: Some("pop".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_queue_position_follows_tickets() {
        let reg = JobRegistry::new(120);
        let a = reg.admit("a".into(), &req("a"));
        let b = reg.admit("b".into(), &req("b"));
        let c = reg.admit("c".into(), &req("c"));
        assert_eq!(a.queue_position, Some(0));
        assert_eq!(b.queue_position, Some(1));
        assert_eq!(c.estimated_wait_time_seconds, Some(240));
        assert_eq!(reg.queue_depth(), 3);

        reg.mark_started("a");
        let b = reg.get("b").unwrap();
        assert_eq!(b.queue_position, Some(0));
        assert_eq!(reg.get("c").unwrap().queue_position, Some(1));

        let a = reg.get("a").unwrap();
        assert_eq!(a.status, JobStatus::Processing);
        assert!(a.queue_position.is_none());
        assert!(a.processing_time_secs.is_some());
    }

    #[test]
    fn test_complete_and_fail() {
        let reg = JobRegistry::new(120);
        reg.admit("ok".into(), &req("ok"));
        reg.admit("bad".into(), &req("bad"));
        reg.mark_started("ok");
        reg.complete(
            "ok",
            JobOutput {
                output_dir: PathBuf::from("/out/ok"),
                output_file: Some(PathBuf::from("/out/ok/mix.wav")),
                ..Default::default()
            },
        );
        reg.mark_started("bad");
        reg.fail("bad", "inference exited with 1".into());

        let ok = reg.get("ok").unwrap();
        assert_eq!(ok.status, JobStatus::Complete);
        assert_eq!(ok.download_url.as_deref(), Some("/download/ok?type=wav"));
        let bad = reg.get("bad").unwrap();
        assert_eq!(bad.status, JobStatus::Error);
        assert_eq!(bad.error.as_deref(), Some("inference exited with 1"));
        assert!(reg.get("missing").is_none());
        assert_eq!(reg.count_by_status(JobStatus::Complete), 1);
    }

    #[tokio::test]
    async fn test_results_file_reload_marks_unfinished_jobs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("results.json");
        {
            let reg = JobRegistry::new(120).with_results_file(path.clone()).unwrap();
            reg.admit("done".into(), &req("done"));
            reg.admit("running".into(), &req("running"));
            reg.admit("waiting".into(), &req("waiting"));
            reg.mark_started("done");
            reg.complete("done", JobOutput::default());
            reg.mark_started("running");
            reg.flush().await;
        }

        let reg = JobRegistry::new(120).with_results_file(path.clone()).unwrap();
        assert_eq!(reg.len(), 3);
        assert_eq!(reg.get("done").unwrap().status, JobStatus::Complete);
        for id in ["running", "waiting"] {
            let rec = reg.get(id).unwrap();
            assert_eq!(rec.status, JobStatus::Error);
            assert_eq!(rec.error.as_deref(), Some(INTERRUPTED));
        }

        let next = reg.admit("new".into(), &req("new"));
        assert_eq!(next.ticket, 3);
        assert_eq!(next.queue_position, Some(0));

        reg.flush().await;
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains("queue_position"));
        assert!(raw.contains(INTERRUPTED));
    }

    #[tokio::test]
    async fn test_transitions_are_written_in_background() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("results.json");
        let reg = JobRegistry::new(120).with_results_file(path.clone()).unwrap();

        for i in 0..20 {
            reg.admit(format!("job-{i}"), &req("burst"));
        }

        for _ in 0..100 {
            if std::fs::read_to_string(&path).map(|r| r.contains("job-19")).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("results file never written");
    }

    #[test]
    fn test_oldest_finished_jobs_are_evicted() {
        let reg = JobRegistry::new(120).with_max_finished(2);
        for id in ["a", "b", "c", "queued"] {
            reg.admit(id.into(), &req(id));
        }
        reg.mark_started("a");
        reg.complete("a", JobOutput::default());
        reg.mark_started("b");
        reg.fail("b", "boom".into());
        assert_eq!(reg.len(), 4);

        reg.mark_started("c");
        reg.complete("c", JobOutput::default());
        assert!(reg.get("a").is_none());
        assert!(reg.get("b").is_some());
        assert!(reg.get("c").is_some());
        assert_eq!(reg.get("queued").unwrap().status, JobStatus::Queued);
        assert_eq!(reg.len(), 3);
    }

    #[tokio::test]
    async fn test_reload_applies_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("results.json");
        {
            let reg = JobRegistry::new(120).with_results_file(path.clone()).unwrap();
            for id in ["one", "two", "three"] {
                reg.admit(id.into(), &req(id));
                reg.mark_started(id);
                reg.complete(id, JobOutput::default());
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            reg.flush().await;
        }

        let reg = JobRegistry::new(120)
            .with_max_finished(2)
            .with_results_file(path)
            .unwrap();
        assert_eq!(reg.len(), 2);
        assert!(reg.get("one").is_none());
        assert!(reg.get("three").is_some());
    }
}
