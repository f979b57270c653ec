//! Subprocess-backed generation: writes the prompt files, runs the
//! two-stage inference program and collects what it produced.

use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use cadenza_common::{GenerationRequest, InferenceOptions, JobStatus};

use crate::genres::DEFAULT_GENRE;
use crate::lyrics::{format_lyrics, LyricsProvider};
use crate::registry::JobOutput;
use crate::sequencer::{GenerationBackend, JobError, JobProgress, QueuedJob};

const RESULT_EXTENSIONS: [&str; 4] = ["wav", "mp3", "mid", "json"];
const STDERR_TAIL: usize = 5;

#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Interpreter used to run `script`.
    pub python: String,
    /// Inference entry point, relative to `workdir` or absolute.
    pub script: PathBuf,
    pub workdir: PathBuf,
    /// Each job writes into `<output_root>/<request_id>`.
    pub output_root: PathBuf,
    pub stage1_model: PathBuf,
    pub stage2_model: PathBuf,
    /// Kill the program after this long. `None` lets it run.
    pub timeout: Option<Duration>,
}

pub struct InferenceBackend {
    config: InferenceConfig,
    lyrics: Option<Arc<dyn LyricsProvider>>,
}

impl InferenceBackend {
    pub fn new(config: InferenceConfig, lyrics: Option<Arc<dyn LyricsProvider>>) -> Self {
        Self { config, lyrics }
    }

    /// Works out the lyrics and genre for a job, calling the lyrics provider
    /// when the request only carries a prompt.
    async fn resolve_inputs(
        &self,
        req: &GenerationRequest,
        progress: &JobProgress,
    ) -> Result<(Option<String>, String), JobError> {
        let given_genre = req.genre.clone().filter(|g| !g.trim().is_empty());
        let has_lyrics = req.lyrics.as_deref().map(|l| !l.trim().is_empty()).unwrap_or(false);
        let prompt = req.prompt.as_deref().filter(|_| req.has_prompt());

        let lyrics = match (has_lyrics, prompt) {
            (false, Some(prompt)) => {
                let provider = self
                    .lyrics
                    .as_ref()
                    .ok_or_else(|| JobError::Lyrics("no lyrics provider configured".to_string()))?;
                progress.set_status(JobStatus::GeneratingLyrics);
                let text = provider
                    .generate_lyrics(prompt)
                    .await
                    .map_err(|e| JobError::Lyrics(e.to_string()))?;
                Some(text)
            }
            _ => req.lyrics.clone(),
        };

        let genre = match (given_genre, prompt, &self.lyrics) {
            (Some(g), _, _) => g,
            (None, Some(prompt), Some(provider)) => match provider.extract_genre(prompt).await {
                Ok(g) => g,
                Err(e) => {
                    tracing::warn!(error=%e, provider = provider.name(), "genre extraction failed, using default");
                    DEFAULT_GENRE.to_string()
                }
            },
            _ => DEFAULT_GENRE.to_string(),
        };
        Ok((lyrics, genre))
    }

    async fn run(&self, request_id: &str, args: Vec<OsString>) -> Result<(), JobError> {
        let mut cmd = Command::new(&self.config.python);
        cmd.arg(&self.config.script)
            .args(&args)
            .current_dir(&self.config.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(%request_id, python=%self.config.python, script=%self.config.script.display(), ?args, "starting inference");
        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| JobError::Inference(format!("failed to start {}: {e}", self.config.python)))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let drain = async {
            let out = async {
                if let Some(stdout) = stdout {
                    let mut lines = BufReader::new(stdout).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::info!(%request_id, stage = "inference", "{line}");
                    }
                }
            };
            let err = async {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL);
                if let Some(stderr) = stderr {
                    let mut lines = BufReader::new(stderr).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        tracing::info!(%request_id, stage = "inference", stream = "stderr", "{line}");
                        if line.trim().is_empty() {
                            continue;
                        }
                        if tail.len() == STDERR_TAIL {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
                tail
            };
            let ((), tail) = tokio::join!(out, err);
            let status = child.wait().await;
            (status, tail)
        };

        let (status, tail) = match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, drain).await.map_err(|_| {
                JobError::Inference(format!("inference timed out after {}s", limit.as_secs()))
            })?,
            None => drain.await,
        };
        let status = status?;
        let elapsed = started.elapsed().as_secs_f64();

        if status.success() {
            tracing::info!(%request_id, elapsed_secs = elapsed, "inference finished");
            return Ok(());
        }
        let detail = tail.back().cloned().unwrap_or_else(|| "no output".to_string());
        tracing::error!(%request_id, %status, elapsed_secs = elapsed, stderr=?tail, "inference failed");
        Err(JobError::Inference(format!("{status}: {detail}")))
    }
}

#[async_trait]
impl GenerationBackend for InferenceBackend {
    async fn generate(&self, job: &QueuedJob, progress: &JobProgress) -> Result<JobOutput, JobError> {
        let req = &job.request;
        let output_dir = absolutize(&self.config.output_root.join(&job.request_id))?;
        tokio::fs::create_dir_all(&output_dir).await?;

        let (lyrics, genre) = self.resolve_inputs(req, progress).await?;
        let lyrics = format_lyrics(lyrics.as_deref());

        let genre_path = output_dir.join("genre.txt");
        let lyrics_path = output_dir.join("lyrics.txt");
        tokio::fs::write(&genre_path, &genre).await?;
        tokio::fs::write(&lyrics_path, &lyrics).await?;
        progress.set_inputs(&lyrics, &genre);

        progress.set_status(JobStatus::GeneratingAudio);
        let args = build_args(&self.config, &genre_path, &lyrics_path, &output_dir, &req.options);
        self.run(&job.request_id, args).await?;

        let scan_dir = output_dir.clone();
        let found = tokio::task::spawn_blocking(move || discover_outputs(&scan_dir))
            .await
            .map_err(|e| JobError::Io(std::io::Error::other(e)))??;
        let Some(primary) = found.primary else {
            return Err(JobError::NoOutput(output_dir.to_string_lossy().to_string()));
        };

        Ok(JobOutput {
            output_dir,
            output_file: Some(primary),
            file_paths: found.files,
            lyrics: Some(lyrics),
            genre: Some(genre),
        })
    }
}

fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Command-line arguments for the inference program. Knobs missing from
/// the request fall back to the defaults the program was tuned with.
pub fn build_args(
    config: &InferenceConfig,
    genre_path: &Path,
    lyrics_path: &Path,
    output_dir: &Path,
    opts: &InferenceOptions,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();
    let mut push = |flag: &str, value: OsString| {
        args.push(flag.into());
        args.push(value);
    };

    push("--genre_txt", genre_path.into());
    push("--lyrics_txt", lyrics_path.into());
    push("--output_dir", output_dir.into());
    push("--stage1_model", config.stage1_model.clone().into());
    push("--stage2_model", config.stage2_model.clone().into());
    push("--stage2_batch_size", opts.stage2_batch_size.unwrap_or(12).to_string().into());
    push("--run_n_segments", opts.run_n_segments.unwrap_or(1).to_string().into());
    push("--max_new_tokens", opts.max_new_tokens.unwrap_or(3000).to_string().into());
    push("--repetition_penalty", opts.repetition_penalty.unwrap_or(1.1).to_string().into());
    push("--stage2_cache_size", opts.stage2_cache_size.unwrap_or(32768).to_string().into());
    if let Some(v) = opts.cuda_idx {
        push("--cuda_idx", v.to_string().into());
    }
    if let Some(v) = opts.stage1_cache_size {
        push("--stage1_cache_size", v.to_string().into());
    }
    if let Some(v) = &opts.stage1_cache_mode {
        push("--stage1_cache_mode", v.into());
    }
    if let Some(v) = &opts.stage2_cache_mode {
        push("--stage2_cache_mode", v.into());
    }

    args.push("--stage1_use_exl2".into());
    args.push("--stage2_use_exl2".into());
    for (enabled, flag) in [
        (opts.stage1_no_guidance, "--stage1_no_guidance"),
        (opts.keep_intermediate, "--keep_intermediate"),
        (opts.disable_offload_model, "--disable_offload_model"),
    ] {
        if enabled {
            args.push(flag.into());
        }
    }
    args
}

#[derive(Debug, Default)]
pub struct DiscoveredOutputs {
    /// Largest `.wav`, or the largest `.mp3` when no wav was written.
    pub primary: Option<PathBuf>,
    /// Path relative to the output dir → absolute path.
    pub files: BTreeMap<String, String>,
}

/// Walks `dir` for result files.
pub fn discover_outputs(dir: &Path) -> std::io::Result<DiscoveredOutputs> {
    let mut found = DiscoveredOutputs::default();
    let mut best_wav: Option<(u64, PathBuf)> = None;
    let mut best_mp3: Option<(u64, PathBuf)> = None;

    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(path);
                continue;
            }
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .unwrap_or_default();
            if !RESULT_EXTENSIONS.contains(&ext.as_str()) {
                continue;
            }

            let rel = path.strip_prefix(dir).unwrap_or(&path).to_string_lossy().to_string();
            found.files.insert(rel, path.to_string_lossy().to_string());

            let slot = match ext.as_str() {
                "wav" => &mut best_wav,
                "mp3" => &mut best_mp3,
                _ => continue,
            };
            if slot.as_ref().map(|(size, _)| meta.len() > *size).unwrap_or(true) {
                *slot = Some((meta.len(), path));
            }
        }
    }

    found.primary = best_wav.or(best_mp3).map(|(_, p)| p);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::JobRegistry;
    use crate::lyrics::LyricsError;

    fn config(root: &Path) -> InferenceConfig {
        InferenceConfig {
            python: "python3".to_string(),
            script: PathBuf::from("src/yue/infer.py"),
            workdir: root.to_path_buf(),
            output_root: root.join("out"),
            stage1_model: root.join("models/stage1"),
            stage2_model: root.join("models/stage2"),
            timeout: None,
        }
    }

    fn flag_value(args: &[OsString], flag: &str) -> Option<String> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|v| v.to_string_lossy().to_string())
    }

    #[test]
    fn test_build_args_defaults() {
        let cfg = config(Path::new("/srv"));
        let args = build_args(
            &cfg,
            Path::new("/o/genre.txt"),
            Path::new("/o/lyrics.txt"),
            Path::new("/o"),
            &InferenceOptions::default(),
        );
        assert_eq!(flag_value(&args, "--stage2_batch_size").as_deref(), Some("12"));
        assert_eq!(flag_value(&args, "--run_n_segments").as_deref(), Some("1"));
        assert_eq!(flag_value(&args, "--max_new_tokens").as_deref(), Some("3000"));
        assert_eq!(flag_value(&args, "--repetition_penalty").as_deref(), Some("1.1"));
        assert_eq!(flag_value(&args, "--stage2_cache_size").as_deref(), Some("32768"));
        assert_eq!(flag_value(&args, "--stage1_model").as_deref(), Some("/srv/models/stage1"));
        assert!(args.iter().any(|a| a == "--stage1_use_exl2"));
        assert!(!args.iter().any(|a| a == "--cuda_idx" || a == "--keep_intermediate"));
    }

    #[test]
    fn test_build_args_overrides_and_flags() {
        let cfg = config(Path::new("/srv"));
        let opts = InferenceOptions {
            max_new_tokens: Some(1500),
            cuda_idx: Some(1),
            stage1_cache_mode: Some("Q4".into()),
            keep_intermediate: true,
            disable_offload_model: true,
            ..Default::default()
        };
        let args = build_args(&cfg, Path::new("g"), Path::new("l"), Path::new("o"), &opts);
        assert_eq!(flag_value(&args, "--max_new_tokens").as_deref(), Some("1500"));
        assert_eq!(flag_value(&args, "--cuda_idx").as_deref(), Some("1"));
        assert_eq!(flag_value(&args, "--stage1_cache_mode").as_deref(), Some("Q4"));
        assert!(args.iter().any(|a| a == "--keep_intermediate"));
        assert!(args.iter().any(|a| a == "--disable_offload_model"));
        assert!(!args.iter().any(|a| a == "--stage1_no_guidance"));
    }

    #[test]
    fn test_discover_picks_largest_wav() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path();
        std::fs::create_dir_all(dir.join("vocoder/mix")).unwrap();
        std::fs::write(dir.join("vocoder/mix/small.wav"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.join("vocoder/mix/big.wav"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.join("song.mp3"), vec![0u8; 1000]).unwrap();
        std::fs::write(dir.join("lyrics.txt"), b"x").unwrap();

        let found = discover_outputs(dir).unwrap();
        assert_eq!(found.primary, Some(dir.join("vocoder/mix/big.wav")));
        assert_eq!(found.files.len(), 3);
        assert!(!found.files.contains_key("lyrics.txt"));
    }

    #[test]
    fn test_discover_falls_back_to_mp3_then_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover_outputs(tmp.path()).unwrap().primary.is_none());
        std::fs::write(tmp.path().join("out.MP3"), b"id3").unwrap();
        assert_eq!(discover_outputs(tmp.path()).unwrap().primary, Some(tmp.path().join("out.MP3")));
    }

    struct FixedLyrics;

    #[async_trait]
    impl LyricsProvider for FixedLyrics {
        fn name(&self) -> &str {
            "fixed"
        }
        async fn generate_lyrics(&self, _prompt: &str) -> Result<String, LyricsError> {
            Ok("[verse]\nrain on the window".to_string())
        }
        async fn extract_genre(&self, _prompt: &str) -> Result<String, LyricsError> {
            Err(LyricsError::Empty)
        }
    }

    fn progress() -> JobProgress {
        let registry = Arc::new(JobRegistry::new(120));
        registry.admit("job".into(), &GenerationRequest::default());
        JobProgress::new(registry, "job")
    }

    #[tokio::test]
    async fn test_resolve_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = InferenceBackend::new(config(tmp.path()), Some(Arc::new(FixedLyrics)));

        let req = GenerationRequest {
            prompt: Some("rainy day".into()),
            ..Default::default()
        };
        let (lyrics, genre) = backend.resolve_inputs(&req, &progress()).await.unwrap();
        assert_eq!(lyrics.as_deref(), Some("[verse]\nrain on the window"));
        assert_eq!(genre, DEFAULT_GENRE);

        let req = GenerationRequest {
            lyrics: Some("hello".into()),
            genre: Some("jazz".into()),
            prompt: Some("ignored".into()),
            ..Default::default()
        };
        let (lyrics, genre) = backend.resolve_inputs(&req, &progress()).await.unwrap();
        assert_eq!(lyrics.as_deref(), Some("hello"));
        assert_eq!(genre, "jazz");

        let no_provider = InferenceBackend::new(config(tmp.path()), None);
        let req = GenerationRequest {
            prompt: Some("rainy day".into()),
            ..Default::default()
        };
        let err = no_provider.resolve_inputs(&req, &progress()).await.unwrap_err();
        assert!(matches!(err, JobError::Lyrics(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_generate_runs_program_and_collects_audio() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("fake_infer.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = --output_dir ]; then out=\"$2\"; fi\n  shift\ndone\necho generating\nprintf 'RIFF' > \"$out/song.wav\"\n",
        )
        .unwrap();

        let cfg = InferenceConfig {
            python: "sh".to_string(),
            script,
            ..config(tmp.path())
        };
        let backend = InferenceBackend::new(cfg, None);
        let job = QueuedJob {
            request_id: "job".to_string(),
            request: GenerationRequest {
                lyrics: Some("one\ntwo".into()),
                genre: Some("rock".into()),
                ..Default::default()
            },
        };
        let out = backend.generate(&job, &progress()).await.unwrap();
        assert_eq!(out.output_file, Some(tmp.path().join("out/job/song.wav")));
        assert_eq!(out.genre.as_deref(), Some("rock"));
        assert_eq!(out.lyrics.as_deref(), Some("[verse]\none\ntwo"));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("out/job/genre.txt")).unwrap(),
            "rock"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_inference_error() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("broken.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'CUDA out of memory' >&2\nexit 3\n").unwrap();
        let cfg = InferenceConfig {
            python: "sh".to_string(),
            script,
            ..config(tmp.path())
        };
        let backend = InferenceBackend::new(cfg, None);
        let job = QueuedJob {
            request_id: "job".to_string(),
            request: GenerationRequest {
                lyrics: Some("x".into()),
                genre: Some("pop".into()),
                ..Default::default()
            },
        };
        let err = backend.generate(&job, &progress()).await.unwrap_err();
        match err {
            JobError::Inference(msg) => assert!(msg.contains("CUDA out of memory"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
