mod args;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use cadenza_common::auth::ApiKeyConfig;
use cadenza_server::app::build_app;
use cadenza_server::artifacts::{parse_artifacts, Artifact};
use cadenza_server::coordinator::{CoordinatorConfig, ModelCoordinator};
use cadenza_server::fetcher::{ArtifactFetcher, HubFetcher, LocalFetcher, ObjectStoreFetcher};
use cadenza_server::inference::{InferenceBackend, InferenceConfig};
use cadenza_server::genres::GenreCatalog;
use cadenza_server::lyrics::{create_lyrics_provider, ChatSettings, LyricsProvider, ProviderKind};
use cadenza_server::metrics::Metrics;
use cadenza_server::prompts::PromptStore;
use cadenza_server::registry::JobRegistry;
use cadenza_server::retry::RetryPolicy;
use cadenza_server::sequencer::JobSequencer;
use cadenza_server::state::AppState;

use crate::args::{Args, FetchSource};

fn build_fetcher(args: &Args) -> anyhow::Result<Arc<dyn ArtifactFetcher>> {
    let fetcher: Arc<dyn ArtifactFetcher> = match args.fetch_source {
        FetchSource::Hub => Arc::new(HubFetcher::new(args.hf_endpoint.clone(), args.hf_token.clone())),
        FetchSource::ObjectStore => {
            let uri = args
                .object_store_uri
                .as_deref()
                .context("--object-store-uri is required with --fetch-source object-store")?;
            Arc::new(ObjectStoreFetcher::new(uri))
        }
        FetchSource::Local => {
            let dir = args
                .local_source_dir
                .as_deref()
                .context("--local-source-dir is required with --fetch-source local")?;
            Arc::new(LocalFetcher {
                source_root: PathBuf::from(dir),
            })
        }
    };
    Ok(fetcher)
}

/// Directory for a named stage, falling back to position in the list.
fn stage_dir(artifacts: &[Artifact], name: &str, index: usize) -> anyhow::Result<PathBuf> {
    artifacts
        .iter()
        .find(|a| a.name == name)
        .or_else(|| artifacts.get(index))
        .map(|a| a.dir.clone())
        .with_context(|| format!("no artifact configured for {name}"))
}

fn build_lyrics(
    args: &Args,
    prompts: Arc<PromptStore>,
    genres: Arc<GenreCatalog>,
) -> Option<Arc<dyn LyricsProvider>> {
    let key = match args.lyrics_provider {
        ProviderKind::Anthropic => args.anthropic_api_key.clone(),
        ProviderKind::OpenAi => args.openai_api_key.clone(),
    };
    let key = key.filter(|k| !k.is_empty())?;
    let settings = ChatSettings {
        api_key: key,
        model: args.lyrics_model.clone(),
        base_url: args.lyrics_base_url.clone(),
        timeout: Duration::from_secs(args.lyrics_timeout_secs),
    };
    match create_lyrics_provider(args.lyrics_provider, settings, prompts, genres) {
        Ok(p) => {
            tracing::info!(provider = p.name(), "lyrics provider configured");
            Some(p)
        }
        Err(e) => {
            tracing::warn!(error=%e, "failed to build lyrics client, prompt-only requests disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let otel_provider = cadenza_common::telemetry::init_tracing(
        "cadenza-server",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
        &args.log_format,
    );

    let model_dir = Path::new(&args.model_dir);
    let artifacts = parse_artifacts(&args.artifacts, model_dir).map_err(anyhow::Error::msg)?;
    let stage1_model = stage_dir(&artifacts, "stage1", 0)?;
    let stage2_model = stage_dir(&artifacts, "stage2", 1)?;

    let fetcher = build_fetcher(&args)?;
    tracing::info!(
        fetcher = fetcher.name(),
        model_dir = %args.model_dir,
        artifacts = ?artifacts.iter().map(|a| format!("{}={}", a.name, a.source)).collect::<Vec<_>>(),
        "model artifacts configured"
    );

    let coordinator = Arc::new(ModelCoordinator::new(
        artifacts,
        fetcher,
        CoordinatorConfig {
            retry: RetryPolicy {
                max_attempts: args.download_attempts,
                initial_backoff: Duration::from_secs(args.download_backoff_secs),
                max_backoff: Duration::from_secs(args.download_max_backoff_secs),
            },
            download_timeout: Duration::from_secs(args.download_timeout_secs),
            lock_wait_timeout: args.lock_wait_timeout_secs.map(Duration::from_secs),
        },
    ));
    if args.verify_on_startup {
        coordinator.verify_on_startup();
    }
    if args.preload {
        coordinator.spawn_preload();
    }

    let registry = JobRegistry::new(args.job_estimate_secs).with_max_finished(args.max_finished_jobs);
    let registry = Arc::new(match &args.results_file {
        Some(path) => registry
            .with_results_file(PathBuf::from(path))
            .with_context(|| format!("failed to load results file {path}"))?,
        None => registry,
    });

    let prompts = Arc::new(match &args.prompt_dir {
        Some(dir) => PromptStore::load(PathBuf::from(dir))
            .with_context(|| format!("failed to read prompts from {dir}"))?,
        None => PromptStore::in_memory(),
    });
    let genres = Arc::new(match &args.genre_tags_file {
        Some(path) => GenreCatalog::from_tags_file(Path::new(path))
            .with_context(|| format!("failed to load genre tags {path}"))?,
        None => GenreCatalog::builtin(),
    });
    tracing::info!(genres = genres.len(), "genre catalog loaded");

    let lyrics = build_lyrics(&args, prompts.clone(), genres.clone());
    if lyrics.is_none() {
        tracing::warn!("no lyrics provider configured, prompt-only requests will fail");
    }

    let backend = Arc::new(InferenceBackend::new(
        InferenceConfig {
            python: args.python.clone(),
            script: PathBuf::from(&args.infer_script),
            workdir: PathBuf::from(&args.infer_workdir),
            output_root: PathBuf::from(&args.output_dir),
            stage1_model,
            stage2_model,
            timeout: args.infer_timeout_secs.map(Duration::from_secs),
        },
        lyrics.clone(),
    ));

    let (sequencer, worker) =
        JobSequencer::start(args.queue_max_size, registry.clone(), coordinator.clone(), backend);
    let sequencer = Arc::new(sequencer);

    let st = AppState {
        coordinator,
        sequencer: sequencer.clone(),
        registry: registry.clone(),
        lyrics,
        prompts,
        genres,
        metrics: Arc::new(Metrics::default()),
        auth: ApiKeyConfig::from_keys(args.api_keys.as_deref(), args.rate_limit_per_minute),
    };
    let app = build_app(st);

    let listener = tokio::net::TcpListener::bind(&args.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", args.listen_addr))?;
    tracing::info!(addr = %args.listen_addr, queue_max_size = args.queue_max_size, "cadenza-server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    sequencer.shutdown();
    if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
        tracing::warn!("generation worker still busy at shutdown");
    }
    registry.flush().await;
    if let Some(provider) = otel_provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("failed to flush traces: {e}");
        }
    }
    Ok(())
}
