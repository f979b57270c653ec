use clap::{Parser, ValueEnum};

use cadenza_server::lyrics::ProviderKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FetchSource {
    /// `huggingface-cli download` per artifact.
    Hub,
    /// `gsutil -m cp -r` from `--object-store-uri`.
    ObjectStore,
    /// Copy from `--local-source-dir`.
    Local,
}

#[derive(Debug, Parser)]
#[command(name = "cadenza-server", about = "Music generation inference server")]
pub struct Args {
    #[arg(long, env = "CADENZA_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    // ---- Models ----

    /// Root directory holding one sub-directory per artifact.
    #[arg(long, env = "CADENZA_MODEL_DIR", default_value = "/models")]
    pub model_dir: String,

    /// `name=source` pairs; defaults to the two-stage layout.
    #[arg(long = "artifact", env = "CADENZA_ARTIFACTS", value_delimiter = ',')]
    pub artifacts: Vec<String>,

    #[arg(long, env = "CADENZA_FETCH_SOURCE", value_enum, default_value_t = FetchSource::Hub)]
    pub fetch_source: FetchSource,

    /// Base URI for `object-store` fetches, e.g. gs://bucket/models.
    #[arg(long, env = "CADENZA_OBJECT_STORE_URI")]
    pub object_store_uri: Option<String>,

    #[arg(long, env = "CADENZA_LOCAL_SOURCE_DIR")]
    pub local_source_dir: Option<String>,

    /// HuggingFace endpoint mirror (sets HF_ENDPOINT).
    #[arg(long, env = "HF_ENDPOINT")]
    pub hf_endpoint: Option<String>,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,

    /// Bound on one fetch + verify attempt.
    #[arg(long, env = "CADENZA_DOWNLOAD_TIMEOUT_SECS", default_value_t = 600)]
    pub download_timeout_secs: u64,

    #[arg(long, env = "CADENZA_DOWNLOAD_ATTEMPTS", default_value_t = 3)]
    pub download_attempts: u32,

    #[arg(long, env = "CADENZA_DOWNLOAD_BACKOFF_SECS", default_value_t = 2)]
    pub download_backoff_secs: u64,

    #[arg(long, env = "CADENZA_DOWNLOAD_MAX_BACKOFF_SECS", default_value_t = 60)]
    pub download_max_backoff_secs: u64,

    /// Give up waiting for another caller's download after this long. Unset waits forever.
    #[arg(long, env = "CADENZA_LOCK_WAIT_TIMEOUT_SECS")]
    pub lock_wait_timeout_secs: Option<u64>,

    /// Check the model directory at boot and mark models ready if complete.
    #[arg(long, env = "CADENZA_VERIFY_ON_STARTUP", default_value_t = true, action = clap::ArgAction::Set)]
    pub verify_on_startup: bool,

    /// Start downloading missing models in the background at boot.
    #[arg(long, env = "CADENZA_PRELOAD", default_value_t = false)]
    pub preload: bool,

    // ---- Jobs ----

    #[arg(long, env = "CADENZA_QUEUE_MAX_SIZE", default_value_t = 16)]
    pub queue_max_size: usize,

    /// Per-job estimate used for the queue wait hint.
    #[arg(long, env = "CADENZA_JOB_ESTIMATE_SECS", default_value_t = 120)]
    pub job_estimate_secs: u64,

    /// Persist job records here and reload them at startup.
    #[arg(long, env = "CADENZA_RESULTS_FILE")]
    pub results_file: Option<String>,

    /// Completed and failed jobs kept before the oldest are dropped. 0 keeps all.
    #[arg(long, env = "CADENZA_MAX_FINISHED_JOBS", default_value_t = 1000)]
    pub max_finished_jobs: usize,

    #[arg(long, env = "CADENZA_OUTPUT_DIR", default_value = "/tmp/cadenza/output")]
    pub output_dir: String,

    // ---- Inference program ----

    #[arg(long, env = "CADENZA_PYTHON", default_value = "python3")]
    pub python: String,

    #[arg(long, env = "CADENZA_INFER_SCRIPT", default_value = "src/yue/infer.py")]
    pub infer_script: String,

    #[arg(long, env = "CADENZA_INFER_WORKDIR", default_value = ".")]
    pub infer_workdir: String,

    /// Kill the inference program after this long. Unset lets it run.
    #[arg(long, env = "CADENZA_INFER_TIMEOUT_SECS")]
    pub infer_timeout_secs: Option<u64>,

    // ---- Lyrics ----

    #[arg(long, env = "CADENZA_LYRICS_PROVIDER", value_enum, default_value_t = ProviderKind::Anthropic)]
    pub lyrics_provider: ProviderKind,

    /// Key for `--lyrics-provider anthropic`; enables prompt-only requests.
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Key for `--lyrics-provider openai`.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Defaults to the provider's recommended model.
    #[arg(long, env = "CADENZA_LYRICS_MODEL")]
    pub lyrics_model: Option<String>,

    #[arg(long, env = "CADENZA_LYRICS_BASE_URL")]
    pub lyrics_base_url: Option<String>,

    #[arg(long, env = "CADENZA_LYRICS_TIMEOUT_SECS", default_value_t = 60)]
    pub lyrics_timeout_secs: u64,

    /// Saves prompts edited over HTTP here so they survive restarts.
    #[arg(long, env = "CADENZA_PROMPT_DIR")]
    pub prompt_dir: Option<String>,

    /// JSON file with a `genre` list replacing the built-in genre tags.
    #[arg(long, env = "CADENZA_GENRE_TAGS_FILE")]
    pub genre_tags_file: Option<String>,

    // ---- Auth ----

    /// Comma-separated API keys. Empty disables auth.
    #[arg(long, env = "CADENZA_API_KEYS", hide_env_values = true)]
    pub api_keys: Option<String>,

    /// Requests per minute per key, 0 disables the limit.
    #[arg(long, env = "CADENZA_RATE_LIMIT_PER_MINUTE", default_value_t = 0)]
    pub rate_limit_per_minute: u64,

    // ---- Telemetry ----

    /// OTLP/HTTP base URL for trace export.
    #[arg(long, env = "CADENZA_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "CADENZA_OTLP_TOKEN", hide_env_values = true)]
    pub otlp_token: Option<String>,

    /// `text` or `json`.
    #[arg(long, env = "CADENZA_LOG_FORMAT", default_value = "text")]
    pub log_format: String,
}
