use serde::{Deserialize, Serialize};

/// Readiness of the model artifacts on local disk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelReadinessState {
    NotLoaded,
    Downloading,
    Ready,
    Failed,
}

impl ModelReadinessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelReadinessState::NotLoaded => "not_loaded",
            ModelReadinessState::Downloading => "downloading",
            ModelReadinessState::Ready => "ready",
            ModelReadinessState::Failed => "failed",
        }
    }

    /// Numeric value used for the metrics gauge.
    pub fn as_gauge(self) -> u8 {
        match self {
            ModelReadinessState::NotLoaded => 0,
            ModelReadinessState::Downloading => 1,
            ModelReadinessState::Ready => 2,
            ModelReadinessState::Failed => 3,
        }
    }

    /// Short operator-facing message for health payloads.
    pub fn describe(self) -> &'static str {
        match self {
            ModelReadinessState::NotLoaded => "models will be downloaded on first request",
            ModelReadinessState::Downloading => {
                "models are currently being downloaded, check back in a few minutes"
            }
            ModelReadinessState::Ready => "models loaded and ready for inference",
            ModelReadinessState::Failed => "model loading failed",
        }
    }
}

impl std::fmt::Display for ModelReadinessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// On-disk view of one expected artifact directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactStatus {
    /// Artifact name (e.g. "stage1").
    pub name: String,

    /// Remote identifier the artifact is fetched from (e.g. "m-a-p/YuE-s2-1B-general").
    pub source: String,

    /// Local directory that must be populated.
    pub path: String,

    pub exists: bool,

    /// Regular files directly inside `path`.
    #[serde(default)]
    pub file_count: u32,

    /// `exists && file_count > 0`.
    pub ready: bool,
}

/// Snapshot returned by the coordinator's status read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatus {
    pub state: ModelReadinessState,

    pub message: String,

    /// Last download/verification error, kept until the next successful attempt.
    #[serde(default)]
    pub error: Option<String>,

    pub artifacts: Vec<ArtifactStatus>,

    /// Number of completed download attempts (success or failure) since start.
    #[serde(default)]
    pub completed_attempts: u64,

    /// Start of the in-flight download, ms since epoch.
    #[serde(default)]
    pub download_started_at_ms: Option<u64>,

    /// Last time the state reached READY, ms since epoch.
    #[serde(default)]
    pub ready_at_ms: Option<u64>,
}

impl ModelStatus {
    pub fn is_ready(&self) -> bool {
        self.state == ModelReadinessState::Ready
    }
}
