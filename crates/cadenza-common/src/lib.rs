pub mod job;
pub mod model_status;
pub mod predict;

pub use job::{GenerationRequest, InferenceOptions, JobRecord, JobStatus};
pub use model_status::{ArtifactStatus, ModelReadinessState, ModelStatus};
pub use predict::{parse_predict_body, JobAccepted, LyricsResult, PredictCall, PredictResponse};

pub mod auth;
pub mod telemetry;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
