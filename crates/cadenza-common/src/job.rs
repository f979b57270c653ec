use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_ID: &str = "anonymous";
pub const DEFAULT_SONG_NAME: &str = "untitled_song";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    GeneratingLyrics,
    GeneratingAudio,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::GeneratingLyrics => "generating_lyrics",
            JobStatus::GeneratingAudio => "generating_audio",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Knobs forwarded to the inference program. Unset fields use the
/// program-side defaults applied by the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage2_batch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_n_segments: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_new_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage2_cache_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cuda_idx: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage1_cache_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage1_cache_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage2_cache_mode: Option<String>,
    #[serde(default)]
    pub stage1_no_guidance: bool,
    #[serde(default)]
    pub keep_intermediate: bool,
    #[serde(default)]
    pub disable_offload_model: bool,
}

/// A user generation request as submitted to `/predict`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub song_name: Option<String>,
    #[serde(default)]
    pub lyrics: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    /// Free-text description; lyrics and genre are derived from it when absent.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Return generated lyrics inline instead of queueing audio generation.
    #[serde(default)]
    pub lyrics_only: bool,
    #[serde(flatten)]
    pub options: InferenceOptions,
}

impl GenerationRequest {
    fn non_empty(v: &Option<String>) -> bool {
        v.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false)
    }

    pub fn has_prompt(&self) -> bool {
        Self::non_empty(&self.prompt)
    }

    /// Checks that the request carries enough input to produce a song.
    pub fn validate(&self) -> Result<(), String> {
        if self.lyrics_only {
            if self.has_prompt() {
                return Ok(());
            }
            return Err("lyrics_only requires a prompt".to_string());
        }
        if self.has_prompt() {
            return Ok(());
        }
        let mut missing = Vec::new();
        if self.lyrics.is_none() {
            missing.push("lyrics");
        }
        if !Self::non_empty(&self.genre) {
            missing.push("genre");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing required fields: {}", missing.join(", ")))
        }
    }

    pub fn user_id_or_default(&self) -> String {
        self.user_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_ID.to_string())
    }

    pub fn song_name_or_default(&self) -> String {
        self.song_name
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SONG_NAME.to_string())
    }
}

/// Tracked state of one generation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub request_id: String,
    pub status: JobStatus,

    /// Admission order; position in queue is derived from it.
    #[serde(default)]
    pub ticket: u64,

    pub user_id: String,
    pub song_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lyrics: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub queued_at_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<String>,
    /// Primary audio artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<String>,
    /// File name → absolute path of every result file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub file_paths: BTreeMap<String, String>,

    // Computed on read, never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_wait_time_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_queue_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl JobRecord {
    pub fn new(request_id: String, ticket: u64, req: &GenerationRequest, now_ms: u64) -> Self {
        Self {
            request_id,
            status: JobStatus::Queued,
            ticket,
            user_id: req.user_id_or_default(),
            song_name: req.song_name_or_default(),
            genre: req.genre.clone(),
            lyrics: req.lyrics.clone(),
            error: None,
            queued_at_ms: now_ms,
            started_at_ms: None,
            completed_at_ms: None,
            output_dir: None,
            output_file: None,
            file_paths: BTreeMap::new(),
            queue_position: None,
            estimated_wait_time_seconds: None,
            time_in_queue_secs: None,
            processing_time_secs: None,
            download_url: None,
        }
    }

    /// Drops the fields that are only meaningful in a live read.
    pub fn clear_computed(&mut self) {
        self.queue_position = None;
        self.estimated_wait_time_seconds = None;
        self.time_in_queue_secs = None;
        self.processing_time_secs = None;
        self.download_url = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_requires_lyrics_and_genre_without_prompt() {
        let req = GenerationRequest {
            lyrics: Some("[verse]\nla la".into()),
            ..Default::default()
        };
        assert_eq!(req.validate().unwrap_err(), "missing required fields: genre");

        let req = GenerationRequest {
            prompt: Some("a song about rain".into()),
            ..Default::default()
        };
        assert!(req.validate().is_ok());

        let req = GenerationRequest {
            lyrics_only: true,
            ..Default::default()
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_options_are_flattened() {
        let raw = r#"{"lyrics":"x","genre":"pop","max_new_tokens":1500,"keep_intermediate":true}"#;
        let req: GenerationRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.options.max_new_tokens, Some(1500));
        assert!(req.options.keep_intermediate);
        assert_eq!(req.song_name_or_default(), DEFAULT_SONG_NAME);
    }

    #[test]
    fn test_status_terminal() {
        assert!(JobStatus::Complete.is_terminal());
        assert!(JobStatus::Error.is_terminal());
        assert!(!JobStatus::GeneratingAudio.is_terminal());
        assert_eq!(
            serde_json::to_string(&JobStatus::GeneratingLyrics).unwrap(),
            "\"generating_lyrics\""
        );
    }
}
