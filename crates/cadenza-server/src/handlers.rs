use std::path::{Path, PathBuf};

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path as UrlPath, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::io::ReaderStream;

use cadenza_common::{
    parse_predict_body, GenerationRequest, JobAccepted, JobRecord, JobStatus, LyricsResult,
    ModelReadinessState, PredictCall, PredictResponse,
};

use crate::genres::DEFAULT_GENRE;
use crate::prompts::PromptKind;
use crate::sequencer::AdmissionError;
use crate::state::AppState;

/// Suggested client back-off while models are downloading.
const DOWNLOAD_RETRY_AFTER_SECS: u64 = 300;

pub fn api_error(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"error": {"message": message.into(), "type": kind}})),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

pub async fn index() -> impl IntoResponse {
    Json(json!({
        "service": "cadenza",
        "endpoints": {
            "health": "GET /health",
            "readiness": "GET /readiness",
            "predict": "POST /predict",
            "generate": "POST /generate",
            "download_models": "POST /download-models",
            "models_status": "GET /models/status",
            "result": "GET /result/{request_id}",
            "status": "GET /status/{request_id}",
            "download": "GET /download/{request_id}?type=wav",
            "generate_lyrics_with_genres": "POST /generate_lyrics_with_genres",
            "system_prompt": "GET|PUT /system_prompt",
            "genre_prompt": "GET|PUT /genre_prompt",
            "provider": "GET /provider",
            "metrics": "GET /metrics",
        }
    }))
}

/// Always 200 so the platform keeps routing to the instance while models
/// are still being fetched.
pub async fn health(State(st): State<AppState>) -> impl IntoResponse {
    let models = st.coordinator.get_status();
    Json(json!({
        "status": "healthy",
        "message": models.message,
        "models": models,
        "queue": {
            "depth": st.sequencer.depth(),
            "capacity": st.sequencer.capacity(),
        },
        "jobs": st.registry.len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn readiness(State(st): State<AppState>) -> impl IntoResponse {
    let state = st.coordinator.state();
    Json(json!({
        "ready": true,
        "models_ready": state == ModelReadinessState::Ready,
        "model_state": state,
    }))
}

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

pub async fn models_status(State(st): State<AppState>) -> impl IntoResponse {
    Json(st.coordinator.get_status())
}

pub async fn download_models(State(st): State<AppState>) -> Response {
    match st.coordinator.get_status().state {
        ModelReadinessState::Ready => {
            return Json(json!({
                "status": "already_loaded",
                "message": "models are already loaded",
            }))
            .into_response();
        }
        ModelReadinessState::Downloading => {
            return (
                StatusCode::ACCEPTED,
                Json(json!({
                    "status": "downloading",
                    "message": "model download already in progress",
                })),
            )
                .into_response();
        }
        _ => {}
    }

    match st.coordinator.ensure_models_available().await {
        Ok(()) => Json(json!({
            "status": "success",
            "message": "models downloaded successfully",
        }))
        .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "message": e.to_string(),
            })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Predict
// ---------------------------------------------------------------------------

pub async fn predict(
    State(st): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let call = match body {
        Ok(Json(v)) => parse_predict_body(v),
        Err(rej) => Err(rej.body_text()),
    };
    match call {
        Err(msg) => api_error(StatusCode::BAD_REQUEST, "invalid_request", msg),
        Ok(PredictCall::Status(id)) => match st.registry.get(&id) {
            Some(rec) => Json(PredictResponse::single(rec)).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(PredictResponse::single(json!({
                    "request_id": id,
                    "error": "request id not found",
                }))),
            )
                .into_response(),
        },
        Ok(PredictCall::Generate(req)) => submit(&st, req).await,
    }
}

async fn submit(st: &AppState, req: GenerationRequest) -> Response {
    if let Err(msg) = req.validate() {
        return api_error(StatusCode::BAD_REQUEST, "invalid_request", msg);
    }
    if req.lyrics_only {
        return lyrics_only(st, &req).await;
    }
    match queue_generation(st, req).await {
        Ok(accepted) => Json(PredictResponse::single(accepted)).into_response(),
        Err(resp) => resp,
    }
}

fn downloading_response() -> Response {
    let mut resp = (
        StatusCode::ACCEPTED,
        Json(PredictResponse::single(json!({
            "status": "downloading",
            "message": "models are currently being downloaded, retry later",
            "retry_after_seconds": DOWNLOAD_RETRY_AFTER_SECS,
        }))),
    )
        .into_response();
    resp.headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(DOWNLOAD_RETRY_AFTER_SECS));
    resp
}

/// Makes sure the models are usable, then admits the job.
///
/// A download already in progress answers 202 straight away instead of
/// holding the request open for its duration. Otherwise a missing model set
/// is fetched inline before admission.
async fn queue_generation(st: &AppState, req: GenerationRequest) -> Result<JobAccepted, Response> {
    if st.coordinator.state() == ModelReadinessState::Downloading {
        return Err(downloading_response());
    }
    if let Err(e) = st.coordinator.ensure_models_available().await {
        if st.coordinator.state() == ModelReadinessState::Downloading {
            return Err(downloading_response());
        }
        tracing::warn!(error=%e, "rejecting generation, models unavailable");
        return Err(api_error(StatusCode::SERVICE_UNAVAILABLE, "models_unavailable", e.to_string()));
    }

    st.sequencer.submit(req).map_err(|e| match e {
        AdmissionError::QueueFull { .. } => {
            api_error(StatusCode::TOO_MANY_REQUESTS, "queue_full", e.to_string())
        }
        AdmissionError::Closed => api_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", e.to_string()),
    })
}

async fn lyrics_only(st: &AppState, req: &GenerationRequest) -> Response {
    let Some(provider) = st.lyrics.as_ref() else {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "lyrics_unavailable",
            "no lyrics provider configured",
        );
    };
    let prompt = req.prompt.as_deref().unwrap_or_default();
    let request_id = uuid::Uuid::new_v4().to_string();

    let lyrics = match provider.generate_lyrics(prompt).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(%request_id, error=%e, "lyrics generation failed");
            return api_error(StatusCode::BAD_GATEWAY, "lyrics_provider_error", e.to_string());
        }
    };
    let genre = match req.genre.clone().filter(|g| !g.trim().is_empty()) {
        Some(g) => Some(g),
        None => provider
            .extract_genre(prompt)
            .await
            .map_err(|e| tracing::warn!(%request_id, error=%e, "genre extraction failed"))
            .ok(),
    };

    Json(PredictResponse::single(LyricsResult {
        request_id,
        status: JobStatus::Complete,
        lyrics,
        genre,
    }))
    .into_response()
}

// ---------------------------------------------------------------------------
// Lyrics with genres
// ---------------------------------------------------------------------------

/// Inference settings applied to genre-driven jobs unless the request
/// overrides them.
fn apply_genre_job_defaults(req: &mut GenerationRequest) {
    let o = &mut req.options;
    o.stage2_batch_size.get_or_insert(12);
    o.run_n_segments.get_or_insert(2);
    o.max_new_tokens.get_or_insert(3000);
    o.repetition_penalty.get_or_insert(1.1);
    o.stage2_cache_size.get_or_insert(32768);
}

/// Reads `genres` as a list of strings. Absent, null and empty all mean
/// "infer from the prompt".
fn requested_genres(body: &Value) -> Result<Vec<String>, String> {
    match body.get("genres") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|g| match g {
                Value::String(s) => Ok(s.clone()),
                other => Err(format!("invalid genre type: {other} (should be a string)")),
            })
            .collect(),
        Some(_) => Err("genres should be an array of strings".to_string()),
    }
}

/// Writes lyrics in the requested (or inferred) genres, then queues the
/// song with the first genre as its primary style.
pub async fn generate_lyrics_with_genres(
    State(st): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(v)) => v,
        Err(rej) => return api_error(StatusCode::BAD_REQUEST, "invalid_request", rej.body_text()),
    };
    let prompt = match body.get("prompt").and_then(Value::as_str).map(str::trim) {
        Some(p) if !p.is_empty() => p.to_string(),
        _ => return api_error(StatusCode::BAD_REQUEST, "invalid_request", "missing required field: prompt"),
    };
    let requested = match requested_genres(&body) {
        Ok(g) => g,
        Err(msg) => return api_error(StatusCode::BAD_REQUEST, "invalid_request", msg),
    };
    let mut req: GenerationRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return api_error(StatusCode::BAD_REQUEST, "invalid_request", e.to_string()),
    };
    let Some(provider) = st.lyrics.clone() else {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "lyrics_unavailable",
            "no lyrics provider configured",
        );
    };
    if st.coordinator.state() == ModelReadinessState::Downloading {
        return downloading_response();
    }

    let selection = st.genres.validate(requested.as_slice());
    let inferred = selection.valid.is_empty();
    let genres = if inferred {
        let suggested = provider.infer_genres(&prompt).await.unwrap_or_else(|e| {
            tracing::warn!(error=%e, "genre inference failed, using default");
            Vec::new()
        });
        let valid = st.genres.validate(suggested.as_slice()).valid;
        if valid.is_empty() {
            vec![DEFAULT_GENRE.to_string()]
        } else {
            valid
        }
    } else {
        selection.valid
    };

    let lyrics = match provider.generate_lyrics_with_genres(&prompt, &genres).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error=%e, ?genres, "genre lyrics generation failed");
            return api_error(StatusCode::BAD_GATEWAY, "lyrics_provider_error", e.to_string());
        }
    };

    req.prompt = None;
    req.lyrics_only = false;
    req.lyrics = Some(lyrics.clone());
    req.genre = genres.first().cloned();
    apply_genre_job_defaults(&mut req);

    let accepted = match queue_generation(&st, req).await {
        Ok(a) => a,
        Err(resp) => return resp,
    };
    let request_id = accepted.request_id.clone();
    let mut out = serde_json::to_value(&accepted).unwrap_or_else(|_| json!({}));
    if let Value::Object(map) = &mut out {
        map.insert("lyrics".into(), json!(lyrics));
        map.insert("used_genres".into(), json!(genres));
        map.insert("lyrics_provider".into(), json!(provider.name()));
        map.insert("genres_were_inferred".into(), json!(inferred));
        map.insert(
            "download_instructions".into(),
            json!({
                "check_status": format!("/result/{request_id}"),
                "download_when_ready": format!("/download/{request_id}"),
                "supported_formats": ["wav", "mp3", "mid"],
            }),
        );
        if inferred {
            map.insert(
                "genre_info".into(),
                json!({
                    "message": "genres were inferred from the prompt",
                    "inferred_genres": genres,
                }),
            );
        }
        if !selection.rejected.is_empty() {
            map.insert(
                "warnings".into(),
                json!({
                    "invalid_genres": selection.rejected,
                    "message": "some genres were not recognized and were omitted",
                }),
            );
        }
    }
    Json(out).into_response()
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn provider_name(st: &AppState) -> &str {
    st.lyrics.as_deref().map(|p| p.name()).unwrap_or("none")
}

fn show_prompt(st: &AppState, kind: PromptKind) -> Response {
    Json(json!({
        "prompt": st.prompts.get(kind),
        "provider": provider_name(st),
    }))
    .into_response()
}

async fn update_prompt(st: &AppState, kind: PromptKind, body: Result<Json<Value>, JsonRejection>) -> Response {
    let body = match body {
        Ok(Json(v)) => v,
        Err(rej) => return api_error(StatusCode::BAD_REQUEST, "invalid_request", rej.body_text()),
    };
    let text = match body.get("prompt") {
        None => return api_error(StatusCode::BAD_REQUEST, "invalid_request", "missing required field: prompt"),
        Some(Value::String(s)) => s.clone(),
        Some(_) => return api_error(StatusCode::BAD_REQUEST, "invalid_request", "prompt must be a string"),
    };
    if let Err(e) = st.prompts.set(kind, text.clone()).await {
        tracing::error!(?kind, error=%e, "failed to save prompt");
        return api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "prompt_not_saved",
            format!("failed to save prompt: {e}"),
        );
    }
    Json(json!({
        "message": "prompt updated",
        "prompt": text,
        "provider": provider_name(st),
    }))
    .into_response()
}

pub async fn get_system_prompt(State(st): State<AppState>) -> Response {
    show_prompt(&st, PromptKind::Lyrics)
}

pub async fn put_system_prompt(
    State(st): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    update_prompt(&st, PromptKind::Lyrics, body).await
}

pub async fn get_genre_prompt(State(st): State<AppState>) -> Response {
    show_prompt(&st, PromptKind::Genre)
}

pub async fn put_genre_prompt(
    State(st): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Response {
    update_prompt(&st, PromptKind::Genre, body).await
}

pub async fn provider(State(st): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "provider": provider_name(&st),
        "configured": st.lyrics.is_some(),
        "genres": st.genres.len(),
    }))
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

pub async fn job_result(State(st): State<AppState>, UrlPath(id): UrlPath<String>) -> Response {
    match st.registry.get(&id) {
        Some(rec) => Json(rec).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "not_found", "request id not found"),
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

pub async fn download_result(
    State(st): State<AppState>,
    UrlPath(id): UrlPath<String>,
    Query(q): Query<DownloadQuery>,
) -> Response {
    let kind = q.kind.unwrap_or_else(|| "wav".to_string()).to_ascii_lowercase();
    let Some(rec) = st.registry.get(&id) else {
        return api_error(StatusCode::NOT_FOUND, "not_found", "request id not found");
    };
    if rec.status != JobStatus::Complete {
        return api_error(
            StatusCode::NOT_FOUND,
            "not_ready",
            format!("song generation not complete (status: {})", rec.status),
        );
    }
    let Some(path) = pick_file(&rec, &kind) else {
        return api_error(StatusCode::NOT_FOUND, "not_found", format!("no {kind} file for this request"));
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::error!(request_id=%id, path=%path.display(), error=%e, "result file unreadable");
            return api_error(StatusCode::NOT_FOUND, "not_found", "result file is no longer available");
        }
    };
    let len = file.metadata().await.ok().map(|m| m.len());

    let filename = format!("{}_{}.{}", safe_name(&rec.song_name), rec.request_id, kind);
    let mut resp = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type(&kind)));
    if let Ok(v) = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\"")) {
        headers.insert(header::CONTENT_DISPOSITION, v);
    }
    if let Some(len) = len {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }
    resp
}

/// The primary output if it has the requested extension, otherwise any
/// recorded result file that does.
fn pick_file(rec: &JobRecord, kind: &str) -> Option<PathBuf> {
    let has_ext = |p: &str| {
        Path::new(p)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(kind))
            .unwrap_or(false)
    };
    rec.output_file
        .as_deref()
        .filter(|p| has_ext(p))
        .or_else(|| rec.file_paths.values().map(String::as_str).find(|p| has_ext(p)))
        .map(PathBuf::from)
}

fn content_type(kind: &str) -> &'static str {
    match kind {
        "wav" => "audio/wav",
        "mp3" => "audio/mpeg",
        "mid" => "audio/midi",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
