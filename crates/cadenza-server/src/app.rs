use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use cadenza_common::auth::api_key_middleware;

use crate::handlers::{
    download_models, download_result, generate_lyrics_with_genres, get_genre_prompt, get_system_prompt,
    health, index, job_result, models_status, predict, provider, put_genre_prompt, put_system_prompt,
    readiness,
};
use crate::metrics::{metrics_handler, track_requests};
use crate::state::AppState;

/// Full HTTP surface. Health, readiness, model status, provider info and
/// metrics stay public; everything that queues work, returns results or
/// edits prompts goes through the API-key middleware.
pub fn build_app(st: AppState) -> Router {
    let authed_routes = Router::new()
        .route("/predict", post(predict))
        .route("/generate", post(predict))
        .route("/download-models", post(download_models))
        .route("/result/:id", get(job_result))
        .route("/status/:id", get(job_result))
        .route("/download/:id", get(download_result))
        .route("/generate_lyrics_with_genres", post(generate_lyrics_with_genres))
        .route("/system_prompt", get(get_system_prompt).put(put_system_prompt))
        .route("/genre_prompt", get(get_genre_prompt).put(put_genre_prompt))
        .layer(middleware::from_fn_with_state(
            st.clone(),
            api_key_middleware::<AppState>,
        ));

    let public_routes = Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/readiness", get(readiness))
        .route("/models/status", get(models_status))
        .route("/provider", get(provider))
        .route("/metrics", get(metrics_handler));

    public_routes
        .merge(authed_routes)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}
