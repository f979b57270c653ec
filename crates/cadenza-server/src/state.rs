use std::sync::Arc;

use cadenza_common::auth::ApiKeyConfig;

use crate::coordinator::ModelCoordinator;
use crate::genres::GenreCatalog;
use crate::lyrics::LyricsProvider;
use crate::metrics::Metrics;
use crate::prompts::PromptStore;
use crate::registry::JobRegistry;
use crate::sequencer::JobSequencer;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ModelCoordinator>,
    pub sequencer: Arc<JobSequencer>,
    pub registry: Arc<JobRegistry>,
    /// Used for `lyrics_only` requests; jobs get their own copy via the backend.
    pub lyrics: Option<Arc<dyn LyricsProvider>>,
    /// Shared with the lyrics provider, edited over HTTP.
    pub prompts: Arc<PromptStore>,
    pub genres: Arc<GenreCatalog>,
    pub metrics: Arc<Metrics>,
    pub auth: ApiKeyConfig,
}

impl AsRef<ApiKeyConfig> for AppState {
    fn as_ref(&self) -> &ApiKeyConfig {
        &self.auth
    }
}
