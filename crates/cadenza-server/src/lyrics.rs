use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::genres::{GenreCatalog, DEFAULT_GENRE};
use crate::prompts::{PromptKind, PromptStore};

const SECTION_MARKERS: [&str; 5] = ["[verse]", "[chorus]", "[bridge]", "[intro]", "[outro]"];

const DEFAULT_SONG: &str = "[verse]
Your melody flows like a gentle stream
Through the silence of my heart
Every note you sing becomes my dream
A masterpiece of art

[chorus]
In this symphony of life we're writing
Each moment a brand new song
With every breath our souls uniting
Together we belong";

/// Normalises lyrics into the sectioned layout the inference program reads.
///
/// Lyrics that already carry a section marker are kept verbatim. Otherwise
/// the non-empty lines are split into sections by count: up to 4 lines form
/// one verse, up to 8 a verse and a chorus, and more are cut into quarters
/// alternating verse and chorus.
pub fn format_lyrics(raw: Option<&str>) -> String {
    let raw = raw.unwrap_or_default();
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return DEFAULT_SONG.to_string();
    }

    let lower = raw.to_lowercase();
    if SECTION_MARKERS.iter().any(|m| lower.contains(m)) {
        return raw.to_string();
    }

    let lines: Vec<&str> = raw.lines().map(str::trim).filter(|l| !l.is_empty()).collect();

    let section = |tag: &str, part: &[&str]| format!("[{tag}]\n{}", part.join("\n"));
    let n = lines.len();
    if n <= 4 {
        section("verse", &lines)
    } else if n <= 8 {
        let mid = n / 2;
        [section("verse", &lines[..mid]), section("chorus", &lines[mid..])].join("\n\n")
    } else {
        let q = n / 4;
        [
            section("verse", &lines[..q]),
            section("chorus", &lines[q..2 * q]),
            section("verse", &lines[2 * q..3 * q]),
            section("chorus", &lines[3 * q..]),
        ]
        .join("\n\n")
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LyricsError {
    #[error("lyrics provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("lyrics provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("lyrics provider returned no text")]
    Empty,
}

/// Turns a free-text description into lyrics and genres.
#[async_trait]
pub trait LyricsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_lyrics(&self, prompt: &str) -> Result<String, LyricsError>;

    /// One catalog genre for the prompt.
    async fn extract_genre(&self, prompt: &str) -> Result<String, LyricsError>;

    /// Two or three genres that suit the prompt, unvalidated.
    async fn infer_genres(&self, prompt: &str) -> Result<Vec<String>, LyricsError> {
        Ok(vec![self.extract_genre(prompt).await?])
    }

    async fn generate_lyrics_with_genres(&self, prompt: &str, _genres: &[String]) -> Result<String, LyricsError> {
        self.generate_lyrics(prompt).await
    }
}

/// One system + user round trip against a hosted chat model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, LyricsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// Anthropic messages API.
    Anthropic,
    /// OpenAI chat completions API.
    #[value(name = "openai")]
    OpenAi,
}

impl ProviderKind {
    pub fn default_base_url(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::OpenAi => "https://api.openai.com",
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "claude-3-5-sonnet-latest",
            ProviderKind::OpenAi => "gpt-4o",
        }
    }
}

/// Connection settings for [`create_lyrics_provider`]. Unset model and base
/// URL use the provider's defaults.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub api_key: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Duration,
}

pub fn create_lyrics_provider(
    kind: ProviderKind,
    settings: ChatSettings,
    prompts: Arc<PromptStore>,
    genres: Arc<GenreCatalog>,
) -> Result<Arc<dyn LyricsProvider>, LyricsError> {
    let base_url = settings.base_url.as_deref().unwrap_or(kind.default_base_url());
    let model = settings
        .model
        .unwrap_or_else(|| kind.default_model().to_string());
    let chat: Arc<dyn ChatModel> = match kind {
        ProviderKind::Anthropic => Arc::new(AnthropicChat::new(base_url, settings.api_key, model, settings.timeout)?),
        ProviderKind::OpenAi => Arc::new(OpenAiChat::new(base_url, settings.api_key, model, settings.timeout)?),
    };
    Ok(Arc::new(PromptedLyrics::new(chat, prompts, genres)))
}

const GENRE_SYSTEM_PROMPT: &str = "Based on the given prompt, determine the most suitable musical genre for the song.
Respond with just a single word genre (e.g. rock, pop, jazz, hiphop, blues).
Do not include any explanations or additional text.";

const INFER_GENRES_PROMPT: &str = "As a music expert, analyze the given prompt and suggest 2-3 musical genres that would work well together.
Consider the theme and mood of the prompt, common genre combinations in modern music, and how well the genres blend.
Respond with ONLY a comma-separated list of genres (e.g. rock, electronic, indie).
Do not include any explanations or additional text.";

fn genre_lyrics_prompt(genres: &[String]) -> String {
    format!(
        "You are a professional songwriter. Generate song lyrics based on the given prompt that incorporate elements from the following genres: {}.
The lyrics MUST follow this exact structure: [verse], [chorus], [verse], [chorus], [bridge], [outro].
Separate sections with exactly one blank line, put each lyric line on its own line, and mark every
section with its type in square brackets (e.g. [verse]).
Use the themes, vocabulary, rhyme patterns and mood typical of these genres.
Do not include any explanations or additional text, just the lyrics.",
        genres.join(", ")
    )
}

/// Lyrics and genres from any [`ChatModel`], steered by the editable
/// prompts and normalised against the genre catalog.
pub struct PromptedLyrics {
    chat: Arc<dyn ChatModel>,
    prompts: Arc<PromptStore>,
    genres: Arc<GenreCatalog>,
}

impl PromptedLyrics {
    pub fn new(chat: Arc<dyn ChatModel>, prompts: Arc<PromptStore>, genres: Arc<GenreCatalog>) -> Self {
        Self { chat, prompts, genres }
    }
}

#[async_trait]
impl LyricsProvider for PromptedLyrics {
    fn name(&self) -> &str {
        self.chat.name()
    }

    async fn generate_lyrics(&self, prompt: &str) -> Result<String, LyricsError> {
        let system = self.prompts.get(PromptKind::Lyrics);
        self.chat.complete(&system, prompt, 1024).await
    }

    async fn extract_genre(&self, prompt: &str) -> Result<String, LyricsError> {
        let extra = self.prompts.get(PromptKind::Genre);
        let system = if extra.trim().is_empty() {
            GENRE_SYSTEM_PROMPT.to_string()
        } else {
            format!("{GENRE_SYSTEM_PROMPT}\n\n{extra}")
        };
        let raw = self.chat.complete(&system, prompt, 50).await?;
        Ok(self.genres.closest(&clean_genre(&raw)))
    }

    async fn infer_genres(&self, prompt: &str) -> Result<Vec<String>, LyricsError> {
        let raw = self.chat.complete(INFER_GENRES_PROMPT, prompt, 100).await?;
        Ok(split_genres(&raw))
    }

    async fn generate_lyrics_with_genres(&self, prompt: &str, genres: &[String]) -> Result<String, LyricsError> {
        self.chat.complete(&genre_lyrics_prompt(genres), prompt, 1024).await
    }
}

/// First non-empty line of a model reply, lowercased, with surrounding
/// punctuation removed.
fn clean_genre(raw: &str) -> String {
    raw.lines()
        .map(|l| {
            l.trim()
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '&')
                .to_lowercase()
        })
        .find(|l| !l.is_empty())
        .unwrap_or_else(|| DEFAULT_GENRE.to_string())
}

fn split_genres(raw: &str) -> Vec<String> {
    raw.split([',', '\n'])
        .map(clean_genre_item)
        .filter(|g| !g.is_empty())
        .collect()
}

fn clean_genre_item(item: &str) -> String {
    item.trim()
        .trim_matches(|c: char| !c.is_alphanumeric() && c != '&')
        .to_lowercase()
}

async fn read_error(resp: reqwest::Response) -> LyricsError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    LyricsError::Status {
        status,
        body: body.chars().take(500).collect(),
    }
}

fn non_empty(text: String) -> Result<String, LyricsError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(LyricsError::Empty);
    }
    Ok(text.to_string())
}

// ---------------------------------------------------------------------------
// Anthropic
// ---------------------------------------------------------------------------

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicChat {
    pub fn new(base_url: &str, api_key: String, model: String, timeout: Duration) -> Result<Self, LyricsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl ChatModel for AnthropicChat {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, LyricsError> {
        let body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": format!("Prompt: {prompt}")}],
        });

        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }

        let parsed: MessagesResponse = resp.json().await?;
        non_empty(parsed.content.into_iter().filter_map(|b| b.text).collect())
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChat {
    pub fn new(base_url: &str, api_key: String, model: String, timeout: Duration) -> Result<Self, LyricsError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChat {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, system: &str, prompt: &str, max_tokens: u32) -> Result<String, LyricsError> {
        let body = json!({
            "model": self.model,
            "max_tokens": max_tokens,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": format!("Prompt: {prompt}")},
            ],
        });

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(read_error(resp).await);
        }

        let parsed: ChatCompletionResponse = resp.json().await?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        non_empty(text)
    }
}
