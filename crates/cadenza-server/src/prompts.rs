//! Editable system prompts for the lyrics provider.
//!
//! Both prompts live in memory and, when a directory is configured, in one
//! text file each so edits survive restarts.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

pub const DEFAULT_LYRICS_PROMPT: &str = "You are a professional songwriter. Generate song lyrics based on the given prompt.
The lyrics MUST follow this exact structure: [verse], [chorus], [verse], [chorus], [bridge], [outro].
Separate sections with exactly one blank line, put each lyric line on its own line, and mark every
section with its type in square brackets (e.g. [verse]).
Do not include any explanations or additional text, just the lyrics.";

/// Appended to the built-in genre instructions; empty adds nothing.
pub const DEFAULT_GENRE_PROMPT: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// System prompt for lyrics generation.
    Lyrics,
    /// Extra guidance for genre extraction.
    Genre,
}

impl PromptKind {
    fn file_name(self) -> &'static str {
        match self {
            PromptKind::Lyrics => "lyrics_prompt.txt",
            PromptKind::Genre => "genre_prompt.txt",
        }
    }

    fn default_text(self) -> &'static str {
        match self {
            PromptKind::Lyrics => DEFAULT_LYRICS_PROMPT,
            PromptKind::Genre => DEFAULT_GENRE_PROMPT,
        }
    }
}

pub struct PromptStore {
    lyrics: RwLock<String>,
    genre: RwLock<String>,
    dir: Option<PathBuf>,
}

impl Default for PromptStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PromptStore {
    pub fn in_memory() -> Self {
        Self {
            lyrics: RwLock::new(DEFAULT_LYRICS_PROMPT.to_string()),
            genre: RwLock::new(DEFAULT_GENRE_PROMPT.to_string()),
            dir: None,
        }
    }

    /// Reads saved prompts from `dir`, keeping defaults for missing files.
    pub fn load(dir: PathBuf) -> std::io::Result<Self> {
        let read = |kind: PromptKind| -> std::io::Result<String> {
            let path = dir.join(kind.file_name());
            match std::fs::read_to_string(&path) {
                Ok(text) if !text.trim().is_empty() => {
                    tracing::info!(path=%path.display(), "loaded saved prompt");
                    Ok(text)
                }
                Ok(_) => Ok(kind.default_text().to_string()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(kind.default_text().to_string()),
                Err(e) => Err(e),
            }
        };
        Ok(Self {
            lyrics: RwLock::new(read(PromptKind::Lyrics)?),
            genre: RwLock::new(read(PromptKind::Genre)?),
            dir: Some(dir),
        })
    }

    fn slot(&self, kind: PromptKind) -> &RwLock<String> {
        match kind {
            PromptKind::Lyrics => &self.lyrics,
            PromptKind::Genre => &self.genre,
        }
    }

    pub fn get(&self, kind: PromptKind) -> String {
        self.slot(kind)
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replaces a prompt. The file is written first so a failed write leaves
    /// the in-memory prompt unchanged.
    pub async fn set(&self, kind: PromptKind, text: String) -> std::io::Result<()> {
        if let Some(dir) = &self.dir {
            write_prompt(dir, kind, &text).await?;
        }
        *self.slot(kind).write().unwrap_or_else(|e| e.into_inner()) = text;
        tracing::info!(?kind, "prompt updated");
        Ok(())
    }
}

async fn write_prompt(dir: &Path, kind: PromptKind, text: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(kind.file_name());
    let tmp = path.with_extension("txt.tmp");
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, &path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prompts_survive_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("prompts");

        let store = PromptStore::load(dir.clone()).unwrap();
        assert_eq!(store.get(PromptKind::Lyrics), DEFAULT_LYRICS_PROMPT);
        assert_eq!(store.get(PromptKind::Genre), "");

        store.set(PromptKind::Genre, "Prefer acoustic genres.".into()).await.unwrap();
        assert_eq!(store.get(PromptKind::Genre), "Prefer acoustic genres.");
        assert_eq!(store.get(PromptKind::Lyrics), DEFAULT_LYRICS_PROMPT);

        let reloaded = PromptStore::load(dir.clone()).unwrap();
        assert_eq!(reloaded.get(PromptKind::Genre), "Prefer acoustic genres.");
        assert!(!dir.join("genre_prompt.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_write_keeps_old_prompt() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let store = PromptStore {
            dir: Some(blocker),
            ..PromptStore::in_memory()
        };
        assert!(store.set(PromptKind::Lyrics, "new".into()).await.is_err());
        assert_eq!(store.get(PromptKind::Lyrics), DEFAULT_LYRICS_PROMPT);
    }
}
