//! Genre vocabulary understood by the inference model, and mapping of
//! free-form genre names onto it.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;

pub const DEFAULT_GENRE: &str = "pop";

/// Tags the two-stage model was trained with. Replaced wholesale by
/// `--genre-tags-file` when the deployed checkpoint ships its own list.
const BUILTIN_GENRES: &[&str] = &[
    "acoustic", "afrobeat", "alternative", "ambient", "blues", "bluegrass", "bossa nova", "cantopop",
    "celtic", "children", "chillout", "city pop", "classical", "country", "dance", "disco",
    "dream pop", "drum and bass", "dubstep", "edm", "electronic", "emo", "experimental", "flamenco",
    "folk", "funk", "gospel", "grunge", "hard rock", "heavy metal", "hip-hop", "house", "indie",
    "industrial", "j-pop", "jazz", "k-pop", "latin", "lo-fi", "mandopop", "metal", "musical",
    "neo-soul", "new age", "opera", "orchestral", "pop", "pop rock", "post-rock", "progressive",
    "psychedelic", "punk", "r&b", "rap", "reggae", "reggaeton", "rock", "salsa", "shoegaze", "ska",
    "soft rock", "soul", "soundtrack", "swing", "synthwave", "tango", "techno", "trance", "trap",
    "world",
];

/// Spellings models and users commonly produce for a tag.
const VARIATIONS: &[(&str, &str)] = &[
    ("hiphop", "hip-hop"),
    ("hip hop", "hip-hop"),
    ("rb", "r&b"),
    ("randb", "r&b"),
    ("rhythm and blues", "r&b"),
    ("electronica", "electronic"),
    ("classical music", "classical"),
    ("pop music", "pop"),
    ("rock music", "rock"),
];

#[derive(Debug, thiserror::Error)]
pub enum GenreFileError {
    #[error("failed to read genre tags: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid genre tags file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("genre tags file lists no genres")]
    Empty,
}

#[derive(Deserialize)]
struct TagsFile {
    #[serde(default)]
    genre: Vec<String>,
}

/// Outcome of validating a caller-supplied genre list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenreSelection {
    /// Catalog tags, deduplicated, in request order.
    pub valid: Vec<String>,
    /// Inputs with no reasonable match.
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GenreCatalog {
    genres: BTreeSet<String>,
}

impl Default for GenreCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl GenreCatalog {
    pub fn builtin() -> Self {
        Self::from_names(BUILTIN_GENRES.iter().copied())
    }

    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            genres: names
                .into_iter()
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    /// Loads a `{"genre": [...]}` tags file.
    pub fn from_tags_file(path: &Path) -> Result<Self, GenreFileError> {
        let raw = std::fs::read_to_string(path)?;
        let tags: TagsFile = serde_json::from_str(&raw)?;
        let catalog = Self::from_names(tags.genre.iter().map(String::as_str));
        if catalog.genres.is_empty() {
            return Err(GenreFileError::Empty);
        }
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.genres.len()
    }

    pub fn is_empty(&self) -> bool {
        self.genres.is_empty()
    }

    pub fn contains(&self, genre: &str) -> bool {
        self.genres.contains(&genre.trim().to_lowercase())
    }

    /// Best catalog tag for `input`, falling back to [`DEFAULT_GENRE`].
    ///
    /// Tries, in order: exact match, the input with punctuation removed,
    /// known variations, then the longest tag that contains or is contained
    /// in the input.
    pub fn closest(&self, input: &str) -> String {
        let genre = input.trim().to_lowercase();
        if genre.is_empty() {
            return DEFAULT_GENRE.to_string();
        }
        if self.genres.contains(&genre) {
            return genre;
        }

        let cleaned: String = genre
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect();
        if self.genres.contains(&cleaned) {
            return cleaned;
        }

        for candidate in [&genre, &cleaned] {
            if let Some((_, tag)) = VARIATIONS.iter().find(|(from, _)| from == candidate) {
                if self.genres.contains(*tag) {
                    return tag.to_string();
                }
            }
        }

        self.genres
            .iter()
            .filter(|tag| genre.contains(tag.as_str()) || tag.contains(genre.as_str()))
            .max_by(|a, b| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .cloned()
            .unwrap_or_else(|| DEFAULT_GENRE.to_string())
    }

    /// Maps each requested genre onto the catalog. A request that only
    /// matches by falling back to the default is rejected rather than
    /// silently turned into [`DEFAULT_GENRE`].
    pub fn validate<S: AsRef<str>>(&self, requested: &[S]) -> GenreSelection {
        let mut selection = GenreSelection::default();
        for raw in requested {
            let genre = raw.as_ref().trim().to_lowercase();
            let matched = if self.genres.contains(&genre) {
                Some(genre.clone())
            } else {
                Some(self.closest(&genre)).filter(|m| m != DEFAULT_GENRE)
            };
            match matched {
                Some(m) if !selection.valid.contains(&m) => selection.valid.push(m),
                Some(_) => {}
                None => selection.rejected.push(genre),
            }
        }
        selection
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closest_genre() {
        let catalog = GenreCatalog::builtin();
        assert_eq!(catalog.closest("Jazz"), "jazz");
        assert_eq!(catalog.closest("hip hop"), "hip-hop");
        assert_eq!(catalog.closest("HipHop!"), "hip-hop");
        assert_eq!(catalog.closest("rhythm and blues"), "r&b");
        assert_eq!(catalog.closest("k-pop."), "k-pop");
        assert_eq!(catalog.closest("dark synthwave"), "synthwave");
        assert_eq!(catalog.closest("heavy metal music"), "heavy metal");
        assert_eq!(catalog.closest("zzqx"), DEFAULT_GENRE);
        assert_eq!(catalog.closest("  "), DEFAULT_GENRE);
    }

    #[test]
    fn test_validate_splits_known_and_unknown() {
        let catalog = GenreCatalog::builtin();
        let sel = catalog.validate(&["Rock", "hip hop", "zzqx", "rock music", "pop"]);
        assert_eq!(sel.valid, vec!["rock", "hip-hop", "pop"]);
        assert_eq!(sel.rejected, vec!["zzqx"]);
    }

    #[test]
    fn test_tags_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tags.json");
        std::fs::write(&path, r#"{"genre": ["Shanty", "Pop"], "mood": ["sad"]}"#).unwrap();
        let catalog = GenreCatalog::from_tags_file(&path).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.contains("shanty"));
        assert_eq!(catalog.closest("sea shanty"), "shanty");

        std::fs::write(&path, r#"{"mood": ["sad"]}"#).unwrap();
        assert!(matches!(GenreCatalog::from_tags_file(&path), Err(GenreFileError::Empty)));
    }
}
