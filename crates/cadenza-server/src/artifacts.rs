use std::path::{Path, PathBuf};

use cadenza_common::ArtifactStatus;

pub const DEFAULT_STAGE1_SOURCE: &str = "m-a-p/YuE-s1-7B-anneal-en-cot";
pub const DEFAULT_STAGE2_SOURCE: &str = "m-a-p/YuE-s2-1B-general";

/// One model artifact: a named directory under the model root that must be
/// populated from `source` before inference can run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub source: String,
    pub dir: PathBuf,
}

impl Artifact {
    pub fn new(name: impl Into<String>, source: impl Into<String>, model_dir: &Path) -> Self {
        let name = name.into();
        let dir = model_dir.join(&name);
        Self {
            name,
            source: source.into(),
            dir,
        }
    }

    /// Parses `name=source` (e.g. `stage1=m-a-p/YuE-s1-7B-anneal-en-cot`).
    pub fn parse(entry: &str, model_dir: &Path) -> Result<Self, String> {
        let (name, source) = entry
            .split_once('=')
            .ok_or_else(|| format!("artifact '{entry}' must look like name=source"))?;
        let (name, source) = (name.trim(), source.trim());
        if name.is_empty() || source.is_empty() {
            return Err(format!("artifact '{entry}' has an empty name or source"));
        }
        if name.contains('/') || name.contains("..") {
            return Err(format!("artifact name '{name}' must be a plain directory name"));
        }
        Ok(Self::new(name, source, model_dir))
    }

    /// Inspects the artifact directory on disk. Ready means the directory
    /// exists and holds at least one regular file at top level.
    pub fn inspect(&self) -> ArtifactStatus {
        let exists = self.dir.is_dir();
        let file_count = if exists { top_level_file_count(&self.dir) } else { 0 };
        ArtifactStatus {
            name: self.name.clone(),
            source: self.source.clone(),
            path: self.dir.to_string_lossy().to_string(),
            exists,
            file_count,
            ready: exists && file_count > 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inspect().ready
    }
}

/// The two-stage default layout: `stage1` and `stage2` under `model_dir`.
pub fn default_artifacts(model_dir: &Path) -> Vec<Artifact> {
    vec![
        Artifact::new("stage1", DEFAULT_STAGE1_SOURCE, model_dir),
        Artifact::new("stage2", DEFAULT_STAGE2_SOURCE, model_dir),
    ]
}

/// Builds the artifact list from `name=source` entries, falling back to the
/// default layout when none are given. Names must be unique.
pub fn parse_artifacts(entries: &[String], model_dir: &Path) -> Result<Vec<Artifact>, String> {
    if entries.is_empty() {
        return Ok(default_artifacts(model_dir));
    }
    let mut out: Vec<Artifact> = Vec::with_capacity(entries.len());
    for entry in entries {
        let artifact = Artifact::parse(entry, model_dir)?;
        if out.iter().any(|a| a.name == artifact.name) {
            return Err(format!("artifact '{}' listed twice", artifact.name));
        }
        out.push(artifact);
    }
    Ok(out)
}

/// Counts regular files (symlinks to files included) directly inside `path`.
fn top_level_file_count(path: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|e| std::fs::metadata(e.path()).map(|m| m.is_file()).unwrap_or(false))
        .count() as u32
}
