use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::artifacts::Artifact;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status} while fetching {artifact}: {detail}")]
    CommandFailed {
        program: String,
        artifact: String,
        status: String,
        detail: String,
    },

    #[error("source directory {0} does not exist")]
    SourceMissing(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Populates artifact directories from wherever the weights live.
///
/// Called once per download attempt with every artifact that did not verify;
/// the coordinator guarantees at most one call is in flight.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, artifacts: &[Artifact]) -> Result<(), FetchError>;
}

// ---------------------------------------------------------------------------
// Subprocess helpers
// ---------------------------------------------------------------------------

/// PATH with `$HOME/.local/bin` prepended, where pip installs user CLIs.
fn augmented_path() -> String {
    let current = std::env::var("PATH").unwrap_or_default();
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    format!("{}/.local/bin:{}", home, current)
}

async fn run_checked(mut cmd: Command, program: &str, artifact: &str) -> Result<(), FetchError> {
    cmd.env("PATH", augmented_path());
    cmd.stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd.output().await.map_err(|source| FetchError::Spawn {
        program: program.to_string(),
        source,
    })?;
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string();
    Err(FetchError::CommandFailed {
        program: program.to_string(),
        artifact: artifact.to_string(),
        status: output.status.to_string(),
        detail,
    })
}

// ---------------------------------------------------------------------------
// Hub (huggingface-cli)
// ---------------------------------------------------------------------------

/// Downloads each artifact's repository straight into its directory with
/// `huggingface-cli download <repo> --local-dir <dir>`.
pub struct HubFetcher {
    pub program: String,
    /// Mirror passed as `HF_ENDPOINT`.
    pub endpoint: Option<String>,
    pub token: Option<String>,
}

impl HubFetcher {
    pub fn new(endpoint: Option<String>, token: Option<String>) -> Self {
        Self {
            program: "huggingface-cli".to_string(),
            endpoint,
            token,
        }
    }
}

#[async_trait]
impl ArtifactFetcher for HubFetcher {
    fn name(&self) -> &str {
        "hub"
    }

    async fn fetch(&self, artifacts: &[Artifact]) -> Result<(), FetchError> {
        for artifact in artifacts {
            tokio::fs::create_dir_all(&artifact.dir).await?;
            tracing::info!(artifact=%artifact.name, repo=%artifact.source, dir=%artifact.dir.display(), "downloading from hub");

            let mut cmd = Command::new(&self.program);
            cmd.arg("download")
                .arg(&artifact.source)
                .arg("--local-dir")
                .arg(&artifact.dir);
            if let Some(endpoint) = &self.endpoint {
                cmd.env("HF_ENDPOINT", endpoint);
            }
            if let Some(token) = &self.token {
                cmd.env("HF_TOKEN", token);
            }
            run_checked(cmd, &self.program, &artifact.name).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Object store (gsutil)
// ---------------------------------------------------------------------------

/// Copies `<base_uri>/<name>` into the model root with `gsutil -m cp -r`.
pub struct ObjectStoreFetcher {
    pub program: String,
    pub base_uri: String,
}

impl ObjectStoreFetcher {
    pub fn new(base_uri: impl Into<String>) -> Self {
        Self {
            program: "gsutil".to_string(),
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
        }
    }

    fn source_uri(&self, artifact: &Artifact) -> String {
        format!("{}/{}/*", self.base_uri, artifact.name)
    }
}

#[async_trait]
impl ArtifactFetcher for ObjectStoreFetcher {
    fn name(&self) -> &str {
        "object-store"
    }

    async fn fetch(&self, artifacts: &[Artifact]) -> Result<(), FetchError> {
        for artifact in artifacts {
            tokio::fs::create_dir_all(&artifact.dir).await?;
            let uri = self.source_uri(artifact);
            tracing::info!(artifact=%artifact.name, %uri, dir=%artifact.dir.display(), "copying from object store");

            let mut cmd = Command::new(&self.program);
            cmd.args(["-m", "cp", "-r"]).arg(&uri).arg(&artifact.dir);
            run_checked(cmd, &self.program, &artifact.name).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Local directory
// ---------------------------------------------------------------------------

/// Copies `<source_root>/<name>` into the artifact directory. Used with a
/// pre-mounted volume.
pub struct LocalFetcher {
    pub source_root: PathBuf,
}

#[async_trait]
impl ArtifactFetcher for LocalFetcher {
    fn name(&self) -> &str {
        "local"
    }

    async fn fetch(&self, artifacts: &[Artifact]) -> Result<(), FetchError> {
        for artifact in artifacts {
            let from = self.source_root.join(&artifact.name);
            if !from.is_dir() {
                return Err(FetchError::SourceMissing(from));
            }
            let to = artifact.dir.clone();
            tracing::info!(artifact=%artifact.name, from=%from.display(), to=%to.display(), "copying local artifact");
            tokio::task::spawn_blocking(move || copy_dir(&from, &to))
                .await
                .map_err(|e| FetchError::Io(std::io::Error::other(e)))??;
        }
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_fetcher_copies_tree() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join("stage1/sub")).unwrap();
        std::fs::write(src.path().join("stage1/config.json"), b"{}").unwrap();
        std::fs::write(src.path().join("stage1/sub/w.bin"), b"w").unwrap();

        let fetcher = LocalFetcher {
            source_root: src.path().to_path_buf(),
        };
        let artifact = Artifact::new("stage1", "org/repo", dst.path());
        fetcher.fetch(std::slice::from_ref(&artifact)).await.unwrap();

        assert!(artifact.is_ready());
        assert!(artifact.dir.join("sub/w.bin").is_file());
    }

    #[tokio::test]
    async fn test_local_fetcher_missing_source() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let fetcher = LocalFetcher {
            source_root: src.path().to_path_buf(),
        };
        let err = fetcher
            .fetch(&[Artifact::new("stage2", "org/repo", dst.path())])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let dst = tempfile::tempdir().unwrap();
        let fetcher = HubFetcher {
            program: "cadenza-definitely-not-installed".to_string(),
            endpoint: None,
            token: None,
        };
        let err = fetcher
            .fetch(&[Artifact::new("stage1", "org/repo", dst.path())])
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Spawn { .. }), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_fetch_kills_program() {
        use crate::coordinator::{CoordinatorConfig, CoordinatorError, ModelCoordinator};
        use crate::retry::RetryPolicy;
        use std::sync::Arc;
        use std::time::Duration;

        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("fetch.log");
        let program = tmp.path().join("slow-cli");
        std::fs::write(
            &program,
            format!(
                "#!/bin/sh\necho start >> {log}\nsleep 1\necho end >> {log}\n",
                log = log.display()
            ),
        )
        .unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let fetcher = Arc::new(HubFetcher {
            program: program.to_string_lossy().to_string(),
            endpoint: None,
            token: None,
        });
        let models = tmp.path().join("models");
        let coord = Arc::new(ModelCoordinator::new(
            vec![Artifact::new("stage1", "org/repo", &models)],
            fetcher,
            CoordinatorConfig {
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(1),
                },
                download_timeout: Duration::from_millis(200),
                lock_wait_timeout: None,
            },
        ));

        let err = coord.ensure_models_available().await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Timeout(_)));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let written = std::fs::read_to_string(&log).unwrap();
        assert_eq!(written, "start\nstart\n");
    }

    #[test]
    fn test_object_store_uri() {
        let f = ObjectStoreFetcher::new("gs://bucket/models/");
        let a = Artifact::new("stage2", "org/repo", Path::new("/m"));
        assert_eq!(f.source_uri(&a), "gs://bucket/models/stage2/*");
    }
}
