//! Remote model registry.
//!
//! The pipeline publishes the trained adapter to, and the evaluator and prediction service pull
//! it from, a repository named `{account}/{adapter_name}`. Base checkpoints and tokenizers are
//! referenced either as local directories or as model repositories, which are snapshotted into
//! the cache directory once and reused afterwards.

use crate::dataset::dir_is_non_empty;
use crate::error::PipelineResult;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use textsum_models::{HubClient, RepoKind, SnapshotOptions};
use tracing::{debug, info};

/// Where trained adapters are published.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Returns true if the repository already exists.
    async fn exists(&self, repo: &str) -> PipelineResult<bool>;

    /// Creates the repository and uploads `files` (by file name) in one commit.
    async fn publish(&self, repo: &str, files: &[PathBuf]) -> PipelineResult<usize>;

    /// Makes a local copy of the repository and returns its directory.
    async fn fetch(&self, repo: &str) -> PipelineResult<PathBuf>;
}

/// [`ModelRegistry`] backed by the HuggingFace Hub, with a local snapshot cache.
#[derive(Debug, Clone)]
pub struct HubRegistry {
    hub: HubClient,
    cache_dir: PathBuf,
}

impl HubRegistry {
    #[must_use]
    pub fn new(hub: HubClient, cache_dir: impl Into<PathBuf>) -> Self {
        Self { hub, cache_dir: cache_dir.into() }
    }

    #[must_use]
    pub fn hub(&self) -> &HubClient {
        &self.hub
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Cache directory for a model repository.
    #[must_use]
    pub fn cached_model_dir(&self, repo: &str) -> PathBuf {
        self.cache_dir.join(format!("models--{}", repo.replace('/', "--")))
    }

    /// Resolves a checkpoint reference to a local directory.
    ///
    /// An existing directory is used as is; anything else is treated as a model repository and
    /// downloaded into the cache unless a previous download is already there.
    pub async fn resolve_pretrained(&self, reference: &str) -> PipelineResult<PathBuf> {
        let local = Path::new(reference);
        if local.is_dir() {
            debug!(path = %local.display(), "Using local checkpoint");
            return Ok(local.to_path_buf());
        }
        let dest = self.cached_model_dir(reference);
        if dir_is_non_empty(&dest) {
            debug!(repo = %reference, path = %dest.display(), "Using cached checkpoint");
            return Ok(dest);
        }
        info!(repo = %reference, "Downloading checkpoint from hub");
        self.hub
            .snapshot_download(reference, RepoKind::Model, &dest, &SnapshotOptions::default())
            .await?;
        Ok(dest)
    }
}

#[async_trait]
impl ModelRegistry for HubRegistry {
    async fn exists(&self, repo: &str) -> PipelineResult<bool> {
        Ok(self.hub.repo_exists(repo, RepoKind::Model).await?)
    }

    async fn publish(&self, repo: &str, files: &[PathBuf]) -> PipelineResult<usize> {
        self.hub.create_repo(repo, RepoKind::Model, false).await?;
        let named: Vec<(String, PathBuf)> = files
            .iter()
            .filter_map(|path| {
                path.file_name().map(|name| (name.to_string_lossy().into_owned(), path.clone()))
            })
            .collect();
        let pushed = self
            .hub
            .upload_files(repo, RepoKind::Model, &named, "Upload LoRA adapter and tokenizer")
            .await?;
        Ok(pushed)
    }

    async fn fetch(&self, repo: &str) -> PipelineResult<PathBuf> {
        let dest = self.cached_model_dir(repo);
        self.hub
            .snapshot_download(repo, RepoKind::Model, &dest, &SnapshotOptions::default())
            .await?;
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_resolve_pretrained_prefers_local_directory() {
        let temp = TempDir::new().unwrap();
        let registry = HubRegistry::new(HubClient::new("http://127.0.0.1:9", None), temp.path().join("cache"));
        let resolved = registry.resolve_pretrained(&temp.path().display().to_string()).await.unwrap();
        assert_eq!(resolved, temp.path());
    }

    #[tokio::test]
    async fn test_resolve_pretrained_downloads_once() {
        let mut server = mockito::Server::new_async().await;
        let info = server
            .mock("GET", "/api/models/org/base/revision/main")
            .with_status(200)
            .with_body(r#"{"siblings":[{"rfilename":"config.json"}]}"#)
            .expect(1)
            .create_async()
            .await;
        let file = server
            .mock("GET", "/org/base/resolve/main/config.json")
            .with_status(200)
            .with_body(r#"{"vocab_size": 8}"#)
            .expect(1)
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let registry = HubRegistry::new(HubClient::new(server.url(), None), temp.path());
        let first = registry.resolve_pretrained("org/base").await.unwrap();
        let second = registry.resolve_pretrained("org/base").await.unwrap();
        assert_eq!(first, second);
        assert!(first.join("config.json").exists());
        info.assert_async().await;
        file.assert_async().await;
    }

    #[tokio::test]
    async fn test_publish_creates_repo_then_uploads() {
        let mut server = mockito::Server::new_async().await;
        let create = server.mock("POST", "/api/repos/create").with_status(200).create_async().await;
        let commit = server
            .mock("POST", "/api/models/alice/distilbart-samsum-lora/commit/main")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let file = temp.path().join("adapter_config.json");
        std::fs::write(&file, "{}").unwrap();

        let registry = HubRegistry::new(HubClient::new(server.url(), Some("token".to_string())), temp.path());
        let pushed = registry.publish("alice/distilbart-samsum-lora", &[file]).await.unwrap();
        assert_eq!(pushed, 1);
        create.assert_async().await;
        commit.assert_async().await;
    }
}
