//! Minimal HuggingFace Hub client.
//!
//! Covers what the pipeline needs: listing a repo revision, downloading its files (optionally
//! through a local cache with symlinks), creating a repo and pushing a folder as one commit.

use crate::error::HubError;
use base64::Engine;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

/// Default public endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://huggingface.co";

/// Whether a repo holds a model or a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Model,
    Dataset,
}

impl RepoKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Dataset => "dataset",
        }
    }

    fn resolve_prefix(self) -> &'static str {
        match self {
            Self::Model => "",
            Self::Dataset => "datasets/",
        }
    }
}

/// One file listed in a repo revision.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepoFile {
    pub rfilename: String,
}

/// Revision metadata returned by the Hub API.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub siblings: Vec<RepoFile>,
}

/// How [`HubClient::snapshot_download`] materializes files.
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    pub revision: String,
    /// Download into `cache_dir` and symlink from the destination.
    pub use_symlinks: bool,
    pub cache_dir: Option<PathBuf>,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self { revision: "main".to_string(), use_symlinks: false, cache_dir: None }
    }
}

/// HTTP client for the Hub REST API.
#[derive(Debug, Clone)]
pub struct HubClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HubClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self { client: Client::new(), endpoint, token }
    }

    /// Reads `HF_ENDPOINT` and `HUGGINGFACE_HUB_TOKEN` (falling back to `HF_TOKEN`).
    #[must_use]
    pub fn from_env() -> Self {
        let endpoint = std::env::var("HF_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let token = std::env::var("HUGGINGFACE_HUB_TOKEN")
            .or_else(|_| std::env::var("HF_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty());
        Self::new(endpoint, token)
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: Response, repo: &str) -> Result<Response, HubError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(HubError::NotFound(repo.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HubError::Unauthorized(repo.to_string())),
            _ => {
                let body = response.text().await.unwrap_or_default();
                error!(repo = %repo, status = status.as_u16(), "Hub request failed");
                Err(HubError::Status { status: status.as_u16(), body })
            }
        }
    }

    /// Lists the files of `repo` at `revision`.
    pub async fn repo_info(&self, repo: &str, kind: RepoKind, revision: &str) -> Result<RepoInfo, HubError> {
        validate_repo_id(repo)?;
        let url = format!("{}/api/{}s/{repo}/revision/{revision}", self.endpoint, kind.as_str());
        debug!(url = %url, "Fetching repo info");
        let response = self.authorized(self.client.get(&url)).send().await?;
        let response = Self::check(response, repo).await?;
        Ok(response.json().await?)
    }

    /// Returns true if the repo exists and is visible with the current token.
    pub async fn repo_exists(&self, repo: &str, kind: RepoKind) -> Result<bool, HubError> {
        match self.repo_info(repo, kind, "main").await {
            Ok(_) => Ok(true),
            Err(HubError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Downloads one file to `dest`, creating parent directories.
    pub async fn download_file(
        &self,
        repo: &str,
        kind: RepoKind,
        revision: &str,
        filename: &str,
        dest: &Path,
    ) -> Result<PathBuf, HubError> {
        validate_repo_id(repo)?;
        let url = format!("{}/{}{repo}/resolve/{revision}/{filename}", self.endpoint, kind.resolve_prefix());
        debug!(url = %url, dest = %dest.display(), "Downloading file");
        let response = self.authorized(self.client.get(&url)).send().await?;
        let bytes = Self::check(response, repo).await?.bytes().await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        Ok(dest.to_path_buf())
    }

    /// Downloads every file of a repo revision into `local_dir`.
    pub async fn snapshot_download(
        &self,
        repo: &str,
        kind: RepoKind,
        local_dir: &Path,
        options: &SnapshotOptions,
    ) -> Result<Vec<PathBuf>, HubError> {
        let info = self.repo_info(repo, kind, &options.revision).await?;
        tokio::fs::create_dir_all(local_dir).await?;

        let cache_root = options
            .cache_dir
            .as_ref()
            .filter(|_| options.use_symlinks)
            .map(|dir| dir.join(format!("{}s--{}", kind.as_str(), repo.replace('/', "--"))).join(&options.revision));

        let mut files = Vec::with_capacity(info.siblings.len());
        for sibling in &info.siblings {
            let relative = safe_relative_path(&sibling.rfilename)?;
            let dest = local_dir.join(&relative);
            match &cache_root {
                Some(cache) => {
                    let cached = cache.join(&relative);
                    if !cached.exists() {
                        self.download_file(repo, kind, &options.revision, &sibling.rfilename, &cached)
                            .await?;
                    }
                    link_or_copy(&cached, &dest).await?;
                }
                None => {
                    self.download_file(repo, kind, &options.revision, &sibling.rfilename, &dest).await?;
                }
            }
            files.push(dest);
        }
        info!(repo = %repo, files = files.len(), dest = %local_dir.display(), "Snapshot downloaded");
        Ok(files)
    }

    /// Creates a repo; an already existing repo is not an error.
    pub async fn create_repo(&self, repo: &str, kind: RepoKind, private: bool) -> Result<(), HubError> {
        validate_repo_id(repo)?;
        let (organization, name) = match repo.split_once('/') {
            Some((org, name)) => (Some(org), name),
            None => (None, repo),
        };
        let url = format!("{}/api/repos/create", self.endpoint);
        let body = json!({ "name": name, "organization": organization, "type": kind.as_str(), "private": private });
        let response = self.authorized(self.client.post(&url)).json(&body).send().await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(repo = %repo, "Repo already exists");
            return Ok(());
        }
        Self::check(response, repo).await?;
        info!(repo = %repo, "Created repo");
        Ok(())
    }

    /// Uploads every file under `folder` to `repo` as a single commit on `main`.
    ///
    /// Returns the number of files pushed.
    pub async fn upload_folder(
        &self,
        repo: &str,
        kind: RepoKind,
        folder: &Path,
        commit_message: &str,
    ) -> Result<usize, HubError> {
        let mut files = collect_files(folder);
        files.sort();
        self.upload_files(repo, kind, &files, commit_message).await
    }

    /// Uploads `(path_in_repo, local_path)` pairs as a single commit on `main`.
    pub async fn upload_files(
        &self,
        repo: &str,
        kind: RepoKind,
        files: &[(String, PathBuf)],
        commit_message: &str,
    ) -> Result<usize, HubError> {
        validate_repo_id(repo)?;
        let mut body = json!({
            "key": "header",
            "value": { "summary": commit_message, "description": "" }
        })
        .to_string();
        body.push('\n');
        for (relative, path) in files {
            safe_relative_path(relative)?;
            let content = tokio::fs::read(path).await?;
            let line = json!({
                "key": "file",
                "value": {
                    "path": relative,
                    "encoding": "base64",
                    "content": base64::engine::general_purpose::STANDARD.encode(content),
                }
            });
            body.push_str(&line.to_string());
            body.push('\n');
        }

        let url = format!("{}/api/{}s/{repo}/commit/main", self.endpoint, kind.as_str());
        let response = self
            .authorized(self.client.post(&url))
            .header("content-type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        Self::check(response, repo).await?;
        info!(repo = %repo, files = files.len(), "Pushed files to hub");
        Ok(files.len())
    }
}

/// Accepts `name` or `namespace/name` made of alphanumerics, `-`, `_` and `.`.
pub fn validate_repo_id(repo: &str) -> Result<(), HubError> {
    let parts: Vec<&str> = repo.split('/').collect();
    let valid_part = |p: &&str| {
        !p.is_empty()
            && !p.starts_with('.')
            && p.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if parts.len() > 2 || !parts.iter().all(valid_part) {
        return Err(HubError::InvalidRepoId(repo.to_string()));
    }
    Ok(())
}

fn safe_relative_path(name: &str) -> Result<PathBuf, HubError> {
    let path = PathBuf::from(name);
    if path.components().all(|c| matches!(c, Component::Normal(_))) {
        Ok(path)
    } else {
        Err(HubError::UnsafePath(name.to_string()))
    }
}

/// Files under `root` as `(path_in_repo, local_path)`, following links; unreadable entries and
/// link cycles are skipped.
fn collect_files(root: &Path) -> Vec<(String, PathBuf)> {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping entry while collecting upload files");
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let relative = entry
                .path()
                .strip_prefix(root)
                .ok()?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            Some((relative, entry.into_path()))
        })
        .collect()
}

async fn link_or_copy(cached: &Path, dest: &Path) -> Result<(), HubError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::symlink_metadata(dest).await.is_ok() {
        tokio::fs::remove_file(dest).await?;
    }
    #[cfg(unix)]
    tokio::fs::symlink(std::path::absolute(cached)?, dest).await?;
    #[cfg(not(unix))]
    tokio::fs::copy(cached, dest).await.map(|_| ())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_repo_id() {
        assert!(validate_repo_id("samsum").is_ok());
        assert!(validate_repo_id("someone/distilbart-samsum-lora").is_ok());
        assert!(validate_repo_id("a/b/c").is_err());
        assert!(validate_repo_id("../etc").is_err());
        assert!(validate_repo_id("").is_err());
    }

    #[test]
    fn test_safe_relative_path_rejects_traversal() {
        assert!(safe_relative_path("data/train.csv").is_ok());
        assert!(safe_relative_path("../secret").is_err());
        assert!(safe_relative_path("/abs").is_err());
    }

    #[tokio::test]
    async fn test_snapshot_download_fetches_all_files() {
        let mut server = mockito::Server::new_async().await;
        let info = server
            .mock("GET", "/api/datasets/knkarthick/samsum/revision/main")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"id":"knkarthick/samsum","siblings":[{"rfilename":"train.csv"},{"rfilename":"data/test.csv"}]}"#)
            .create_async()
            .await;
        let train = server
            .mock("GET", "/datasets/knkarthick/samsum/resolve/main/train.csv")
            .with_status(200)
            .with_body("id,dialogue,summary\n")
            .create_async()
            .await;
        let test = server
            .mock("GET", "/datasets/knkarthick/samsum/resolve/main/data/test.csv")
            .with_status(200)
            .with_body("id,dialogue,summary\n")
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let client = HubClient::new(server.url(), None);
        let files = client
            .snapshot_download("knkarthick/samsum", RepoKind::Dataset, temp.path(), &SnapshotOptions::default())
            .await
            .unwrap();

        assert_eq!(files.len(), 2);
        assert!(temp.path().join("data/test.csv").exists());
        info.assert_async().await;
        train.assert_async().await;
        test.assert_async().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snapshot_download_symlinks_into_cache() {
        let mut server = mockito::Server::new_async().await;
        let _info = server
            .mock("GET", "/api/models/org/base/revision/main")
            .with_status(200)
            .with_body(r#"{"siblings":[{"rfilename":"config.json"}]}"#)
            .create_async()
            .await;
        let _file = server
            .mock("GET", "/org/base/resolve/main/config.json")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("cache");
        let dest = temp.path().join("model");
        let options = SnapshotOptions { use_symlinks: true, cache_dir: Some(cache.clone()), ..SnapshotOptions::default() };
        HubClient::new(server.url(), None)
            .snapshot_download("org/base", RepoKind::Model, &dest, &options)
            .await
            .unwrap();

        let link = dest.join("config.json");
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert!(cache.join("models--org--base/main/config.json").exists());
    }

    #[tokio::test]
    async fn test_repo_info_maps_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/models/nobody/missing/revision/main")
            .with_status(404)
            .create_async()
            .await;
        let client = HubClient::new(server.url(), None);
        assert!(!client.repo_exists("nobody/missing", RepoKind::Model).await.unwrap());
    }

    #[tokio::test]
    async fn test_create_repo_tolerates_conflict() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/repos/create")
            .match_header("authorization", "Bearer secret")
            .with_status(409)
            .create_async()
            .await;
        let client = HubClient::new(server.url(), Some("secret".to_string()));
        client.create_repo("me/adapter", RepoKind::Model, false).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_folder_sends_one_commit() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/models/me/adapter/commit/main")
            .match_header("content-type", "application/x-ndjson")
            .match_body(mockito::Matcher::Regex("adapter_config.json".to_string()))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("adapter_config.json"), "{}").unwrap();
        std::fs::write(temp.path().join("adapter_model.json"), "{}").unwrap();

        let client = HubClient::new(server.url(), Some("secret".to_string()));
        let pushed = client
            .upload_folder("me/adapter", RepoKind::Model, temp.path(), "Upload LoRA adapter")
            .await
            .unwrap();
        assert_eq!(pushed, 2);
        mock.assert_async().await;
    }

    #[test]
    fn test_collect_files_walks_nested_dirs_and_skips_link_cycles() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("adapter_config.json"), "{}").unwrap();
        std::fs::create_dir_all(temp.path().join("checkpoint-2")).unwrap();
        std::fs::write(temp.path().join("checkpoint-2/adapter_model.json"), "{}").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(temp.path(), temp.path().join("checkpoint-2/loop")).unwrap();

        let mut files = collect_files(temp.path());
        files.sort();
        let names: Vec<&str> = files.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["adapter_config.json", "checkpoint-2/adapter_model.json"]);
        assert_eq!(files[1].1, temp.path().join("checkpoint-2/adapter_model.json"));
    }

    #[tokio::test]
    async fn test_unauthorized_status() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/api/models/me/private/revision/main")
            .with_status(401)
            .create_async()
            .await;
        let client = HubClient::new(server.url(), None);
        let err = client.repo_info("me/private", RepoKind::Model, "main").await.unwrap_err();
        assert!(matches!(err, HubError::Unauthorized(_)));
    }
}
