use crate::config::DataIngestionConfig;
use crate::dataset::dir_is_non_empty;
use crate::error::PipelineResult;
use textsum_models::{HubClient, RepoKind, SnapshotOptions};
use tracing::info;

/// Result of [`DataIngestion::download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionOutcome {
    Downloaded { files: usize },
    /// The destination already had content; nothing was fetched.
    Skipped,
}

/// Fetches the dataset snapshot into `root_dir`.
#[derive(Debug, Clone)]
pub struct DataIngestion {
    config: DataIngestionConfig,
    hub: HubClient,
}

impl DataIngestion {
    #[must_use]
    pub fn new(config: DataIngestionConfig, hub: HubClient) -> Self {
        Self { config, hub }
    }

    /// Downloads the dataset unless the destination already exists and is non-empty.
    pub async fn download(&self) -> PipelineResult<IngestionOutcome> {
        let dest = &self.config.root_dir;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if dir_is_non_empty(dest) {
            info!(dest = %dest.display(), "Files already exist, skipping download");
            return Ok(IngestionOutcome::Skipped);
        }

        info!(repo = %self.config.repo_id, dest = %dest.display(), "Starting data download");
        let options = SnapshotOptions {
            revision: self.config.revision.clone(),
            use_symlinks: self.config.local_dir_use_symlinks,
            cache_dir: Some(self.config.cache_dir.clone()),
        };
        let files = self
            .hub
            .snapshot_download(&self.config.repo_id, RepoKind::Dataset, dest, &options)
            .await?;
        info!(files = files.len(), "Data downloaded successfully");
        Ok(IngestionOutcome::Downloaded { files: files.len() })
    }
}
