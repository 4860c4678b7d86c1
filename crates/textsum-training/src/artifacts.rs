use crate::error::{PipelineError, PipelineResult};
use crate::job::JobId;
use crate::rouge::RougeScores;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use textsum_models::LoraConfig;

pub const MANIFEST_FILE: &str = "training_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    AdapterConfig,
    AdapterWeights,
    Tokenizer,
    Checkpoint,
    Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TrainingMetrics {
    pub train_loss: Option<f64>,
    pub eval_loss: Option<f64>,
    pub eval_rouge: Option<RougeScores>,
    pub eval_gen_len: Option<f64>,
    pub steps: u64,
    pub epochs: u32,
}

/// Summary of one training run, written next to the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingManifest {
    pub job_id: JobId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub base_model: String,
    pub dataset_path: PathBuf,
    pub seed: u64,
    pub lora: LoraConfig,
    #[serde(default)]
    pub metrics: TrainingMetrics,
    pub artifacts: Vec<TrainingArtifact>,
}

impl TrainingManifest {
    pub fn save(&self, dir: &Path) -> PipelineResult<PathBuf> {
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    pub fn load(dir: &Path) -> PipelineResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(PipelineError::Artifact(format!("no training manifest in {}", dir.display())));
        }
        Ok(serde_json::from_slice(&std::fs::read(&path)?)?)
    }
}

pub fn sha256_file(path: &Path) -> PipelineResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, path: PathBuf) -> PipelineResult<TrainingArtifact> {
    if !path.exists() {
        return Err(PipelineError::Artifact(format!("artifact path does not exist: {}", path.display())));
    }

    let hash = sha256_file(&path)?;
    Ok(TrainingArtifact { kind, path, sha256: hash })
}
