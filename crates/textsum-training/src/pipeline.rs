//! Stage orchestration.
//!
//! Stages run strictly in order and hand data to each other only through the artifact
//! directories named in the pipeline document. Each stage is idempotent on re-run: ingestion
//! skips a populated destination, publishing skips an existing repository, and the other stages
//! overwrite their own outputs.

use crate::artifacts::TrainingManifest;
use crate::config::{ConfigurationManager, RegistryConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::evaluation::ModelEvaluation;
use crate::ingestion::{DataIngestion, IngestionOutcome};
use crate::job::JobId;
use crate::prediction::PredictionPipeline;
use crate::progress::{ProgressSink, TracingProgressSink};
use crate::registry::HubRegistry;
use crate::rouge::RougeScores;
use crate::trainer::{ModelTrainer, PublishOutcome};
use crate::transformation::DataTransformation;
use crate::validation::{DataValidation, ValidationReport};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use textsum_models::HubClient;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    DataIngestion,
    DataValidation,
    DataTransformation,
    ModelTrainer,
    ModelEvaluation,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::DataIngestion,
        Stage::DataValidation,
        Stage::DataTransformation,
        Stage::ModelTrainer,
        Stage::ModelEvaluation,
    ];

    /// Stages run by a training request: everything up to and including the trainer.
    pub const THROUGH_TRAINING: [Stage; 4] =
        [Stage::DataIngestion, Stage::DataValidation, Stage::DataTransformation, Stage::ModelTrainer];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::DataIngestion => "data_ingestion",
            Stage::DataValidation => "data_validation",
            Stage::DataTransformation => "data_transformation",
            Stage::ModelTrainer => "model_trainer",
            Stage::ModelEvaluation => "model_evaluation",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Stage::DataIngestion => "Data Ingestion stage",
            Stage::DataValidation => "Data Validation stage",
            Stage::DataTransformation => "Data Transformation stage",
            Stage::ModelTrainer => "Model Trainer stage",
            Stage::ModelEvaluation => "Model Evaluation stage",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "data_ingestion" | "ingestion" => Ok(Stage::DataIngestion),
            "data_validation" | "validation" => Ok(Stage::DataValidation),
            "data_transformation" | "transformation" => Ok(Stage::DataTransformation),
            "model_trainer" | "trainer" | "training" => Ok(Stage::ModelTrainer),
            "model_evaluation" | "evaluation" => Ok(Stage::ModelEvaluation),
            other => Err(PipelineError::Config(format!("unknown stage '{other}'"))),
        }
    }
}

/// What a stage produced.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Ingested(IngestionOutcome),
    Validated(ValidationReport),
    Transformed(PathBuf),
    Trained { manifest: Box<TrainingManifest>, publish: PublishOutcome },
    Evaluated(RougeScores),
}

pub struct Pipeline {
    config: ConfigurationManager,
    registry: HubRegistry,
    registry_config: RegistryConfig,
    progress: Arc<dyn ProgressSink>,
}

impl Pipeline {
    /// Builds the hub client from the registry settings (endpoint and token from the environment).
    #[must_use]
    pub fn new(config: ConfigurationManager) -> Self {
        let registry_config = config.registry_config();
        let hub = HubClient::new(registry_config.endpoint.clone(), registry_config.token.clone());
        let registry = HubRegistry::new(hub, registry_config.cache_dir.clone());
        Self::with_registry(config, registry, registry_config)
    }

    #[must_use]
    pub fn with_registry(config: ConfigurationManager, registry: HubRegistry, registry_config: RegistryConfig) -> Self {
        Self { config, registry, registry_config, progress: Arc::new(TracingProgressSink) }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ConfigurationManager {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &HubRegistry {
        &self.registry
    }

    /// `{account}/{adapter_name}`, or `None` when no account is configured.
    #[must_use]
    pub fn adapter_repo(&self) -> Option<String> {
        self.registry_config.adapter_repo()
    }

    pub async fn run_stage(&self, stage: Stage, job_id: &JobId, cancel: &Arc<AtomicBool>) -> PipelineResult<StageOutcome> {
        info!(">>>>>> {} started <<<<<<", stage.title());
        let outcome = match stage {
            Stage::DataIngestion => {
                let ingestion = DataIngestion::new(self.config.data_ingestion_config()?, self.registry.hub().clone());
                StageOutcome::Ingested(ingestion.download().await?)
            }
            Stage::DataValidation => {
                let validation = DataValidation::new(self.config.data_validation_config()?);
                let report = tokio::task::spawn_blocking(move || validation.validate_all()).await??;
                if !report.passed() {
                    warn!(?report, "Data validation failed, continuing with the remaining stages");
                }
                StageOutcome::Validated(report)
            }
            Stage::DataTransformation => {
                let transformation =
                    DataTransformation::load(self.config.data_transformation_config()?, &self.registry).await?;
                StageOutcome::Transformed(transformation.convert(&self.registry).await?)
            }
            Stage::ModelTrainer => {
                let trainer = ModelTrainer::new(self.config.model_trainer_config()?);
                let manifest = trainer
                    .train(&self.registry, job_id.clone(), Arc::clone(&self.progress), Arc::clone(cancel))
                    .await?;
                let repo = self.adapter_repo();
                let publish = trainer.publish(&self.registry, repo.as_deref()).await?;
                StageOutcome::Trained { manifest: Box::new(manifest), publish }
            }
            Stage::ModelEvaluation => {
                let evaluation = ModelEvaluation::new(self.config.model_evaluation_config()?);
                let repo = self.adapter_repo();
                StageOutcome::Evaluated(evaluation.evaluate(&self.registry, repo.as_deref()).await?)
            }
        };
        info!(">>>>>> {} completed <<<<<<", stage.title());
        Ok(outcome)
    }

    /// Runs `stages` in order, stopping at the first error or when `cancel` is raised.
    pub async fn run(
        &self,
        stages: &[Stage],
        job_id: &JobId,
        cancel: &Arc<AtomicBool>,
    ) -> PipelineResult<Vec<(Stage, StageOutcome)>> {
        let mut outcomes = Vec::with_capacity(stages.len());
        for stage in stages {
            if cancel.load(Ordering::Relaxed) {
                return Err(PipelineError::Cancelled);
            }
            let outcome = self.run_stage(*stage, job_id, cancel).await.inspect_err(|e| {
                tracing::error!(stage = %stage, error = %e, "Stage failed");
            })?;
            outcomes.push((*stage, outcome));
        }
        Ok(outcomes)
    }

    /// Loads the adapter named by the registry settings (or the local trainer output).
    pub async fn load_predictor(&self) -> PipelineResult<PredictionPipeline> {
        let config = self.config.model_evaluation_config()?;
        let base_model = config.base_model_path.clone();
        let evaluation = ModelEvaluation::new(config);
        let repo = self.adapter_repo();
        PredictionPipeline::load(&evaluation, &base_model, &self.registry, repo.as_deref()).await
    }
}
