//! textsum pipeline
//!
//! The offline pipeline and the pieces the prediction service shares with it:
//! - Typed configuration (`ConfigurationManager`)
//! - Ingestion, validation and transformation of the dialogue dataset
//! - LoRA training with checkpoints, a manifest and optional publishing (`ModelTrainer`)
//! - ROUGE evaluation (`ModelEvaluation`)
//! - Prediction (`PredictionPipeline`) and the in-process `TrainingQueue`

pub mod artifacts;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluation;
pub mod ingestion;
pub mod job;
pub mod pipeline;
pub mod prediction;
pub mod progress;
pub mod queue;
pub mod registry;
pub mod rouge;
pub mod trainer;
pub mod transformation;
pub mod validation;

#[cfg(test)]
mod testing;

pub use artifacts::{ArtifactKind, TrainingArtifact, TrainingManifest, TrainingMetrics};
pub use config::{
    ConfigurationManager, DataIngestionConfig, DataTransformationConfig, DataValidationConfig, IntervalStrategy,
    ModelEvaluationConfig, ModelTrainerConfig, ParamsDocument, PipelineDocument, RegistryConfig,
    DEFAULT_CONFIG_PATH, DEFAULT_PARAMS_PATH,
};
pub use dataset::{DatasetDict, RawExample, TokenizedExample};
pub use error::{PipelineError, PipelineResult};
pub use evaluation::{score_examples, write_metrics_csv, ModelEvaluation, SampleScores};
pub use ingestion::{DataIngestion, IngestionOutcome};
pub use job::{JobId, JobStatus};
pub use pipeline::{Pipeline, Stage, StageOutcome};
pub use prediction::PredictionPipeline;
pub use progress::{ProgressEvent, ProgressSink, TracingProgressSink};
pub use queue::{job_runner, CancelOutcome, JobRunner, JobSnapshot, TrainingQueue};
pub use registry::{HubRegistry, ModelRegistry};
pub use rouge::RougeScores;
pub use trainer::{ModelTrainer, PublishOutcome};
pub use transformation::DataTransformation;
pub use validation::{DataValidation, ValidationReport};
