//! Pipeline configuration.
//!
//! Two YAML documents drive a run: the pipeline document (`config/config.yaml`) with paths and
//! identifiers per stage, and the hyperparameter document (`params.yaml`). Both are parsed into
//! typed records that reject unknown keys, and [`ConfigurationManager`] hands out one immutable
//! record per stage, creating that stage's output directory on the way.

use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use textsum_models::hub::DEFAULT_ENDPOINT;
use textsum_models::{MAX_INPUT_LENGTH, MAX_TARGET_LENGTH};
use tracing::debug;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yaml";
pub const DEFAULT_PARAMS_PATH: &str = "params.yaml";

/// Adapter repository name used when the pipeline document does not set one.
pub const DEFAULT_ADAPTER_NAME: &str = "distilbart-samsum-lora";

/// Row label written to the metrics table.
pub const DEFAULT_MODEL_VARIANT: &str = "distilbart-lora";

fn default_revision() -> String {
    "main".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("artifacts/.cache/hub")
}

fn default_save_total_limit() -> usize {
    3
}

fn default_sample_size() -> usize {
    10
}

fn default_save_steps() -> u64 {
    500
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_adapter_name() -> String {
    DEFAULT_ADAPTER_NAME.to_string()
}

fn default_model_variant() -> String {
    DEFAULT_MODEL_VARIANT.to_string()
}

fn default_max_input_length() -> usize {
    MAX_INPUT_LENGTH
}

fn default_max_target_length() -> usize {
    MAX_TARGET_LENGTH
}

/// The pipeline document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDocument {
    pub artifacts_root: PathBuf,
    pub data_ingestion: DataIngestionConfig,
    pub data_validation: DataValidationConfig,
    pub data_transformation: DataTransformationConfig,
    pub model_trainer: ModelTrainerSection,
    pub model_evaluation: ModelEvaluationSection,
    #[serde(default)]
    pub model_registry: ModelRegistrySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataIngestionConfig {
    /// Destination of the dataset snapshot.
    pub root_dir: PathBuf,
    /// Dataset repository on the hub.
    pub repo_id: String,
    pub local_dir_use_symlinks: bool,
    /// Download cache used when symlinking.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_revision")]
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataValidationConfig {
    pub root_dir: PathBuf,
    /// Directory that is checked; the ingestion destination.
    pub data_dir: PathBuf,
    #[serde(alias = "STATUS_FILE")]
    pub status_file: PathBuf,
    #[serde(alias = "ALL_REQUIRED_FILES")]
    pub all_required_files: Vec<String>,
    #[serde(alias = "ALL_REQUIRED_COLUMNS")]
    pub all_required_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataTransformationConfig {
    pub root_dir: PathBuf,
    /// CSV directory, saved dataset, or dataset repository id.
    pub data_path: String,
    /// Local checkpoint directory or model repository id holding `tokenizer.json`.
    pub tokenizer_path: String,
    #[serde(default = "default_max_input_length")]
    pub max_input_length: usize,
    #[serde(default = "default_max_target_length")]
    pub max_target_length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelTrainerSection {
    pub root_dir: PathBuf,
    pub data_path: PathBuf,
    pub model_ckpt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelEvaluationSection {
    pub root_dir: PathBuf,
    pub data_path: PathBuf,
    pub metric_file_name: PathBuf,
    pub base_model_path: String,
    /// Local adapter used when no registry account is configured.
    #[serde(default)]
    pub adapter_path: Option<PathBuf>,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_model_variant")]
    pub model_variant: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelRegistrySection {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_adapter_name")]
    pub adapter_name: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for ModelRegistrySection {
    fn default() -> Self {
        Self { endpoint: default_endpoint(), adapter_name: default_adapter_name(), cache_dir: default_cache_dir() }
    }
}

/// How often evaluation or checkpointing happens during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalStrategy {
    No,
    Steps,
    Epoch,
}

/// The hyperparameter document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParamsDocument {
    #[serde(rename = "TrainingArguments")]
    pub training_arguments: TrainingArguments,
    #[serde(rename = "LoRAConfig")]
    pub lora_config: LoraParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainingArguments {
    pub num_train_epochs: u32,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub weight_decay: f32,
    pub logging_steps: u64,
    pub eval_strategy: IntervalStrategy,
    pub save_strategy: IntervalStrategy,
    pub learning_rate: f32,
    pub seed: u64,
    /// Defaults to `logging_steps`.
    #[serde(default)]
    pub eval_steps: Option<u64>,
    #[serde(default = "default_save_steps")]
    pub save_steps: u64,
    #[serde(default = "default_save_total_limit")]
    pub save_total_limit: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default = "default_sample_size")]
    pub train_sample_size: usize,
    #[serde(default = "default_sample_size")]
    pub eval_sample_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoraParams {
    pub lora_r: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    pub lora_target_modules: Vec<String>,
}

/// Everything the trainer needs, flattened from both documents.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTrainerConfig {
    pub root_dir: PathBuf,
    pub data_path: PathBuf,
    pub model_ckpt: String,
    pub num_train_epochs: u32,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub weight_decay: f32,
    pub logging_steps: u64,
    pub eval_strategy: IntervalStrategy,
    pub eval_steps: u64,
    pub save_strategy: IntervalStrategy,
    pub save_steps: u64,
    pub save_total_limit: usize,
    pub gradient_accumulation_steps: usize,
    pub learning_rate: f32,
    pub lora_r: usize,
    pub lora_alpha: f32,
    pub lora_dropout: f32,
    pub lora_target_modules: Vec<String>,
    pub seed: u64,
    pub train_sample_size: usize,
    pub eval_sample_size: usize,
    /// Encoder and label lengths the dataset was tokenized with.
    pub max_input_length: usize,
    pub max_target_length: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelEvaluationConfig {
    pub root_dir: PathBuf,
    pub data_path: PathBuf,
    pub metric_file_name: PathBuf,
    pub base_model_path: String,
    pub adapter_path: PathBuf,
    pub sample_size: usize,
    pub model_variant: String,
    pub max_input_length: usize,
    pub max_target_length: usize,
}

/// Remote registry settings; the account and token come from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub endpoint: String,
    pub adapter_name: String,
    pub cache_dir: PathBuf,
    pub account: Option<String>,
    pub token: Option<String>,
}

impl RegistryConfig {
    /// `{account}/{adapter_name}`, when an account is configured.
    #[must_use]
    pub fn adapter_repo(&self) -> Option<String> {
        self.account.as_ref().map(|account| format!("{account}/{}", self.adapter_name))
    }
}

fn read_document<T: serde::de::DeserializeOwned>(path: &Path) -> PipelineResult<T> {
    if !path.exists() {
        return Err(PipelineError::Config(format!("configuration file not found: {}", path.display())));
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
    serde_yaml::from_str(&content).map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Builds the per-stage configuration records.
#[derive(Debug, Clone)]
pub struct ConfigurationManager {
    config: PipelineDocument,
    params: ParamsDocument,
}

impl ConfigurationManager {
    /// Parses both documents and creates `artifacts_root`.
    pub fn new(config_path: &Path, params_path: &Path) -> PipelineResult<Self> {
        let config: PipelineDocument = read_document(config_path)?;
        let params: ParamsDocument = read_document(params_path)?;
        debug!(config = %config_path.display(), params = %params_path.display(), "Loaded configuration");
        Self::from_documents(config, params)
    }

    pub fn from_documents(config: PipelineDocument, params: ParamsDocument) -> PipelineResult<Self> {
        validate_params(&params)?;
        std::fs::create_dir_all(&config.artifacts_root)?;
        Ok(Self { config, params })
    }

    #[must_use]
    pub fn artifacts_root(&self) -> &Path {
        &self.config.artifacts_root
    }

    pub fn data_ingestion_config(&self) -> PipelineResult<DataIngestionConfig> {
        let config = self.config.data_ingestion.clone();
        if let Some(parent) = config.root_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(config)
    }

    pub fn data_validation_config(&self) -> PipelineResult<DataValidationConfig> {
        let config = self.config.data_validation.clone();
        std::fs::create_dir_all(&config.root_dir)?;
        if let Some(parent) = config.status_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(config)
    }

    pub fn data_transformation_config(&self) -> PipelineResult<DataTransformationConfig> {
        let config = self.config.data_transformation.clone();
        std::fs::create_dir_all(&config.root_dir)?;
        Ok(config)
    }

    pub fn model_trainer_config(&self) -> PipelineResult<ModelTrainerConfig> {
        let section = &self.config.model_trainer;
        let args = &self.params.training_arguments;
        let lora = &self.params.lora_config;
        std::fs::create_dir_all(&section.root_dir)?;

        Ok(ModelTrainerConfig {
            root_dir: section.root_dir.clone(),
            data_path: section.data_path.clone(),
            model_ckpt: section.model_ckpt.clone(),
            num_train_epochs: args.num_train_epochs,
            per_device_train_batch_size: args.per_device_train_batch_size,
            per_device_eval_batch_size: args.per_device_eval_batch_size,
            weight_decay: args.weight_decay,
            logging_steps: args.logging_steps,
            eval_strategy: args.eval_strategy,
            eval_steps: args.eval_steps.unwrap_or(args.logging_steps),
            save_strategy: args.save_strategy,
            save_steps: args.save_steps,
            save_total_limit: args.save_total_limit,
            gradient_accumulation_steps: args.gradient_accumulation_steps,
            learning_rate: args.learning_rate,
            lora_r: lora.lora_r,
            lora_alpha: lora.lora_alpha,
            lora_dropout: lora.lora_dropout,
            lora_target_modules: lora.lora_target_modules.clone(),
            seed: args.seed,
            train_sample_size: args.train_sample_size,
            eval_sample_size: args.eval_sample_size,
            max_input_length: self.config.data_transformation.max_input_length,
            max_target_length: self.config.data_transformation.max_target_length,
        })
    }

    pub fn model_evaluation_config(&self) -> PipelineResult<ModelEvaluationConfig> {
        let section = &self.config.model_evaluation;
        std::fs::create_dir_all(&section.root_dir)?;
        Ok(ModelEvaluationConfig {
            root_dir: section.root_dir.clone(),
            data_path: section.data_path.clone(),
            metric_file_name: section.metric_file_name.clone(),
            base_model_path: section.base_model_path.clone(),
            adapter_path: section
                .adapter_path
                .clone()
                .unwrap_or_else(|| self.config.model_trainer.root_dir.clone()),
            sample_size: section.sample_size,
            model_variant: section.model_variant.clone(),
            max_input_length: self.config.data_transformation.max_input_length,
            max_target_length: self.config.data_transformation.max_target_length,
        })
    }

    /// Registry settings; `HF_ENDPOINT`, `HUGGINGFACE_USERNAME` and `HUGGINGFACE_HUB_TOKEN`
    /// are read from the environment.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        let section = &self.config.model_registry;
        RegistryConfig {
            endpoint: env_var("HF_ENDPOINT").unwrap_or_else(|| section.endpoint.clone()),
            adapter_name: section.adapter_name.clone(),
            cache_dir: section.cache_dir.clone(),
            account: env_var("HUGGINGFACE_USERNAME"),
            token: env_var("HUGGINGFACE_HUB_TOKEN"),
        }
    }
}

fn validate_params(params: &ParamsDocument) -> PipelineResult<()> {
    let args = &params.training_arguments;
    if args.num_train_epochs == 0 {
        return Err(PipelineError::Config("num_train_epochs must be >= 1".to_string()));
    }
    if args.per_device_train_batch_size == 0 || args.per_device_eval_batch_size == 0 {
        return Err(PipelineError::Config("batch sizes must be >= 1".to_string()));
    }
    if args.gradient_accumulation_steps == 0 {
        return Err(PipelineError::Config("gradient_accumulation_steps must be >= 1".to_string()));
    }
    if !args.learning_rate.is_finite() || args.learning_rate <= 0.0 {
        return Err(PipelineError::Config("learning_rate must be > 0".to_string()));
    }
    if args.logging_steps == 0 || args.save_steps == 0 || args.eval_steps == Some(0) {
        return Err(PipelineError::Config("step intervals must be >= 1".to_string()));
    }
    let lora = &params.lora_config;
    if lora.lora_r == 0 {
        return Err(PipelineError::Config("lora_r must be >= 1".to_string()));
    }
    if !(0.0..1.0).contains(&lora.lora_dropout) {
        return Err(PipelineError::Config("lora_dropout must be in [0, 1)".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_documents(dir: &Path, extra_params: &str) -> (PathBuf, PathBuf) {
        let root = dir.join("artifacts");
        let config = format!(
            r"
artifacts_root: {root}
data_ingestion:
  root_dir: {root}/data_ingestion/samsum_dataset
  repo_id: knkarthick/samsum
  local_dir_use_symlinks: false
data_validation:
  root_dir: {root}/data_validation
  data_dir: {root}/data_ingestion/samsum_dataset
  STATUS_FILE: {root}/data_validation/status.txt
  ALL_REQUIRED_FILES: [train.csv, test.csv, validation.csv]
  ALL_REQUIRED_COLUMNS: [id, dialogue, summary]
data_transformation:
  root_dir: {root}/data_transformation
  data_path: {root}/data_ingestion/samsum_dataset
  tokenizer_path: sshleifer/distilbart-cnn-12-6
model_trainer:
  root_dir: {root}/model_trainer
  data_path: {root}/data_transformation/samsum_dataset
  model_ckpt: sshleifer/distilbart-cnn-12-6
model_evaluation:
  root_dir: {root}/model_evaluation
  data_path: {root}/data_transformation/samsum_dataset
  metric_file_name: {root}/model_evaluation/metrics.csv
  base_model_path: sshleifer/distilbart-cnn-12-6
",
            root = root.display()
        );
        let params = format!(
            r"
TrainingArguments:
  num_train_epochs: 1
  per_device_train_batch_size: 1
  per_device_eval_batch_size: 1
  weight_decay: 0.01
  logging_steps: 10
  eval_strategy: steps
  save_strategy: epoch
  learning_rate: 2.0e-4
  seed: 42
{extra_params}
LoRAConfig:
  lora_r: 8
  lora_alpha: 32
  lora_dropout: 0.1
  lora_target_modules: [q_proj, v_proj]
"
        );
        let config_path = dir.join("config.yaml");
        let params_path = dir.join("params.yaml");
        std::fs::write(&config_path, config).unwrap();
        std::fs::write(&params_path, params).unwrap();
        (config_path, params_path)
    }

    #[test]
    fn test_loads_documents_and_creates_directories() {
        let temp = TempDir::new().unwrap();
        let (config, params) = write_documents(temp.path(), "");
        let manager = ConfigurationManager::new(&config, &params).unwrap();
        assert!(manager.artifacts_root().exists());

        let validation = manager.data_validation_config().unwrap();
        assert_eq!(validation.all_required_columns, vec!["id", "dialogue", "summary"]);
        assert!(validation.status_file.parent().unwrap().exists());

        let trainer = manager.model_trainer_config().unwrap();
        assert_eq!(trainer.eval_strategy, IntervalStrategy::Steps);
        assert_eq!(trainer.eval_steps, 10);
        assert_eq!(trainer.save_total_limit, 3);
        assert_eq!(trainer.lora_target_modules, vec!["q_proj", "v_proj"]);
        assert!(trainer.root_dir.exists());

        let evaluation = manager.model_evaluation_config().unwrap();
        assert_eq!(evaluation.sample_size, 10);
        assert_eq!(evaluation.adapter_path, trainer.root_dir);
        assert_eq!(evaluation.model_variant, "distilbart-lora");

        let lengths = (MAX_INPUT_LENGTH, MAX_TARGET_LENGTH);
        assert_eq!((trainer.max_input_length, trainer.max_target_length), lengths);
        assert_eq!((evaluation.max_input_length, evaluation.max_target_length), lengths);
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let temp = TempDir::new().unwrap();
        let (config, params) = write_documents(temp.path(), "  warmup_ratio: 0.1");
        let err = ConfigurationManager::new(&config, &params).unwrap_err();
        assert!(err.to_string().contains("warmup_ratio"), "{err}");
    }

    #[test]
    fn test_missing_document_is_config_error() {
        let temp = TempDir::new().unwrap();
        let err = ConfigurationManager::new(&temp.path().join("nope.yaml"), &temp.path().join("params.yaml"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_adapter_repo_requires_account() {
        let registry = RegistryConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            adapter_name: DEFAULT_ADAPTER_NAME.to_string(),
            cache_dir: default_cache_dir(),
            account: None,
            token: None,
        };
        assert_eq!(registry.adapter_repo(), None);

        let registry = RegistryConfig { account: Some("alice".to_string()), ..registry };
        assert_eq!(registry.adapter_repo().as_deref(), Some("alice/distilbart-samsum-lora"));
    }
}
