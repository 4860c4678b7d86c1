//! ROUGE evaluation of a trained adapter on the test split.

use crate::config::ModelEvaluationConfig;
use crate::dataset::{DatasetDict, TokenizedExample};
use crate::error::{PipelineError, PipelineResult};
use crate::registry::{HubRegistry, ModelRegistry};
use crate::rouge::{self, RougeScores};
use std::path::{Path, PathBuf};
use textsum_models::{restore_padding, GenerationParams, LocalSeq2Seq, LoraAdapter, Seq2SeqModel, TextTokenizer};
use tracing::{debug, info};

/// Decoded predictions for a sample with their ROUGE scores.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleScores {
    pub rouge: RougeScores,
    /// Mean number of non-padding tokens generated per example.
    pub gen_len: f64,
    pub predictions: Vec<String>,
}

/// Generates a summary for every row and scores it against the row's labels.
pub fn score_examples(
    model: &dyn Seq2SeqModel,
    tokenizer: &TextTokenizer,
    rows: &[TokenizedExample],
    params: &GenerationParams,
) -> PipelineResult<SampleScores> {
    let pad = tokenizer.pad_token_id();
    let mut predictions = Vec::with_capacity(rows.len());
    let mut references = Vec::with_capacity(rows.len());
    let mut generated_tokens = 0usize;

    for (idx, row) in rows.iter().enumerate() {
        let output = model.generate(&row.input_ids, &row.attention_mask, params)?;
        generated_tokens += output.iter().filter(|id| **id != pad).count();
        let prediction = tokenizer.decode(&output)?;
        let reference = tokenizer.decode(&restore_padding(&row.labels, pad))?;
        debug!(idx, prediction = %prediction, reference = %reference, "Scored example");
        predictions.push(prediction.trim().to_string());
        references.push(reference.trim().to_string());
    }

    let rouge = rouge::compute(&predictions, &references)?;
    let gen_len = if rows.is_empty() { 0.0 } else { generated_tokens as f64 / rows.len() as f64 };
    Ok(SampleScores { rouge, gen_len, predictions })
}

/// Writes the one-row metrics table: `,rouge1,rouge2,rougeL,rougeLsum` then `<variant>,...`.
pub fn write_metrics_csv(path: &Path, variant: &str, scores: &RougeScores) -> PipelineResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["", "rouge1", "rouge2", "rougeL", "rougeLsum"])?;
    writer.write_record([
        variant.to_string(),
        scores.rouge1.to_string(),
        scores.rouge2.to_string(),
        scores.rouge_l.to_string(),
        scores.rouge_lsum.to_string(),
    ])?;
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ModelEvaluation {
    config: ModelEvaluationConfig,
}

impl ModelEvaluation {
    #[must_use]
    pub fn new(config: ModelEvaluationConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ModelEvaluationConfig {
        &self.config
    }

    /// Beam settings with the output capped at the tokenized label length.
    #[must_use]
    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams::summary().with_max_length(self.config.max_target_length)
    }

    /// Adapter directory: a fresh copy of the registry repository, or the local trainer output.
    pub async fn resolve_adapter_dir(
        &self,
        registry: &dyn ModelRegistry,
        adapter_repo: Option<&str>,
    ) -> PipelineResult<PathBuf> {
        if let Some(repo) = adapter_repo {
            info!(repo, "Fetching adapter from registry");
            return registry.fetch(repo).await;
        }
        let local = &self.config.adapter_path;
        if !local.join(LoraAdapter::CONFIG_FILE).is_file() {
            return Err(PipelineError::Artifact(format!("no trained adapter in {}", local.display())));
        }
        info!(path = %local.display(), "Using local adapter");
        Ok(local.clone())
    }

    pub async fn evaluate(&self, registry: &HubRegistry, adapter_repo: Option<&str>) -> PipelineResult<RougeScores> {
        let adapter_dir = self.resolve_adapter_dir(registry, adapter_repo).await?;
        let base_dir = registry.resolve_pretrained(&self.config.base_model_path).await?;
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.evaluate_local(&base_dir, &adapter_dir)).await?
    }

    /// Runs generation on the first `sample_size` test rows and writes the metrics file.
    pub fn evaluate_local(&self, base_dir: &Path, adapter_dir: &Path) -> PipelineResult<RougeScores> {
        let tokenizer_dir = if adapter_dir.join(TextTokenizer::FILE_NAME).is_file() { adapter_dir } else { base_dir };
        let tokenizer = TextTokenizer::from_dir(tokenizer_dir)?;
        let model = LocalSeq2Seq::from_pretrained_with_adapter(base_dir, adapter_dir)?;

        let dataset = DatasetDict::<TokenizedExample>::load_from_disk(&self.config.data_path)?;
        let test = dataset.split("test")?;
        let sample = if self.config.sample_size == 0 { test } else { &test[..test.len().min(self.config.sample_size)] };
        info!(examples = sample.len(), model = %model.id(), "Evaluating adapter");

        let scores = score_examples(&model, &tokenizer, sample, &self.generation_params())?;
        write_metrics_csv(&self.config.metric_file_name, &self.config.model_variant, &scores.rouge)?;
        info!(
            rouge1 = scores.rouge.rouge1,
            rouge2 = scores.rouge.rouge2,
            rouge_l = scores.rouge.rouge_l,
            rouge_lsum = scores.rouge.rouge_lsum,
            gen_len = scores.gen_len,
            metrics = %self.config.metric_file_name.display(),
            "Evaluation finished"
        );
        Ok(scores.rouge)
    }
}
