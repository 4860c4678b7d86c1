use crate::error::{PipelineError, PipelineResult};
use crate::evaluation::ModelEvaluation;
use crate::registry::HubRegistry;
use std::path::Path;
use std::sync::Arc;
use textsum_models::{GenerationParams, LocalSeq2Seq, Seq2SeqModel, TextTokenizer, MAX_INPUT_LENGTH};
use tracing::{debug, info};

/// Tokenizer plus adapted model, loaded once and shared by request handlers.
#[derive(Clone)]
pub struct PredictionPipeline {
    model: Arc<dyn Seq2SeqModel>,
    tokenizer: TextTokenizer,
    params: GenerationParams,
    max_input_length: usize,
}

impl std::fmt::Debug for PredictionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionPipeline")
            .field("model", &self.model.id())
            .field("params", &self.params)
            .field("max_input_length", &self.max_input_length)
            .finish_non_exhaustive()
    }
}

impl PredictionPipeline {
    #[must_use]
    pub fn new(model: Arc<dyn Seq2SeqModel>, tokenizer: TextTokenizer) -> Self {
        Self { model, tokenizer, params: GenerationParams::summary(), max_input_length: MAX_INPUT_LENGTH }
    }

    /// Encoder truncation and output cap, matching the lengths the dataset was tokenized with.
    #[must_use]
    pub fn with_lengths(mut self, max_input_length: usize, max_target_length: usize) -> Self {
        self.max_input_length = max_input_length;
        self.params = self.params.with_max_length(max_target_length);
        self
    }

    /// Loads the base checkpoint with the adapter found in `adapter_dir`.
    pub fn from_dirs(base_dir: &Path, adapter_dir: &Path) -> PipelineResult<Self> {
        let tokenizer_dir = if adapter_dir.join(TextTokenizer::FILE_NAME).is_file() { adapter_dir } else { base_dir };
        let tokenizer = TextTokenizer::from_dir(tokenizer_dir)?;
        let model = LocalSeq2Seq::from_pretrained_with_adapter(base_dir, adapter_dir)?;
        info!(model = %model.id(), "Prediction pipeline ready");
        Ok(Self::new(Arc::new(model), tokenizer))
    }

    /// Resolves the adapter the same way evaluation does, then loads it.
    pub async fn load(
        evaluation: &ModelEvaluation,
        base_model: &str,
        registry: &HubRegistry,
        adapter_repo: Option<&str>,
    ) -> PipelineResult<Self> {
        let adapter_dir = evaluation.resolve_adapter_dir(registry, adapter_repo).await?;
        let base_dir = registry.resolve_pretrained(base_model).await?;
        let config = evaluation.config();
        let (max_input, max_target) = (config.max_input_length, config.max_target_length);
        let pipeline = tokio::task::spawn_blocking(move || Self::from_dirs(&base_dir, &adapter_dir)).await??;
        Ok(pipeline.with_lengths(max_input, max_target))
    }

    #[must_use]
    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Summarizes `text`; input beyond the encoder limit is truncated.
    pub fn predict(&self, text: &str) -> PipelineResult<String> {
        if text.trim().is_empty() {
            return Err(PipelineError::Dataset("text must not be empty".to_string()));
        }
        let encoded = self.tokenizer.encode(text, self.max_input_length)?;
        let output = self.model.generate(&encoded.input_ids, &encoded.attention_mask, &self.params)?;
        let summary = self.tokenizer.decode(&output)?.trim().to_string();
        debug!(input_tokens = encoded.input_ids.len(), output_tokens = output.len(), "Generated summary");
        Ok(summary)
    }
}
