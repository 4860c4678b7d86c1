//! Model layer for textsum.
//!
//! This crate holds every piece of the pipeline that touches token ids or model weights:
//!
//! - **Tokenizer**: `tokenizer.json` loading, fixed-length encoding, label masking
//! - **Local engine**: a single-binary seq2seq summarizer with LoRA adapters
//! - **Beam search**: HF-style beam search with length penalty and early stopping
//! - **Hub**: a minimal client for the HuggingFace Hub REST API
//!
//! The pipeline crate only talks to models through [`Seq2SeqModel`], so the local engine can
//! be swapped for another backend without touching orchestration code.

pub mod beam;
pub mod error;
pub mod hub;
pub mod local;
pub mod lora;
pub mod optim;
pub mod tokenizer;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixtures;

use serde::{Deserialize, Serialize};
use tracing::debug;

pub use beam::{beam_search, StepScorer};
pub use error::{HubError, ModelError};
pub use hub::{HubClient, RepoFile, RepoInfo, RepoKind, SnapshotOptions};
pub use local::{AdapterGradients, AdapterOptimizer, BaseModelConfig, LocalSeq2Seq, TrainingExample, ADAPTABLE_MODULES};
pub use lora::{LoraAdapter, LoraConfig, LoraWeights};
pub use optim::{AdamState, AdamW, LinearSchedule};
pub use tokenizer::{mask_padding, restore_padding, EncodedText, TextTokenizer};

/// Maximum encoder length for dialogue inputs.
///
/// Shared by transformation, evaluation and prediction: the tokenized dataset has no stored
/// schema, so every consumer must agree on these values.
pub const MAX_INPUT_LENGTH: usize = 1024;

/// Maximum label / generation length for summaries.
pub const MAX_TARGET_LENGTH: usize = 128;

/// Label value ignored by the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Parameters for beam-search generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Maximum output length, counting the decoder start token.
    pub max_length: usize,
    /// Number of beams kept at every step.
    pub num_beams: usize,
    /// Stop as soon as `num_beams` hypotheses are finished.
    pub early_stopping: bool,
    /// Exponent applied to the hypothesis length when scoring finished beams.
    pub length_penalty: f32,
}

impl GenerationParams {
    /// Generation settings used by evaluation and the prediction service.
    #[must_use]
    pub const fn summary() -> Self {
        Self { max_length: MAX_TARGET_LENGTH, num_beams: 4, early_stopping: true, length_penalty: 0.8 }
    }

    /// Same settings with the output capped at `max_length` tokens.
    #[must_use]
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::summary()
    }
}

/// A sequence-to-sequence model that can generate output token ids from encoder input ids.
pub trait Seq2SeqModel: Send + Sync {
    /// Identifier used in logs.
    fn id(&self) -> &str;

    /// Generates output ids for a single encoder input.
    ///
    /// The returned ids may contain special tokens; callers decode with special tokens skipped.
    fn generate(
        &self,
        input_ids: &[u32],
        attention_mask: &[u32],
        params: &GenerationParams,
    ) -> Result<Vec<u32>, ModelError>;
}

/// A mock implementation of [`Seq2SeqModel`] for testing.
///
/// Echoes the leading attended input tokens, which makes decoded output predictable.
#[derive(Debug, Default)]
pub struct MockModel {
    id: String,
    lead_tokens: usize,
}

impl MockModel {
    /// Creates a new `MockModel` that echoes up to `lead_tokens` input tokens.
    #[must_use]
    pub fn new(id: impl Into<String>, lead_tokens: usize) -> Self {
        Self { id: id.into(), lead_tokens }
    }
}

impl Seq2SeqModel for MockModel {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate(
        &self,
        input_ids: &[u32],
        attention_mask: &[u32],
        params: &GenerationParams,
    ) -> Result<Vec<u32>, ModelError> {
        if input_ids.len() != attention_mask.len() {
            return Err(ModelError::InvalidInput(format!(
                "input_ids ({}) and attention_mask ({}) differ in length",
                input_ids.len(),
                attention_mask.len()
            )));
        }
        debug!(model_id = %self.id, input_len = input_ids.len(), "MockModel generating");

        let limit = self.lead_tokens.min(params.max_length);
        Ok(input_ids
            .iter()
            .zip(attention_mask)
            .filter(|(_, m)| **m == 1)
            .map(|(id, _)| *id)
            .take(limit)
            .collect())
    }
}
