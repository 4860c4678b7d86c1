//! Tokenizer wrapper over the HuggingFace `tokenizers` crate.
//!
//! Encoding here never relies on the tokenizer's own truncation/padding settings: special
//! tokens, truncation and padding are applied explicitly so that every stage produces the same
//! fixed-length layout regardless of what the `tokenizer.json` was saved with.

use crate::error::ModelError;
use crate::IGNORE_INDEX;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

const PAD_CANDIDATES: [&str; 2] = ["<pad>", "[PAD]"];
const BOS_CANDIDATES: [&str; 2] = ["<s>", "[CLS]"];
const EOS_CANDIDATES: [&str; 2] = ["</s>", "[SEP]"];

/// Token ids plus attention mask for one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedText {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl EncodedText {
    /// Number of attended (non-padding) positions.
    #[must_use]
    pub fn attended_len(&self) -> usize {
        self.attention_mask.iter().filter(|m| **m == 1).count()
    }
}

/// A loaded tokenizer with its special token ids resolved.
#[derive(Clone)]
pub struct TextTokenizer {
    inner: Tokenizer,
    pad_id: u32,
    bos_id: Option<u32>,
    eos_id: Option<u32>,
}

impl std::fmt::Debug for TextTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("pad_id", &self.pad_id)
            .field("bos_id", &self.bos_id)
            .field("eos_id", &self.eos_id)
            .finish()
    }
}

fn first_known(inner: &Tokenizer, candidates: &[&str]) -> Option<u32> {
    candidates.iter().find_map(|t| inner.token_to_id(t))
}

impl TextTokenizer {
    /// File name used when saving or loading from a directory.
    pub const FILE_NAME: &'static str = "tokenizer.json";

    /// Wraps an already-built tokenizer, resolving pad/bos/eos ids.
    pub fn from_tokenizer(inner: Tokenizer) -> Result<Self, ModelError> {
        let pad_id = first_known(&inner, &PAD_CANDIDATES).ok_or_else(|| {
            ModelError::Tokenizer(format!("tokenizer has no padding token (tried {PAD_CANDIDATES:?})"))
        })?;
        let bos_id = first_known(&inner, &BOS_CANDIDATES);
        let eos_id = first_known(&inner, &EOS_CANDIDATES);
        Ok(Self { inner, pad_id, bos_id, eos_id })
    }

    /// Loads a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let inner = Tokenizer::from_file(path).map_err(|e| {
            ModelError::Tokenizer(format!("cannot load tokenizer from '{}': {e}", path.display()))
        })?;
        Self::from_tokenizer(inner)
    }

    /// Loads `tokenizer.json` from a checkpoint or adapter directory.
    pub fn from_dir(dir: &Path) -> Result<Self, ModelError> {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Err(ModelError::Checkpoint(format!("missing {} in {}", Self::FILE_NAME, dir.display())));
        }
        Self::from_file(&path)
    }

    /// Writes `tokenizer.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<PathBuf, ModelError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        self.inner
            .save(&path, true)
            .map_err(|e| ModelError::Tokenizer(format!("cannot save tokenizer to '{}': {e}", path.display())))?;
        Ok(path)
    }

    #[must_use]
    pub fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    #[must_use]
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_id
    }

    #[must_use]
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_id
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn content_ids(&self, text: &str) -> Result<Vec<u32>, ModelError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ModelError::Tokenizer(format!("encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn special_count(&self) -> usize {
        usize::from(self.bos_id.is_some()) + usize::from(self.eos_id.is_some())
    }

    /// Encodes `text` with special tokens, truncated to `max_length`. No padding.
    pub fn encode(&self, text: &str, max_length: usize) -> Result<EncodedText, ModelError> {
        let specials = self.special_count();
        if max_length <= specials {
            return Err(ModelError::InvalidInput(format!(
                "max_length {max_length} leaves no room for content tokens"
            )));
        }

        let mut content = self.content_ids(text)?;
        content.truncate(max_length - specials);

        let mut input_ids = Vec::with_capacity(content.len() + specials);
        input_ids.extend(self.bos_id);
        input_ids.extend(content);
        input_ids.extend(self.eos_id);

        let attention_mask = vec![1; input_ids.len()];
        Ok(EncodedText { input_ids, attention_mask })
    }

    /// Encodes `text` truncated and padded to exactly `max_length` positions.
    pub fn encode_padded(&self, text: &str, max_length: usize) -> Result<EncodedText, ModelError> {
        let mut encoded = self.encode(text, max_length)?;
        let missing = max_length - encoded.input_ids.len();
        encoded.input_ids.extend(std::iter::repeat_n(self.pad_id, missing));
        encoded.attention_mask.extend(std::iter::repeat_n(0, missing));
        Ok(encoded)
    }

    /// Decodes ids with special tokens skipped.
    pub fn decode(&self, ids: &[u32]) -> Result<String, ModelError> {
        self.inner
            .decode(ids, true)
            .map_err(|e| ModelError::Tokenizer(format!("decode failed: {e}")))
    }

    /// Token count of `text` including special tokens, used for generated-length metrics.
    pub fn count_tokens(&self, text: &str) -> Result<usize, ModelError> {
        Ok(self.content_ids(text)?.len() + self.special_count())
    }
}

/// Replaces padding ids with [`IGNORE_INDEX`] so the loss skips them.
#[must_use]
pub fn mask_padding(ids: &[u32], pad_id: u32) -> Vec<i64> {
    ids.iter().map(|id| if *id == pad_id { IGNORE_INDEX } else { i64::from(*id) }).collect()
}

/// Reverses [`mask_padding`]: ignored positions become `pad_id` again.
#[must_use]
pub fn restore_padding(labels: &[i64], pad_id: u32) -> Vec<u32> {
    labels
        .iter()
        .map(|l| u32::try_from(*l).unwrap_or(pad_id))
        .collect()
}
