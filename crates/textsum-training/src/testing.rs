//! Shared fixtures for unit tests.

use crate::dataset::{DatasetDict, TokenizedExample};
use crate::error::PipelineResult;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use textsum_models::{mask_padding, LocalSeq2Seq, LoraConfig, TextTokenizer};

pub const SAMPLE_PAIRS: &[(&str, &str)] = &[
    ("amanda: i baked cookies do you want some jerry: sure", "amanda baked cookies"),
    ("hannah: do you have larry number betty: no ask larry", "hannah asks for larry number"),
    ("jerry: the meeting moved to friday amanda: ok thanks", "the meeting moved to friday"),
    ("betty: we were at the park last time hannah: ok", "betty and hannah were at the park"),
];

pub fn tokenize_pair(tokenizer: &TextTokenizer, dialogue: &str, summary: &str) -> TokenizedExample {
    let input = tokenizer.encode_padded(dialogue, 32).expect("encode dialogue");
    let target = tokenizer.encode_padded(summary, 16).expect("encode summary");
    TokenizedExample {
        input_ids: input.input_ids,
        attention_mask: input.attention_mask,
        labels: mask_padding(&target.input_ids, tokenizer.pad_token_id()),
    }
}

/// Tokenizes [`SAMPLE_PAIRS`] with the tokenizer in `base_dir` into train/validation/test splits.
pub fn write_fixture_dataset(base_dir: &Path, out_dir: &Path) -> PipelineResult<PathBuf> {
    let tokenizer = TextTokenizer::from_dir(base_dir)?;
    let rows: Vec<TokenizedExample> =
        SAMPLE_PAIRS.iter().map(|(d, s)| tokenize_pair(&tokenizer, d, s)).collect();
    let mut dict = DatasetDict::new();
    dict.insert("train", rows.clone());
    dict.insert("validation", rows[..2].to_vec());
    dict.insert("test", rows);
    dict.save_to_disk(out_dir)?;
    Ok(out_dir.to_path_buf())
}

/// Saves a freshly initialized adapter plus the base tokenizer into `adapter_dir`.
pub fn write_fixture_adapter(base_dir: &Path, adapter_dir: &Path) -> PipelineResult<()> {
    let mut model = LocalSeq2Seq::from_pretrained(base_dir)?;
    let lora = LoraConfig::new(4, 32.0, 0.0, vec!["q_proj".to_string(), "v_proj".to_string()]);
    model.init_adapter(lora, &mut StdRng::seed_from_u64(7))?;
    if let Some(adapter) = model.adapter() {
        adapter.save(adapter_dir)?;
    }
    TextTokenizer::from_dir(base_dir)?.save(adapter_dir)?;
    Ok(())
}
