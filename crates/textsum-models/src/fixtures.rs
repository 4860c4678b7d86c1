//! Small on-disk checkpoints for tests.
//!
//! The tokenizer is a word-level `tokenizer.json` with BART-style special tokens
//! (`<s>`=0, `<pad>`=1, `</s>`=2, `<unk>`=3); words are numbered from 4 in the order given.

use crate::error::ModelError;
use crate::local::BaseModelConfig;
use crate::tokenizer::TextTokenizer;
use serde_json::json;
use std::path::{Path, PathBuf};

const SPECIAL_TOKENS: [&str; 4] = ["<s>", "<pad>", "</s>", "<unk>"];

/// Writes a word-level `tokenizer.json` into `dir`.
pub fn write_word_level_tokenizer(dir: &Path, words: &[&str]) -> Result<PathBuf, ModelError> {
    std::fs::create_dir_all(dir)?;

    let mut vocab = serde_json::Map::new();
    for (id, token) in SPECIAL_TOKENS.iter().chain(words.iter()).enumerate() {
        vocab.entry((*token).to_string()).or_insert_with(|| json!(id));
    }

    let added_tokens: Vec<_> = SPECIAL_TOKENS
        .iter()
        .enumerate()
        .map(|(id, content)| {
            json!({
                "id": id,
                "content": content,
                "single_word": false,
                "lstrip": false,
                "rstrip": false,
                "normalized": false,
                "special": true
            })
        })
        .collect();

    let tokenizer_json = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added_tokens,
        "normalizer": null,
        "pre_tokenizer": { "type": "WhitespaceSplit" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": vocab,
            "unk_token": "<unk>"
        }
    });

    let path = dir.join(TextTokenizer::FILE_NAME);
    std::fs::write(&path, serde_json::to_string_pretty(&tokenizer_json)?)?;
    Ok(path)
}

/// Writes a base checkpoint (`config.json` + `tokenizer.json`) for the local engine.
pub fn write_base_checkpoint(dir: &Path, words: &[&str]) -> Result<PathBuf, ModelError> {
    write_word_level_tokenizer(dir, words)?;
    let config = BaseModelConfig {
        model_type: Some("local-copy".to_string()),
        vocab_size: SPECIAL_TOKENS.len() + words.len(),
        pad_token_id: Some(1),
        bos_token_id: Some(0),
        eos_token_id: Some(2),
        decoder_start_token_id: Some(2),
        ..BaseModelConfig::default()
    };
    config.save(dir)?;
    Ok(dir.to_path_buf())
}

/// Vocabulary used by pipeline-level tests: enough words for a few dialogue/summary pairs.
pub const DIALOGUE_WORDS: &[&str] = &[
    "amanda:", "jerry:", "hannah:", "betty:", "i", "baked", "cookies", "do", "you", "want",
    "some", "sure", "will", "bring", "them", "tomorrow", "have", "number", "larry", "no",
    "ask", "he", "called", "her", "last", "time", "we", "were", "at", "the", "park",
    "to", "is", "and", "a", "meeting", "moved", "friday", "ok", "thanks",
];
