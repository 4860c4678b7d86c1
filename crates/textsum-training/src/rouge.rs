//! ROUGE-1, ROUGE-2, ROUGE-L and ROUGE-Lsum.
//!
//! Tokenization follows the usual rouge scorer: lowercase, anything that is not an ASCII letter
//! or digit becomes a separator, and tokens longer than three characters are stemmed. Scores are F-measures averaged over the pairs, scaled to
//! percentages and rounded to four decimals. ROUGE-Lsum treats newlines as sentence breaks.

use crate::error::{PipelineError, PipelineResult};
use rust_stemmers::{Algorithm, Stemmer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

static STEMMER: LazyLock<Stemmer> = LazyLock::new(|| Stemmer::create(Algorithm::English));

/// Shorter tokens are left as written.
const MIN_STEM_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RougeScores {
    pub rouge1: f64,
    pub rouge2: f64,
    #[serde(rename = "rougeL")]
    pub rouge_l: f64,
    #[serde(rename = "rougeLsum")]
    pub rouge_lsum: f64,
}

#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .map(|token| {
            if token.len() >= MIN_STEM_LEN { STEMMER.stem(token).into_owned() } else { token.to_string() }
        })
        .collect()
}

fn f_measure(hits: usize, pred_total: usize, ref_total: usize) -> f64 {
    if hits == 0 || pred_total == 0 || ref_total == 0 {
        return 0.0;
    }
    let precision = hits as f64 / pred_total as f64;
    let recall = hits as f64 / ref_total as f64;
    2.0 * precision * recall / (precision + recall)
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    for gram in tokens.windows(n) {
        *counts.entry(gram).or_insert(0) += 1;
    }
    counts
}

fn rouge_n(pred: &[String], reference: &[String], n: usize) -> f64 {
    let pred_counts = ngram_counts(pred, n);
    let ref_counts = ngram_counts(reference, n);
    let hits = ref_counts
        .iter()
        .map(|(gram, count)| (*count).min(pred_counts.get(gram).copied().unwrap_or(0)))
        .sum();
    f_measure(
        hits,
        pred.len().saturating_sub(n - 1),
        reference.len().saturating_sub(n - 1),
    )
}

fn lcs_table(a: &[String], b: &[String]) -> Vec<Vec<usize>> {
    let mut table = vec![vec![0; b.len() + 1]; a.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            table[i][j] = if a[i - 1] == b[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }
    table
}

fn rouge_l(pred: &[String], reference: &[String]) -> f64 {
    let table = lcs_table(reference, pred);
    f_measure(table[reference.len()][pred.len()], pred.len(), reference.len())
}

/// Indices into `reference` that lie on one longest common subsequence with `candidate`.
fn lcs_indices(reference: &[String], candidate: &[String]) -> Vec<usize> {
    let table = lcs_table(reference, candidate);
    let (mut i, mut j) = (reference.len(), candidate.len());
    let mut indices = Vec::new();
    while i > 0 && j > 0 {
        if reference[i - 1] == candidate[j - 1] {
            indices.push(i - 1);
            i -= 1;
            j -= 1;
        } else if table[i - 1][j] >= table[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    indices.reverse();
    indices
}

fn rouge_lsum(pred: &str, reference: &str) -> f64 {
    let sentences = |text: &str| -> Vec<Vec<String>> {
        text.split('\n').map(tokenize).filter(|s| !s.is_empty()).collect()
    };
    let pred_sents = sentences(pred);
    let ref_sents = sentences(reference);
    let pred_total: usize = pred_sents.iter().map(Vec::len).sum();
    let ref_total: usize = ref_sents.iter().map(Vec::len).sum();

    let mut pred_counts: HashMap<&str, usize> = HashMap::new();
    for token in pred_sents.iter().flatten() {
        *pred_counts.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut ref_counts: HashMap<&str, usize> = HashMap::new();
    for token in ref_sents.iter().flatten() {
        *ref_counts.entry(token.as_str()).or_insert(0) += 1;
    }

    let mut hits = 0;
    for reference_sent in &ref_sents {
        let mut union: Vec<usize> = pred_sents.iter().flat_map(|c| lcs_indices(reference_sent, c)).collect();
        union.sort_unstable();
        union.dedup();
        for idx in union {
            let token = reference_sent[idx].as_str();
            let (Some(p), Some(r)) = (pred_counts.get_mut(token), ref_counts.get_mut(token)) else {
                continue;
            };
            if *p > 0 && *r > 0 {
                hits += 1;
                *p -= 1;
                *r -= 1;
            }
        }
    }
    f_measure(hits, pred_total, ref_total)
}

fn percent(value: f64) -> f64 {
    (value * 100.0 * 10_000.0).round() / 10_000.0
}

/// Mean ROUGE F-measures (x100, 4 decimals) over prediction/reference pairs.
pub fn compute(predictions: &[String], references: &[String]) -> PipelineResult<RougeScores> {
    if predictions.len() != references.len() {
        return Err(PipelineError::Dataset(format!(
            "{} predictions but {} references",
            predictions.len(),
            references.len()
        )));
    }
    if predictions.is_empty() {
        return Ok(RougeScores::default());
    }

    let mut sums = [0.0_f64; 4];
    for (pred, reference) in predictions.iter().zip(references) {
        let p = tokenize(pred);
        let r = tokenize(reference);
        sums[0] += rouge_n(&p, &r, 1);
        sums[1] += rouge_n(&p, &r, 2);
        sums[2] += rouge_l(&p, &r);
        sums[3] += rouge_lsum(pred, reference);
    }
    let n = predictions.len() as f64;
    Ok(RougeScores {
        rouge1: percent(sums[0] / n),
        rouge2: percent(sums[1] / n),
        rouge_l: percent(sums[2] / n),
        rouge_lsum: percent(sums[3] / n),
    })
}
