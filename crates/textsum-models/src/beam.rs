//! Beam search decoding.
//!
//! Follows HF `generate` semantics: hypotheses carry summed log-probabilities, finished
//! hypotheses are scored as `sum_logprobs / len^length_penalty`, an EOS candidate is only
//! accepted from the top `num_beams` ranks, and with `early_stopping` the search ends once
//! `num_beams` hypotheses have finished.

use crate::error::ModelError;
use crate::GenerationParams;
use std::collections::HashSet;

/// Produces next-token log-probabilities for a decoder prefix.
pub trait StepScorer {
    fn vocab_size(&self) -> usize;

    /// Fills `out` (length `vocab_size`) with log-probabilities of the next token after `prefix`.
    fn log_probs(&self, prefix: &[u32], out: &mut [f32]) -> Result<(), ModelError>;
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    score: f32,
}

struct FinishedHypotheses {
    capacity: usize,
    length_penalty: f32,
    items: Vec<Hypothesis>,
}

impl FinishedHypotheses {
    fn new(capacity: usize, length_penalty: f32) -> Self {
        Self { capacity, length_penalty, items: Vec::with_capacity(capacity + 1) }
    }

    fn normalize(&self, sum_logprobs: f32, len: usize) -> f32 {
        sum_logprobs / (len as f32).powf(self.length_penalty)
    }

    fn worst(&self) -> f32 {
        self.items.iter().map(|h| h.score).fold(f32::INFINITY, f32::min)
    }

    /// `scored_len` excludes a trailing EOS.
    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32, scored_len: usize) {
        let score = self.normalize(sum_logprobs, scored_len);
        if self.items.len() < self.capacity || score > self.worst() {
            self.items.push(Hypothesis { tokens, score });
            if self.items.len() > self.capacity {
                self.items.sort_by(|a, b| b.score.total_cmp(&a.score));
                self.items.truncate(self.capacity);
            }
        }
    }

    fn is_done(&self, best_running: f32, cur_len: usize, early_stopping: bool) -> bool {
        if self.items.len() < self.capacity {
            return false;
        }
        if early_stopping {
            return true;
        }
        self.normalize(best_running, cur_len) <= self.worst()
    }

    fn best(self) -> Option<Hypothesis> {
        self.items.into_iter().max_by(|a, b| a.score.total_cmp(&b.score))
    }
}

/// Tokens that would repeat an n-gram already present in `tokens`.
fn banned_by_ngram(tokens: &[u32], n: usize) -> HashSet<u32> {
    let mut banned = HashSet::new();
    if n == 0 || tokens.len() + 1 < n {
        return banned;
    }
    let tail = &tokens[tokens.len() + 1 - n..];
    for window in tokens.windows(n) {
        if window[..n - 1] == *tail {
            banned.insert(window[n - 1]);
        }
    }
    banned
}

/// Runs beam search from `start` and returns the best sequence without the start token.
pub fn beam_search(
    scorer: &dyn StepScorer,
    start: u32,
    eos: Option<u32>,
    params: &GenerationParams,
    no_repeat_ngram_size: usize,
) -> Result<Vec<u32>, ModelError> {
    if params.num_beams == 0 {
        return Err(ModelError::InvalidInput("num_beams must be >= 1".to_string()));
    }
    if params.max_length < 2 {
        return Err(ModelError::InvalidInput("max_length must be >= 2".to_string()));
    }

    let vocab = scorer.vocab_size();
    let mut beams = vec![Hypothesis { tokens: vec![start], score: 0.0 }];
    let mut finished = FinishedHypotheses::new(params.num_beams, params.length_penalty);
    let mut log_probs = vec![0.0; vocab];
    let mut done = false;

    while beams[0].tokens.len() < params.max_length {
        let mut candidates: Vec<(usize, u32, f32)> = Vec::with_capacity(beams.len() * vocab);
        for (beam_idx, beam) in beams.iter().enumerate() {
            scorer.log_probs(&beam.tokens, &mut log_probs)?;
            let banned = banned_by_ngram(&beam.tokens, no_repeat_ngram_size);
            for (token, lp) in log_probs.iter().enumerate() {
                let token = token as u32;
                if !lp.is_finite() || banned.contains(&token) {
                    continue;
                }
                candidates.push((beam_idx, token, beam.score + lp));
            }
        }
        if candidates.is_empty() {
            break;
        }

        let keep = (2 * params.num_beams).min(candidates.len());
        candidates.select_nth_unstable_by(keep - 1, |a, b| b.2.total_cmp(&a.2));
        candidates.truncate(keep);
        candidates.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut next = Vec::with_capacity(params.num_beams);
        for (rank, (beam_idx, token, score)) in candidates.into_iter().enumerate() {
            if Some(token) == eos {
                if rank < params.num_beams {
                    let mut tokens = beams[beam_idx].tokens.clone();
                    let scored_len = tokens.len();
                    tokens.push(token);
                    finished.add(tokens, score, scored_len);
                }
                continue;
            }
            let mut tokens = beams[beam_idx].tokens.clone();
            tokens.push(token);
            next.push(Hypothesis { tokens, score });
            if next.len() == params.num_beams {
                break;
            }
        }

        if next.is_empty() {
            beams.clear();
            break;
        }
        beams = next;

        if finished.is_done(beams[0].score, beams[0].tokens.len(), params.early_stopping) {
            done = true;
            break;
        }
    }

    // Hypotheses cut off before finishing still compete.
    if !done {
        for beam in beams {
            let scored_len = beam.tokens.len();
            finished.add(beam.tokens, beam.score, scored_len);
        }
    }

    let best = finished
        .best()
        .ok_or_else(|| ModelError::InvalidInput("beam search produced no hypothesis".to_string()))?;
    Ok(best.tokens.into_iter().skip(1).collect())
}
