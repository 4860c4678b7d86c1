//! Local seq2seq engine.
//!
//! A small, dependency-free summarizer that runs inside the process. The frozen base is a
//! copy prior over the encoder input: tokens present in the source are boosted, and the token
//! that follows the previous output token in the source is boosted further, so the untuned
//! base behaves as a lead extractive summarizer. Fine-tuning only touches LoRA adapters on two
//! modules:
//!
//! - `q_proj`: previous output token -> next-token logits
//! - `v_proj`: mean over attended source tokens -> next-token logits
//!
//! Both adapters add `scaling * (x·A)·B` to the base logits.

use crate::beam::{beam_search, StepScorer};
use crate::error::ModelError;
use crate::lora::{LoraAdapter, LoraConfig, LoraWeights};
use crate::optim::{AdamState, AdamW, LinearSchedule};
use crate::{GenerationParams, Seq2SeqModel, IGNORE_INDEX};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Modules of the base model that accept a LoRA adapter.
pub const ADAPTABLE_MODULES: [&str; 2] = ["q_proj", "v_proj"];

const Q_PROJ: &str = "q_proj";
const V_PROJ: &str = "v_proj";

fn default_true() -> bool {
    true
}

fn default_copy_bias() -> f32 {
    2.0
}

fn default_follow_bias() -> f32 {
    6.0
}

/// Base checkpoint configuration (`config.json`). Unknown keys are ignored, so HF-style
/// configs load as long as they carry `vocab_size`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseModelConfig {
    #[serde(default)]
    pub model_type: Option<String>,
    pub vocab_size: usize,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub decoder_start_token_id: Option<u32>,
    /// Turned off while training.
    #[serde(default = "default_true")]
    pub use_cache: bool,
    #[serde(default = "default_copy_bias")]
    pub copy_bias: f32,
    #[serde(default = "default_follow_bias")]
    pub follow_bias: f32,
    #[serde(default)]
    pub eos_bias: f32,
    #[serde(default)]
    pub no_repeat_ngram_size: usize,
}

impl Default for BaseModelConfig {
    fn default() -> Self {
        Self {
            model_type: None,
            vocab_size: 0,
            pad_token_id: None,
            bos_token_id: None,
            eos_token_id: None,
            decoder_start_token_id: None,
            use_cache: true,
            copy_bias: default_copy_bias(),
            follow_bias: default_follow_bias(),
            eos_bias: 0.0,
            no_repeat_ngram_size: 0,
        }
    }
}

impl BaseModelConfig {
    pub const FILE_NAME: &'static str = "config.json";

    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let path = dir.join(Self::FILE_NAME);
        if !path.exists() {
            return Err(ModelError::Checkpoint(format!("missing {} in {}", Self::FILE_NAME, dir.display())));
        }
        let config: Self = serde_json::from_slice(&std::fs::read(&path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf, ModelError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.vocab_size == 0 {
            return Err(ModelError::Checkpoint("vocab_size must be > 0".to_string()));
        }
        let ids = [self.pad_token_id, self.bos_token_id, self.eos_token_id, self.decoder_start_token_id];
        if let Some(id) = ids.into_iter().flatten().find(|id| *id as usize >= self.vocab_size) {
            return Err(ModelError::Checkpoint(format!(
                "special token id {id} is outside the vocabulary ({})",
                self.vocab_size
            )));
        }
        Ok(())
    }

    fn start_token(&self) -> Result<u32, ModelError> {
        self.decoder_start_token_id
            .or(self.eos_token_id)
            .or(self.bos_token_id)
            .ok_or_else(|| ModelError::Checkpoint("config has no decoder start token".to_string()))
    }
}

/// One tokenized training row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Target ids with padding replaced by [`IGNORE_INDEX`].
    pub labels: Vec<i64>,
}

/// Source-side state shared by every decoding step of one input.
struct SourceContext {
    tokens: Vec<u32>,
    copy: Vec<u32>,
    follows: HashMap<u32, Vec<u32>>,
    first_content: Option<u32>,
}

impl SourceContext {
    fn new(config: &BaseModelConfig, input_ids: &[u32], attention_mask: &[u32]) -> Result<Self, ModelError> {
        if input_ids.len() != attention_mask.len() {
            return Err(ModelError::InvalidInput(format!(
                "input_ids ({}) and attention_mask ({}) differ in length",
                input_ids.len(),
                attention_mask.len()
            )));
        }
        let tokens: Vec<u32> = input_ids
            .iter()
            .zip(attention_mask)
            .filter(|(_, m)| **m == 1)
            .map(|(id, _)| *id)
            .collect();
        if let Some(id) = tokens.iter().find(|id| **id as usize >= config.vocab_size) {
            return Err(ModelError::InvalidInput(format!(
                "token id {id} is outside the vocabulary ({})",
                config.vocab_size
            )));
        }

        let special = |id: u32| {
            Some(id) == config.pad_token_id || Some(id) == config.bos_token_id || Some(id) == config.eos_token_id
        };

        let mut copy: Vec<u32> = tokens.iter().copied().filter(|id| !special(*id)).collect();
        copy.sort_unstable();
        copy.dedup();

        let mut follows: HashMap<u32, Vec<u32>> = HashMap::new();
        for pair in tokens.windows(2) {
            let next = follows.entry(pair[0]).or_default();
            if !next.contains(&pair[1]) {
                next.push(pair[1]);
            }
        }
        let first_content = tokens.iter().copied().find(|id| !special(*id));

        Ok(Self { tokens, copy, follows, first_content })
    }
}

/// Inputs to the adapter modules at one decoding step.
struct AdapterInputs {
    h_q: Vec<f32>,
    h_v: Vec<f32>,
}

/// The local engine: frozen base plus an optional LoRA adapter.
#[derive(Debug, Clone)]
pub struct LocalSeq2Seq {
    id: String,
    config: BaseModelConfig,
    adapter: Option<LoraAdapter>,
}

impl LocalSeq2Seq {
    /// Loads the base model from a checkpoint directory holding `config.json`.
    pub fn from_pretrained(dir: &Path) -> Result<Self, ModelError> {
        let config = BaseModelConfig::load(dir)?;
        info!(
            checkpoint = %dir.display(),
            vocab_size = config.vocab_size,
            model_type = config.model_type.as_deref().unwrap_or("unknown"),
            "Loaded base model"
        );
        Ok(Self { id: dir.display().to_string(), config, adapter: None })
    }

    /// Loads a base model and attaches the adapter saved in `adapter_dir`.
    pub fn from_pretrained_with_adapter(base_dir: &Path, adapter_dir: &Path) -> Result<Self, ModelError> {
        let adapter = LoraAdapter::load(adapter_dir)?;
        let mut model = Self::from_pretrained(base_dir)?.with_adapter(adapter)?;
        model.id = adapter_dir.display().to_string();
        Ok(model)
    }

    #[must_use]
    pub fn from_config(id: impl Into<String>, config: BaseModelConfig) -> Self {
        Self { id: id.into(), config, adapter: None }
    }

    /// Attaches a trained adapter after checking it fits this base model.
    pub fn with_adapter(mut self, adapter: LoraAdapter) -> Result<Self, ModelError> {
        adapter.config.validate()?;
        if adapter.modules.is_empty() {
            return Err(ModelError::Adapter("adapter has no modules".to_string()));
        }
        for (name, weights) in &adapter.modules {
            if !ADAPTABLE_MODULES.contains(&name.as_str()) {
                return Err(ModelError::Adapter(format!("module '{name}' does not exist in the base model")));
            }
            if weights.in_features != self.config.vocab_size || weights.out_features != self.config.vocab_size {
                return Err(ModelError::Adapter(format!(
                    "module '{name}' is {}x{} but the base model vocabulary is {}",
                    weights.in_features, weights.out_features, self.config.vocab_size
                )));
            }
        }
        self.adapter = Some(adapter);
        Ok(self)
    }

    /// Creates a fresh adapter for the configured target modules.
    ///
    /// Targets the base model does not have are skipped with a warning; if none match, the
    /// adapter cannot be built.
    pub fn init_adapter(&mut self, config: LoraConfig, rng: &mut impl Rng) -> Result<(), ModelError> {
        config.validate()?;
        let mut modules = BTreeMap::new();
        for target in &config.target_modules {
            if ADAPTABLE_MODULES.contains(&target.as_str()) {
                let vocab = self.config.vocab_size;
                modules.insert(target.clone(), LoraWeights::init(vocab, vocab, config.r, rng));
            } else {
                warn!(module = %target, "Target module not found in base model, skipping");
            }
        }
        if modules.is_empty() {
            return Err(ModelError::Adapter(format!(
                "target modules {:?} not found in the base model (available: {ADAPTABLE_MODULES:?})",
                config.target_modules
            )));
        }

        let adapter = LoraAdapter { config, modules };
        info!(
            trainable_parameters = adapter.trainable_parameters(),
            modules = ?adapter.modules.keys().collect::<Vec<_>>(),
            "Initialized LoRA adapter"
        );
        self.adapter = Some(adapter);
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &BaseModelConfig {
        &self.config
    }

    #[must_use]
    pub fn adapter(&self) -> Option<&LoraAdapter> {
        self.adapter.as_ref()
    }

    /// Disables the decoder cache for training.
    pub fn disable_cache(&mut self) {
        self.config.use_cache = false;
    }

    fn module(&self, name: &str) -> Option<(&LoraWeights, f32)> {
        let adapter = self.adapter.as_ref()?;
        adapter.modules.get(name).map(|w| (w, adapter.config.scaling()))
    }

    /// Mean of the `v_proj` input rows over the source, each row scaled by its dropout factor.
    fn source_hidden(&self, ctx: &SourceContext, keep: &[f32]) -> Vec<f32> {
        let Some((v, _)) = self.module(V_PROJ) else {
            return Vec::new();
        };
        let mut hidden = vec![0.0; v.r];
        if ctx.tokens.is_empty() {
            return hidden;
        }
        for (token, k) in ctx.tokens.iter().zip(keep) {
            for (h, a) in hidden.iter_mut().zip(v.a_row(*token as usize)) {
                *h += a * k;
            }
        }
        let n = ctx.tokens.len() as f32;
        hidden.iter_mut().for_each(|h| *h /= n);
        hidden
    }

    fn prev_hidden(&self, prev: u32, keep: f32) -> Vec<f32> {
        match self.module(Q_PROJ) {
            Some((q, _)) => q.a_row(prev as usize).iter().map(|a| a * keep).collect(),
            None => Vec::new(),
        }
    }

    /// Writes next-token logits for one step into `out`.
    fn logits(&self, ctx: &SourceContext, prev: u32, is_first: bool, inputs: &AdapterInputs, out: &mut [f32]) {
        out.fill(0.0);
        for token in &ctx.copy {
            out[*token as usize] += self.config.copy_bias;
        }
        let followers = if is_first {
            ctx.first_content.map(|t| vec![t]).unwrap_or_default()
        } else {
            ctx.follows.get(&prev).cloned().unwrap_or_default()
        };
        for token in followers {
            out[token as usize] += self.config.follow_bias;
        }
        if let Some(eos) = self.config.eos_token_id {
            out[eos as usize] += self.config.eos_bias;
        }

        if let Some((q, scaling)) = self.module(Q_PROJ) {
            q.add_projection(&inputs.h_q, scaling, out);
        }
        if let Some((v, scaling)) = self.module(V_PROJ) {
            v.add_projection(&inputs.h_v, scaling, out);
        }

        for id in [self.config.pad_token_id, self.config.bos_token_id].into_iter().flatten() {
            if Some(id) != self.config.eos_token_id {
                out[id as usize] = f32::NEG_INFINITY;
            }
        }
    }

    fn decoder_inputs(&self, labels: &[i64]) -> Result<Vec<u32>, ModelError> {
        let start = self.config.start_token()?;
        let pad = self.config.pad_token_id.unwrap_or(start);
        let mut inputs = Vec::with_capacity(labels.len());
        inputs.push(start);
        for label in labels.iter().take(labels.len().saturating_sub(1)) {
            inputs.push(u32::try_from(*label).unwrap_or(pad));
        }
        Ok(inputs)
    }

    fn target(&self, label: i64) -> Result<Option<usize>, ModelError> {
        if label == IGNORE_INDEX {
            return Ok(None);
        }
        match usize::try_from(label) {
            Ok(t) if t < self.config.vocab_size => Ok(Some(t)),
            _ => Err(ModelError::InvalidInput(format!(
                "label {label} is outside the vocabulary ({})",
                self.config.vocab_size
            ))),
        }
    }

    /// Summed cross-entropy and token count for one example, without dropout.
    pub fn example_loss(&self, example: &TrainingExample) -> Result<(f64, usize), ModelError> {
        let ctx = SourceContext::new(&self.config, &example.input_ids, &example.attention_mask)?;
        let keep = vec![1.0; ctx.tokens.len()];
        let h_v = self.source_hidden(&ctx, &keep);
        let decoder_inputs = self.decoder_inputs(&example.labels)?;

        let mut logits = vec![0.0; self.config.vocab_size];
        let mut loss = 0.0;
        let mut count = 0;
        for (t, label) in example.labels.iter().enumerate() {
            let Some(target) = self.target(*label)? else {
                continue;
            };
            let prev = decoder_inputs[t];
            let inputs = AdapterInputs { h_q: self.prev_hidden(prev, 1.0), h_v: h_v.clone() };
            self.logits(&ctx, prev, t == 0, &inputs, &mut logits);
            log_softmax(&mut logits);
            loss -= f64::from(logits[target]);
            count += 1;
        }
        Ok((loss, count))
    }

    /// Runs a training forward/backward pass and adds the adapter gradients into `grads`.
    ///
    /// Returns the summed loss for the example; `grads` tracks the token count so the
    /// optimizer can average over everything accumulated since the last step.
    pub fn accumulate_gradients(
        &self,
        example: &TrainingExample,
        grads: &mut AdapterGradients,
        rng: &mut impl Rng,
    ) -> Result<f64, ModelError> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| ModelError::Adapter("no adapter attached; call init_adapter first".to_string()))?;
        grads.ensure_shapes(adapter);
        let dropout = adapter.config.lora_dropout;
        let scaling = adapter.config.scaling();
        let mut keep_factor = || if dropout > 0.0 && rng.gen_bool(f64::from(dropout)) { 0.0 } else { 1.0 / (1.0 - dropout) };

        let ctx = SourceContext::new(&self.config, &example.input_ids, &example.attention_mask)?;
        let source_keep: Vec<f32> = ctx.tokens.iter().map(|_| keep_factor()).collect();
        let h_v = self.source_hidden(&ctx, &source_keep);
        let decoder_inputs = self.decoder_inputs(&example.labels)?;

        let vocab = self.config.vocab_size;
        let mut logits = vec![0.0; vocab];
        let mut dh_v = vec![0.0; h_v.len()];
        let mut loss = 0.0;

        for (t, label) in example.labels.iter().enumerate() {
            let Some(target) = self.target(*label)? else {
                continue;
            };
            let prev = decoder_inputs[t];
            let prev_keep = keep_factor();
            let inputs = AdapterInputs { h_q: self.prev_hidden(prev, prev_keep), h_v: h_v.clone() };
            self.logits(&ctx, prev, t == 0, &inputs, &mut logits);
            log_softmax(&mut logits);
            loss -= f64::from(logits[target]);

            // d loss / d logits = softmax - onehot
            let mut dz: Vec<f32> = logits.iter().map(|lp| lp.exp()).collect();
            dz[target] -= 1.0;

            if let Some((q, _)) = self.module(Q_PROJ) {
                let g = grads.module_mut(Q_PROJ);
                let dh_q = backprop_projection(q, &inputs.h_q, &dz, scaling, &mut g.lora_b);
                let row = prev as usize * q.r;
                for (k, d) in dh_q.iter().enumerate() {
                    g.lora_a[row + k] += d * prev_keep;
                }
            }
            if let Some((v, _)) = self.module(V_PROJ) {
                let g = grads.module_mut(V_PROJ);
                let dh = backprop_projection(v, &inputs.h_v, &dz, scaling, &mut g.lora_b);
                dh_v.iter_mut().zip(dh).for_each(|(acc, d)| *acc += d);
            }
            grads.tokens += 1;
        }

        if let Some((v, _)) = self.module(V_PROJ) {
            if !ctx.tokens.is_empty() {
                let n = ctx.tokens.len() as f32;
                let g = grads.module_mut(V_PROJ);
                for (token, keep) in ctx.tokens.iter().zip(&source_keep) {
                    let row = *token as usize * v.r;
                    for (k, d) in dh_v.iter().enumerate() {
                        g.lora_a[row + k] += d * keep / n;
                    }
                }
            }
        }

        grads.loss_sum += loss;
        Ok(loss)
    }
}

/// Adds `dL/dB` into `grad_b` and returns `dL/dh` for one projection.
fn backprop_projection(weights: &LoraWeights, hidden: &[f32], dz: &[f32], scaling: f32, grad_b: &mut [f32]) -> Vec<f32> {
    let out = weights.out_features;
    let mut dh = vec![0.0; weights.r];
    for (k, h) in hidden.iter().enumerate() {
        let b_row = &weights.lora_b[k * out..(k + 1) * out];
        let g_row = &mut grad_b[k * out..(k + 1) * out];
        let mut acc = 0.0;
        for ((g, b), d) in g_row.iter_mut().zip(b_row).zip(dz) {
            *g += scaling * h * d;
            acc += b * d;
        }
        dh[k] = scaling * acc;
    }
    dh
}

fn log_softmax(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = values.iter().map(|v| (v - max).exp()).sum();
    let log_sum = max + sum.ln();
    values.iter_mut().for_each(|v| *v -= log_sum);
}

impl Seq2SeqModel for LocalSeq2Seq {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate(
        &self,
        input_ids: &[u32],
        attention_mask: &[u32],
        params: &GenerationParams,
    ) -> Result<Vec<u32>, ModelError> {
        let ctx = SourceContext::new(&self.config, input_ids, attention_mask)?;
        let keep = vec![1.0; ctx.tokens.len()];
        let h_v = self.source_hidden(&ctx, &keep);
        let scorer = Decoder { model: self, ctx, h_v };
        debug!(model_id = %self.id, source_len = scorer.ctx.tokens.len(), num_beams = params.num_beams, "Generating");
        beam_search(
            &scorer,
            self.config.start_token()?,
            self.config.eos_token_id,
            params,
            self.config.no_repeat_ngram_size,
        )
    }
}

struct Decoder<'a> {
    model: &'a LocalSeq2Seq,
    ctx: SourceContext,
    h_v: Vec<f32>,
}

impl StepScorer for Decoder<'_> {
    fn vocab_size(&self) -> usize {
        self.model.config.vocab_size
    }

    fn log_probs(&self, prefix: &[u32], out: &mut [f32]) -> Result<(), ModelError> {
        let prev = *prefix
            .last()
            .ok_or_else(|| ModelError::InvalidInput("empty decoder prefix".to_string()))?;
        let inputs = AdapterInputs { h_q: self.model.prev_hidden(prev, 1.0), h_v: self.h_v.clone() };
        self.model.logits(&self.ctx, prev, prefix.len() == 1, &inputs, out);
        log_softmax(out);
        Ok(())
    }
}

/// Gradients for both LoRA factors of one module.
#[derive(Debug, Clone, Default)]
pub struct ModuleGradients {
    pub lora_a: Vec<f32>,
    pub lora_b: Vec<f32>,
}

/// Adapter gradients accumulated across examples until the next optimizer step.
#[derive(Debug, Clone, Default)]
pub struct AdapterGradients {
    modules: BTreeMap<String, ModuleGradients>,
    tokens: usize,
    loss_sum: f64,
}

impl AdapterGradients {
    fn ensure_shapes(&mut self, adapter: &LoraAdapter) {
        for (name, weights) in &adapter.modules {
            let g = self.modules.entry(name.clone()).or_default();
            if g.lora_a.len() != weights.lora_a.len() {
                g.lora_a = vec![0.0; weights.lora_a.len()];
            }
            if g.lora_b.len() != weights.lora_b.len() {
                g.lora_b = vec![0.0; weights.lora_b.len()];
            }
        }
    }

    fn module_mut(&mut self, name: &str) -> &mut ModuleGradients {
        self.modules.entry(name.to_string()).or_default()
    }

    /// Target tokens seen since the last reset.
    #[must_use]
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Mean loss per target token since the last reset.
    #[must_use]
    pub fn mean_loss(&self) -> Option<f64> {
        (self.tokens > 0).then(|| self.loss_sum / self.tokens as f64)
    }

    pub fn reset(&mut self) {
        for g in self.modules.values_mut() {
            g.lora_a.fill(0.0);
            g.lora_b.fill(0.0);
        }
        self.tokens = 0;
        self.loss_sum = 0.0;
    }
}

/// AdamW over adapter parameters with a linear learning-rate decay.
#[derive(Debug, Clone)]
pub struct AdapterOptimizer {
    adamw: AdamW,
    schedule: LinearSchedule,
    states: BTreeMap<String, (AdamState, AdamState)>,
}

impl AdapterOptimizer {
    #[must_use]
    pub fn new(adamw: AdamW, schedule: LinearSchedule) -> Self {
        Self { adamw, schedule, states: BTreeMap::new() }
    }

    #[must_use]
    pub fn step_count(&self) -> u64 {
        self.adamw.step_count()
    }

    /// Learning rate that the next step will use.
    #[must_use]
    pub fn current_lr(&self) -> f32 {
        self.schedule.lr_at(self.adamw.step_count())
    }

    /// Applies the averaged gradients to the model's adapter, then resets `grads`.
    ///
    /// Returns the learning rate used, or `None` when nothing was accumulated.
    pub fn step(&mut self, model: &mut LocalSeq2Seq, grads: &mut AdapterGradients) -> Result<Option<f32>, ModelError> {
        if grads.tokens == 0 {
            return Ok(None);
        }
        let lr = self.current_lr();
        let adapter = model
            .adapter
            .as_mut()
            .ok_or_else(|| ModelError::Adapter("no adapter attached".to_string()))?;

        let norm = 1.0 / grads.tokens as f32;
        self.adamw.begin_step();
        for (name, weights) in &mut adapter.modules {
            let Some(g) = grads.modules.get_mut(name) else {
                continue;
            };
            g.lora_a.iter_mut().for_each(|v| *v *= norm);
            g.lora_b.iter_mut().for_each(|v| *v *= norm);
            let (state_a, state_b) = self.states.entry(name.clone()).or_default();
            self.adamw.update(lr, &mut weights.lora_a, &g.lora_a, state_a);
            self.adamw.update(lr, &mut weights.lora_b, &g.lora_b, state_b);
        }
        grads.reset();
        Ok(Some(lr))
    }
}
