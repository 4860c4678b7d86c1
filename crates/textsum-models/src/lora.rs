//! LoRA adapter configuration and weights.
//!
//! The on-disk layout mirrors PEFT: `adapter_config.json` holds the configuration and
//! `adapter_model.json` the per-module `lora_A` / `lora_B` factors.

use crate::error::ModelError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_task_type() -> String {
    "SEQ_2_SEQ_LM".to_string()
}

fn default_bias() -> String {
    "none".to_string()
}

/// LoRA hyperparameters, serialized as `adapter_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank of the update matrices.
    pub r: usize,
    /// Scaling numerator; the update is scaled by `lora_alpha / r`.
    pub lora_alpha: f32,
    /// Dropout applied to the adapter input during training.
    pub lora_dropout: f32,
    /// Names of the base-model modules that receive an adapter.
    pub target_modules: Vec<String>,
    #[serde(default = "default_peft_type")]
    pub peft_type: String,
    #[serde(default = "default_task_type")]
    pub task_type: String,
    #[serde(default = "default_bias")]
    pub bias: String,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

impl LoraConfig {
    #[must_use]
    pub fn new(r: usize, lora_alpha: f32, lora_dropout: f32, target_modules: Vec<String>) -> Self {
        Self {
            r,
            lora_alpha,
            lora_dropout,
            target_modules,
            peft_type: default_peft_type(),
            task_type: default_task_type(),
            bias: default_bias(),
            base_model_name_or_path: None,
        }
    }

    #[must_use]
    pub fn with_base_model(mut self, base: impl Into<String>) -> Self {
        self.base_model_name_or_path = Some(base.into());
        self
    }

    /// Multiplier applied to `B·A`.
    #[must_use]
    pub fn scaling(&self) -> f32 {
        self.lora_alpha / self.r as f32
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.r == 0 {
            return Err(ModelError::Adapter("lora r must be >= 1".to_string()));
        }
        if !self.lora_alpha.is_finite() || self.lora_alpha <= 0.0 {
            return Err(ModelError::Adapter("lora_alpha must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            return Err(ModelError::Adapter("lora_dropout must be in [0, 1)".to_string()));
        }
        if self.target_modules.is_empty() {
            return Err(ModelError::Adapter("target_modules must not be empty".to_string()));
        }
        if self.peft_type != "LORA" {
            return Err(ModelError::Adapter(format!("unsupported peft_type '{}'", self.peft_type)));
        }
        Ok(())
    }
}

/// Low-rank factors for one module: `delta(x) = scaling * (x·A)·B`.
///
/// `lora_a` is `in_features x r` (row-major, one row per input id) and `lora_b` is
/// `r x out_features`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraWeights {
    pub in_features: usize,
    pub out_features: usize,
    pub r: usize,
    pub lora_a: Vec<f32>,
    pub lora_b: Vec<f32>,
}

impl LoraWeights {
    /// `A` uniform in `[-1/sqrt(r), 1/sqrt(r)]`, `B` zero, so the initial update is zero.
    pub fn init(in_features: usize, out_features: usize, r: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (r as f32).sqrt();
        let lora_a = (0..in_features * r).map(|_| rng.gen_range(-bound..bound)).collect();
        Self { in_features, out_features, r, lora_a, lora_b: vec![0.0; r * out_features] }
    }

    /// Row of `A` for input id `index`.
    #[must_use]
    pub fn a_row(&self, index: usize) -> &[f32] {
        &self.lora_a[index * self.r..(index + 1) * self.r]
    }

    /// Adds `scaling * hidden·B` into `out`.
    pub fn add_projection(&self, hidden: &[f32], scaling: f32, out: &mut [f32]) {
        for (k, h) in hidden.iter().enumerate() {
            let coef = scaling * h;
            if coef == 0.0 {
                continue;
            }
            let row = &self.lora_b[k * self.out_features..(k + 1) * self.out_features];
            for (o, b) in out.iter_mut().zip(row) {
                *o += coef * b;
            }
        }
    }

    fn check_shapes(&self, name: &str) -> Result<(), ModelError> {
        if self.lora_a.len() != self.in_features * self.r || self.lora_b.len() != self.r * self.out_features {
            return Err(ModelError::Checkpoint(format!("adapter module '{name}' has inconsistent shapes")));
        }
        Ok(())
    }
}

/// A trained (or freshly initialized) adapter: configuration plus per-module weights.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraAdapter {
    pub config: LoraConfig,
    pub modules: BTreeMap<String, LoraWeights>,
}

impl LoraAdapter {
    pub const CONFIG_FILE: &'static str = "adapter_config.json";
    pub const WEIGHTS_FILE: &'static str = "adapter_model.json";

    /// Writes `adapter_config.json` and `adapter_model.json` into `dir`.
    pub fn save(&self, dir: &Path) -> Result<Vec<PathBuf>, ModelError> {
        std::fs::create_dir_all(dir)?;
        let config_path = dir.join(Self::CONFIG_FILE);
        std::fs::write(&config_path, serde_json::to_string_pretty(&self.config)?)?;
        let weights_path = dir.join(Self::WEIGHTS_FILE);
        std::fs::write(&weights_path, serde_json::to_vec(&self.modules)?)?;
        Ok(vec![config_path, weights_path])
    }

    /// Loads an adapter saved with [`LoraAdapter::save`].
    pub fn load(dir: &Path) -> Result<Self, ModelError> {
        let config_path = dir.join(Self::CONFIG_FILE);
        let weights_path = dir.join(Self::WEIGHTS_FILE);
        if !config_path.exists() || !weights_path.exists() {
            return Err(ModelError::Checkpoint(format!("no LoRA adapter found in {}", dir.display())));
        }

        let config: LoraConfig = serde_json::from_slice(&std::fs::read(&config_path)?)?;
        config.validate()?;
        let modules: BTreeMap<String, LoraWeights> = serde_json::from_slice(&std::fs::read(&weights_path)?)?;
        for (name, weights) in &modules {
            weights.check_shapes(name)?;
            if weights.r != config.r {
                return Err(ModelError::Checkpoint(format!(
                    "adapter module '{name}' has rank {} but config says {}",
                    weights.r, config.r
                )));
            }
        }
        Ok(Self { config, modules })
    }

    /// Number of trainable parameters across all modules.
    #[must_use]
    pub fn trainable_parameters(&self) -> usize {
        self.modules.values().map(|w| w.lora_a.len() + w.lora_b.len()).sum()
    }
}
