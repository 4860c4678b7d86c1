//! LoRA fine-tuning of the local seq2seq engine.
//!
//! The trainer loads the tokenized dataset written by the transformation stage, attaches a fresh
//! adapter to the frozen base checkpoint and runs AdamW with a linearly decaying learning rate.
//! Evaluation and checkpointing follow the configured interval strategies. The final adapter,
//! the tokenizer and a manifest with SHA-256 digests are written to `root_dir`.

use crate::artifacts::{make_artifact, ArtifactKind, TrainingArtifact, TrainingManifest, TrainingMetrics};
use crate::config::{IntervalStrategy, ModelTrainerConfig};
use crate::dataset::{DatasetDict, TokenizedExample};
use crate::error::{PipelineError, PipelineResult};
use crate::evaluation::score_examples;
use crate::job::JobId;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::registry::{HubRegistry, ModelRegistry};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use textsum_models::{
    AdamW, AdapterGradients, AdapterOptimizer, GenerationParams, LinearSchedule, LocalSeq2Seq, LoraAdapter,
    LoraConfig, TextTokenizer, TrainingExample,
};
use tracing::{debug, info, warn};

const CHECKPOINT_PREFIX: &str = "checkpoint-";
const RESULTS_FILE: &str = "all_results.json";

/// Result of [`ModelTrainer::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { files: usize },
    /// The repository already existed; nothing was uploaded.
    AlreadyExists,
    /// No registry account is configured.
    Skipped,
}

/// Metrics from one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
struct EvalResult {
    loss: Option<f64>,
    rouge: crate::rouge::RougeScores,
    gen_len: f64,
}

#[derive(Debug, Clone)]
pub struct ModelTrainer {
    config: ModelTrainerConfig,
}

impl ModelTrainer {
    #[must_use]
    pub fn new(config: ModelTrainerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &ModelTrainerConfig {
        &self.config
    }

    /// Resolves `model_ckpt` and trains on a blocking thread.
    pub async fn train(
        &self,
        registry: &HubRegistry,
        job_id: JobId,
        progress: Arc<dyn ProgressSink>,
        cancel: Arc<AtomicBool>,
    ) -> PipelineResult<TrainingManifest> {
        let base_dir = registry.resolve_pretrained(&self.config.model_ckpt).await?;
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.train_local(&base_dir, &job_id, progress.as_ref(), &cancel)).await?
    }

    /// Runs the full training loop against a base checkpoint directory.
    ///
    /// `cancel` is checked before every optimizer step; a set flag ends the run with
    /// [`PipelineError::Cancelled`] and leaves `root_dir` without a final adapter.
    pub fn train_local(
        &self,
        base_dir: &Path,
        job_id: &JobId,
        progress: &dyn ProgressSink,
        cancel: &AtomicBool,
    ) -> PipelineResult<TrainingManifest> {
        let cfg = &self.config;
        let started_at = Utc::now();
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let dataset = DatasetDict::<TokenizedExample>::load_from_disk(&cfg.data_path)?;
        let train_rows = sample(dataset.split("train")?, cfg.train_sample_size);
        if train_rows.is_empty() {
            return Err(PipelineError::Dataset("train split is empty".to_string()));
        }
        let eval_rows = match dataset.get("validation") {
            Some(rows) => sample(rows, cfg.eval_sample_size),
            None => sample(dataset.split("test")?, cfg.eval_sample_size),
        };
        let train: Vec<TrainingExample> = train_rows.iter().cloned().map(Into::into).collect();

        let tokenizer = TextTokenizer::from_dir(base_dir)?;
        let mut model = LocalSeq2Seq::from_pretrained(base_dir)?;
        model.disable_cache();
        let lora = LoraConfig::new(cfg.lora_r, cfg.lora_alpha, cfg.lora_dropout, cfg.lora_target_modules.clone())
            .with_base_model(cfg.model_ckpt.clone());
        model.init_adapter(lora.clone(), &mut rng)?;
        let trainable = model.adapter().map_or(0, LoraAdapter::trainable_parameters);

        let examples_per_step = cfg.per_device_train_batch_size * cfg.gradient_accumulation_steps;
        let steps_per_epoch = train.len().div_ceil(examples_per_step) as u64;
        let total_steps = steps_per_epoch * u64::from(cfg.num_train_epochs);
        let mut optimizer = AdapterOptimizer::new(
            AdamW::new(cfg.weight_decay),
            LinearSchedule { base_lr: cfg.learning_rate, total_steps },
        );
        let mut grads = AdapterGradients::default();

        info!(
            job_id = %job_id,
            examples = train.len(),
            eval_examples = eval_rows.len(),
            epochs = cfg.num_train_epochs,
            total_steps,
            trainable_parameters = trainable,
            "Starting LoRA fine-tuning"
        );
        progress.on_event(ProgressEvent::Started { job_id: job_id.clone(), total_steps });

        let mut loss_sum = 0.0;
        let mut loss_tokens = 0usize;
        let mut window_loss = 0.0;
        let mut window_tokens = 0usize;
        let mut last_eval: Option<EvalResult> = None;
        let mut order: Vec<usize> = (0..train.len()).collect();

        for epoch in 0..cfg.num_train_epochs {
            order.shuffle(&mut rng);
            for (chunk_idx, chunk) in order.chunks(examples_per_step).enumerate() {
                if cancel.load(Ordering::Relaxed) {
                    warn!(job_id = %job_id, step = optimizer.step_count(), "Training cancelled");
                    return Err(PipelineError::Cancelled);
                }
                for idx in chunk {
                    model.accumulate_gradients(&train[*idx], &mut grads, &mut rng)?;
                }
                let tokens = grads.tokens();
                let step_loss = grads.mean_loss().unwrap_or(0.0) * tokens as f64;
                let Some(lr) = optimizer.step(&mut model, &mut grads)? else {
                    debug!(chunk_idx, "No target tokens in batch, skipping step");
                    continue;
                };
                loss_sum += step_loss;
                loss_tokens += tokens;
                window_loss += step_loss;
                window_tokens += tokens;

                let step = optimizer.step_count();
                if step % cfg.logging_steps == 0 && window_tokens > 0 {
                    let epoch_progress = f64::from(epoch) + (chunk_idx + 1) as f64 / steps_per_epoch as f64;
                    progress.on_event(ProgressEvent::Step {
                        job_id: job_id.clone(),
                        step,
                        total: total_steps,
                        epoch: epoch_progress,
                        loss: window_loss / window_tokens as f64,
                        learning_rate: lr,
                    });
                    window_loss = 0.0;
                    window_tokens = 0;
                }
                if cfg.eval_strategy == IntervalStrategy::Steps && step % cfg.eval_steps == 0 {
                    last_eval = Some(self.run_eval(&model, &tokenizer, eval_rows, job_id, step, progress)?);
                }
                if cfg.save_strategy == IntervalStrategy::Steps && step % cfg.save_steps == 0 {
                    self.save_checkpoint(&model, step, job_id, progress)?;
                }
            }

            let step = optimizer.step_count();
            if cfg.eval_strategy == IntervalStrategy::Epoch {
                last_eval = Some(self.run_eval(&model, &tokenizer, eval_rows, job_id, step, progress)?);
            }
            if cfg.save_strategy == IntervalStrategy::Epoch {
                self.save_checkpoint(&model, step, job_id, progress)?;
            }
        }

        let train_loss = (loss_tokens > 0).then(|| loss_sum / loss_tokens as f64);
        let metrics = TrainingMetrics {
            train_loss,
            eval_loss: last_eval.as_ref().and_then(|e| e.loss),
            eval_rouge: last_eval.as_ref().map(|e| e.rouge),
            eval_gen_len: last_eval.as_ref().map(|e| e.gen_len),
            steps: optimizer.step_count(),
            epochs: cfg.num_train_epochs,
        };

        let artifacts = self.save_outputs(&model, &tokenizer, &metrics)?;
        let manifest = TrainingManifest {
            job_id: job_id.clone(),
            started_at,
            finished_at: Utc::now(),
            base_model: cfg.model_ckpt.clone(),
            dataset_path: cfg.data_path.clone(),
            seed: cfg.seed,
            lora,
            metrics,
            artifacts,
        };
        let manifest_path = manifest.save(&cfg.root_dir)?;
        info!(job_id = %job_id, manifest = %manifest_path.display(), train_loss, "Model training complete");
        progress.on_event(ProgressEvent::Finished { job_id: job_id.clone(), train_loss });
        Ok(manifest)
    }

    fn run_eval(
        &self,
        model: &LocalSeq2Seq,
        tokenizer: &TextTokenizer,
        rows: &[TokenizedExample],
        job_id: &JobId,
        step: u64,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<EvalResult> {
        let mut loss = 0.0;
        let mut tokens = 0usize;
        for batch in rows.chunks(self.config.per_device_eval_batch_size) {
            for row in batch {
                let (sum, count) = model.example_loss(&row.clone().into())?;
                loss += sum;
                tokens += count;
            }
        }
        let scores = score_examples(
            model,
            tokenizer,
            rows,
            &GenerationParams::summary().with_max_length(self.config.max_target_length),
        )?;
        let result = EvalResult {
            loss: (tokens > 0).then(|| loss / tokens as f64),
            rouge: scores.rouge,
            gen_len: scores.gen_len,
        };
        progress.on_event(ProgressEvent::Eval {
            job_id: job_id.clone(),
            step,
            eval_loss: result.loss,
            rouge: result.rouge,
            gen_len: result.gen_len,
        });
        Ok(result)
    }

    fn save_checkpoint(
        &self,
        model: &LocalSeq2Seq,
        step: u64,
        job_id: &JobId,
        progress: &dyn ProgressSink,
    ) -> PipelineResult<()> {
        let adapter = model
            .adapter()
            .ok_or_else(|| PipelineError::Artifact("no adapter to checkpoint".to_string()))?;
        let dir = self.config.root_dir.join(format!("{CHECKPOINT_PREFIX}{step}"));
        adapter.save(&dir)?;
        progress.on_event(ProgressEvent::Checkpoint { job_id: job_id.clone(), step, path: dir });
        rotate_checkpoints(&self.config.root_dir, self.config.save_total_limit)
    }

    fn save_outputs(
        &self,
        model: &LocalSeq2Seq,
        tokenizer: &TextTokenizer,
        metrics: &TrainingMetrics,
    ) -> PipelineResult<Vec<TrainingArtifact>> {
        let root = &self.config.root_dir;
        let adapter = model
            .adapter()
            .ok_or_else(|| PipelineError::Artifact("training finished without an adapter".to_string()))?;

        let mut artifacts = Vec::new();
        let mut saved = adapter.save(root)?.into_iter();
        if let Some(path) = saved.next() {
            artifacts.push(make_artifact(ArtifactKind::AdapterConfig, path)?);
        }
        if let Some(path) = saved.next() {
            artifacts.push(make_artifact(ArtifactKind::AdapterWeights, path)?);
        }
        artifacts.push(make_artifact(ArtifactKind::Tokenizer, tokenizer.save(root)?)?);

        let results_path = root.join(RESULTS_FILE);
        std::fs::write(&results_path, serde_json::to_string_pretty(metrics)?)?;
        artifacts.push(make_artifact(ArtifactKind::Metrics, results_path)?);

        for (_, dir) in list_checkpoints(root)? {
            artifacts.push(make_artifact(ArtifactKind::Checkpoint, dir.join(LoraAdapter::WEIGHTS_FILE))?);
        }
        Ok(artifacts)
    }

    /// Files uploaded by [`ModelTrainer::publish`]: the adapter pair and the tokenizer.
    pub fn publish_files(&self) -> PipelineResult<Vec<PathBuf>> {
        let files: Vec<PathBuf> = [LoraAdapter::CONFIG_FILE, LoraAdapter::WEIGHTS_FILE, TextTokenizer::FILE_NAME]
            .iter()
            .map(|name| self.config.root_dir.join(name))
            .collect();
        if let Some(missing) = files.iter().find(|f| !f.is_file()) {
            return Err(PipelineError::Artifact(format!("{} not found, train first", missing.display())));
        }
        Ok(files)
    }

    /// Uploads the trained adapter unless the repository already exists.
    pub async fn publish(&self, registry: &dyn ModelRegistry, repo: Option<&str>) -> PipelineResult<PublishOutcome> {
        let Some(repo) = repo else {
            warn!("HUGGINGFACE_USERNAME is not set, skipping adapter upload");
            return Ok(PublishOutcome::Skipped);
        };
        if registry.exists(repo).await? {
            info!(repo, "Model already exists in registry, skipping upload");
            return Ok(PublishOutcome::AlreadyExists);
        }
        let files = self.publish_files()?;
        let pushed = registry.publish(repo, &files).await?;
        info!(repo, files = pushed, "Adapter uploaded");
        Ok(PublishOutcome::Published { files: pushed })
    }
}

fn sample(rows: &[TokenizedExample], size: usize) -> &[TokenizedExample] {
    if size == 0 { rows } else { &rows[..rows.len().min(size)] }
}

/// `checkpoint-<step>` directories under `root`, oldest first.
fn list_checkpoints(root: &Path) -> PipelineResult<Vec<(u64, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(step) = name.to_str().and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX)).and_then(|s| s.parse().ok())
        else {
            continue;
        };
        if entry.path().is_dir() {
            found.push((step, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

fn rotate_checkpoints(root: &Path, keep: usize) -> PipelineResult<()> {
    let checkpoints = list_checkpoints(root)?;
    let excess = checkpoints.len().saturating_sub(keep);
    for (step, dir) in checkpoints.into_iter().take(excess) {
        debug!(step, path = %dir.display(), "Removing old checkpoint");
        std::fs::remove_dir_all(&dir)?;
    }
    Ok(())
}
