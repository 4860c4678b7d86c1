use crate::job::JobId;
use crate::rouge::RougeScores;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started { job_id: JobId, total_steps: u64 },
    Step { job_id: JobId, step: u64, total: u64, epoch: f64, loss: f64, learning_rate: f32 },
    Eval { job_id: JobId, step: u64, eval_loss: Option<f64>, rouge: RougeScores, gen_len: f64 },
    Checkpoint { job_id: JobId, step: u64, path: PathBuf },
    Finished { job_id: JobId, train_loss: Option<f64> },
}

pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Logs every event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Started { job_id, total_steps } => {
                info!(job_id = %job_id, total_steps, "Training started");
            }
            ProgressEvent::Step { job_id, step, total, epoch, loss, learning_rate } => {
                info!(job_id = %job_id, step, total, epoch, loss, learning_rate, "Training step");
            }
            ProgressEvent::Eval { job_id, step, eval_loss, rouge, gen_len } => {
                info!(
                    job_id = %job_id,
                    step,
                    eval_loss,
                    rouge1 = rouge.rouge1,
                    rouge2 = rouge.rouge2,
                    rouge_l = rouge.rouge_l,
                    rouge_lsum = rouge.rouge_lsum,
                    gen_len,
                    "Evaluation"
                );
            }
            ProgressEvent::Checkpoint { job_id, step, path } => {
                info!(job_id = %job_id, step, path = %path.display(), "Saved checkpoint");
            }
            ProgressEvent::Finished { job_id, train_loss } => {
                info!(job_id = %job_id, train_loss, "Training finished");
            }
        }
    }
}
