//! `run` and `stage` commands.

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use textsum_training::{
    ConfigurationManager, IngestionOutcome, JobId, Pipeline, PublishOutcome, Stage, StageOutcome,
};

pub async fn execute(manager: ConfigurationManager) -> Result<()> {
    run_stages(manager, &Stage::ALL).await
}

pub async fn execute_stage(manager: ConfigurationManager, name: &str) -> Result<()> {
    let stage: Stage = name.parse().with_context(|| format!("Cannot run stage '{name}'"))?;
    run_stages(manager, &[stage]).await
}

async fn run_stages(manager: ConfigurationManager, stages: &[Stage]) -> Result<()> {
    let pipeline = Pipeline::new(manager);
    let job_id = JobId::new();
    let cancel = Arc::new(AtomicBool::new(false));

    let outcomes = pipeline.run(stages, &job_id, &cancel).await.context("Pipeline run failed")?;

    println!();
    println!("{}", format!("Pipeline run {job_id}").bold().cyan());
    println!("{}", "─".repeat(60));
    for (stage, outcome) in &outcomes {
        println!("{:<22} {}", stage.as_str(), describe(outcome));
    }
    println!();
    Ok(())
}

fn describe(outcome: &StageOutcome) -> String {
    match outcome {
        StageOutcome::Ingested(IngestionOutcome::Downloaded { files }) => format!("downloaded {files} files").green().to_string(),
        StageOutcome::Ingested(IngestionOutcome::Skipped) => "already present, skipped".dimmed().to_string(),
        StageOutcome::Validated(report) if report.passed() => "passed".green().to_string(),
        StageOutcome::Validated(report) => format!(
            "failed (files: {}, columns: {}, missing values: {})",
            report.files_exist, report.columns_present, report.no_missing_values
        )
        .yellow()
        .to_string(),
        StageOutcome::Transformed(path) => format!("saved to {}", path.display()).green().to_string(),
        StageOutcome::Trained { manifest, publish } => {
            let loss = manifest.metrics.train_loss.map_or_else(|| "n/a".to_string(), |l| format!("{l:.4}"));
            let published = match publish {
                PublishOutcome::Published { files } => format!("published {files} files"),
                PublishOutcome::AlreadyExists => "registry repo exists, not published".to_string(),
                PublishOutcome::Skipped => "no registry account, not published".to_string(),
            };
            format!("{} steps, train loss {loss}, {published}", manifest.metrics.steps).green().to_string()
        }
        StageOutcome::Evaluated(scores) => format!(
            "rouge1 {:.4}  rouge2 {:.4}  rougeL {:.4}  rougeLsum {:.4}",
            scores.rouge1, scores.rouge2, scores.rouge_l, scores.rouge_lsum
        )
        .green()
        .to_string(),
    }
}
