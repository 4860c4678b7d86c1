//! `predict` command.

use anyhow::{Context, Result};
use serde_json::json;
use textsum_training::{ConfigurationManager, Pipeline};

pub async fn execute(manager: ConfigurationManager, text: &str, json_output: bool) -> Result<()> {
    let pipeline = Pipeline::new(manager);
    let predictor = pipeline.load_predictor().await.context("Failed to load the prediction pipeline")?;

    let input = text.to_string();
    let summary = tokio::task::spawn_blocking(move || predictor.predict(&input))
        .await
        .context("Prediction task panicked")?
        .context("Failed to generate summary")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&json!({ "dialogue": text, "summary": summary }))?);
    } else {
        println!("{summary}");
    }
    Ok(())
}
