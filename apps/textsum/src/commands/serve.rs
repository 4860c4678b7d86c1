//! `serve` command.

use anyhow::{Context, Result};
use std::sync::Arc;
use textsum_server::{AppState, ServerConfig};
use textsum_training::{job_runner, ConfigurationManager, Pipeline, Stage, TrainingQueue};
use tracing::info;

pub async fn execute(manager: ConfigurationManager, server: ServerConfig) -> Result<()> {
    let pipeline = Arc::new(Pipeline::new(manager));

    let runner = {
        let pipeline = Arc::clone(&pipeline);
        job_runner(move |job_id, cancel| {
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.run(&Stage::THROUGH_TRAINING, &job_id, &cancel).await.map(|_| ()) }
        })
    };
    let queue = Arc::new(TrainingQueue::start(runner));
    let state = AppState::new(queue, server.max_concurrent_predictions);

    let loader = Arc::clone(&pipeline);
    state.spawn_model_loader(async move { loader.load_predictor().await });

    info!(address = %server.bind_address(), "Starting prediction service");
    textsum_server::serve(state, &server).await.context("Prediction service failed")
}
