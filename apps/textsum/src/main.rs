//! textsum CLI
//!
//! Runs the summarization pipeline stage by stage, serves predictions over HTTP and
//! summarizes a single dialogue from the command line.

mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use textsum_training::{ConfigurationManager, DEFAULT_CONFIG_PATH, DEFAULT_PARAMS_PATH};
use tracing_subscriber::EnvFilter;

/// textsum - dialogue summarization with LoRA-tuned seq2seq models
#[derive(Parser, Debug)]
#[command(name = "textsum", author, version, about = "Dialogue summarization pipeline and prediction service")]
struct Args {
    /// Pipeline document (artifact locations and stage settings)
    #[arg(long, global = true, env = "TEXTSUM_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Hyperparameter document (TrainingArguments and LoRAConfig)
    #[arg(long, global = true, env = "TEXTSUM_PARAMS", default_value = DEFAULT_PARAMS_PATH)]
    params: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every stage: ingestion, validation, transformation, training, evaluation
    Run,

    /// Run a single stage
    ///
    /// Stages read their inputs from the artifact directories earlier stages wrote.
    Stage {
        /// data_ingestion, data_validation, data_transformation, model_trainer or model_evaluation
        name: String,
    },

    /// Serve predictions and training requests over HTTP
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// Maximum number of summaries generated at once
        #[arg(long, default_value_t = 2)]
        max_concurrent: usize,

        /// Per-request timeout in seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },

    /// Summarize one dialogue with the trained adapter
    Predict {
        /// Dialogue text
        text: String,

        /// Print {"dialogue", "summary"} as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(level: &str, format: LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level '{level}'"))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr);
    let result = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| anyhow::anyhow!(e)).context("Failed to initialize logging")
}

fn load_config(config: &Path, params: &Path) -> anyhow::Result<ConfigurationManager> {
    ConfigurationManager::new(config, params).with_context(|| {
        format!("Failed to load configuration from {} and {}", config.display(), params.display())
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may already carry the settings.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_logging(&args.log_level, args.log_format)?;

    let manager = load_config(&args.config, &args.params)?;
    match args.command {
        Command::Run => commands::run::execute(manager).await,
        Command::Stage { name } => commands::run::execute_stage(manager, &name).await,
        Command::Serve { host, port, max_concurrent, timeout_secs } => {
            let server = textsum_server::ServerConfig {
                host,
                port,
                max_concurrent_predictions: max_concurrent,
                request_timeout: std::time::Duration::from_secs(timeout_secs),
            };
            commands::serve::execute(manager, server).await
        }
        Command::Predict { text, json } => commands::predict::execute(manager, &text, json).await,
    }
}
