//! End-to-end pipeline runs against a local checkpoint and CSV files, without network access.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;
use textsum_models::fixtures::{write_base_checkpoint, DIALOGUE_WORDS};
use textsum_models::HubClient;
use textsum_training::{
    ConfigurationManager, DatasetDict, HubRegistry, IngestionOutcome, JobId, Pipeline, PublishOutcome, RegistryConfig,
    Stage, StageOutcome, TokenizedExample, TrainingManifest,
};

const CSV: &str = "id,dialogue,summary
1,amanda: i baked cookies do you want some jerry: sure,amanda baked cookies
2,hannah: do you have larry number betty: no ask larry,hannah asks for larry number
3,jerry: the meeting moved to friday amanda: ok thanks,the meeting moved to friday
";

struct Workspace {
    _temp: TempDir,
    root: PathBuf,
    config: PathBuf,
    params: PathBuf,
}

fn workspace(splits: &[&str]) -> Workspace {
    let temp = TempDir::new().unwrap();
    let base = temp.path().join("base");
    write_base_checkpoint(&base, DIALOGUE_WORDS).unwrap();

    let root = temp.path().join("artifacts");
    let raw = root.join("data_ingestion/samsum_dataset");
    std::fs::create_dir_all(&raw).unwrap();
    for split in splits {
        std::fs::write(raw.join(format!("{split}.csv")), CSV).unwrap();
    }

    let config = format!(
        r#"
artifacts_root: "{root}"
data_ingestion:
  root_dir: "{root}/data_ingestion/samsum_dataset"
  repo_id: knkarthick/samsum
  local_dir_use_symlinks: false
data_validation:
  root_dir: "{root}/data_validation"
  data_dir: "{root}/data_ingestion/samsum_dataset"
  STATUS_FILE: "{root}/data_validation/status.txt"
  ALL_REQUIRED_FILES: [train.csv, test.csv, validation.csv]
  ALL_REQUIRED_COLUMNS: [id, dialogue, summary]
data_transformation:
  root_dir: "{root}/data_transformation"
  data_path: "{root}/data_ingestion/samsum_dataset"
  tokenizer_path: "{base}"
  max_input_length: 32
  max_target_length: 16
model_trainer:
  root_dir: "{root}/model_trainer"
  data_path: "{root}/data_transformation/samsum_dataset"
  model_ckpt: "{base}"
model_evaluation:
  root_dir: "{root}/model_evaluation"
  data_path: "{root}/data_transformation/samsum_dataset"
  metric_file_name: "{root}/model_evaluation/metrics.csv"
  base_model_path: "{base}"
  sample_size: 2
"#,
        root = root.display(),
        base = base.display()
    );
    let params = r"
TrainingArguments:
  num_train_epochs: 2
  per_device_train_batch_size: 2
  per_device_eval_batch_size: 1
  weight_decay: 0.01
  logging_steps: 1
  eval_strategy: epoch
  save_strategy: epoch
  learning_rate: 5.0e-3
  seed: 7
  eval_sample_size: 2
LoRAConfig:
  lora_r: 4
  lora_alpha: 32
  lora_dropout: 0.0
  lora_target_modules: [q_proj, v_proj]
";
    let config_path = temp.path().join("config.yaml");
    let params_path = temp.path().join("params.yaml");
    std::fs::write(&config_path, config).unwrap();
    std::fs::write(&params_path, params).unwrap();
    Workspace { _temp: temp, root, config: config_path, params: params_path }
}

/// Offline pipeline with no registry account, so nothing is published or fetched.
fn offline_pipeline(ws: &Workspace) -> Pipeline {
    let manager = ConfigurationManager::new(&ws.config, &ws.params).unwrap();
    let registry_config = RegistryConfig {
        endpoint: "http://127.0.0.1:9".to_string(),
        adapter_name: "distilbart-samsum-lora".to_string(),
        cache_dir: ws.root.join(".cache"),
        account: None,
        token: None,
    };
    let registry = HubRegistry::new(HubClient::new(&registry_config.endpoint, None), &registry_config.cache_dir);
    Pipeline::with_registry(manager, registry, registry_config)
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_full_pipeline_produces_metrics() {
    let ws = workspace(&["train", "validation", "test"]);
    let pipeline = offline_pipeline(&ws);
    let cancel = Arc::new(AtomicBool::new(false));

    let outcomes = pipeline.run(&Stage::ALL, &JobId::from("e2e"), &cancel).await.unwrap();
    assert_eq!(outcomes.len(), 5);

    assert!(matches!(outcomes[0].1, StageOutcome::Ingested(IngestionOutcome::Skipped)));
    match &outcomes[1].1 {
        StageOutcome::Validated(report) => assert!(report.passed()),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(
        read(&ws.root.join("data_validation/status.txt")),
        "Validation status: True\nColumn validation status: True\nMissing values validation status: True\n"
    );

    let tokenized =
        DatasetDict::<TokenizedExample>::load_from_disk(&ws.root.join("data_transformation/samsum_dataset")).unwrap();
    assert_eq!(tokenized.split("train").unwrap()[0].labels.len(), 16);

    match &outcomes[3].1 {
        StageOutcome::Trained { manifest, publish } => {
            assert_eq!(*publish, PublishOutcome::Skipped);
            assert_eq!(manifest.metrics.steps, 4);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    let manifest = TrainingManifest::load(&ws.root.join("model_trainer")).unwrap();
    assert_eq!(manifest.job_id, JobId::from("e2e"));

    let metrics = read(&ws.root.join("model_evaluation/metrics.csv"));
    let mut lines = metrics.lines();
    assert_eq!(lines.next(), Some(",rouge1,rouge2,rougeL,rougeLsum"));
    assert!(lines.next().is_some_and(|row| row.starts_with("distilbart-lora,")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_validation_does_not_stop_training() {
    let ws = workspace(&["train", "test"]);
    let pipeline = offline_pipeline(&ws);
    let cancel = Arc::new(AtomicBool::new(false));

    let outcomes = pipeline.run(&Stage::THROUGH_TRAINING, &JobId::new(), &cancel).await.unwrap();
    match &outcomes[1].1 {
        StageOutcome::Validated(report) => {
            assert!(!report.files_exist);
            assert!(report.columns_present);
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    assert!(matches!(outcomes[3].1, StageOutcome::Trained { .. }));
    assert!(read(&ws.root.join("data_validation/status.txt")).starts_with("Validation status: False\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_predictor_loads_local_adapter() {
    let ws = workspace(&["train", "validation", "test"]);
    let pipeline = offline_pipeline(&ws);
    let cancel = Arc::new(AtomicBool::new(false));
    pipeline.run(&Stage::THROUGH_TRAINING, &JobId::new(), &cancel).await.unwrap();

    let predictor = pipeline.load_predictor().await.unwrap();
    // generation follows data_transformation.max_target_length
    assert_eq!(predictor.params().max_length, 16);
    let summary = predictor.predict("amanda: i baked cookies do you want some").unwrap();
    assert!(!summary.is_empty());
}

#[tokio::test]
async fn test_raised_cancel_flag_runs_nothing() {
    let ws = workspace(&["train", "validation", "test"]);
    let pipeline = offline_pipeline(&ws);
    let cancel = Arc::new(AtomicBool::new(true));

    let err = pipeline.run(&Stage::ALL, &JobId::new(), &cancel).await.unwrap_err();
    assert!(matches!(err, textsum_training::PipelineError::Cancelled));
    assert!(!ws.root.join("data_validation/status.txt").exists());
}
