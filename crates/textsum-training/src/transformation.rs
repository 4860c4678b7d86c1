use crate::config::DataTransformationConfig;
use crate::dataset::{is_saved_dataset, load_csv_splits, DatasetDict, RawExample, TokenizedExample};
use crate::error::{PipelineError, PipelineResult};
use crate::registry::HubRegistry;
use std::path::{Path, PathBuf};
use textsum_models::{mask_padding, RepoKind, SnapshotOptions, TextTokenizer};
use tracing::{debug, info, warn};

/// Directory name of the tokenized dataset under `root_dir`.
pub const OUTPUT_DIR: &str = "samsum_dataset";

const SOURCE_CACHE_DIR: &str = "source_cache";

/// Tokenizes the raw dataset into fixed-length model inputs.
#[derive(Debug, Clone)]
pub struct DataTransformation {
    config: DataTransformationConfig,
    tokenizer: TextTokenizer,
}

impl DataTransformation {
    #[must_use]
    pub fn new(config: DataTransformationConfig, tokenizer: TextTokenizer) -> Self {
        Self { config, tokenizer }
    }

    /// Resolves `tokenizer_path` (local directory or model repository) and loads it.
    pub async fn load(config: DataTransformationConfig, registry: &HubRegistry) -> PipelineResult<Self> {
        let dir = registry.resolve_pretrained(&config.tokenizer_path).await?;
        let tokenizer = TextTokenizer::from_dir(&dir)?;
        Ok(Self::new(config, tokenizer))
    }

    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.config.root_dir.join(OUTPUT_DIR)
    }

    /// Encodes one example: padded dialogue ids, and summary labels with padding masked.
    pub fn preprocess(&self, example: &RawExample) -> PipelineResult<TokenizedExample> {
        let inputs = self.tokenizer.encode_padded(&example.dialogue, self.config.max_input_length)?;
        let targets = self.tokenizer.encode_padded(&example.summary, self.config.max_target_length)?;
        Ok(TokenizedExample {
            input_ids: inputs.input_ids,
            attention_mask: inputs.attention_mask,
            labels: mask_padding(&targets.input_ids, self.tokenizer.pad_token_id()),
        })
    }

    /// Finds the raw dataset: a CSV directory, then a saved dataset, then a dataset repository.
    async fn load_source(&self, registry: &HubRegistry) -> PipelineResult<DatasetDict<RawExample>> {
        let data_path = Path::new(&self.config.data_path);

        match load_csv_splits(data_path) {
            Ok(Some(dict)) => {
                debug!(path = %data_path.display(), "Loaded CSV splits");
                return Ok(dict);
            }
            Ok(None) => {}
            Err(e) => warn!(path = %data_path.display(), error = %e, "Could not read CSV splits"),
        }

        if is_saved_dataset(data_path) {
            match DatasetDict::load_from_disk(data_path) {
                Ok(dict) => {
                    debug!(path = %data_path.display(), "Loaded saved dataset");
                    return Ok(dict);
                }
                Err(e) => warn!(path = %data_path.display(), error = %e, "Could not read saved dataset"),
            }
        }

        let snapshot = self.config.root_dir.join(SOURCE_CACHE_DIR);
        info!(repo = %self.config.data_path, dest = %snapshot.display(), "Fetching dataset from hub");
        registry
            .hub()
            .snapshot_download(&self.config.data_path, RepoKind::Dataset, &snapshot, &SnapshotOptions::default())
            .await?;
        load_csv_splits(&snapshot)?.ok_or_else(|| {
            PipelineError::Dataset(format!("dataset '{}' has no train/validation/test CSV files", self.config.data_path))
        })
    }

    /// Tokenizes every split and saves the result to `root_dir/samsum_dataset`.
    pub async fn convert(&self, registry: &HubRegistry) -> PipelineResult<PathBuf> {
        let raw = self.load_source(registry).await?;
        raw.split("train")?;

        let this = self.clone();
        let out_dir = self.output_dir();
        let target = out_dir.clone();
        tokio::task::spawn_blocking(move || this.tokenize_and_save(&raw, &target)).await??;
        info!(path = %out_dir.display(), "Saved tokenized dataset");
        Ok(out_dir)
    }

    fn tokenize_and_save(&self, raw: &DatasetDict<RawExample>, out_dir: &Path) -> PipelineResult<()> {
        for name in raw.split_names() {
            debug!(split = name, rows = raw.get(name).map_or(0, <[RawExample]>::len), "Tokenizing split");
        }
        let tokenized = raw.try_map(|example| self.preprocess(example))?;
        tokenized.save_to_disk(out_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use textsum_models::fixtures::{write_word_level_tokenizer, DIALOGUE_WORDS};
    use textsum_models::{restore_padding, HubClient, IGNORE_INDEX};

    fn setup(temp: &TempDir, data_path: &str) -> (DataTransformation, HubRegistry) {
        let tok_dir = temp.path().join("tokenizer");
        write_word_level_tokenizer(&tok_dir, DIALOGUE_WORDS).unwrap();
        let config = DataTransformationConfig {
            root_dir: temp.path().join("data_transformation"),
            data_path: data_path.to_string(),
            tokenizer_path: tok_dir.display().to_string(),
            max_input_length: 24,
            max_target_length: 8,
        };
        let tokenizer = TextTokenizer::from_dir(&tok_dir).unwrap();
        let registry = HubRegistry::new(HubClient::new("http://127.0.0.1:9", None), temp.path().join("cache"));
        (DataTransformation::new(config, tokenizer), registry)
    }

    fn write_csvs(dir: &Path) {
        std::fs::create_dir_all(dir).unwrap();
        let csv = "id,dialogue,summary\n1,amanda: i baked cookies do you want some,amanda baked cookies\n";
        for split in ["train", "validation", "test"] {
            std::fs::write(dir.join(format!("{split}.csv")), csv).unwrap();
        }
    }

    #[test]
    fn test_preprocess_masks_label_padding() {
        let temp = TempDir::new().unwrap();
        let (transformation, _) = setup(&temp, "unused");
        let example = RawExample {
            id: None,
            dialogue: "amanda: i baked cookies".to_string(),
            summary: "amanda baked cookies".to_string(),
        };
        let encoded = transformation.preprocess(&example).unwrap();
        assert_eq!(encoded.input_ids.len(), 24);
        assert_eq!(encoded.attention_mask.len(), 24);
        assert_eq!(encoded.labels.len(), 8);
        assert_eq!(&encoded.labels[5..], &[IGNORE_INDEX; 3]);

        let restored = restore_padding(&encoded.labels, transformation.tokenizer.pad_token_id());
        assert_eq!(transformation.tokenizer.decode(&restored).unwrap(), "amanda baked cookies");
    }

    #[tokio::test]
    async fn test_convert_from_csv_directory() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("raw");
        write_csvs(&data);
        let (transformation, registry) = setup(&temp, &data.display().to_string());

        let out = transformation.convert(&registry).await.unwrap();
        let tokenized = DatasetDict::<TokenizedExample>::load_from_disk(&out).unwrap();
        assert_eq!(tokenized.split_names(), vec!["test", "train", "validation"]);
        assert_eq!(tokenized.split("train").unwrap()[0].input_ids.len(), 24);
    }

    #[tokio::test]
    async fn test_convert_from_saved_dataset() {
        let temp = TempDir::new().unwrap();
        let saved = temp.path().join("saved");
        let mut dict = DatasetDict::new();
        dict.insert(
            "train",
            vec![RawExample { id: None, dialogue: "jerry: sure".to_string(), summary: "jerry agrees".to_string() }],
        );
        dict.save_to_disk(&saved).unwrap();
        let (transformation, registry) = setup(&temp, &saved.display().to_string());

        let out = transformation.convert(&registry).await.unwrap();
        assert!(is_saved_dataset(&out));
    }

    #[tokio::test]
    async fn test_convert_falls_back_to_hub() {
        let mut server = mockito::Server::new_async().await;
        let _info = server
            .mock("GET", "/api/datasets/knkarthick/samsum/revision/main")
            .with_status(200)
            .with_body(r#"{"siblings":[{"rfilename":"train.csv"}]}"#)
            .create_async()
            .await;
        let _file = server
            .mock("GET", "/datasets/knkarthick/samsum/resolve/main/train.csv")
            .with_status(200)
            .with_body("id,dialogue,summary\n1,hannah: have you number,hannah asks\n")
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let (transformation, _) = setup(&temp, "knkarthick/samsum");
        let registry = HubRegistry::new(HubClient::new(server.url(), None), temp.path().join("cache"));

        let out = transformation.convert(&registry).await.unwrap();
        let tokenized = DatasetDict::<TokenizedExample>::load_from_disk(&out).unwrap();
        assert_eq!(tokenized.split("train").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_convert_requires_train_split() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("raw");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("test.csv"), "id,dialogue,summary\n1,ok,ok\n").unwrap();
        let (transformation, registry) = setup(&temp, &data.display().to_string());
        assert!(matches!(transformation.convert(&registry).await, Err(PipelineError::Dataset(_))));
    }
}
