use crate::error::{PipelineError, PipelineResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use textsum_models::TrainingExample;

/// Split file names recognised in a CSV dataset directory, in load order.
pub const CSV_SPLITS: [&str; 3] = ["train", "validation", "test"];

const DICT_FILE: &str = "dataset_dict.json";

/// One dialogue/summary pair as found in the raw CSV files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExample {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub dialogue: String,
    #[serde(default)]
    pub summary: String,
}

/// Fixed-length model inputs for one example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
}

impl From<TokenizedExample> for TrainingExample {
    fn from(value: TokenizedExample) -> Self {
        Self { input_ids: value.input_ids, attention_mask: value.attention_mask, labels: value.labels }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DictManifest {
    splits: Vec<String>,
}

/// Named splits of rows, persisted as `dataset_dict.json` plus one `<split>.jsonl` per split.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDict<T> {
    splits: BTreeMap<String, Vec<T>>,
}

impl<T> Default for DatasetDict<T> {
    fn default() -> Self {
        Self { splits: BTreeMap::new() }
    }
}

impl<T> DatasetDict<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, split: impl Into<String>, rows: Vec<T>) {
        self.splits.insert(split.into(), rows);
    }

    #[must_use]
    pub fn get(&self, split: &str) -> Option<&[T]> {
        self.splits.get(split).map(Vec::as_slice)
    }

    /// Like [`DatasetDict::get`] but a missing split is an error.
    pub fn split(&self, split: &str) -> PipelineResult<&[T]> {
        self.get(split).ok_or_else(|| {
            PipelineError::Dataset(format!("split '{split}' not found (available: {:?})", self.split_names()))
        })
    }

    #[must_use]
    pub fn split_names(&self) -> Vec<&str> {
        self.splits.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.splits.is_empty()
    }

    /// Applies `f` to every row, keeping the split structure.
    pub fn try_map<U, F>(&self, mut f: F) -> PipelineResult<DatasetDict<U>>
    where
        F: FnMut(&T) -> PipelineResult<U>,
    {
        let mut out = DatasetDict::new();
        for (name, rows) in &self.splits {
            let mapped = rows.iter().map(&mut f).collect::<PipelineResult<Vec<_>>>()?;
            out.insert(name.clone(), mapped);
        }
        Ok(out)
    }
}

impl<T: Serialize + DeserializeOwned> DatasetDict<T> {
    pub fn save_to_disk(&self, dir: &Path) -> PipelineResult<Vec<PathBuf>> {
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.splits.len() + 1);
        for (name, rows) in &self.splits {
            let path = dir.join(format!("{name}.jsonl"));
            write_jsonl(&path, rows)?;
            written.push(path);
        }
        let manifest = DictManifest { splits: self.splits.keys().cloned().collect() };
        let manifest_path = dir.join(DICT_FILE);
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)?;
        written.push(manifest_path);
        Ok(written)
    }

    pub fn load_from_disk(dir: &Path) -> PipelineResult<Self> {
        let manifest_path = dir.join(DICT_FILE);
        if !manifest_path.exists() {
            return Err(PipelineError::Dataset(format!("no saved dataset at {}", dir.display())));
        }
        let manifest: DictManifest = serde_json::from_slice(&std::fs::read(&manifest_path)?)?;
        let mut dict = Self::new();
        for name in manifest.splits {
            let rows = read_jsonl(&dir.join(format!("{name}.jsonl")))?;
            dict.insert(name, rows);
        }
        Ok(dict)
    }
}

/// True if `dir` holds a dataset written by [`DatasetDict::save_to_disk`].
#[must_use]
pub fn is_saved_dataset(dir: &Path) -> bool {
    dir.join(DICT_FILE).is_file()
}

fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> PipelineResult<()> {
    let mut out = String::new();
    for row in rows {
        out.push_str(&serde_json::to_string(row)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> PipelineResult<Vec<T>> {
    let contents = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row = serde_json::from_str(line).map_err(|e| {
            PipelineError::Dataset(format!("failed to parse {} line {}: {}", path.display(), idx + 1, e))
        })?;
        rows.push(row);
    }
    Ok(rows)
}

/// Reads `dialogue`/`summary` rows from one CSV file.
pub fn read_csv_examples(path: &Path) -> PipelineResult<Vec<RawExample>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    for required in ["dialogue", "summary"] {
        if !headers.iter().any(|h| h == required) {
            return Err(PipelineError::Dataset(format!("{} has no '{required}' column", path.display())));
        }
    }
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Loads `train.csv` / `validation.csv` / `test.csv` from `dir`; `None` when none exist.
pub fn load_csv_splits(dir: &Path) -> PipelineResult<Option<DatasetDict<RawExample>>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut dict = DatasetDict::new();
    for split in CSV_SPLITS {
        let path = dir.join(format!("{split}.csv"));
        if path.is_file() {
            dict.insert(split, read_csv_examples(&path)?);
        }
    }
    Ok((!dict.is_empty()).then_some(dict))
}

/// True if `dir` exists and has at least one entry.
pub fn dir_is_non_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir).map(|mut entries| entries.next().is_some()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load_dataset_dict() {
        let temp = TempDir::new().unwrap();
        let mut dict = DatasetDict::new();
        dict.insert(
            "train",
            vec![TokenizedExample { input_ids: vec![0, 5, 2], attention_mask: vec![1, 1, 1], labels: vec![0, 7, -100] }],
        );
        dict.insert("test", vec![]);
        dict.save_to_disk(temp.path()).unwrap();

        assert!(is_saved_dataset(temp.path()));
        let loaded = DatasetDict::<TokenizedExample>::load_from_disk(temp.path()).unwrap();
        assert_eq!(loaded, dict);
        assert_eq!(loaded.split_names(), vec!["test", "train"]);
    }

    #[test]
    fn test_missing_split_is_dataset_error() {
        let dict: DatasetDict<RawExample> = DatasetDict::new();
        assert!(matches!(dict.split("train"), Err(PipelineError::Dataset(_))));
    }

    #[test]
    fn test_load_csv_splits_reads_quoted_dialogues() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("train.csv"),
            "id,dialogue,summary\n13818513,\"Amanda: I baked cookies.\nJerry: Sure!\",Amanda baked cookies.\n",
        )
        .unwrap();
        let dict = load_csv_splits(temp.path()).unwrap().unwrap();
        let train = dict.split("train").unwrap();
        assert_eq!(train.len(), 1);
        assert_eq!(train[0].id.as_deref(), Some("13818513"));
        assert!(train[0].dialogue.contains('\n'));
        assert!(dict.get("test").is_none());
    }

    #[test]
    fn test_load_csv_splits_none_without_csv() {
        let temp = TempDir::new().unwrap();
        assert!(load_csv_splits(temp.path()).unwrap().is_none());
        assert!(!dir_is_non_empty(&temp.path().join("missing")));
    }
}
