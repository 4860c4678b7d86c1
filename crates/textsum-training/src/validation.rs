//! Checks on the ingested dataset directory.
//!
//! Each check writes one `"<Check> status: True|False"` line to the status file. The file-existence
//! check starts a new record; the others append to it. Read or parse failures are returned as
//! errors rather than recorded as a failed check.

use crate::config::DataValidationConfig;
use crate::error::PipelineResult;
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Outcome of [`DataValidation::validate_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationReport {
    pub files_exist: bool,
    pub columns_present: bool,
    pub no_missing_values: bool,
}

impl ValidationReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.files_exist && self.columns_present && self.no_missing_values
    }
}

#[derive(Debug, Clone)]
pub struct DataValidation {
    config: DataValidationConfig,
}

impl DataValidation {
    #[must_use]
    pub fn new(config: DataValidationConfig) -> Self {
        Self { config }
    }

    fn write_status(&self, line: &str, append: bool) -> PipelineResult<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&self.config.status_file)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn csv_files(&self) -> PipelineResult<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.config.data_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Every required file name is present in the data directory.
    pub fn validate_all_files_exist(&self) -> PipelineResult<bool> {
        let present: HashSet<String> = std::fs::read_dir(&self.config.data_dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        let missing: Vec<&String> = self.config.all_required_files.iter().filter(|f| !present.contains(*f)).collect();

        let status = missing.is_empty();
        if !status {
            warn!(missing = ?missing, dir = %self.config.data_dir.display(), "Required files are missing");
        }
        self.write_status(&format!("Validation status: {}", status_word(status)), false)?;
        Ok(status)
    }

    /// Every CSV file in the data directory has every required column.
    pub fn validate_all_columns(&self) -> PipelineResult<bool> {
        let mut status = true;
        let files = self.csv_files()?;
        if files.is_empty() {
            warn!(dir = %self.config.data_dir.display(), "No CSV files to check");
        }
        for path in &files {
            let mut reader = csv::Reader::from_path(path)?;
            let headers: HashSet<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
            let missing: Vec<&String> =
                self.config.all_required_columns.iter().filter(|c| !headers.contains(*c)).collect();
            if !missing.is_empty() {
                warn!(file = %display_name(path), missing_columns = ?missing, "Missing required columns");
                status = false;
            }
        }
        self.write_status(&format!("Column validation status: {}", status_word(status)), true)?;
        Ok(status)
    }

    /// No CSV file has empty fields.
    pub fn validate_missing_values(&self) -> PipelineResult<bool> {
        let mut status = true;
        for path in &self.csv_files()? {
            let counts = missing_value_counts(path)?;
            let total: usize = counts.values().sum();
            info!(file = %display_name(path), total_missing = total, per_column = ?counts, "Missing value statistics");
            if total > 0 {
                warn!(file = %display_name(path), total_missing = total, "File has missing values");
                status = false;
            }
        }
        self.write_status(&format!("Missing values validation status: {}", status_word(status)), true)?;
        Ok(status)
    }

    /// Runs the three checks in order.
    pub fn validate_all(&self) -> PipelineResult<ValidationReport> {
        let report = ValidationReport {
            files_exist: self.validate_all_files_exist()?,
            columns_present: self.validate_all_columns()?,
            no_missing_values: self.validate_missing_values()?,
        };
        info!(?report, status_file = %self.config.status_file.display(), "Validation finished");
        Ok(report)
    }
}

/// Status lines use `True`/`False`.
fn status_word(status: bool) -> &'static str {
    if status { "True" } else { "False" }
}

fn display_name(path: &Path) -> String {
    path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned())
}

/// Empty fields per column; short rows count as missing for the absent columns.
fn missing_value_counts(path: &Path) -> PipelineResult<BTreeMap<String, usize>> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut counts: BTreeMap<String, usize> = headers.iter().map(|h| (h.clone(), 0)).collect();

    for record in reader.records() {
        let record = record?;
        for (idx, header) in headers.iter().enumerate() {
            if record.get(idx).is_none_or(str::is_empty) {
                *counts.entry(header.clone()).or_default() += 1;
            }
        }
    }
    Ok(counts)
}
