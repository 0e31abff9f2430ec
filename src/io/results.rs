//! Result records: one CSV row per `(dataset, model)`.
//!
//! Layout: `<OUTPUT_DIR>/error_metrics/<dataset_name>/<model_key>.csv`.
//! Writes go to a temporary sibling first and are renamed into place, so a
//! reader never observes a half-written record.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::domain::{ErrorRecord, QualityFlag};
use crate::error::{AppError, ErrorKind};

/// Deterministic record path for a pair.
pub fn record_path(metrics_root: &Path, dataset: &str, model_key: &str) -> PathBuf {
    metrics_root.join(dataset).join(format!("{model_key}.csv"))
}

fn encode(record: &ErrorRecord) -> Result<Vec<u8>, String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.serialize(record).map_err(|e| e.to_string())?;
    writer.into_inner().map_err(|e| e.to_string())
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "record.csv".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", std::process::id()));
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Persist `record`, overwriting any previous record for the pair.
///
/// A failed write is retried once before giving up.
pub fn write_record(metrics_root: &Path, record: &ErrorRecord) -> Result<PathBuf, AppError> {
    let path = record_path(metrics_root, &record.dataset_name, &record.model_key);
    let bytes = encode(record).map_err(|e| {
        AppError::new(ErrorKind::ResultWriteFailure, format!("Failed to encode result record: {e}"))
    })?;

    if let Err(first) = write_atomic(&path, &bytes) {
        warn!(target: "results", path = %path.display(), error = %first, "result write failed; retrying once");
        write_atomic(&path, &bytes).map_err(|e| {
            AppError::new(
                ErrorKind::ResultWriteFailure,
                format!("Failed to write result record {}: {e}", path.display()),
            )
        })?;
    }
    debug!(target: "results", path = %path.display(), "result record written");
    Ok(path)
}

/// Read the record at `path`.
///
/// `Ok(None)` means the file exists but holds no parsable row.
pub fn read_record(path: &Path) -> Result<Option<ErrorRecord>, AppError> {
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        AppError::new(ErrorKind::Io, format!("Failed to open result record {}: {e}", path.display()))
    })?;
    let record = reader.deserialize::<ErrorRecord>().next();
    match record {
        Some(Ok(r)) => Ok(Some(r)),
        Some(Err(e)) => {
            debug!(target: "results", path = %path.display(), error = %e, "unparsable result record");
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Derived on-disk state of a pair.
pub fn quality_flag(metrics_root: &Path, dataset: &str, model_key: &str) -> QualityFlag {
    let path = record_path(metrics_root, dataset, model_key);
    if !path.is_file() {
        return QualityFlag::NoCsv;
    }
    match read_record(&path) {
        Ok(Some(record)) => QualityFlag::from_record(&record),
        Ok(None) | Err(_) => QualityFlag::CsvButNoResults,
    }
}
