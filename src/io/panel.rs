//! Parquet panel loader.
//!
//! Panels are long-format tables with an entity column, a date column and a
//! value column. Column names follow either the canonical spelling
//! (`entity_id`, `timestamp`, `value`) or the short one (`id`, `ds`, `y`).
//! Everything else in the file is ignored.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, Date32Array, Float32Array, Float64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use chrono::NaiveDate;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::{ArrowWriter, ProjectionMask};
use tracing::{debug, warn};

use crate::domain::{AssemblyStats, Panel};
use crate::error::{AppError, ErrorKind};

const ENTITY_COLUMNS: [&str; 2] = ["entity_id", "id"];
const TIMESTAMP_COLUMNS: [&str; 2] = ["timestamp", "ds"];
const VALUE_COLUMNS: [&str; 2] = ["value", "y"];

/// Counters collected while loading a panel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub batches: usize,
    /// Rows without an entity id or timestamp.
    pub null_keys: usize,
    pub assembly: AssemblyStats,
}

fn unreadable(path: &Path, e: impl std::fmt::Display) -> AppError {
    AppError::new(
        ErrorKind::PanelUnreadable,
        format!("Failed to read panel {}: {e}", path.display()),
    )
}

fn find_column(schema: &Schema, candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|name| schema.index_of(name).ok())
}

/// Read the panel at `path`.
pub fn load_panel(path: &Path) -> Result<(Panel, LoadReport), AppError> {
    let file = File::open(path).map_err(|e| unreadable(path, e))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| unreadable(path, e))?;

    let schema = builder.schema().clone();
    let mut missing = Vec::new();
    let mut indices = Vec::with_capacity(3);
    for candidates in [&ENTITY_COLUMNS, &TIMESTAMP_COLUMNS, &VALUE_COLUMNS] {
        match find_column(&schema, candidates) {
            Some(idx) => indices.push(idx),
            None => missing.push(candidates.join("|")),
        }
    }
    if !missing.is_empty() {
        return Err(AppError::new(
            ErrorKind::PanelSchemaMismatch,
            format!(
                "Panel {} is missing column(s): {}",
                path.display(),
                missing.join(", ")
            ),
        ));
    }

    let names: Vec<String> = indices.iter().map(|i| schema.field(*i).name().clone()).collect();
    let mask = ProjectionMask::roots(builder.parquet_schema(), indices.iter().copied());
    let reader = builder
        .with_projection(mask)
        .build()
        .map_err(|e| unreadable(path, e))?;

    let mut report = LoadReport::default();
    let mut rows: Vec<(String, NaiveDate, Option<f64>)> = Vec::new();

    for batch in reader {
        let batch = batch.map_err(|e| unreadable(path, e))?;
        report.batches += 1;
        extract_rows(&batch, &names, &mut rows, &mut report)
            .map_err(|msg| AppError::new(ErrorKind::PanelSchemaMismatch, format!("{}: {msg}", path.display())))?;
    }

    if report.null_keys > 0 {
        warn!(target: "panel", null_keys = report.null_keys, "dropped rows without entity id or timestamp");
    }

    let (panel, assembly) = Panel::from_rows(rows);
    report.assembly = assembly;
    debug!(
        target: "panel",
        path = %path.display(),
        rows = assembly.rows,
        entities = panel.n_entities(),
        duplicates = assembly.duplicates,
        non_finite = assembly.non_finite,
        "panel loaded"
    );
    Ok((panel, report))
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef, String> {
    batch
        .column_by_name(name)
        .ok_or_else(|| format!("column {name} disappeared from batch"))
}

fn extract_rows(
    batch: &RecordBatch,
    names: &[String],
    rows: &mut Vec<(String, NaiveDate, Option<f64>)>,
    report: &mut LoadReport,
) -> Result<(), String> {
    let ids = cast(column(batch, &names[0])?, &DataType::Utf8)
        .map_err(|e| format!("entity column is not string-like: {e}"))?;
    let dates = cast(column(batch, &names[1])?, &DataType::Date32)
        .map_err(|e| format!("timestamp column is not date-like: {e}"))?;
    let values = cast(column(batch, &names[2])?, &DataType::Float32)
        .map_err(|e| format!("value column is not numeric: {e}"))?;

    let ids = ids
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or("entity column cast failed")?;
    let dates = dates
        .as_any()
        .downcast_ref::<Date32Array>()
        .ok_or("timestamp column cast failed")?;
    let values = values
        .as_any()
        .downcast_ref::<Float32Array>()
        .ok_or("value column cast failed")?;

    for i in 0..batch.num_rows() {
        if ids.is_null(i) || dates.is_null(i) {
            report.null_keys += 1;
            continue;
        }
        let Some(date) = dates.value_as_date(i) else {
            report.null_keys += 1;
            continue;
        };
        let value = if values.is_null(i) {
            None
        } else {
            Some(f64::from(values.value(i)))
        };
        rows.push((ids.value(i).to_string(), date, value));
    }
    Ok(())
}

/// Write rows as a canonical parquet panel (`entity_id`, `timestamp`, `value`).
pub fn write_panel(path: &Path, rows: &[(String, NaiveDate, Option<f64>)]) -> Result<(), AppError> {
    let io_err = |e: &dyn std::fmt::Display| {
        AppError::new(ErrorKind::Io, format!("Failed to write panel {}: {e}", path.display()))
    };

    let schema = Arc::new(Schema::new(vec![
        Field::new("entity_id", DataType::Utf8, false),
        Field::new("timestamp", DataType::Date32, false),
        Field::new("value", DataType::Float64, true),
    ]));

    let ids = StringArray::from_iter_values(rows.iter().map(|r| r.0.as_str()));
    let dates = Date32Array::from_iter_values(rows.iter().map(|r| days_since_epoch(r.1)));
    let values = Float64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![Arc::new(ids), Arc::new(dates), Arc::new(values)],
    )
    .map_err(|e| io_err(&e))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(&e))?;
    }
    let file = File::create(path).map_err(|e| io_err(&e))?;
    let mut writer = ArrowWriter::try_new(file, schema, None).map_err(|e| io_err(&e))?;
    writer.write(&batch).map_err(|e| io_err(&e))?;
    writer.close().map_err(|e| io_err(&e))?;
    Ok(())
}

/// Arrow `Date32` encoding: days since 1970-01-01.
fn days_since_epoch(date: NaiveDate) -> i32 {
    (date - NaiveDate::default()).num_days() as i32
}
