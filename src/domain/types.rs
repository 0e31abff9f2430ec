//! Shared domain types.
//!
//! These are kept small and serializable so the registries, the result
//! writer and the planner can all talk about the same things.

use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::domain::Frequency;

/// Reporting group a dataset belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum GroupTag {
    BasisSpreads,
    ReturnsPortfolios,
    ReturnsDisaggregated,
    Other,
}

impl GroupTag {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupTag::BasisSpreads => "basis_spreads",
            GroupTag::ReturnsPortfolios => "returns_portfolios",
            GroupTag::ReturnsDisaggregated => "returns_disaggregated",
            GroupTag::Other => "other",
        }
    }
}

impl fmt::Display for GroupTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adapter family a model entry dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Classical,
    NeuralAuto,
    Foundation,
}

impl Family {
    pub fn as_str(self) -> &'static str {
        match self {
            Family::Classical => "classical",
            Family::NeuralAuto => "neural_auto",
            Family::Foundation => "foundation",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one registered dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetDescriptor {
    pub name: String,
    /// Source module (catalog section) the dataset comes from.
    pub module: String,
    pub panel_path: PathBuf,
    pub frequency: Frequency,
    pub seasonality: usize,
    pub group: GroupTag,
    pub description: String,
    pub table_display_name: String,
    pub short_name: String,
    pub is_balanced: bool,
    /// Opaque upstream requirements, only interpreted by the planner.
    pub required_data_sources: Vec<String>,
}

/// One one-step-ahead prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRecord {
    pub entity_id: String,
    /// Last timestamp whose actual was available to the model.
    pub cutoff: NaiveDate,
    pub timestamp: NaiveDate,
    /// CV window the prediction belongs to.
    pub window: usize,
    pub prediction: f64,
}

/// Quality annotation stored alongside a result record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultQuality {
    #[default]
    Ok,
    /// MASE came out exactly zero (usually constant predictions).
    ZeroMase,
    NullMase,
}

impl ResultQuality {
    pub fn from_mase(mase: Option<f64>) -> Self {
        match mase {
            None => ResultQuality::NullMase,
            Some(v) if v == 0.0 => ResultQuality::ZeroMase,
            Some(_) => ResultQuality::Ok,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResultQuality::Ok => "ok",
            ResultQuality::ZeroMase => "zero_mase",
            ResultQuality::NullMase => "null_mase",
        }
    }
}

/// Metrics persisted once per `(dataset, model)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(rename = "model_name")]
    pub model_key: String,
    pub dataset_name: String,
    #[serde(rename = "MASE")]
    pub mase: Option<f64>,
    #[serde(rename = "MSE")]
    pub mse: Option<f64>,
    #[serde(rename = "RMSE")]
    pub rmse: Option<f64>,
    #[serde(rename = "R2oos")]
    pub r2oos: Option<f64>,
    #[serde(rename = "time_taken")]
    pub wall_time_seconds: f64,
    /// Absent in records written before the column existed.
    #[serde(default)]
    pub quality: ResultQuality,
}

/// Derived state of a `(dataset, model)` result on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityFlag {
    Success,
    NoCsv,
    CsvButNoResults,
    /// MASE is null or zero.
    QualityIssues,
}

impl QualityFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityFlag::Success => "Success",
            QualityFlag::NoCsv => "No_CSV",
            QualityFlag::CsvButNoResults => "CSV_But_No_Results",
            QualityFlag::QualityIssues => "Quality_Issues",
        }
    }

    pub fn from_record(record: &ErrorRecord) -> Self {
        match record.mase {
            Some(v) if v.is_finite() && v != 0.0 => QualityFlag::Success,
            _ => QualityFlag::QualityIssues,
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-invocation job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Resolved,
    Preprocessed,
    Fitted,
    Forecast,
    Evaluated,
    Persisted,
    Done,
    Skipped,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::New => "new",
            Phase::Resolved => "resolved",
            Phase::Preprocessed => "preprocessed",
            Phase::Fitted => "fitted",
            Phase::Forecast => "forecast",
            Phase::Evaluated => "evaluated",
            Phase::Persisted => "persisted",
            Phase::Done => "done",
            Phase::Skipped => "skipped",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
