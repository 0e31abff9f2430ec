//! Terminal output for the `forecast` subcommands.
//!
//! Formatting lives here so the pipeline stays free of presentation and the
//! output can be asserted on in tests.

use std::fmt::Write as _;

use crate::app::pipeline::JobReport;
use crate::domain::{DatasetDescriptor, QualityFlag};
use crate::planner::{Job, Plan};
use crate::registry::ModelDescriptor;

fn fmt_opt(v: Option<f64>) -> String {
    match v {
        Some(x) => format!("{x:.4}"),
        None => "null".to_string(),
    }
}

/// Summary of a finished job.
pub fn format_job_summary(report: &JobReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== forecast - {} / {} ===", report.dataset, report.model_key);
    let _ = writeln!(out, "Family: {} | {}", report.family, report.hardware);
    let p = &report.preprocess;
    let _ = writeln!(
        out,
        "Entities: {} kept of {} | dropped={} | gap rows={} | min train={}",
        report.n_entities,
        p.input_entities,
        p.dropped.len(),
        p.gap_rows_inserted,
        p.min_train_length
    );
    let _ = writeln!(
        out,
        "CV: horizon={} windows={} | forecasts={} aligned={} failed entities={}",
        report.horizon, report.plan.n_windows, report.forecasts, report.aligned_pairs, report.failed_entities
    );

    let m = &report.metrics;
    let _ = writeln!(
        out,
        "MASE={} MSE={} RMSE={} R2oos={} ({})",
        fmt_opt(m.mase),
        fmt_opt(m.mse),
        fmt_opt(m.rmse),
        fmt_opt(m.r2oos),
        report.record.quality.as_str()
    );
    for c in &report.companions {
        let _ = writeln!(
            out,
            "  baseline {:<18} MASE={} RMSE={}{}",
            c.model_key,
            fmt_opt(c.metrics.mase),
            fmt_opt(c.metrics.rmse),
            if c.written { " (written)" } else { "" }
        );
    }
    let _ = writeln!(out, "Record: {}", report.record_path.display());
    let _ = write!(out, "Elapsed: {:.2}s", report.elapsed_seconds);
    out
}

/// One `dataset<TAB>model` line per job.
pub fn format_plan(plan: &Plan) -> String {
    plan.jobs
        .iter()
        .map(|j| format!("{}\t{}", j.dataset, j.model_key))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_status(rows: &[(Job, QualityFlag)]) -> String {
    rows.iter()
        .map(|(j, flag)| format!("{}\t{}\t{}", j.dataset, j.model_key, flag))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_datasets<'a>(datasets: impl Iterator<Item = &'a DatasetDescriptor>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<40} {:<5} {:>4} {:<22} description", "name", "freq", "m", "group");
    for d in datasets {
        let _ = writeln!(
            out,
            "{:<40} {:<5} {:>4} {:<22} {}",
            d.name,
            d.frequency.tag(),
            d.seasonality,
            d.group.as_str(),
            d.description
        );
    }
    out.trim_end().to_string()
}

pub fn format_models<'a>(models: impl Iterator<Item = &'a ModelDescriptor>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{:<24} {:<12} {:<24} enabled", "key", "family", "constructor");
    for m in models {
        let _ = writeln!(
            out,
            "{:<24} {:<12} {:<24} {}",
            m.key,
            m.family().as_str(),
            m.constructor_ref,
            m.enabled
        );
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_and_status_are_tab_separated() {
        let job = Job {
            model_key: "naive".into(),
            dataset: "ftsfr_a".into(),
        };
        let plan = Plan {
            jobs: vec![job.clone()],
            skipped: Vec::new(),
        };
        assert_eq!(format_plan(&plan), "ftsfr_a\tnaive");
        assert_eq!(
            format_status(&[(job, QualityFlag::NoCsv)]),
            "ftsfr_a\tnaive\tNo_CSV"
        );
    }

    #[test]
    fn nulls_print_as_null() {
        assert_eq!(fmt_opt(None), "null");
        assert_eq!(fmt_opt(Some(0.5)), "0.5000");
    }
}
