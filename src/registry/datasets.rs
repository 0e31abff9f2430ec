//! Dataset catalog: TOML document grouped by source module.
//!
//! ```toml
//! [cds_returns]
//! required_data_sources = ["wrds"]
//!
//! [cds_returns.ftsfr_cds_portfolio_returns]
//! frequency = "ME"
//! seasonality = 12
//! description = "CDS portfolio returns"
//! group = "returns_portfolios"
//! ```
//!
//! Module tables may carry metadata next to their leaves; only keys with the
//! canonical prefix that declare a `frequency` become datasets.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::domain::{DatasetDescriptor, Frequency, GroupTag};
use crate::error::{AppError, ErrorKind};

/// Key prefix that marks a leaf as a dataset.
pub const DATASET_PREFIX: &str = "ftsfr_";

#[derive(Debug, Deserialize)]
struct DatasetEntry {
    frequency: String,
    seasonality: Option<i64>,
    #[serde(default)]
    description: String,
    short_name: Option<String>,
    table_name: Option<String>,
    group: Option<GroupTag>,
    #[serde(default)]
    is_balanced: bool,
    panel_path: Option<PathBuf>,
    required_data_sources: Option<Vec<String>>,
    /// Descriptive keys the registry does not interpret.
    #[serde(flatten)]
    extra: toml::Table,
}

#[derive(Debug, Clone, Default)]
pub struct DatasetRegistry {
    entries: BTreeMap<String, DatasetDescriptor>,
}

impl DatasetRegistry {
    /// Read and parse the catalog at `path`; panels resolve under `data_dir`.
    pub fn load(path: &Path, data_dir: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorKind::Config,
                format!("Failed to read dataset catalog {}: {e}", path.display()),
            )
        })?;
        Self::from_toml_str(&text, data_dir)
    }

    pub fn from_toml_str(text: &str, data_dir: &Path) -> Result<Self, AppError> {
        let doc: toml::Table = toml::from_str(text)
            .map_err(|e| AppError::new(ErrorKind::Config, format!("Invalid dataset catalog: {e}")))?;

        let mut entries = BTreeMap::new();
        for (module, section) in &doc {
            let Some(section) = section.as_table() else {
                continue;
            };
            let inherited = section
                .get("required_data_sources")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|s| s.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            for (key, leaf) in section {
                if !key.starts_with(DATASET_PREFIX) {
                    continue;
                }
                let Some(table) = leaf.as_table() else {
                    continue;
                };
                if !table.contains_key("frequency") {
                    continue;
                }
                let entry: DatasetEntry = leaf.clone().try_into().map_err(|e| {
                    AppError::new(ErrorKind::Config, format!("Invalid catalog entry {module}.{key}: {e}"))
                })?;
                if !entry.extra.is_empty() {
                    let ignored: Vec<&str> = entry.extra.keys().map(String::as_str).collect();
                    debug!(target: "registry", dataset = %key, ?ignored, "ignoring extra catalog keys");
                }
                let descriptor = build_descriptor(module, key, entry, &inherited, data_dir)?;
                if entries.insert(key.clone(), descriptor).is_some() {
                    return Err(AppError::new(
                        ErrorKind::Config,
                        format!("Dataset {key} is declared in more than one module."),
                    ));
                }
            }
        }

        debug!(target: "registry", datasets = entries.len(), "dataset catalog loaded");
        Ok(Self { entries })
    }

    /// Look up a dataset by name.
    pub fn resolve(&self, name: &str) -> Result<&DatasetDescriptor, AppError> {
        self.entries
            .get(name)
            .ok_or_else(|| AppError::new(ErrorKind::DatasetNotRegistered, name.to_string()))
    }

    /// All datasets ordered by name.
    pub fn list(&self) -> impl Iterator<Item = &DatasetDescriptor> {
        self.entries.values()
    }

    pub fn by_group(&self, group: GroupTag) -> impl Iterator<Item = &DatasetDescriptor> {
        self.entries.values().filter(move |d| d.group == group)
    }

    /// Datasets whose upstream requirements are all among `sources`.
    pub fn available<'a>(&'a self, sources: &[String]) -> impl Iterator<Item = &'a DatasetDescriptor> {
        let have: BTreeSet<String> = sources.iter().cloned().collect();
        self.entries
            .values()
            .filter(move |d| d.required_data_sources.iter().all(|s| have.contains(s)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn build_descriptor(
    module: &str,
    key: &str,
    entry: DatasetEntry,
    inherited_sources: &[String],
    data_dir: &Path,
) -> Result<DatasetDescriptor, AppError> {
    let frequency = Frequency::from_tag(&entry.frequency).ok_or_else(|| {
        AppError::new(
            ErrorKind::Config,
            format!("Dataset {key}: unrecognized frequency '{}'.", entry.frequency),
        )
    })?;

    let seasonality = match entry.seasonality {
        None => frequency.default_seasonality(),
        Some(s) if s > 0 => s as usize,
        Some(s) => {
            return Err(AppError::new(
                ErrorKind::Config,
                format!("Dataset {key}: seasonality must be a positive integer (got {s})."),
            ));
        }
    };

    let panel_path = match entry.panel_path {
        Some(p) if p.is_absolute() => p,
        Some(p) => data_dir.join(p),
        None => data_dir.join(module).join(format!("{key}.parquet")),
    };

    let short_name = entry
        .short_name
        .unwrap_or_else(|| key.trim_start_matches(DATASET_PREFIX).to_string());
    let table_display_name = entry.table_name.unwrap_or_else(|| short_name.clone());

    Ok(DatasetDescriptor {
        name: key.to_string(),
        module: module.to_string(),
        panel_path,
        frequency,
        seasonality,
        group: entry.group.unwrap_or(GroupTag::Other),
        description: entry.description,
        table_display_name,
        short_name,
        is_balanced: entry.is_balanced,
        required_data_sources: entry
            .required_data_sources
            .unwrap_or_else(|| inherited_sources.to_vec()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
[cds_returns]
required_data_sources = ["wrds", "markit"]

[cds_returns.ftsfr_cds_portfolio_returns]
frequency = "ME"
seasonality = 12
description = "CDS portfolio returns"
short_name = "CDS Port."
group = "returns_portfolios"
is_balanced = true

[cds_returns.ftsfr_cds_contract_returns]
frequency = "ME"
group = "returns_disaggregated"
required_data_sources = ["wrds"]

[cds_returns.notes]
frequency = "ME"

[cip]
[cip.ftsfr_cip_spreads]
frequency = "B"
panel_path = "cip/spreads.parquet"
group = "basis_spreads"
"#;

    #[test]
    fn parses_leaves_and_applies_defaults() {
        let reg = DatasetRegistry::from_toml_str(CATALOG, Path::new("/data")).unwrap();
        assert_eq!(reg.len(), 3);

        let port = reg.resolve("ftsfr_cds_portfolio_returns").unwrap();
        assert_eq!(port.frequency, Frequency::M);
        assert_eq!(port.seasonality, 12);
        assert_eq!(port.short_name, "CDS Port.");
        assert_eq!(port.table_display_name, "CDS Port.");
        assert_eq!(port.required_data_sources, vec!["wrds", "markit"]);
        assert_eq!(
            port.panel_path,
            PathBuf::from("/data/cds_returns/ftsfr_cds_portfolio_returns.parquet")
        );

        let cip = reg.resolve("ftsfr_cip_spreads").unwrap();
        assert_eq!(cip.seasonality, 5);
        assert_eq!(cip.panel_path, PathBuf::from("/data/cip/spreads.parquet"));
        assert!(cip.required_data_sources.is_empty());
    }

    #[test]
    fn listing_filters() {
        let reg = DatasetRegistry::from_toml_str(CATALOG, Path::new("/data")).unwrap();
        let spreads: Vec<_> = reg.by_group(GroupTag::BasisSpreads).map(|d| d.name.as_str()).collect();
        assert_eq!(spreads, vec!["ftsfr_cip_spreads"]);

        let avail: Vec<_> = reg
            .available(&["wrds".to_string()])
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(avail, vec!["ftsfr_cds_contract_returns", "ftsfr_cip_spreads"]);
    }

    #[test]
    fn unknown_dataset_and_bad_entries_fail() {
        let reg = DatasetRegistry::from_toml_str(CATALOG, Path::new("/data")).unwrap();
        let err = reg.resolve("ftsfr_missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DatasetNotRegistered);

        let bad = "[m.ftsfr_x]\nfrequency = \"H\"\n";
        let err = DatasetRegistry::from_toml_str(bad, Path::new("/data")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);

        let bad = "[m.ftsfr_x]\nfrequency = \"M\"\nseasonality = 0\n";
        assert!(DatasetRegistry::from_toml_str(bad, Path::new("/data")).is_err());
    }

    #[test]
    fn extra_leaf_keys_are_ignored() {
        let text = r#"
[cds]
[cds.ftsfr_cds_a]
frequency = "ME"
seasonality = 12
description = "a"
entity_count = 20
source_url = "https://example.org"
"#;
        let reg = DatasetRegistry::from_toml_str(text, Path::new("/data")).unwrap();
        let a = reg.resolve("ftsfr_cds_a").unwrap();
        assert_eq!(a.seasonality, 12);
        assert_eq!(a.description, "a");

        // Interpreted keys are still type-checked.
        let bad = "[m.ftsfr_x]\nfrequency = \"M\"\nseasonality = \"twelve\"\n";
        let err = DatasetRegistry::from_toml_str(bad, Path::new("/data")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
