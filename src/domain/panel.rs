//! Long-format panel held as one contiguous series per entity.

use std::collections::BTreeMap;

use chrono::NaiveDate;

/// One entity's univariate series.
///
/// Timestamps are strictly increasing; `values[i]` is `None` when the
/// observation is missing.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub entity_id: String,
    pub timestamps: Vec<NaiveDate>,
    pub values: Vec<Option<f64>>,
}

impl Series {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn push(&mut self, timestamp: NaiveDate, value: Option<f64>) {
        self.timestamps.push(timestamp);
        self.values.push(value);
    }

    /// Number of non-missing observations.
    pub fn valid_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }
}

/// A dataset's full collection of entities, ordered by entity id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Panel {
    pub series: Vec<Series>,
}

/// Counters reported while assembling a panel from raw rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblyStats {
    pub rows: usize,
    /// Rows that shared `(entity_id, timestamp)` with a later row.
    pub duplicates: usize,
    /// Values that were non-finite and turned into missing.
    pub non_finite: usize,
}

impl Panel {
    /// Build a panel from unordered long-format rows.
    ///
    /// Rows are grouped by entity and sorted by timestamp. When a timestamp
    /// repeats within an entity the last row wins. Non-finite values become
    /// missing.
    pub fn from_rows<I>(rows: I) -> (Self, AssemblyStats)
    where
        I: IntoIterator<Item = (String, NaiveDate, Option<f64>)>,
    {
        let mut stats = AssemblyStats::default();
        let mut grouped: BTreeMap<String, BTreeMap<NaiveDate, Option<f64>>> = BTreeMap::new();

        for (entity_id, timestamp, value) in rows {
            stats.rows += 1;
            let value = match value {
                Some(v) if v.is_finite() => Some(v),
                Some(_) => {
                    stats.non_finite += 1;
                    None
                }
                None => None,
            };
            let entity = grouped.entry(entity_id).or_default();
            if entity.insert(timestamp, value).is_some() {
                stats.duplicates += 1;
            }
        }

        let series = grouped
            .into_iter()
            .map(|(entity_id, obs)| {
                let mut s = Series::new(entity_id);
                for (ts, v) in obs {
                    s.push(ts, v);
                }
                s
            })
            .collect();

        (Self { series }, stats)
    }

    pub fn n_entities(&self) -> usize {
        self.series.len()
    }

    pub fn n_rows(&self) -> usize {
        self.series.iter().map(Series::len).sum()
    }

    pub fn get(&self, entity_id: &str) -> Option<&Series> {
        self.series
            .binary_search_by(|s| s.entity_id.as_str().cmp(entity_id))
            .ok()
            .map(|idx| &self.series[idx])
    }

    pub fn entity_ids(&self) -> Vec<&str> {
        self.series.iter().map(|s| s.entity_id.as_str()).collect()
    }
}
