//! Byte-weight estimates used for vertical-merge progress.

use std::collections::BTreeMap;

/// Per-column on-disk byte weights over the merged source parts.
///
/// The merging (key) columns' share of the total drives the progress value
/// reported while the k-way merge runs; each gathered column then adds its
/// own share as it completes.
#[derive(Debug, Default)]
pub(crate) struct ColumnSizeEstimator {
    sizes: BTreeMap<String, u64>,
    sum_index: u64,
    sum_total: u64,
}

impl ColumnSizeEstimator {
    pub(crate) fn new(
        sizes: BTreeMap<String, u64>,
        merging: &[String],
        gathering: &[String],
    ) -> Self {
        let sum_index: u64 = merging.iter().map(|name| sizes.get(name).copied().unwrap_or(0)).sum();
        let sum_gathering: u64 = gathering
            .iter()
            .map(|name| sizes.get(name).copied().unwrap_or(0))
            .sum();
        Self {
            sizes,
            sum_index,
            sum_total: sum_index + sum_gathering,
        }
    }

    pub(crate) fn key_columns_weight(&self) -> f64 {
        if self.sum_total == 0 {
            return 1.0;
        }
        self.sum_index as f64 / self.sum_total as f64
    }

    pub(crate) fn column_weight(&self, name: &str) -> f64 {
        if self.sum_total == 0 {
            return 0.0;
        }
        self.sizes.get(name).copied().unwrap_or(0) as f64 / self.sum_total as f64
    }
}
