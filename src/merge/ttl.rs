//! TTL-based row eviction and column defaulting during merge.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::Block;
use crate::logging::strata_log;
use crate::part::ttl::TtlInfos;
use crate::part::FuturePart;
use crate::schema::{ColumnDesc, StorageMetadata, TtlExpression};

/// Decide whether TTL eviction must run for this merge.
///
/// Returns `(need_remove_expired_values, force_ttl)`. `force_ttl` is set
/// when some source has TTL metadata that was never computed, which makes
/// the merge recompute everything.
pub(crate) fn evaluate_need(
    future_part: &FuturePart,
    metadata: &StorageMetadata,
    merged_infos: &TtlInfos,
    time_of_merge: u64,
) -> (bool, bool) {
    let mut need_remove = false;
    let mut force = false;
    if metadata.has_any_ttl() {
        for part in &future_part.parts {
            if !part.ttl_infos.computed {
                strata_log!(
                    log::Level::Info,
                    "ttl_force_recompute",
                    "part={} has TTL values that were never calculated, will recompute during merge",
                    part.name
                );
                need_remove = true;
                force = true;
            }
        }
    }
    if let Some(part_min_ttl) = merged_infos.part_min_ttl() {
        if part_min_ttl <= time_of_merge {
            need_remove = true;
        }
    }
    (need_remove, force)
}

/// Drops rows and defaults column values whose TTL expression has matured
/// as of the merge timestamp.
pub(crate) struct TtlEvictor {
    row_ttl: Option<TtlExpression>,
    column_ttls: Vec<(ColumnDesc, TtlExpression)>,
    time_of_merge: u64,
}

impl TtlEvictor {
    pub(crate) fn new(metadata: &StorageMetadata, time_of_merge: u64) -> Self {
        let column_ttls = metadata
            .ttl
            .column_ttls
            .iter()
            .filter_map(|(name, expr)| {
                metadata.column(name).map(|desc| (desc.clone(), expr.clone()))
            })
            .collect();
        Self {
            row_ttl: metadata.ttl.row_ttl.clone(),
            column_ttls,
            time_of_merge,
        }
    }

    /// Remove matured rows from a source block before it enters the k-way
    /// merge, counting them into `input_rows_filtered`.
    pub(crate) fn filter_block(&self, block: Block, filtered: &AtomicU64) -> Block {
        let Some(row_ttl) = &self.row_ttl else {
            return block;
        };
        let Some(base_idx) = block.column_index(&row_ttl.column) else {
            return block;
        };
        let keep: Vec<bool> = block.columns[base_idx]
            .data
            .iter()
            .map(|cell| match row_ttl.evaluate(cell) {
                Some(expiry) => expiry > self.time_of_merge,
                None => true,
            })
            .collect();
        let dropped = keep.iter().filter(|k| !**k).count();
        if dropped == 0 {
            return block;
        }
        filtered.fetch_add(dropped as u64, Ordering::Relaxed);

        let columns = block
            .columns
            .into_iter()
            .map(|mut column| {
                column.data = column
                    .data
                    .into_iter()
                    .zip(&keep)
                    .filter(|(_, kept)| **kept)
                    .map(|(value, _)| value)
                    .collect();
                column
            })
            .collect();
        Block { columns }
    }

    /// Replace matured cells of column-TTL columns with their defaults.
    pub(crate) fn apply_column_ttl(&self, block: &mut Block) {
        for (desc, expr) in &self.column_ttls {
            let Some(base_idx) = block.column_index(&expr.column) else {
                continue;
            };
            let Some(target_idx) = block.column_index(&desc.name) else {
                continue;
            };
            let matured: Vec<bool> = block.columns[base_idx]
                .data
                .iter()
                .map(|cell| match expr.evaluate(cell) {
                    Some(expiry) => expiry <= self.time_of_merge,
                    None => false,
                })
                .collect();
            let default = desc.default_value();
            for (cell, matured) in block.columns[target_idx].data.iter_mut().zip(matured) {
                if matured {
                    *cell = default.clone();
                }
            }
        }
    }
}
