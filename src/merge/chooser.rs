//! Horizontal/Vertical decision.

use crate::merge::row_sources::MAX_PARTS;
use crate::merge::MergeAlgorithm;
use crate::part::{FuturePart, PartStorageType, PartType};
use crate::schema::{MergeMode, MergingParams};
use crate::settings::MergeSettings;

/// Pure decision function from part shape plus settings.
pub(crate) fn choose_merge_algorithm(
    future_part: &FuturePart,
    gathering_columns: usize,
    sum_rows_upper_bound: u64,
    need_remove_expired_values: bool,
    deduplicate: bool,
    merging_params: &MergingParams,
    settings: &MergeSettings,
) -> MergeAlgorithm {
    if deduplicate {
        return MergeAlgorithm::Horizontal;
    }
    if !settings.enable_vertical_merge_algorithm {
        return MergeAlgorithm::Horizontal;
    }
    if need_remove_expired_values {
        return MergeAlgorithm::Horizontal;
    }
    if future_part.part_type != PartType::Wide {
        return MergeAlgorithm::Horizontal;
    }
    if future_part.storage_type != PartStorageType::Full {
        return MergeAlgorithm::Horizontal;
    }
    if !settings.allow_vertical_merges_from_compact_to_wide_parts
        && future_part.parts.iter().any(|p| p.part_type != PartType::Wide)
    {
        return MergeAlgorithm::Horizontal;
    }

    let is_supported_mode = matches!(
        merging_params.mode,
        MergeMode::Ordinary
            | MergeMode::Collapsing
            | MergeMode::Replacing
            | MergeMode::VersionedCollapsing
    );
    let enough_ordinary_cols =
        gathering_columns >= settings.vertical_merge_algorithm_min_columns_to_activate;
    let enough_total_rows =
        sum_rows_upper_bound >= settings.vertical_merge_algorithm_min_rows_to_activate;
    let no_parts_overflow = future_part.parts.len() <= MAX_PARTS;

    if is_supported_mode && enough_ordinary_cols && enough_total_rows && no_parts_overflow {
        MergeAlgorithm::Vertical
    } else {
        MergeAlgorithm::Horizontal
    }
}
