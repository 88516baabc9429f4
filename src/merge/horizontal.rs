//! The horizontal stage: k-way merge of the merging columns (all columns
//! for the Horizontal algorithm) into the new part, plus the row-ID map
//! generation for decoupled vector indexes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::Ordering;

use crate::error::{Error, Result};
use crate::logging::strata_log;
use crate::merge::chooser::choose_merge_algorithm;
use crate::merge::column_sizes::ColumnSizeEstimator;
use crate::merge::remap;
use crate::merge::row_sources::{RowSourcesFile, RowSourcesWriter, MAX_PARTS};
use crate::merge::task::{GlobalCtx, NewPartState};
use crate::merge::transform::{MergedTransform, TransformOptions};
use crate::merge::ttl::{self, TtlEvictor};
use crate::merge::vertical::VerticalInput;
use crate::merge::MergeAlgorithm;
use crate::part::reader::PartReader;
use crate::part::ttl::TtlInfos;
use crate::part::writer::MergedBlockWriter;
use crate::part::{MergeType, MinMaxIndex, PartTransaction};
use crate::schema::{ColumnDesc, MergeMode, MergingParams, StorageMetadata};
use crate::settings::{CleanDeletedRows, MergeSettings};
use crate::vector::{MergedPartNameAndId, VectorIndexState};

/// Sort-key columns are merged; ordinary columns are gathered using the
/// row-source stream written by the merge step.
pub(crate) fn extract_merging_and_gathering_columns(
    metadata: &StorageMetadata,
    merging_params: &MergingParams,
) -> (Vec<ColumnDesc>, Vec<ColumnDesc>) {
    let mut key_columns: BTreeSet<String> = metadata.sort_key.iter().cloned().collect();
    for index in &metadata.secondary_indices {
        key_columns.extend(index.columns.iter().cloned());
    }

    match merging_params.mode {
        MergeMode::Collapsing | MergeMode::VersionedCollapsing => {
            if let Some(sign) = &merging_params.sign_column {
                key_columns.insert(sign.clone());
            }
        }
        MergeMode::Replacing => {
            if let Some(column) = &merging_params.is_deleted_column {
                key_columns.insert(column.clone());
            }
            if let Some(column) = &merging_params.version_column {
                key_columns.insert(column.clone());
            }
        }
        _ => {}
    }

    // Force at least one merging column in case of an empty key.
    if key_columns.is_empty() {
        if let Some(first) = metadata.columns.first() {
            key_columns.insert(first.name.clone());
        }
    }

    let mut merging = Vec::new();
    let mut gathering = Vec::new();
    for column in &metadata.columns {
        if key_columns.contains(&column.name) {
            merging.push(column.clone());
        } else {
            gathering.push(column.clone());
        }
    }
    (merging, gathering)
}

fn create_row_sources_writer(g: &mut GlobalCtx) -> Result<RowSourcesWriter> {
    if g.scratch.is_none() {
        g.scratch = Some(tempfile::tempdir()?);
    }
    let scratch = g.scratch.as_ref().expect("scratch dir just created");
    RowSourcesWriter::create(&scratch.path().join("rows_sources"), g.params.write_settings.buffer_size)
}

fn need_sync_part(input_rows: u64, input_bytes: u64, settings: &MergeSettings) -> bool {
    (settings.min_rows_to_fsync_after_merge > 0
        && input_rows >= settings.min_rows_to_fsync_after_merge)
        || (settings.min_compressed_bytes_to_fsync_after_merge > 0
            && input_bytes >= settings.min_compressed_bytes_to_fsync_after_merge)
}

enum State {
    Prepare,
    MergeBlocks,
    Finish,
    GenerateRowIdsMaps,
    Done,
}

pub(crate) struct HorizontalStage {
    state: State,
    transform: Option<MergedTransform>,
    rows_sources: Option<RowSourcesFile>,
    column_sizes: Option<ColumnSizeEstimator>,
    read_with_direct_io: bool,
    need_sync: bool,
    sum_input_rows: u64,
    sum_input_bytes: u64,
    initial_reservation: u64,
}

impl HorizontalStage {
    pub(crate) fn new() -> Self {
        Self {
            state: State::Prepare,
            transform: None,
            rows_sources: None,
            column_sizes: None,
            read_with_direct_io: false,
            need_sync: false,
            sum_input_rows: 0,
            sum_input_bytes: 0,
            initial_reservation: 0,
        }
    }

    pub(crate) fn execute(&mut self, g: &mut GlobalCtx) -> Result<bool> {
        match self.state {
            State::Prepare => {
                self.prepare(g)?;
                self.state = State::MergeBlocks;
                Ok(true)
            }
            State::MergeBlocks => {
                if self.merge_block(g)? {
                    Ok(true)
                } else {
                    self.state = State::Finish;
                    Ok(true)
                }
            }
            State::Finish => {
                self.finish(g)?;
                self.state = State::GenerateRowIdsMaps;
                Ok(true)
            }
            State::GenerateRowIdsMaps => {
                if g.can_be_decouple {
                    let rows_sources = self.rows_sources.as_ref().ok_or_else(|| {
                        Error::logical("decoupled merge without a row sources stream")
                    })?;
                    remap::generate_row_ids_maps(g, rows_sources)?;
                }
                self.state = State::Done;
                Ok(false)
            }
            State::Done => Ok(false),
        }
    }

    pub(crate) fn into_vertical_input(self) -> VerticalInput {
        VerticalInput {
            rows_sources: self.rows_sources,
            column_sizes: self.column_sizes,
            need_sync: self.need_sync,
        }
    }

    fn prepare(&mut self, g: &mut GlobalCtx) -> Result<()> {
        if g.params.merges_blocker.is_cancelled() || g.progress.is_cancelled() {
            return Err(Error::Aborted("cancelled merging parts".into()));
        }
        if g.params.future_part.merge_type == MergeType::TtlDelete
            && g.params.ttl_merges_blocker.is_cancelled()
        {
            return Err(Error::Aborted("cancelled merging parts with TTL".into()));
        }

        let parts = g.params.future_part.parts.clone();
        if parts.is_empty() {
            return Err(Error::BadArguments("merge of zero parts".into()));
        }

        strata_log!(
            log::Level::Debug,
            "merge_start",
            "merging {} parts: from {} to {} into {:?} with storage {:?}",
            parts.len(),
            parts.first().map(|p| p.name.as_str()).unwrap_or("?"),
            parts.last().map(|p| p.name.as_str()).unwrap_or("?"),
            g.params.future_part.part_type,
            g.params.future_part.storage_type
        );
        if g.params.deduplicate {
            if g.params.deduplicate_by_columns.is_empty() {
                strata_log!(log::Level::Debug, "merge_dedup", "deduplicate by all columns");
            } else {
                strata_log!(
                    log::Level::Debug,
                    "merge_dedup",
                    "deduplicate by {:?}",
                    g.params.deduplicate_by_columns
                );
            }
        }

        // Projection merges nest inside the parent part and get no prefix.
        let prefix = if g.params.need_prefix && g.params.parent_part_dir.is_none() {
            "tmp_merge_"
        } else {
            ""
        };
        let suffix = if g.params.parent_part_dir.is_some() {
            g.params.suffix.as_str()
        } else {
            ""
        };
        let base_dir = g
            .params
            .parent_part_dir
            .clone()
            .unwrap_or_else(|| g.params.data_dir.clone());
        let basename = format!("{prefix}{}{suffix}", g.params.future_part.name);
        let txn = PartTransaction::begin(base_dir.join(basename))?;

        let metadata = g.params.metadata.clone();
        g.all_column_names = metadata.physical_column_names();
        let (merging, gathering) =
            extract_merging_and_gathering_columns(&metadata, &g.params.merging_params);
        g.merging_columns = merging;
        g.gathering_columns = gathering;

        let mut ttl_infos = TtlInfos {
            computed: true,
            ..Default::default()
        };
        for part in &parts {
            ttl_infos.update(&part.ttl_infos);
        }
        let (mut need_remove, force_ttl) = ttl::evaluate_need(
            &g.params.future_part,
            &metadata,
            &ttl_infos,
            g.params.time_of_merge,
        );
        if need_remove && force_ttl {
            strata_log!(
                log::Level::Debug,
                "ttl_forced",
                "TTL will be recomputed for every row of {}",
                g.params.future_part.name
            );
        }
        if need_remove && g.params.ttl_merges_blocker.is_cancelled() {
            strata_log!(
                log::Level::Info,
                "ttl_paused",
                "part {} has values with expired TTL, but merges with TTL are cancelled",
                g.params.future_part.name
            );
            need_remove = false;
        }
        g.need_remove_expired_values = need_remove;

        self.sum_input_rows = g.params.future_part.total_rows();
        self.sum_input_bytes = g.params.future_part.total_bytes_on_disk();

        let settings = g.params.settings.clone();
        let algorithm = choose_merge_algorithm(
            &g.params.future_part,
            g.gathering_columns.len(),
            self.sum_input_rows,
            need_remove,
            g.params.deduplicate,
            &g.params.merging_params,
            &settings,
        );
        g.chosen_algorithm = Some(algorithm);
        strata_log!(
            log::Level::Debug,
            "merge_algorithm",
            "selected merge algorithm {algorithm:?}"
        );

        let mut row_sources_writer: Option<RowSourcesWriter> = None;
        match algorithm {
            MergeAlgorithm::Horizontal => {
                g.merging_columns = metadata.columns.clone();
                g.gathering_columns.clear();
            }
            MergeAlgorithm::Vertical => {
                row_sources_writer = Some(create_row_sources_writer(g)?);
                let mut sizes = BTreeMap::new();
                for part in &parts {
                    part.accumulate_column_sizes(&mut sizes);
                }
                let merging_names: Vec<String> =
                    g.merging_columns.iter().map(|c| c.name.clone()).collect();
                let gathering_names: Vec<String> =
                    g.gathering_columns.iter().map(|c| c.name.clone()).collect();
                self.column_sizes = Some(ColumnSizeEstimator::new(
                    sizes,
                    &merging_names,
                    &gathering_names,
                ));
            }
        }

        // Decoupled vector index eligibility: every non-empty source must
        // carry a BUILT index; empty sources are ignored.
        if settings.enable_decouple_vector_index && parts.len() <= MAX_PARTS {
            let non_empty: Vec<usize> = parts
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.is_empty())
                .map(|(i, _)| i)
                .collect();
            g.first_part_with_data = non_empty.first().copied().unwrap_or(0);
            for index in &metadata.vector_indices {
                let all_built = non_empty
                    .iter()
                    .all(|&i| parts[i].vector_index.state(&index.name) == VectorIndexState::Built);
                if all_built {
                    g.all_parts_have_vector_index.insert(index.name.clone(), true);
                    g.can_be_decouple = true;
                }
            }
            if g.can_be_decouple
                && non_empty.len() == 1
                && !parts[g.first_part_with_data].has_lightweight_delete()
            {
                strata_log!(
                    log::Level::Debug,
                    "merge_single_vpart",
                    "merge single VPart without lightweight delete to VPart, index in part {}",
                    g.first_part_with_data
                );
                g.only_one_vpart_merged = true;
                g.can_be_decouple = false;
            }
        }

        let merged_source_parts: Vec<MergedPartNameAndId> = parts
            .iter()
            .enumerate()
            .map(|(i, part)| MergedPartNameAndId {
                name: part.name.clone(),
                source_index: i,
                non_empty: !part.is_empty(),
            })
            .collect();

        // The decouple path needs the row-source stream even under the
        // Horizontal algorithm.
        if g.can_be_decouple && row_sources_writer.is_none() {
            row_sources_writer = Some(create_row_sources_writer(g)?);
        }

        // Skip fully expired columns so they are not written only to be
        // dropped again; the new part materializes them as defaults.
        let mut expired_columns = BTreeSet::new();
        if !need_remove {
            for (name, info) in &ttl_infos.columns_ttl {
                if info.finished(g.params.time_of_merge) {
                    strata_log!(
                        log::Level::Trace,
                        "expired_column",
                        "adding expired column {name} for part {}",
                        g.params.future_part.name
                    );
                    expired_columns.insert(name.clone());
                }
            }
            if !expired_columns.is_empty() {
                g.merging_columns.retain(|c| !expired_columns.contains(&c.name));
                g.gathering_columns.retain(|c| !expired_columns.contains(&c.name));
            }
        }

        self.read_with_direct_io = settings.min_merge_bytes_to_use_direct_io != 0
            && self.sum_input_bytes >= settings.min_merge_bytes_to_use_direct_io;
        if self.read_with_direct_io {
            strata_log!(
                log::Level::Debug,
                "merge_direct_io",
                "will merge parts reading files in O_DIRECT"
            );
        }

        let evictor = need_remove
            .then(|| TtlEvictor::new(&metadata, g.params.time_of_merge));
        let mut readers = Vec::with_capacity(parts.len());
        for part in &parts {
            readers.push(PartReader::new(
                part,
                &g.merging_columns,
                settings.merge_max_block_size,
                false,
                Some(&g.input_rows_filtered),
            )?);
        }
        let header: Vec<String> = g.merging_columns.iter().map(|c| c.name.clone()).collect();
        let effective_cleanup = matches!(
            settings.clean_deleted_rows,
            CleanDeletedRows::Always
        ) || g.params.cleanup;
        self.transform = Some(MergedTransform::new(
            header,
            readers,
            &g.params.merging_params,
            &metadata,
            effective_cleanup,
            g.params.time_of_merge,
            TransformOptions {
                block_size: settings.merge_max_block_size,
                deduplicate: g.params.deduplicate,
                deduplicate_by_columns: g.params.deduplicate_by_columns.clone(),
            },
            row_sources_writer,
            evictor,
            g.input_rows_filtered.clone(),
            g.progress.clone(),
        )?);

        let ttl_tally = (need_remove && metadata.has_any_ttl()).then(|| metadata.ttl.clone());
        g.writer = Some(MergedBlockWriter::new(
            txn.path().to_path_buf(),
            g.merging_columns.clone(),
            settings.ratio_of_defaults_for_sparse_serialization,
            ttl_tally,
        ));

        g.new_part = Some(NewPartState {
            txn,
            ttl_infos,
            expired_columns,
            merged_source_parts,
            minmax: MinMaxIndex::default(),
        });
        g.rows_written = 0;
        self.initial_reservation = g
            .params
            .space_reservation
            .as_ref()
            .map(|r| r.initial())
            .unwrap_or(0);
        Ok(())
    }

    fn merge_block(&mut self, g: &mut GlobalCtx) -> Result<bool> {
        if g.merge_cancelled() {
            return Ok(false);
        }
        let transform = self
            .transform
            .as_mut()
            .ok_or_else(|| Error::logical("horizontal stage executed before prepare"))?;
        let Some(block) = transform.next_block()? else {
            return Ok(false);
        };

        g.rows_written += block.rows() as u64;
        g.writer
            .as_mut()
            .ok_or_else(|| Error::logical("merged block writer missing"))?
            .write(&block)?;
        g.progress.set_rows_written(g.rows_written);
        g.progress.add_bytes_written(block.bytes());

        let row_fraction = if self.sum_input_rows > 0 {
            (g.rows_written as f64 / self.sum_input_rows as f64).min(1.0)
        } else {
            1.0
        };
        let fraction = match g.chosen_algorithm {
            Some(MergeAlgorithm::Vertical) => {
                let key_weight = self
                    .column_sizes
                    .as_ref()
                    .map(|cs| cs.key_columns_weight())
                    .unwrap_or(1.0);
                key_weight * row_fraction
            }
            _ => row_fraction,
        };
        g.progress.store_fraction(fraction);

        if let Some(reservation) = &g.params.space_reservation {
            if self.sum_input_rows > 0 {
                reservation.update(((1.0 - fraction) * self.initial_reservation as f64) as u64);
            }
        }
        Ok(true)
    }

    fn finish(&mut self, g: &mut GlobalCtx) -> Result<()> {
        if g.params.merges_blocker.is_cancelled() || g.progress.is_cancelled() {
            return Err(Error::Aborted("cancelled merging parts".into()));
        }
        if g.need_remove_expired_values && g.params.ttl_merges_blocker.is_cancelled() {
            return Err(Error::Aborted(
                "cancelled merging parts with expired TTL".into(),
            ));
        }

        self.need_sync = need_sync_part(self.sum_input_rows, self.sum_input_bytes, &g.params.settings);

        let row_sources_writer = self
            .transform
            .as_mut()
            .and_then(|transform| transform.take_row_sources());
        self.transform = None;
        if let Some(writer) = row_sources_writer {
            let rows_sources_count = writer.count();
            let file = writer.finalize()?;
            let filtered = g.input_rows_filtered.load(Ordering::Relaxed);
            let total_source_rows = g.params.future_part.total_rows();
            if rows_sources_count + filtered != total_source_rows {
                return Err(Error::logical(format!(
                    "number of rows in source parts ({total_source_rows}) excluding filtered rows \
                     ({filtered}) differs from number of bytes written to the rows_sources file \
                     ({rows_sources_count}). It is a bug"
                )));
            }
            self.rows_sources = Some(file);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SecondaryIndexDesc;
    use crate::value::DataType;

    fn metadata() -> StorageMetadata {
        StorageMetadata {
            columns: vec![
                ColumnDesc::new("k", DataType::UInt64),
                ColumnDesc::new("sign", DataType::Int64),
                ColumnDesc::new("a", DataType::String),
                ColumnDesc::new("b", DataType::Float64),
            ],
            sort_key: vec!["k".to_string()],
            secondary_indices: vec![SecondaryIndexDesc {
                name: "by_b".to_string(),
                columns: vec!["b".to_string()],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn mode_forced_columns_join_the_merging_set() {
        let metadata = metadata();
        let mut params = MergingParams::with_mode(MergeMode::Collapsing);
        params.sign_column = Some("sign".to_string());

        let (merging, gathering) = extract_merging_and_gathering_columns(&metadata, &params);
        let merging_names: Vec<&str> = merging.iter().map(|c| c.name.as_str()).collect();
        let gathering_names: Vec<&str> = gathering.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(merging_names, vec!["k", "sign", "b"]);
        assert_eq!(gathering_names, vec!["a"]);
    }

    #[test]
    fn empty_sort_key_forces_one_merging_column() {
        let metadata = StorageMetadata {
            columns: vec![
                ColumnDesc::new("x", DataType::UInt64),
                ColumnDesc::new("y", DataType::UInt64),
            ],
            ..Default::default()
        };
        let (merging, gathering) =
            extract_merging_and_gathering_columns(&metadata, &MergingParams::ordinary());
        assert_eq!(merging.len(), 1);
        assert_eq!(merging[0].name, "x");
        assert_eq!(gathering.len(), 1);
    }
}
