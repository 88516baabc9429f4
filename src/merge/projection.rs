//! The final stage: min/max index merge, recursive projection merges and
//! whole-merge finalization.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::logging::strata_log;
use crate::merge::remap;
use crate::merge::row_sources::RowSourcesFile;
use crate::merge::task::{GlobalCtx, MergeTask, MergeTaskParams};
use crate::part::checksums::CHECKSUMS_FILE_NAME;
use crate::part::{write_part_meta, FuturePart, MinMaxIndex, Part, PartInfo, PartMeta};
use crate::schema::{MergeMode, MergingParams, ProjectionKind};
use crate::vector::VectorIndexState;

/// Context handed forward by the vertical stage.
pub(crate) struct ProjectionInput {
    pub need_sync: bool,
    pub rows_sources: Option<RowSourcesFile>,
}

enum State {
    Prepare,
    ExecuteProjections,
    Finalize,
    Done,
}

pub(crate) struct ProjectionStage {
    input: ProjectionInput,
    state: State,
    children: Vec<MergeTask>,
    child_index: usize,
}

impl ProjectionStage {
    pub(crate) fn new(input: ProjectionInput) -> Self {
        Self {
            input,
            state: State::Prepare,
            children: Vec::new(),
            child_index: 0,
        }
    }

    pub(crate) fn execute(&mut self, g: &mut GlobalCtx) -> Result<bool> {
        match self.state {
            State::Prepare => {
                self.prepare(g)?;
                self.state = State::ExecuteProjections;
                Ok(true)
            }
            State::ExecuteProjections => {
                if self.child_index >= self.children.len() {
                    self.state = State::Finalize;
                    return Ok(true);
                }
                // Projections run sequentially, one step at a time, to
                // keep the CPU budget of a single merge bounded.
                if !self.children[self.child_index].execute()? {
                    self.child_index += 1;
                }
                Ok(true)
            }
            State::Finalize => {
                self.finalize(g)?;
                self.state = State::Done;
                Ok(false)
            }
            State::Done => Ok(false),
        }
    }

    fn prepare(&mut self, g: &mut GlobalCtx) -> Result<()> {
        // Merge min/max indexes, skipping empty parts whose bounds would
        // be changed again by one more merge anyway.
        let mut minmax = MinMaxIndex::default();
        for part in &g.params.future_part.parts {
            if !part.is_empty() {
                if let Some(index) = &part.minmax {
                    minmax.merge(index);
                }
            }
        }
        if let Some(state) = g.new_part.as_mut() {
            state.minmax = minmax;
        }

        let elapsed = g.started_at.elapsed().as_secs_f64().max(f64::EPSILON);
        strata_log!(
            log::Level::Debug,
            "merge_sorted",
            "merge sorted {} rows, containing {} columns ({} merged, {} gathered) in {:.3} sec., {:.0} rows/sec.",
            g.progress.rows_read(),
            g.all_column_names.len(),
            g.merging_columns.len(),
            g.gathering_columns.len(),
            elapsed,
            g.progress.rows_read() as f64 / elapsed
        );

        let parent_dir = g.new_part_dir()?;
        for projection in &g.params.metadata.projections {
            let mut projection_parts = Vec::with_capacity(g.params.future_part.parts.len());
            let mut complete = true;
            for part in &g.params.future_part.parts {
                match part.projections.get(&projection.name) {
                    Some(projection_part) => projection_parts.push(projection_part.clone()),
                    None => {
                        complete = false;
                        break;
                    }
                }
            }
            if !complete {
                strata_log!(
                    log::Level::Debug,
                    "projection_skipped",
                    "projection {} is not merged because some parts don't have it",
                    projection.name
                );
                continue;
            }
            strata_log!(
                log::Level::Debug,
                "projection_selected",
                "selected {} projection parts of {}",
                projection_parts.len(),
                projection.name
            );

            let child_future = FuturePart::new(PartInfo::new(0, 0, 0, 0), projection_parts)
                .with_name(projection.name.clone());
            let mode = match projection.kind {
                ProjectionKind::Aggregate => MergeMode::Aggregating,
                ProjectionKind::Plain => MergeMode::Ordinary,
            };
            let child_params = MergeTaskParams {
                future_part: child_future,
                metadata: projection.metadata.clone(),
                merging_params: MergingParams::with_mode(mode),
                settings: g.params.settings.clone(),
                write_settings: g.params.write_settings,
                data_dir: parent_dir.clone(),
                time_of_merge: g.params.time_of_merge,
                deduplicate: g.params.deduplicate,
                deduplicate_by_columns: g.params.deduplicate_by_columns.clone(),
                cleanup: g.params.cleanup,
                need_prefix: g.params.need_prefix,
                parent_part_dir: Some(parent_dir.clone()),
                suffix: ".proj".to_string(),
                merges_blocker: g.params.merges_blocker.clone(),
                ttl_merges_blocker: g.params.ttl_merges_blocker.clone(),
                space_reservation: None,
            };
            self.children.push(MergeTask::new(child_params));
        }
        Ok(())
    }

    fn finalize(&mut self, g: &mut GlobalCtx) -> Result<()> {
        if g.merge_cancelled() {
            return Err(Error::Aborted("cancelled merging parts".into()));
        }

        // The children wrote themselves into `<name>.proj` under the new
        // part; just insist each of them actually finished.
        for child in &mut self.children {
            child.take_finished_part().ok_or_else(|| {
                Error::logical("projection merge completed without producing a part")
            })?;
        }

        let writer = g
            .writer
            .take()
            .ok_or_else(|| Error::logical("merged block writer missing at finalize"))?;
        let written = writer.finalize(self.input.need_sync)?;
        let mut checksums = written.checksums;
        checksums.add(std::mem::take(&mut g.checksums_gathered_columns));

        if written.rows != g.rows_written {
            return Err(Error::logical(format!(
                "writer holds {} rows but the merge emitted {}",
                written.rows, g.rows_written
            )));
        }
        if written.rows == 0 {
            g.can_be_decouple = false;
            g.only_one_vpart_merged = false;
        }

        let dir = g.new_part_dir()?;
        let meta = {
            let state = g
                .new_part
                .as_ref()
                .ok_or_else(|| Error::logical("new part state missing at finalize"))?;
            let ttl_infos = written
                .ttl_infos
                .unwrap_or_else(|| state.ttl_infos.clone());
            let mut vector_index_states = BTreeMap::new();
            if g.can_be_decouple || g.only_one_vpart_merged {
                for (name, all_built) in &g.all_parts_have_vector_index {
                    if *all_built {
                        vector_index_states.insert(name.clone(), VectorIndexState::Built);
                    }
                }
            }
            PartMeta {
                info: g.params.future_part.info,
                part_type: g.params.future_part.part_type,
                storage_type: g.params.future_part.storage_type,
                rows_count: written.rows,
                columns: g.params.metadata.columns.clone(),
                granules: written.granules,
                minmax: (!state.minmax.is_empty()).then(|| state.minmax.clone()),
                ttl_infos,
                expired_columns: state.expired_columns.clone(),
                vector_index_states,
                merged_source_parts: state.merged_source_parts.clone(),
            }
        };
        write_part_meta(&dir, &meta)?;
        checksums.write_to(&dir, CHECKSUMS_FILE_NAME)?;

        let mut decoupled_indexes = Vec::new();
        if g.can_be_decouple {
            let rows_sources = self.input.rows_sources.as_ref().ok_or_else(|| {
                Error::logical("decoupled merge without a row sources stream")
            })?;
            decoupled_indexes = remap::finalize_decouple(g, &dir, rows_sources)?;
        } else if g.only_one_vpart_merged {
            remap::finalize_single_vpart(g, &dir)?;
        }

        let part = Part::load(&dir)?;
        remap::prime_decouple_cache(&part, &decoupled_indexes)?;

        g.new_part
            .as_mut()
            .expect("checked above")
            .txn
            .precommit();
        g.finished_part = Some(Arc::new(part));
        Ok(())
    }
}
