//! The merge task driver.
//!
//! A task owns a fixed ordered list of stages (horizontal merge, vertical
//! per-column merge, projection merges + finalization). `execute()` does
//! at most one block's work and returns `true` while more work remains,
//! giving the outer scheduler cheap cancellation checkpoints.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tempfile::TempDir;

use crate::error::{Error, Result};
use crate::merge::blocker::ActionBlocker;
use crate::merge::horizontal::HorizontalStage;
use crate::merge::projection::ProjectionStage;
use crate::merge::vertical::VerticalStage;
use crate::merge::{MergeAlgorithm, MergeProgress, SpaceReservation};
use crate::part::checksums::Checksums;
use crate::part::ttl::TtlInfos;
use crate::part::writer::MergedBlockWriter;
use crate::part::{FuturePart, MinMaxIndex, Part, PartTransaction};
use crate::schema::{ColumnDesc, MergingParams, StorageMetadata};
use crate::settings::{MergeSettings, WriteSettings};
use crate::vector::MergedPartNameAndId;

/// Everything a merge needs up front. Collaborating singletons (settings,
/// blockers, reservations) are injected here rather than reached for
/// globally.
pub struct MergeTaskParams {
    pub future_part: FuturePart,
    pub metadata: Arc<StorageMetadata>,
    pub merging_params: MergingParams,
    pub settings: Arc<MergeSettings>,
    pub write_settings: WriteSettings,
    /// Table data directory the new part directory is created under.
    pub data_dir: PathBuf,
    /// Seconds since epoch; TTL expressions are evaluated against this.
    pub time_of_merge: u64,
    pub deduplicate: bool,
    /// Empty means "deduplicate by all columns".
    pub deduplicate_by_columns: Vec<String>,
    pub cleanup: bool,
    /// Whether the new directory gets the `tmp_merge_` prefix.
    pub need_prefix: bool,
    /// Set for projection merges: the enclosing new part's directory.
    pub parent_part_dir: Option<PathBuf>,
    /// Directory suffix for projection merges (`.proj`).
    pub suffix: String,
    pub merges_blocker: ActionBlocker,
    pub ttl_merges_blocker: ActionBlocker,
    pub space_reservation: Option<Arc<SpaceReservation>>,
}

impl MergeTaskParams {
    pub fn new(
        future_part: FuturePart,
        metadata: Arc<StorageMetadata>,
        data_dir: impl Into<PathBuf>,
        time_of_merge: u64,
    ) -> Self {
        Self {
            future_part,
            metadata,
            merging_params: MergingParams::ordinary(),
            settings: Arc::new(MergeSettings::default()),
            write_settings: WriteSettings::default(),
            data_dir: data_dir.into(),
            time_of_merge,
            deduplicate: false,
            deduplicate_by_columns: Vec::new(),
            cleanup: false,
            need_prefix: true,
            parent_part_dir: None,
            suffix: String::new(),
            merges_blocker: ActionBlocker::new(),
            ttl_merges_blocker: ActionBlocker::new(),
            space_reservation: None,
        }
    }
}

/// New-part state accumulated across stages.
pub(crate) struct NewPartState {
    pub txn: PartTransaction,
    pub ttl_infos: TtlInfos,
    pub expired_columns: BTreeSet<String>,
    pub merged_source_parts: Vec<MergedPartNameAndId>,
    pub minmax: MinMaxIndex,
}

/// State shared by all stages of one task.
pub(crate) struct GlobalCtx {
    pub params: MergeTaskParams,
    pub progress: Arc<MergeProgress>,
    pub input_rows_filtered: Arc<AtomicU64>,
    pub merging_columns: Vec<ColumnDesc>,
    pub gathering_columns: Vec<ColumnDesc>,
    pub all_column_names: Vec<String>,
    pub chosen_algorithm: Option<MergeAlgorithm>,
    pub new_part: Option<NewPartState>,
    pub writer: Option<MergedBlockWriter>,
    pub rows_written: u64,
    pub need_remove_expired_values: bool,
    pub can_be_decouple: bool,
    pub only_one_vpart_merged: bool,
    pub all_parts_have_vector_index: BTreeMap<String, bool>,
    pub first_part_with_data: usize,
    pub checksums_gathered_columns: Checksums,
    pub scratch: Option<TempDir>,
    pub started_at: Instant,
    pub finished_part: Option<Arc<Part>>,
}

impl GlobalCtx {
    fn new(params: MergeTaskParams) -> Self {
        Self {
            params,
            progress: Arc::new(MergeProgress::default()),
            input_rows_filtered: Arc::new(AtomicU64::new(0)),
            merging_columns: Vec::new(),
            gathering_columns: Vec::new(),
            all_column_names: Vec::new(),
            chosen_algorithm: None,
            new_part: None,
            writer: None,
            rows_written: 0,
            need_remove_expired_values: false,
            can_be_decouple: false,
            only_one_vpart_merged: false,
            all_parts_have_vector_index: BTreeMap::new(),
            first_part_with_data: 0,
            checksums_gathered_columns: Checksums::default(),
            scratch: None,
            started_at: Instant::now(),
            finished_part: None,
        }
    }

    /// Sampled once per block and at stage boundaries.
    pub(crate) fn merge_cancelled(&self) -> bool {
        self.params.merges_blocker.is_cancelled()
            || (self.need_remove_expired_values && self.params.ttl_merges_blocker.is_cancelled())
            || self.progress.is_cancelled()
    }

    pub(crate) fn new_part_dir(&self) -> Result<PathBuf> {
        self.new_part
            .as_ref()
            .map(|state| state.txn.path().to_path_buf())
            .ok_or_else(|| Error::logical("new part directory is not prepared yet"))
    }
}

enum Stage {
    Horizontal(HorizontalStage),
    Vertical(VerticalStage),
    Projections(ProjectionStage),
    Done,
}

/// One cooperative merge. Created cheap; all preparation happens inside
/// the first `execute()` call.
pub struct MergeTask {
    g: GlobalCtx,
    stage: Stage,
}

impl MergeTask {
    pub fn new(params: MergeTaskParams) -> MergeTask {
        MergeTask {
            g: GlobalCtx::new(params),
            stage: Stage::Horizontal(HorizontalStage::new()),
        }
    }

    /// Perform at most one block of work. Returns `true` while the task
    /// wants to be called again, `false` once the new part is finalized.
    ///
    /// On error the task must be dropped; the temporary part directory is
    /// cleaned up by its scoped transaction guard.
    pub fn execute(&mut self) -> Result<bool> {
        let more = match &mut self.stage {
            Stage::Horizontal(stage) => stage.execute(&mut self.g)?,
            Stage::Vertical(stage) => stage.execute(&mut self.g)?,
            Stage::Projections(stage) => stage.execute(&mut self.g)?,
            Stage::Done => return Ok(false),
        };
        if more {
            return Ok(true);
        }

        // Stage finished: hand its context to the next stage.
        let stage = std::mem::replace(&mut self.stage, Stage::Done);
        self.stage = match stage {
            Stage::Horizontal(stage) => {
                Stage::Vertical(VerticalStage::new(stage.into_vertical_input()))
            }
            Stage::Vertical(stage) => {
                Stage::Projections(ProjectionStage::new(stage.into_projection_input()))
            }
            Stage::Projections(_) | Stage::Done => Stage::Done,
        };
        Ok(!matches!(self.stage, Stage::Done))
    }

    /// Drive the task to completion. Convenience wrapper over `execute`.
    pub fn run_to_completion(&mut self) -> Result<Arc<Part>> {
        while self.execute()? {}
        self.take_finished_part()
            .ok_or_else(|| Error::logical("merge completed without producing a part"))
    }

    pub fn finished_part(&self) -> Option<Arc<Part>> {
        self.g.finished_part.clone()
    }

    pub fn take_finished_part(&mut self) -> Option<Arc<Part>> {
        self.g.finished_part.take()
    }

    pub fn progress(&self) -> Arc<MergeProgress> {
        self.g.progress.clone()
    }

    pub fn input_rows_filtered(&self) -> u64 {
        self.g.input_rows_filtered.load(Ordering::Relaxed)
    }

    /// The algorithm chosen during preparation, once known.
    pub fn algorithm(&self) -> Option<MergeAlgorithm> {
        self.g.chosen_algorithm
    }
}
