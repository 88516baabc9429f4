//! The vertical stage: after the sort-key columns are merged, each
//! remaining column is re-read from all sources and gathered by replaying
//! the row-source stream.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::merge::column_sizes::ColumnSizeEstimator;
use crate::merge::gather::ColumnGatherer;
use crate::merge::projection::ProjectionInput;
use crate::merge::row_sources::RowSourcesFile;
use crate::merge::task::GlobalCtx;
use crate::merge::MergeAlgorithm;
use crate::part::writer::ColumnOnlyWriter;

/// Context handed forward by the horizontal stage.
pub(crate) struct VerticalInput {
    pub rows_sources: Option<RowSourcesFile>,
    pub column_sizes: Option<ColumnSizeEstimator>,
    pub need_sync: bool,
}

enum State {
    PrepareAll,
    Columns,
    FinalizeAll,
    Done,
}

enum OneColumnState {
    NeedPrepare,
    NeedExecute,
    NeedFinish,
}

pub(crate) struct VerticalStage {
    input: VerticalInput,
    state: State,
    one_column: OneColumnState,
    column_index: usize,
    gatherer: Option<ColumnGatherer>,
    column_to: Option<ColumnOnlyWriter>,
    delayed_streams: VecDeque<ColumnOnlyWriter>,
    max_delayed_streams: usize,
    progress_before: f64,
}

impl VerticalStage {
    pub(crate) fn new(input: VerticalInput) -> Self {
        Self {
            input,
            state: State::PrepareAll,
            one_column: OneColumnState::NeedPrepare,
            column_index: 0,
            gatherer: None,
            column_to: None,
            delayed_streams: VecDeque::new(),
            max_delayed_streams: 0,
            progress_before: 0.0,
        }
    }

    pub(crate) fn execute(&mut self, g: &mut GlobalCtx) -> Result<bool> {
        if g.chosen_algorithm != Some(MergeAlgorithm::Vertical) {
            return Ok(false);
        }
        match self.state {
            State::PrepareAll => {
                self.prepare_all(g)?;
                self.state = State::Columns;
                Ok(true)
            }
            State::Columns => {
                if self.column_index >= g.gathering_columns.len() {
                    self.state = State::FinalizeAll;
                    return Ok(true);
                }
                self.execute_one_column(g)
            }
            State::FinalizeAll => {
                while let Some(mut writer) = self.delayed_streams.pop_front() {
                    writer.finish(self.input.need_sync)?;
                }
                self.state = State::Done;
                Ok(false)
            }
            State::Done => Ok(false),
        }
    }

    pub(crate) fn into_projection_input(self) -> ProjectionInput {
        ProjectionInput {
            need_sync: self.input.need_sync,
            rows_sources: self.input.rows_sources,
        }
    }

    fn prepare_all(&mut self, g: &mut GlobalCtx) -> Result<()> {
        g.progress
            .set_columns_written(g.merging_columns.len() as u64);
        if let Some(column_sizes) = &self.input.column_sizes {
            g.progress.store_fraction(column_sizes.key_columns_weight());
        }
        if self.input.rows_sources.is_none() {
            return Err(Error::logical(
                "vertical merge without a row sources stream",
            ));
        }
        self.max_delayed_streams = g
            .params
            .settings
            .max_insert_delayed_streams_for_parallel_write;
        Ok(())
    }

    fn execute_one_column(&mut self, g: &mut GlobalCtx) -> Result<bool> {
        match self.one_column {
            OneColumnState::NeedPrepare => {
                let desc = g.gathering_columns[self.column_index].clone();
                self.progress_before = g.progress.fraction();
                let rows_sources = self
                    .input
                    .rows_sources
                    .as_ref()
                    .ok_or_else(|| Error::logical("row sources stream disappeared"))?;
                self.gatherer = Some(ColumnGatherer::new(
                    &g.params.future_part.parts,
                    &desc,
                    rows_sources.open_reader()?,
                    g.params.settings.merge_max_block_size,
                )?);
                self.column_to = Some(ColumnOnlyWriter::new(
                    g.new_part_dir()?,
                    desc,
                    g.params
                        .settings
                        .ratio_of_defaults_for_sparse_serialization,
                ));
                self.one_column = OneColumnState::NeedExecute;
                Ok(true)
            }
            OneColumnState::NeedExecute => {
                let cancelled =
                    g.params.merges_blocker.is_cancelled() || g.progress.is_cancelled();
                if !cancelled {
                    let gatherer = self
                        .gatherer
                        .as_mut()
                        .ok_or_else(|| Error::logical("column gatherer missing"))?;
                    if let Some(block) = gatherer.read_block()? {
                        self.column_to
                            .as_mut()
                            .ok_or_else(|| Error::logical("column writer missing"))?
                            .write(&block)?;
                        return Ok(true);
                    }
                }
                self.one_column = OneColumnState::NeedFinish;
                Ok(true)
            }
            OneColumnState::NeedFinish => {
                if g.params.merges_blocker.is_cancelled() || g.progress.is_cancelled() {
                    return Err(Error::Aborted("cancelled merging parts".into()));
                }
                self.gatherer = None;
                let mut column_to = self
                    .column_to
                    .take()
                    .ok_or_else(|| Error::logical("column writer missing"))?;
                let column_name = column_to.column_name().to_string();
                let column_elems_written = column_to.rows();
                g.checksums_gathered_columns
                    .add(column_to.fill_checksums()?);
                self.delayed_streams.push_back(column_to);
                while self.delayed_streams.len() > self.max_delayed_streams {
                    let mut writer = self
                        .delayed_streams
                        .pop_front()
                        .expect("length just checked");
                    writer.finish(self.input.need_sync)?;
                }

                if column_elems_written != g.rows_written {
                    return Err(Error::logical(format!(
                        "written {column_elems_written} elements of column {column_name}, \
                         but {} rows of PK columns",
                        g.rows_written
                    )));
                }

                g.progress.add_column_written();
                if let Some(column_sizes) = &self.input.column_sizes {
                    g.progress.store_fraction(
                        self.progress_before + column_sizes.column_weight(&column_name),
                    );
                }
                self.column_index += 1;
                self.one_column = OneColumnState::NeedPrepare;
                Ok(true)
            }
        }
    }
}
