//! The sorted-merge transform family.
//!
//! One [`MergedTransform`] consumes N ordered source streams sharing a
//! header and emits a single ordered stream, applying the configured
//! row-collapsing discipline per group of equal sort keys. Ties between
//! sources resolve by ascending source number, which preserves insertion
//! order semantics.

pub(crate) mod collapsing;
pub(crate) mod graphite;
pub(crate) mod replacing;
pub(crate) mod summing;

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::merge::row_sources::{RowSourcePart, RowSourcesWriter};
use crate::merge::ttl::TtlEvictor;
use crate::merge::MergeProgress;
use crate::part::reader::PartReader;
use crate::schema::{GraphiteRetention, MergeMode, MergingParams, StorageMetadata};
use crate::value::{DataType, Value};

/// One input row of a group, tagged with its source number.
pub(crate) struct GroupRow {
    pub source: usize,
    pub values: Vec<Value>,
}

/// What a discipline decided for one group: a per-input-row emit flag and
/// the emitted rows. The i-th `true` flag corresponds to the i-th output
/// row; this alignment is what makes the row-source stream replayable.
pub(crate) struct GroupDecision {
    pub emit: Vec<bool>,
    pub outputs: Vec<Vec<Value>>,
}

impl GroupDecision {
    pub(crate) fn emit_all(rows: &[GroupRow]) -> Self {
        Self {
            emit: vec![true; rows.len()],
            outputs: rows.iter().map(|r| r.values.clone()).collect(),
        }
    }
}

pub(crate) enum ModeImpl {
    Ordinary,
    Collapsing(collapsing::Collapsing),
    Replacing(replacing::Replacing),
    Summing(summing::Summing),
    Aggregating(summing::Aggregating),
    Graphite(graphite::Graphite),
}

impl ModeImpl {
    fn process_group(&self, rows: &[GroupRow]) -> Result<GroupDecision> {
        match self {
            ModeImpl::Ordinary => Ok(GroupDecision::emit_all(rows)),
            ModeImpl::Collapsing(mode) => mode.process_group(rows),
            ModeImpl::Replacing(mode) => mode.process_group(rows),
            ModeImpl::Summing(mode) => Ok(mode.process_group(rows)),
            ModeImpl::Aggregating(mode) => Ok(mode.process_group(rows)),
            ModeImpl::Graphite(mode) => mode.process_group(rows),
        }
    }
}

fn required_position(header: &[String], column: &str, what: &str) -> Result<usize> {
    header
        .iter()
        .position(|name| name == column)
        .ok_or_else(|| Error::BadArguments(format!("{what} column {column} is not in the header")))
}

/// Build the discipline for `params.mode`, resolving its columns against
/// the stream header.
pub(crate) fn build_mode(
    params: &MergingParams,
    header: &[String],
    metadata: &StorageMetadata,
    effective_cleanup: bool,
    time_of_merge: u64,
) -> Result<ModeImpl> {
    Ok(match params.mode {
        MergeMode::Ordinary => ModeImpl::Ordinary,
        MergeMode::Collapsing | MergeMode::VersionedCollapsing => {
            let sign = params.sign_column.as_deref().ok_or_else(|| {
                Error::BadArguments("collapsing merge requires a sign column".into())
            })?;
            ModeImpl::Collapsing(collapsing::Collapsing {
                sign_pos: required_position(header, sign, "sign")?,
                log_imbalance: params.mode == MergeMode::Collapsing,
            })
        }
        MergeMode::Replacing => {
            let version_pos = match &params.version_column {
                Some(column) => Some(required_position(header, column, "version")?),
                None => None,
            };
            let is_deleted_pos = match &params.is_deleted_column {
                Some(column) => Some(required_position(header, column, "is_deleted")?),
                None => None,
            };
            ModeImpl::Replacing(replacing::Replacing {
                version_pos,
                is_deleted_pos,
                cleanup: effective_cleanup,
            })
        }
        MergeMode::Summing => {
            let sum_positions: Vec<usize> = if params.columns_to_sum.is_empty() {
                header
                    .iter()
                    .enumerate()
                    .filter(|(_, name)| {
                        let name = name.as_str();
                        !metadata.sort_key.iter().any(|k| k == name)
                            && !metadata.partition_key.iter().any(|k| k == name)
                            && metadata
                                .column(name)
                                .map_or(false, |c| c.data_type != DataType::String)
                    })
                    .map(|(i, _)| i)
                    .collect()
            } else {
                params
                    .columns_to_sum
                    .iter()
                    .map(|column| required_position(header, column, "summed"))
                    .collect::<Result<_>>()?
            };
            ModeImpl::Summing(summing::Summing { sum_positions })
        }
        MergeMode::Aggregating => ModeImpl::Aggregating(summing::Aggregating {
            fns: header
                .iter()
                .map(|name| metadata.column(name).and_then(|c| c.aggregate_fn))
                .collect(),
        }),
        MergeMode::Graphite => {
            let graphite = params.graphite.as_ref().ok_or_else(|| {
                Error::BadArguments("graphite merge requires graphite parameters".into())
            })?;
            let mut patterns = Vec::with_capacity(graphite.patterns.len());
            for pattern in &graphite.patterns {
                let regexp = match &pattern.regexp {
                    Some(expr) => Some(regex::Regex::new(expr).map_err(|e| {
                        Error::BadArguments(format!("bad graphite pattern {expr:?}: {e}"))
                    })?),
                    None => None,
                };
                let mut retentions: Vec<GraphiteRetention> = pattern.retentions.clone();
                retentions.sort_by(|a, b| b.age.cmp(&a.age));
                patterns.push(graphite::CompiledPattern {
                    regexp,
                    function: pattern.function,
                    retentions,
                });
            }
            ModeImpl::Graphite(graphite::Graphite {
                path_pos: required_position(header, &graphite.path_column, "graphite path")?,
                time_pos: required_position(header, &graphite.time_column, "graphite time")?,
                value_pos: required_position(header, &graphite.value_column, "graphite value")?,
                version_pos: header
                    .iter()
                    .position(|name| name == &graphite.version_column),
                patterns,
                time_of_merge,
            })
        }
    })
}

struct SourceCursor {
    reader: PartReader,
    rows: VecDeque<Vec<Value>>,
    done: bool,
}

impl SourceCursor {
    fn fill(
        &mut self,
        ttl: Option<&TtlEvictor>,
        filtered: &AtomicU64,
        progress: &MergeProgress,
    ) {
        while self.rows.is_empty() && !self.done {
            match self.reader.read_block() {
                Some(block) => {
                    let block = match ttl {
                        Some(evictor) => evictor.filter_block(block, filtered),
                        None => block,
                    };
                    progress.add_rows_read(block.rows() as u64);
                    for i in 0..block.rows() {
                        self.rows.push_back(block.row(i));
                    }
                }
                None => self.done = true,
            }
        }
    }
}

pub(crate) struct TransformOptions {
    pub block_size: usize,
    pub deduplicate: bool,
    /// Empty means "all columns".
    pub deduplicate_by_columns: Vec<String>,
}

pub(crate) struct MergedTransform {
    header: Vec<String>,
    group_key: Vec<usize>,
    cursors: Vec<SourceCursor>,
    mode: ModeImpl,
    dedup: Option<Vec<usize>>,
    row_sources: Option<RowSourcesWriter>,
    ttl: Option<TtlEvictor>,
    filtered: Arc<AtomicU64>,
    progress: Arc<MergeProgress>,
    block_size: usize,
    pending: Vec<Vec<Value>>,
    exhausted: bool,
}

impl MergedTransform {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        header: Vec<String>,
        readers: Vec<PartReader>,
        params: &MergingParams,
        metadata: &StorageMetadata,
        effective_cleanup: bool,
        time_of_merge: u64,
        options: TransformOptions,
        row_sources: Option<RowSourcesWriter>,
        ttl: Option<TtlEvictor>,
        filtered: Arc<AtomicU64>,
        progress: Arc<MergeProgress>,
    ) -> Result<Self> {
        let mode = build_mode(params, &header, metadata, effective_cleanup, time_of_merge)?;

        // Graphite groups on the rollup key (everything but the time
        // column); every other discipline groups on the full sort key.
        let mut group_key: Vec<usize> = Vec::new();
        for name in &metadata.sort_key {
            if let Some(position) = header.iter().position(|h| h == name) {
                if let ModeImpl::Graphite(g) = &mode {
                    if position == g.time_pos {
                        continue;
                    }
                }
                group_key.push(position);
            }
        }
        if group_key.is_empty() && !matches!(mode, ModeImpl::Graphite(_)) {
            // Force at least one grouping column, mirroring an empty key.
            group_key.push(0);
        }

        let dedup = options.deduplicate.then(|| {
            if options.deduplicate_by_columns.is_empty() {
                (0..header.len()).collect()
            } else {
                options
                    .deduplicate_by_columns
                    .iter()
                    .filter_map(|name| header.iter().position(|h| h == name))
                    .collect()
            }
        });

        Ok(Self {
            header,
            group_key,
            cursors: readers
                .into_iter()
                .map(|reader| SourceCursor {
                    reader,
                    rows: VecDeque::new(),
                    done: false,
                })
                .collect(),
            mode,
            dedup,
            row_sources,
            ttl,
            filtered,
            progress,
            block_size: options.block_size.max(1),
            pending: Vec::new(),
            exhausted: false,
        })
    }

    /// Pull the next output block; `None` once all sources are drained.
    pub(crate) fn next_block(&mut self) -> Result<Option<Block>> {
        while !self.exhausted && self.pending.len() < self.block_size {
            self.process_next_group()?;
        }
        if self.pending.is_empty() {
            return Ok(None);
        }
        let take = self.block_size.min(self.pending.len());
        let rows: Vec<Vec<Value>> = self.pending.drain(..take).collect();
        let mut block = Block::from_rows(&self.header, rows);
        if let Some(evictor) = &self.ttl {
            evictor.apply_column_ttl(&mut block);
        }
        Ok(Some(block))
    }

    /// Hand back the row-source writer once the merge is drained.
    pub(crate) fn take_row_sources(&mut self) -> Option<RowSourcesWriter> {
        self.row_sources.take()
    }

    fn process_next_group(&mut self) -> Result<()> {
        let ttl = self.ttl.as_ref();
        for cursor in &mut self.cursors {
            cursor.fill(ttl, &self.filtered, &self.progress);
        }

        let mut min_key: Option<Vec<Value>> = None;
        for cursor in &self.cursors {
            if let Some(front) = cursor.rows.front() {
                let key = key_of(front, &self.group_key);
                if min_key.as_ref().map_or(true, |current| key < *current) {
                    min_key = Some(key);
                }
            }
        }
        let Some(min_key) = min_key else {
            self.exhausted = true;
            return Ok(());
        };

        let mut group: Vec<GroupRow> = Vec::new();
        for (source, cursor) in self.cursors.iter_mut().enumerate() {
            loop {
                cursor.fill(ttl, &self.filtered, &self.progress);
                match cursor.rows.front() {
                    Some(front) if key_of(front, &self.group_key) == min_key => {
                        group.push(GroupRow {
                            source,
                            values: cursor.rows.pop_front().expect("front row just observed"),
                        });
                    }
                    _ => break,
                }
            }
        }

        let mut decision = self.mode.process_group(&group)?;
        debug_assert_eq!(decision.emit.len(), group.len());
        debug_assert_eq!(
            decision.emit.iter().filter(|e| **e).count(),
            decision.outputs.len()
        );

        if let Some(positions) = &self.dedup {
            dedup_outputs(&mut decision, positions);
        }

        if let Some(writer) = &mut self.row_sources {
            for (row, emit) in group.iter().zip(&decision.emit) {
                writer.write(RowSourcePart::with_skip_flag(row.source, !emit))?;
            }
        }

        self.pending.append(&mut decision.outputs);
        Ok(())
    }
}

fn key_of(row: &[Value], positions: &[usize]) -> Vec<Value> {
    positions.iter().map(|&p| row[p].clone()).collect()
}

/// Drop output rows whose dedup key was already emitted within this group,
/// flipping their emit flag so the row-source stream records a skip.
fn dedup_outputs(decision: &mut GroupDecision, positions: &[usize]) {
    let mut seen: Vec<Vec<Value>> = Vec::new();
    let mut output_index = 0;
    for emit in decision.emit.iter_mut() {
        if !*emit {
            continue;
        }
        let key = key_of(&decision.outputs[output_index], positions);
        if seen.iter().any(|existing| *existing == key) {
            *emit = false;
            decision.outputs.remove(output_index);
        } else {
            seen.push(key);
            output_index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_keeps_first_of_each_key() {
        let mut decision = GroupDecision {
            emit: vec![true, false, true, true],
            outputs: vec![
                vec![Value::UInt64(1), Value::String("a".into())],
                vec![Value::UInt64(1), Value::String("a".into())],
                vec![Value::UInt64(1), Value::String("b".into())],
            ],
        };
        dedup_outputs(&mut decision, &[0, 1]);
        assert_eq!(decision.emit, vec![true, false, false, true]);
        assert_eq!(
            decision.outputs,
            vec![
                vec![Value::UInt64(1), Value::String("a".into())],
                vec![Value::UInt64(1), Value::String("b".into())],
            ]
        );
    }
}
