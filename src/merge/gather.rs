//! Column gathering for the vertical merge.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::block::{Block, Column};
use crate::error::{Error, Result};
use crate::merge::row_sources::RowSourcesReader;
use crate::part::reader::PartReader;
use crate::part::Part;
use crate::schema::ColumnDesc;
use crate::value::Value;

struct ValueCursor {
    reader: PartReader,
    values: VecDeque<Value>,
    done: bool,
}

impl ValueCursor {
    fn next_value(&mut self, column: &str) -> Result<Option<Value>> {
        while self.values.is_empty() && !self.done {
            match self.reader.read_block() {
                Some(block) => {
                    let col = block.column(column).ok_or_else(|| {
                        Error::logical(format!("sequential read lost column {column}"))
                    })?;
                    self.values.extend(col.data.iter().cloned());
                }
                None => self.done = true,
            }
        }
        Ok(self.values.pop_front())
    }
}

/// Reassembles one gathering column in merged-row order by replaying the
/// row-source stream: each record consumes one row from its source, and
/// only non-skipped rows are emitted.
pub(crate) struct ColumnGatherer {
    column: ColumnDesc,
    cursors: Vec<ValueCursor>,
    rows_sources: RowSourcesReader,
    block_size: usize,
    exhausted: bool,
}

impl ColumnGatherer {
    pub(crate) fn new(
        parts: &[Arc<Part>],
        column: &ColumnDesc,
        rows_sources: RowSourcesReader,
        block_size: usize,
    ) -> Result<Self> {
        let mut cursors = Vec::with_capacity(parts.len());
        for part in parts {
            cursors.push(ValueCursor {
                reader: PartReader::new(
                    part,
                    std::slice::from_ref(column),
                    block_size.max(1),
                    false,
                    None,
                )?,
                values: VecDeque::new(),
                done: false,
            });
        }
        Ok(Self {
            column: column.clone(),
            cursors,
            rows_sources,
            block_size: block_size.max(1),
            exhausted: false,
        })
    }

    pub(crate) fn read_block(&mut self) -> Result<Option<Block>> {
        if self.exhausted {
            return Ok(None);
        }
        let mut data = Vec::with_capacity(self.block_size);
        while data.len() < self.block_size {
            let Some(record) = self.rows_sources.next()? else {
                self.exhausted = true;
                break;
            };
            let source = record.source_num();
            let cursor = self.cursors.get_mut(source).ok_or_else(|| {
                Error::logical(format!("row sources name source {source} out of range"))
            })?;
            let value = cursor.next_value(&self.column.name)?.ok_or_else(|| {
                Error::logical(format!(
                    "source {source} ran out of rows while gathering column {}",
                    self.column.name
                ))
            })?;
            if !record.skip_flag() {
                data.push(value);
            }
        }
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Block {
            columns: vec![Column {
                name: self.column.name.clone(),
                data,
            }],
        }))
    }
}
