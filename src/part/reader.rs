//! Sequential block reader over one part.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::block::{Block, Column};
use crate::error::{Error, Result};
use crate::part::{codec, column_file_name, Part, PART_OFFSET_COLUMN};
use crate::schema::ColumnDesc;
use crate::value::Value;

/// Reads a fixed column subset of a part in row order, applying the
/// part's lightweight-delete mask.
///
/// Columns absent from the part (or expired by TTL) are materialized as
/// defaults. With `with_part_offset` the reader appends a synthetic
/// `_part_offset` column holding each surviving row's original offset.
pub(crate) struct PartReader {
    header: Vec<String>,
    data: Vec<Vec<Value>>,
    offsets: Vec<u64>,
    pos: usize,
    block_size: usize,
    with_part_offset: bool,
}

impl PartReader {
    /// `filtered` is incremented once per row masked out by a lightweight
    /// delete. Pass it only from the reader that feeds the k-way merge, so
    /// rereads (offset pass, column gathering) do not double-count.
    pub(crate) fn new(
        part: &Part,
        columns: &[ColumnDesc],
        block_size: usize,
        with_part_offset: bool,
        filtered: Option<&AtomicU64>,
    ) -> Result<Self> {
        let rows_total = part.rows_count as usize;
        let keep: Vec<bool> = match &part.deleted_rows {
            None => vec![true; rows_total],
            Some(mask) => (0..rows_total as u64).map(|row| !mask.contains(row)).collect(),
        };
        let offsets: Vec<u64> = keep
            .iter()
            .enumerate()
            .filter(|(_, kept)| **kept)
            .map(|(row, _)| row as u64)
            .collect();
        if let Some(counter) = filtered {
            counter.fetch_add((rows_total - offsets.len()) as u64, Ordering::Relaxed);
        }

        let mut data = Vec::with_capacity(columns.len());
        for desc in columns {
            let file = part.path.join(column_file_name(&desc.name));
            let full = if file.exists() && !part.expired_columns.contains(&desc.name) {
                let (_, values) = codec::decode_column(&file)?;
                if values.len() != rows_total {
                    return Err(Error::logical(format!(
                        "column {} of part {} has {} rows, part has {}",
                        desc.name,
                        part.name,
                        values.len(),
                        rows_total
                    )));
                }
                values
            } else {
                vec![desc.default_value(); rows_total]
            };
            let surviving: Vec<Value> = full
                .into_iter()
                .zip(&keep)
                .filter(|(_, kept)| **kept)
                .map(|(value, _)| value)
                .collect();
            data.push(surviving);
        }

        Ok(Self {
            header: columns.iter().map(|c| c.name.clone()).collect(),
            data,
            offsets,
            pos: 0,
            block_size: block_size.max(1),
            with_part_offset,
        })
    }

    /// Next block of up to `block_size` rows, `None` at end of part.
    pub(crate) fn read_block(&mut self) -> Option<Block> {
        if self.pos >= self.offsets.len() {
            return None;
        }
        let end = (self.pos + self.block_size).min(self.offsets.len());
        let mut columns: Vec<Column> = self
            .header
            .iter()
            .zip(&self.data)
            .map(|(name, values)| Column {
                name: name.clone(),
                data: values[self.pos..end].to_vec(),
            })
            .collect();
        if self.with_part_offset {
            columns.push(Column {
                name: PART_OFFSET_COLUMN.to_string(),
                data: self.offsets[self.pos..end]
                    .iter()
                    .map(|&offset| Value::UInt64(offset))
                    .collect(),
            });
        }
        self.pos = end;
        Some(Block { columns })
    }
}
