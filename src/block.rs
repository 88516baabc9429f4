//! Column/block containers flowing between readers, transforms and writers.

use std::cmp::Ordering;

use crate::value::Value;

/// A named column chunk.
#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub data: Vec<Value>,
}

/// A horizontal slice of rows over a fixed set of columns.
///
/// All columns in a block have the same length; the block header is the
/// ordered list of column names.
#[derive(Clone, Debug, Default)]
pub struct Block {
    pub columns: Vec<Column>,
}

impl Block {
    pub fn rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn header(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Materialize row `i` in header order.
    pub fn row(&self, i: usize) -> Vec<Value> {
        self.columns.iter().map(|c| c.data[i].clone()).collect()
    }

    /// Uncompressed in-memory weight, for progress accounting.
    pub fn bytes(&self) -> u64 {
        self.columns
            .iter()
            .flat_map(|c| c.data.iter())
            .map(|v| v.byte_size() as u64)
            .sum()
    }

    /// Assemble a block from materialized rows aligned to `header`.
    pub fn from_rows(header: &[String], rows: Vec<Vec<Value>>) -> Block {
        let mut columns: Vec<Column> = header
            .iter()
            .map(|name| Column {
                name: name.clone(),
                data: Vec::with_capacity(rows.len()),
            })
            .collect();
        for row in rows {
            debug_assert_eq!(row.len(), columns.len());
            for (col, value) in columns.iter_mut().zip(row) {
                col.data.push(value);
            }
        }
        Block { columns }
    }
}

/// Compare two materialized rows on the given key positions, ascending.
pub fn compare_rows(a: &[Value], b: &[Value], key: &[usize]) -> Ordering {
    for &i in key {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
