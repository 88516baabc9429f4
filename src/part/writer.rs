//! Block writers producing the new part's column files.

use std::fs::File;
use std::path::PathBuf;

use crate::block::Block;
use crate::error::{Error, Result};
use crate::part::checksums::{hash_file, Checksums};
use crate::part::ttl::TtlInfos;
use crate::part::{codec, column_file_name};
use crate::schema::{ColumnDesc, TtlDescription};
use crate::value::Value;

/// Output of a finished writer.
pub(crate) struct WrittenColumns {
    pub checksums: Checksums,
    pub granules: Vec<u64>,
    pub rows: u64,
    /// Recomputed TTL ranges; `None` when the writer was not asked to
    /// tally them (the source-merged ranges are kept instead).
    pub ttl_infos: Option<TtlInfos>,
}

fn encode_and_hash(
    dir: &PathBuf,
    desc: &ColumnDesc,
    values: &[Value],
    sparse_ratio: f64,
    need_sync: bool,
) -> Result<Checksums> {
    let default = desc.default_value();
    let defaults = values.iter().filter(|v| **v == default).count();
    let use_sparse =
        !values.is_empty() && (defaults as f64 / values.len() as f64) >= sparse_ratio;

    let file_name = column_file_name(&desc.name);
    let path = dir.join(&file_name);
    codec::encode_column(
        &path,
        desc.data_type,
        values,
        use_sparse.then_some(&default),
    )?;
    if need_sync {
        File::open(&path)?.sync_all()?;
    }
    let (size, hash) = hash_file(&path)?;
    let mut checksums = Checksums::default();
    checksums.add_file(file_name, size, hash);
    Ok(checksums)
}

/// Writes the full merging-column set of the new part, one block at a
/// time, and tracks granule boundaries as the merge emits them.
pub(crate) struct MergedBlockWriter {
    dir: PathBuf,
    columns: Vec<ColumnDesc>,
    buffers: Vec<Vec<Value>>,
    granules: Vec<u64>,
    rows: u64,
    sparse_ratio: f64,
    ttl_tally: Option<(TtlDescription, TtlInfos)>,
}

impl MergedBlockWriter {
    pub(crate) fn new(
        dir: PathBuf,
        columns: Vec<ColumnDesc>,
        sparse_ratio: f64,
        ttl: Option<TtlDescription>,
    ) -> Self {
        let buffers = columns.iter().map(|_| Vec::new()).collect();
        Self {
            dir,
            columns,
            buffers,
            granules: Vec::new(),
            rows: 0,
            sparse_ratio,
            ttl_tally: ttl.map(|desc| {
                (
                    desc,
                    TtlInfos {
                        computed: true,
                        ..Default::default()
                    },
                )
            }),
        }
    }

    pub(crate) fn write(&mut self, block: &Block) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        for (desc, buffer) in self.columns.iter().zip(&mut self.buffers) {
            let column = block.column(&desc.name).ok_or_else(|| {
                Error::logical(format!("merged block is missing column {}", desc.name))
            })?;
            buffer.extend(column.data.iter().cloned());
        }
        self.granules.push(block.rows() as u64);
        self.rows += block.rows() as u64;

        if let Some((desc, tally)) = &mut self.ttl_tally {
            if let Some(row_ttl) = &desc.row_ttl {
                if let Some(base) = block.column(&row_ttl.column) {
                    for cell in &base.data {
                        if let Some(expiry) = row_ttl.evaluate(cell) {
                            tally.observe_row(expiry);
                        }
                    }
                }
            }
            for (name, column_ttl) in &desc.column_ttls {
                if let Some(base) = block.column(&column_ttl.column) {
                    for cell in &base.data {
                        if let Some(expiry) = column_ttl.evaluate(cell) {
                            tally.observe_column(name, expiry);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn rows(&self) -> u64 {
        self.rows
    }

    pub(crate) fn finalize(self, need_sync: bool) -> Result<WrittenColumns> {
        let mut checksums = Checksums::default();
        for (desc, values) in self.columns.iter().zip(&self.buffers) {
            checksums.add(encode_and_hash(
                &self.dir,
                desc,
                values,
                self.sparse_ratio,
                need_sync,
            )?);
        }
        Ok(WrittenColumns {
            checksums,
            granules: self.granules,
            rows: self.rows,
            ttl_infos: self.ttl_tally.map(|(_, tally)| tally),
        })
    }
}

/// Writes a single gathered column into an already-started part, reusing
/// the granularity fixed by the merging-column pass.
pub(crate) struct ColumnOnlyWriter {
    dir: PathBuf,
    desc: ColumnDesc,
    values: Vec<Value>,
    sparse_ratio: f64,
    file_written: bool,
}

impl ColumnOnlyWriter {
    pub(crate) fn new(dir: PathBuf, desc: ColumnDesc, sparse_ratio: f64) -> Self {
        Self {
            dir,
            desc,
            values: Vec::new(),
            sparse_ratio,
            file_written: false,
        }
    }

    pub(crate) fn column_name(&self) -> &str {
        &self.desc.name
    }

    pub(crate) fn rows(&self) -> u64 {
        self.values.len() as u64
    }

    pub(crate) fn write(&mut self, block: &Block) -> Result<()> {
        let column = block.column(&self.desc.name).ok_or_else(|| {
            Error::logical(format!(
                "gathered block is missing column {}",
                self.desc.name
            ))
        })?;
        self.values.extend(column.data.iter().cloned());
        Ok(())
    }

    /// Encode the column file and return its checksums. `finish` must still
    /// be called to (optionally) fsync before the writer is dropped.
    pub(crate) fn fill_checksums(&mut self) -> Result<Checksums> {
        let checksums = encode_and_hash(&self.dir, &self.desc, &self.values, self.sparse_ratio, false)?;
        self.file_written = true;
        self.values = Vec::new();
        Ok(checksums)
    }

    pub(crate) fn finish(&mut self, need_sync: bool) -> Result<()> {
        if !self.file_written {
            return Err(Error::logical(format!(
                "column {} finished before fill_checksums",
                self.desc.name
            )));
        }
        if need_sync {
            let path = self.dir.join(column_file_name(&self.desc.name));
            File::open(path)?.sync_all()?;
        }
        Ok(())
    }
}
