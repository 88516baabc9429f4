//! Immutable data parts and the plan objects that merge them.

pub mod builder;
pub mod checksums;
pub(crate) mod codec;
pub(crate) mod reader;
pub mod ttl;
pub(crate) mod writer;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::ColumnDesc;
use crate::value::Value;
use crate::vector::{MergedPartNameAndId, VectorIndexMeta, VectorIndexState};
use checksums::{Checksums, CHECKSUMS_FILE_NAME};
use ttl::TtlInfos;

pub const META_FILE_NAME: &str = "meta.json";
pub const LWD_MASK_FILE_NAME: &str = "deleted_rows.bitmap";

/// Synthetic column exposing the original row offset of each surviving row.
pub(crate) const PART_OFFSET_COLUMN: &str = "_part_offset";

pub(crate) fn column_file_name(column: &str) -> String {
    format!("{column}.col")
}

/// Part identity within a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartInfo {
    pub min_block: u64,
    pub max_block: u64,
    pub level: u32,
    pub mutation: u64,
}

impl PartInfo {
    pub fn new(min_block: u64, max_block: u64, level: u32, mutation: u64) -> Self {
        Self {
            min_block,
            max_block,
            level,
            mutation,
        }
    }

    pub fn name(&self) -> String {
        format!(
            "all_{}_{}_{}_{}",
            self.min_block, self.max_block, self.level, self.mutation
        )
    }

    /// Identity covering a consecutive run of source parts, one level up.
    pub fn covering(parts: &[PartInfo]) -> PartInfo {
        let min_block = parts.iter().map(|p| p.min_block).min().unwrap_or(0);
        let max_block = parts.iter().map(|p| p.max_block).max().unwrap_or(0);
        let level = parts.iter().map(|p| p.level).max().unwrap_or(0) + 1;
        let mutation = parts.iter().map(|p| p.mutation).max().unwrap_or(0);
        PartInfo::new(min_block, max_block, level, mutation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartType {
    Wide,
    Compact,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartStorageType {
    Full,
    Packed,
}

/// Why this merge was scheduled; TTL merges obey the TTL blocker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeType {
    Regular,
    TtlDelete,
}

/// Per-sort-key-column `(min, max)` ranges.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MinMaxIndex {
    pub ranges: Vec<(Value, Value)>,
}

impl MinMaxIndex {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn update(&mut self, key: &[Value]) {
        if self.ranges.is_empty() {
            self.ranges = key.iter().map(|v| (v.clone(), v.clone())).collect();
            return;
        }
        debug_assert_eq!(self.ranges.len(), key.len());
        for (range, value) in self.ranges.iter_mut().zip(key) {
            if *value < range.0 {
                range.0 = value.clone();
            }
            if *value > range.1 {
                range.1 = value.clone();
            }
        }
    }

    pub fn merge(&mut self, other: &MinMaxIndex) {
        if other.is_empty() {
            return;
        }
        if self.ranges.is_empty() {
            self.ranges = other.ranges.clone();
            return;
        }
        debug_assert_eq!(self.ranges.len(), other.ranges.len());
        for (ours, theirs) in self.ranges.iter_mut().zip(&other.ranges) {
            if theirs.0 < ours.0 {
                ours.0 = theirs.0.clone();
            }
            if theirs.1 > ours.1 {
                ours.1 = theirs.1.clone();
            }
        }
    }
}

/// Persisted part metadata (`meta.json`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct PartMeta {
    pub info: PartInfo,
    pub part_type: PartType,
    pub storage_type: PartStorageType,
    pub rows_count: u64,
    pub columns: Vec<ColumnDesc>,
    pub granules: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minmax: Option<MinMaxIndex>,
    #[serde(default)]
    pub ttl_infos: TtlInfos,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub expired_columns: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vector_index_states: BTreeMap<String, VectorIndexState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_source_parts: Vec<MergedPartNameAndId>,
}

pub(crate) fn write_part_meta(dir: &Path, meta: &PartMeta) -> Result<()> {
    let file = File::create(dir.join(META_FILE_NAME))?;
    serde_json::to_writer_pretty(&file, meta)?;
    file.sync_all()?;
    Ok(())
}

/// An immutable, append-once unit of stored rows.
#[derive(Debug)]
pub struct Part {
    pub info: PartInfo,
    pub name: String,
    pub path: PathBuf,
    pub part_type: PartType,
    pub storage_type: PartStorageType,
    pub rows_count: u64,
    pub columns: Vec<ColumnDesc>,
    pub granules: Vec<u64>,
    pub minmax: Option<MinMaxIndex>,
    pub ttl_infos: TtlInfos,
    pub expired_columns: BTreeSet<String>,
    pub checksums: Checksums,
    pub deleted_rows: Option<RoaringTreemap>,
    pub projections: HashMap<String, Arc<Part>>,
    pub vector_index: VectorIndexMeta,
}

impl Part {
    /// Load a part directory written by the builder or a finished merge.
    pub fn load(path: impl Into<PathBuf>) -> Result<Part> {
        let path = path.into();
        let meta_bytes = std::fs::read(path.join(META_FILE_NAME))?;
        let meta: PartMeta = serde_json::from_slice(&meta_bytes)?;
        let checksums = Checksums::read_from(&path.join(CHECKSUMS_FILE_NAME))?;

        let mask_path = path.join(LWD_MASK_FILE_NAME);
        let deleted_rows = if mask_path.exists() {
            let file = File::open(&mask_path)?;
            Some(
                RoaringTreemap::deserialize_from(file)
                    .map_err(|e| Error::corrupted(format!("bad delete mask: {e}")))?,
            )
        } else {
            None
        };

        let mut projections = HashMap::new();
        for entry in std::fs::read_dir(&path)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let entry_name = file_name.to_string_lossy();
            if entry.file_type()?.is_dir() {
                if let Some(projection_name) = entry_name.strip_suffix(".proj") {
                    let projection = Part::load(entry.path())?;
                    projections.insert(projection_name.to_string(), Arc::new(projection));
                }
            }
        }

        Ok(Part {
            info: meta.info,
            name: meta.info.name(),
            path,
            part_type: meta.part_type,
            storage_type: meta.storage_type,
            rows_count: meta.rows_count,
            columns: meta.columns,
            granules: meta.granules,
            minmax: meta.minmax,
            ttl_infos: meta.ttl_infos,
            expired_columns: meta.expired_columns,
            checksums,
            deleted_rows,
            projections,
            vector_index: VectorIndexMeta {
                states: meta.vector_index_states,
                merged_source_parts: meta.merged_source_parts,
                ..Default::default()
            },
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rows_count == 0
    }

    pub fn has_lightweight_delete(&self) -> bool {
        self.deleted_rows
            .as_ref()
            .map_or(false, |mask| !mask.is_empty())
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.checksums.total_size()
    }

    pub fn column_size_on_disk(&self, column: &str) -> u64 {
        self.checksums
            .file_size(&column_file_name(column))
            .unwrap_or(0)
    }

    pub(crate) fn accumulate_column_sizes(&self, sizes: &mut BTreeMap<String, u64>) {
        for column in &self.columns {
            *sizes.entry(column.name.clone()).or_insert(0) +=
                self.column_size_on_disk(&column.name);
        }
    }

    pub fn column_desc(&self, name: &str) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Materialize the part's rows for the given columns (all physical
    /// columns when `None`), with the delete mask applied.
    pub fn read_rows(&self, columns: Option<&[String]>) -> Result<Vec<Vec<Value>>> {
        let descs: Vec<ColumnDesc> = match columns {
            None => self.columns.clone(),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.column_desc(name).cloned().ok_or_else(|| {
                        Error::BadArguments(format!("part {} has no column {name}", self.name))
                    })
                })
                .collect::<Result<_>>()?,
        };
        let mut reader =
            reader::PartReader::new(self, &descs, self.rows_count.max(1) as usize, false, None)?;
        let mut rows = Vec::new();
        while let Some(block) = reader.read_block() {
            for i in 0..block.rows() {
                rows.push(block.row(i));
            }
        }
        Ok(rows)
    }
}

/// Plan object naming the new part and listing the ordered input parts.
///
/// Sources are numbered `0..N-1`; this numbering is the `source_num` used
/// by the row-source stream and the row-ID maps.
#[derive(Clone, Debug)]
pub struct FuturePart {
    pub info: PartInfo,
    pub name: String,
    pub part_type: PartType,
    pub storage_type: PartStorageType,
    pub merge_type: MergeType,
    pub parts: Vec<Arc<Part>>,
}

impl FuturePart {
    pub fn new(info: PartInfo, parts: Vec<Arc<Part>>) -> Self {
        Self {
            info,
            name: info.name(),
            part_type: PartType::Wide,
            storage_type: PartStorageType::Full,
            merge_type: MergeType::Regular,
            parts,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_merge_type(mut self, merge_type: MergeType) -> Self {
        self.merge_type = merge_type;
        self
    }

    pub fn with_part_type(mut self, part_type: PartType) -> Self {
        self.part_type = part_type;
        self
    }

    pub fn total_rows(&self) -> u64 {
        self.parts.iter().map(|p| p.rows_count).sum()
    }

    pub fn total_bytes_on_disk(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes_on_disk()).sum()
    }
}

/// Exclusive ownership of a part directory under construction.
///
/// The directory is removed on drop unless the transaction was
/// pre-committed.
#[derive(Debug)]
pub struct PartTransaction {
    path: PathBuf,
    committed: bool,
}

impl PartTransaction {
    pub fn begin(path: PathBuf) -> Result<Self> {
        if path.exists() {
            return Err(Error::DirectoryAlreadyExists(path));
        }
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn precommit(&mut self) {
        self.committed = true;
    }
}

impl Drop for PartTransaction {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_info_naming_and_covering() {
        let a = PartInfo::new(1, 3, 1, 0);
        let b = PartInfo::new(4, 7, 2, 5);
        assert_eq!(a.name(), "all_1_3_1_0");
        let merged = PartInfo::covering(&[a, b]);
        assert_eq!(merged, PartInfo::new(1, 7, 3, 5));
    }

    #[test]
    fn transaction_cleans_up_unless_committed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("tmp_merge_all_1_1_1_0");
        {
            let _txn = PartTransaction::begin(target.clone()).unwrap();
            assert!(target.exists());
        }
        assert!(!target.exists());

        let mut txn = PartTransaction::begin(target.clone()).unwrap();
        txn.precommit();
        drop(txn);
        assert!(target.exists());

        assert!(matches!(
            PartTransaction::begin(target),
            Err(Error::DirectoryAlreadyExists(_))
        ));
    }

    #[test]
    fn minmax_merge_widens() {
        let mut a = MinMaxIndex::default();
        a.update(&[Value::UInt64(3)]);
        a.update(&[Value::UInt64(5)]);
        let mut b = MinMaxIndex::default();
        b.update(&[Value::UInt64(1)]);
        a.merge(&b);
        assert_eq!(a.ranges, vec![(Value::UInt64(1), Value::UInt64(5))]);
    }
}
