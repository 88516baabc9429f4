//! Vector-index metadata carried by parts.
//!
//! The merge core never builds or searches ANN indexes. It moves their
//! files between parts, rewrites row IDs through forward/inverted maps,
//! pushes deleted-row bitmaps into source segments, and primes the
//! decouple cache so the first search after a merge pays no I/O.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use parking_lot::RwLock;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed engine-wide suffix of every vector-index related file.
pub const VECTOR_INDEX_FILE_SUFFIX: &str = ".vidx";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VectorIndexState {
    #[default]
    NotBuilt,
    Building,
    Built,
}

/// One entry of the merged-source-part record kept on a merged part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedPartNameAndId {
    pub name: String,
    pub source_index: usize,
    pub non_empty: bool,
}

pub fn index_data_file_name(index: &str) -> String {
    format!("{index}-idx_data{VECTOR_INDEX_FILE_SUFFIX}")
}

pub fn index_meta_file_name(index: &str) -> String {
    format!("{index}-idx_meta{VECTOR_INDEX_FILE_SUFFIX}")
}

/// Files making up one built index inside a part directory.
pub fn index_file_names(index: &str) -> [String; 2] {
    [index_data_file_name(index), index_meta_file_name(index)]
}

/// Name of a source file after it is moved into a decoupled part.
pub fn decoupled_index_file_name(source_index: usize, part_name: &str, original: &str) -> String {
    format!("merged-{source_index}-{part_name}-{original}")
}

pub fn inverted_row_ids_map_file_name() -> String {
    format!("merged-inverted_row_ids_map{VECTOR_INDEX_FILE_SUFFIX}")
}

pub fn inverted_row_sources_map_file_name() -> String {
    format!("merged-inverted_row_sources_map{VECTOR_INDEX_FILE_SUFFIX}")
}

pub fn forward_row_ids_map_file_name(source_index: usize, part_name: &str) -> String {
    format!("merged-{source_index}-{part_name}-row_ids_map{VECTOR_INDEX_FILE_SUFFIX}")
}

pub fn index_checksums_file_name(index: &str) -> String {
    format!("{index}-checksums{VECTOR_INDEX_FILE_SUFFIX}")
}

/// Cache key of one reused index segment inside a decoupled part.
pub fn segment_cache_key(source_index: usize, part_name: &str, index: &str) -> String {
    format!("{source_index}-{part_name}-{index}")
}

/// Row-ID maps of one reused segment, cached in memory.
#[derive(Clone, Debug)]
pub struct SegmentMaps {
    /// old local row -> new part row, `u64::MAX` for dead rows.
    pub forward: Vec<u64>,
    /// new part row -> old local row of the emitting source.
    pub inverted: Vec<u64>,
}

/// Per-part vector-index state.
///
/// `states` and `merged_source_parts` persist in the part metadata; the
/// bitmaps and cache are in-memory runtime state shared through `Arc<Part>`.
#[derive(Debug, Default)]
pub struct VectorIndexMeta {
    pub states: BTreeMap<String, VectorIndexState>,
    pub merged_source_parts: Vec<MergedPartNameAndId>,
    pub(crate) delete_bitmaps: RwLock<HashMap<String, RoaringTreemap>>,
    pub(crate) decouple_cache: RwLock<HashMap<String, SegmentMaps>>,
}

impl VectorIndexMeta {
    pub fn state(&self, index: &str) -> VectorIndexState {
        self.states.get(index).copied().unwrap_or_default()
    }

    /// Push deleted row IDs into a segment's bitmap. Idempotent; later
    /// searches over the old segment honor the bitmap.
    pub fn add_deleted_rows(&self, index: &str, rows: &[u64]) {
        if rows.is_empty() {
            return;
        }
        let mut bitmaps = self.delete_bitmaps.write();
        let bitmap = bitmaps.entry(index.to_string()).or_default();
        for &row in rows {
            bitmap.insert(row);
        }
    }

    pub fn deleted_rows(&self, index: &str) -> Option<RoaringTreemap> {
        self.delete_bitmaps.read().get(index).cloned()
    }

    pub fn prime_decouple_cache(&self, segment_key: String, maps: SegmentMaps) {
        self.decouple_cache.write().insert(segment_key, maps);
    }

    pub fn cached_segment(&self, segment_key: &str) -> Option<SegmentMaps> {
        self.decouple_cache.read().get(segment_key).cloned()
    }
}

/// Read an ASCII row-ID map: decimal u64 values, each followed by `\t`.
pub fn read_row_ids_map(path: &Path) -> Result<Vec<u64>> {
    let text = std::fs::read_to_string(path)?;
    if !text.is_empty() && !text.ends_with('\t') {
        return Err(Error::corrupted(format!(
            "row ids map {} is truncated",
            path.display()
        )));
    }
    text.split_terminator('\t')
        .map(|field| {
            field.parse::<u64>().map_err(|_| {
                Error::corrupted(format!("bad value {field:?} in {}", path.display()))
            })
        })
        .collect()
}
