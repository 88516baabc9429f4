//! Merge-relevant storage settings.

/// Policy for rows carrying `is_deleted = 1` in Replacing mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CleanDeletedRows {
    /// Deleted rows survive unless the merge was asked to `cleanup`.
    #[default]
    Never,
    /// Deleted rows are always dropped when they win their group.
    Always,
    /// Defer to the per-merge `cleanup` flag.
    Auto,
}

/// Configure the operating parameters of the merge subsystem.
///
/// Defaults mirror production values; tests lower the vertical-merge
/// activation thresholds to exercise both algorithms.
#[derive(Clone, Debug)]
pub struct MergeSettings {
    /// 0/false disables the Vertical algorithm entirely.
    pub enable_vertical_merge_algorithm: bool,
    /// Minimum number of non-sort-key columns to consider Vertical.
    pub vertical_merge_algorithm_min_columns_to_activate: usize,
    /// Minimum total input rows to consider Vertical.
    pub vertical_merge_algorithm_min_rows_to_activate: u64,
    /// Above this total input size readers open files in direct-I/O mode.
    /// 0 disables the heuristic.
    pub min_merge_bytes_to_use_direct_io: u64,
    /// Target row count of blocks produced by the k-way merge.
    pub merge_max_block_size: usize,
    /// Columns whose default-value ratio meets this threshold are stored
    /// with the sparse codec.
    pub ratio_of_defaults_for_sparse_serialization: f64,
    /// Only consulted in Replacing mode.
    pub clean_deleted_rows: CleanDeletedRows,
    /// Gate for Vertical merges over mixed wide/compact sources.
    pub allow_vertical_merges_from_compact_to_wide_parts: bool,
    /// Master switch for reusing source parts' vector indexes.
    pub enable_decouple_vector_index: bool,
    /// Vertical-stage column-write pipelining depth; 0 flushes each column
    /// as soon as it is gathered.
    pub max_insert_delayed_streams_for_parallel_write: usize,
    /// Fsync the finalized part when at least this many rows were merged.
    pub min_rows_to_fsync_after_merge: u64,
    /// Fsync the finalized part when at least this many input bytes were
    /// merged.
    pub min_compressed_bytes_to_fsync_after_merge: u64,
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            enable_vertical_merge_algorithm: true,
            vertical_merge_algorithm_min_columns_to_activate: 11,
            vertical_merge_algorithm_min_rows_to_activate: 131_072,
            min_merge_bytes_to_use_direct_io: 10 * 1024 * 1024 * 1024,
            merge_max_block_size: 8192,
            ratio_of_defaults_for_sparse_serialization: 0.9375,
            clean_deleted_rows: CleanDeletedRows::Never,
            allow_vertical_merges_from_compact_to_wide_parts: true,
            enable_decouple_vector_index: false,
            max_insert_delayed_streams_for_parallel_write: 0,
            min_rows_to_fsync_after_merge: 0,
            min_compressed_bytes_to_fsync_after_merge: 0,
        }
    }
}

impl MergeSettings {
    pub fn with_vertical_thresholds(mut self, min_columns: usize, min_rows: u64) -> Self {
        self.vertical_merge_algorithm_min_columns_to_activate = min_columns;
        self.vertical_merge_algorithm_min_rows_to_activate = min_rows;
        self
    }

    pub fn with_decouple_vector_index(mut self, enabled: bool) -> Self {
        self.enable_decouple_vector_index = enabled;
        self
    }

    pub fn with_merge_max_block_size(mut self, rows: usize) -> Self {
        self.merge_max_block_size = rows;
        self
    }
}

/// I/O knobs handed to writers.
#[derive(Clone, Copy, Debug)]
pub struct WriteSettings {
    pub buffer_size: usize,
}

impl Default for WriteSettings {
    fn default() -> Self {
        Self { buffer_size: 4096 }
    }
}
