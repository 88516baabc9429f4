//! Builds source parts on disk.
//!
//! The merge core only consumes parts; this builder is the ingest-side
//! surface that materializes one (used heavily by tests). Rows are sorted
//! by the table's sort key before writing.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use roaring::RoaringTreemap;

use crate::error::Result;
use crate::part::checksums::hash_file;
use crate::part::ttl::TtlInfos;
use crate::part::writer::MergedBlockWriter;
use crate::part::{
    write_part_meta, MinMaxIndex, Part, PartInfo, PartMeta, PartStorageType, PartTransaction,
    PartType, LWD_MASK_FILE_NAME,
};
use crate::block::Block;
use crate::schema::StorageMetadata;
use crate::settings::MergeSettings;
use crate::value::Value;
use crate::vector::{index_file_names, VectorIndexState};

pub struct PartBuilder {
    data_dir: PathBuf,
    dir_name: Option<String>,
    metadata: Arc<StorageMetadata>,
    info: PartInfo,
    part_type: PartType,
    rows: Vec<Vec<Value>>,
    deleted_rows: Option<RoaringTreemap>,
    built_indexes: Vec<String>,
    ttl_uncomputed: bool,
    block_size: usize,
    projections: Vec<(String, Vec<Vec<Value>>)>,
}

impl PartBuilder {
    pub fn new(
        data_dir: impl Into<PathBuf>,
        metadata: Arc<StorageMetadata>,
        info: PartInfo,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            dir_name: None,
            metadata,
            info,
            part_type: PartType::Wide,
            rows: Vec::new(),
            deleted_rows: None,
            built_indexes: Vec::new(),
            ttl_uncomputed: false,
            block_size: 8192,
            projections: Vec::new(),
        }
    }

    /// Append one row in `metadata.columns` order.
    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.metadata.columns.len());
        self.rows.push(row);
    }

    pub fn with_rows(mut self, rows: Vec<Vec<Value>>) -> Self {
        for row in rows {
            self.push_row(row);
        }
        self
    }

    /// Mark original row offsets as lightweight-deleted.
    pub fn with_deleted_rows(mut self, rows: impl IntoIterator<Item = u64>) -> Self {
        let mask = self.deleted_rows.get_or_insert_with(RoaringTreemap::new);
        for row in rows {
            mask.insert(row);
        }
        self
    }

    /// Write placeholder index files and record the index as BUILT.
    pub fn with_built_vector_index(mut self, index_name: impl Into<String>) -> Self {
        self.built_indexes.push(index_name.into());
        self
    }

    /// Simulate a part written before the table's TTL existed.
    pub fn with_uncomputed_ttl(mut self) -> Self {
        self.ttl_uncomputed = true;
        self
    }

    pub fn with_part_type(mut self, part_type: PartType) -> Self {
        self.part_type = part_type;
        self
    }

    pub fn with_block_size(mut self, rows: usize) -> Self {
        self.block_size = rows.max(1);
        self
    }

    /// Attach a projection sub-part; `rows` follow the projection
    /// metadata's column order.
    pub fn with_projection_rows(mut self, name: impl Into<String>, rows: Vec<Vec<Value>>) -> Self {
        self.projections.push((name.into(), rows));
        self
    }

    fn with_dir_name(mut self, dir_name: String) -> Self {
        self.dir_name = Some(dir_name);
        self
    }

    pub fn finish(mut self) -> Result<Arc<Part>> {
        let dir_name = self
            .dir_name
            .clone()
            .unwrap_or_else(|| self.info.name());
        let mut txn = PartTransaction::begin(self.data_dir.join(dir_name))?;
        let dir = txn.path().to_path_buf();

        let key_positions: Vec<usize> = self
            .metadata
            .sort_key
            .iter()
            .filter_map(|name| self.metadata.columns.iter().position(|c| &c.name == name))
            .collect();
        self.rows
            .sort_by(|a, b| crate::block::compare_rows(a, b, &key_positions));

        let mut minmax = MinMaxIndex::default();
        for row in &self.rows {
            let key: Vec<Value> = key_positions.iter().map(|&i| row[i].clone()).collect();
            minmax.update(&key);
        }

        let tally_ttl = self.metadata.has_any_ttl() && !self.ttl_uncomputed;
        let header = self.metadata.physical_column_names();
        let mut writer = MergedBlockWriter::new(
            dir.clone(),
            self.metadata.columns.clone(),
            MergeSettings::default().ratio_of_defaults_for_sparse_serialization,
            tally_ttl.then(|| self.metadata.ttl.clone()),
        );
        for chunk in self.rows.chunks(self.block_size) {
            writer.write(&Block::from_rows(&header, chunk.to_vec()))?;
        }
        let written = writer.finalize(false)?;
        let mut checksums = written.checksums;

        if let Some(mask) = &self.deleted_rows {
            let path = dir.join(LWD_MASK_FILE_NAME);
            let mut file = File::create(&path)?;
            mask.serialize_into(&mut file)?;
            file.sync_all()?;
            let (size, hash) = hash_file(&path)?;
            checksums.add_file(LWD_MASK_FILE_NAME, size, hash);
        }

        let mut vector_index_states = std::collections::BTreeMap::new();
        for index_name in &self.built_indexes {
            for file_name in index_file_names(index_name) {
                let mut file = File::create(dir.join(&file_name))?;
                write!(file, "index {index_name} segment of {}", self.info.name())?;
            }
            vector_index_states.insert(index_name.clone(), VectorIndexState::Built);
        }

        for (name, rows) in std::mem::take(&mut self.projections) {
            let projection = self
                .metadata
                .projections
                .iter()
                .find(|p| p.name == name)
                .ok_or_else(|| {
                    crate::error::Error::BadArguments(format!("unknown projection {name}"))
                })?;
            PartBuilder::new(&dir, projection.metadata.clone(), PartInfo::new(0, 0, 0, 0))
                .with_rows(rows)
                .with_dir_name(format!("{name}.proj"))
                .finish()?;
        }

        let ttl_infos = if self.ttl_uncomputed {
            TtlInfos::default()
        } else {
            written.ttl_infos.unwrap_or(TtlInfos {
                computed: true,
                ..Default::default()
            })
        };

        let meta = PartMeta {
            info: self.info,
            part_type: self.part_type,
            storage_type: PartStorageType::Full,
            rows_count: written.rows,
            columns: self.metadata.columns.clone(),
            granules: written.granules,
            minmax: (!minmax.is_empty()).then_some(minmax),
            ttl_infos,
            expired_columns: Default::default(),
            vector_index_states,
            merged_source_parts: Vec::new(),
        };
        write_part_meta(&dir, &meta)?;
        checksums.write_to(&dir, crate::part::checksums::CHECKSUMS_FILE_NAME)?;

        txn.precommit();
        Ok(Arc::new(Part::load(dir)?))
    }
}
