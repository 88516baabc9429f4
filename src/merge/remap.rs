//! Vector-index remapping: row-ID maps, index file moves, per-index
//! checksums and decouple-cache priming for merged parts that reuse their
//! sources' prebuilt ANN indexes.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::logging::strata_log;
use crate::merge::row_sources::RowSourcesFile;
use crate::merge::task::GlobalCtx;
use crate::part::checksums::{hash_file, Checksums, HashingReader};
use crate::part::reader::PartReader;
use crate::part::{Part, PartStorageType, PART_OFFSET_COLUMN};
use crate::schema::{ColumnDesc, MergeMode};
use crate::vector::{
    decoupled_index_file_name, forward_row_ids_map_file_name, index_checksums_file_name,
    index_file_names, inverted_row_ids_map_file_name, inverted_row_sources_map_file_name,
    read_row_ids_map, segment_cache_key, SegmentMaps,
};

/// Sentinel marking a row that did not survive the merge.
const DEAD_ROW: u64 = u64::MAX;

fn write_map_value(out: &mut BufWriter<File>, value: u64) -> Result<()> {
    write!(out, "{value}\t")?;
    Ok(())
}

/// Replay the row-source stream and materialize the inverted and forward
/// row-ID maps inside the new part directory.
///
/// For every source `s` a cursor counts rows consumed from `s`; the
/// original offset comes from a prior `_part_offset` pass, which accounts
/// for rows the sort-key reads skipped (lightweight deletes). Dead rows of
/// row-dropping modes are additionally pushed into each source segment's
/// delete bitmap.
pub(crate) fn generate_row_ids_maps(g: &GlobalCtx, rows_sources: &RowSourcesFile) -> Result<()> {
    let parts = &g.params.future_part.parts;
    let metadata = &g.params.metadata;
    for part in parts {
        if part.storage_type != PartStorageType::Full {
            return Err(Error::BadArguments(format!(
                "unsupported part storage of {}",
                part.name
            )));
        }
    }

    let primary_key_columns: Vec<ColumnDesc> = metadata
        .sort_key
        .iter()
        .filter_map(|name| metadata.column(name).cloned())
        .collect();
    let block_size = g.params.settings.merge_max_block_size;
    let mut part_offsets: Vec<Vec<u64>> = Vec::with_capacity(parts.len());
    for part in parts {
        if part.is_empty() {
            part_offsets.push(Vec::new());
            continue;
        }
        let mut reader = PartReader::new(part, &primary_key_columns, block_size, true, None)?;
        let mut offsets = Vec::new();
        while let Some(block) = reader.read_block() {
            let column = block.column(PART_OFFSET_COLUMN).ok_or_else(|| {
                Error::logical("part offset pass lost the _part_offset column")
            })?;
            for value in &column.data {
                offsets.push(value.as_u64().ok_or_else(|| {
                    Error::logical("_part_offset column holds a non-integer")
                })?);
            }
        }
        part_offsets.push(offsets);
    }

    strata_log!(
        log::Level::Debug,
        "row_ids_maps",
        "replaying rows_sources file {} with {} records",
        rows_sources.path.display(),
        rows_sources.count
    );

    let dir = g.new_part_dir()?;
    let buffer_size = g.params.write_settings.buffer_size.max(64);
    let mut reader = rows_sources.open_reader()?;
    let mut inverted = BufWriter::with_capacity(
        buffer_size,
        File::create(dir.join(inverted_row_ids_map_file_name()))?,
    );
    let mut source_row_cursor = vec![0usize; parts.len()];
    let mut parts_new_row_ids: Vec<Vec<u64>> = parts
        .iter()
        .map(|part| vec![DEAD_ROW; part.rows_count as usize])
        .collect();

    let mut new_row_id: u64 = 0;
    while let Some(record) = reader.next()? {
        let source = record.source_num();
        if source >= parts.len() {
            return Err(Error::logical(format!(
                "row sources name source {source}, merge has {} parts",
                parts.len()
            )));
        }
        if !record.skip_flag() {
            let cursor = source_row_cursor[source];
            let old_offset = *part_offsets[source].get(cursor).ok_or_else(|| {
                Error::logical(format!(
                    "row sources overran the offsets of source {source}"
                ))
            })?;
            parts_new_row_ids[source][old_offset as usize] = new_row_id;
            write_map_value(&mut inverted, old_offset)?;
            new_row_id += 1;
        }
        source_row_cursor[source] += 1;
    }
    inverted.flush()?;
    inverted.get_ref().sync_all()?;

    let drops_rows = matches!(
        g.params.merging_params.mode,
        MergeMode::Collapsing | MergeMode::Replacing | MergeMode::VersionedCollapsing
    );
    for (source, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        let path = dir.join(forward_row_ids_map_file_name(source, &part.name));
        let mut forward = BufWriter::with_capacity(buffer_size, File::create(path)?);
        let mut delete_row_ids: Vec<u64> = Vec::new();
        for (old_row, &mapped) in parts_new_row_ids[source].iter().enumerate() {
            write_map_value(&mut forward, mapped)?;
            if mapped == DEAD_ROW && drops_rows {
                delete_row_ids.push(old_row as u64);
            }
        }
        forward.flush()?;
        forward.get_ref().sync_all()?;

        if !delete_row_ids.is_empty() {
            for index in &metadata.vector_indices {
                part.vector_index.add_deleted_rows(&index.name, &delete_row_ids);
            }
        }
    }
    Ok(())
}

fn move_vector_index_files(
    decouple: bool,
    source_index: usize,
    old_part: &Part,
    index_name: &str,
    new_dir: &Path,
) -> Result<Checksums> {
    let mut checksums = Checksums::default();
    for file_name in index_file_names(index_name) {
        let src = old_part.path.join(&file_name);
        let file = File::open(&src).map_err(|_| {
            Error::corrupted(format!(
                "index file {file_name} is missing from part {}",
                old_part.name
            ))
        })?;
        let dest_name = if decouple {
            decoupled_index_file_name(source_index, &old_part.name, &file_name)
        } else {
            file_name.clone()
        };
        let mut reader = HashingReader::new(BufReader::new(file));
        let mut out = File::create(new_dir.join(&dest_name))?;
        std::io::copy(&mut reader, &mut out)?;
        out.sync_all()?;
        checksums.add_file(dest_name, reader.count(), reader.digest());
    }
    Ok(checksums)
}

/// Move every reusable source index into the new part, persist the
/// row-source stream next to the maps, and write one checksums file per
/// index covering all of it. Returns the decoupled index names.
pub(crate) fn finalize_decouple(
    g: &GlobalCtx,
    dir: &Path,
    rows_sources: &RowSourcesFile,
) -> Result<Vec<String>> {
    let parts = &g.params.future_part.parts;
    let mut per_index: BTreeMap<String, Checksums> = BTreeMap::new();
    for index in &g.params.metadata.vector_indices {
        if g.all_parts_have_vector_index.get(&index.name) != Some(&true) {
            continue;
        }
        let mut checksums = Checksums::default();
        for (source, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            checksums.add(move_vector_index_files(true, source, part, &index.name, dir)?);
        }
        per_index.insert(index.name.clone(), checksums);
    }

    std::fs::copy(&rows_sources.path, dir.join(inverted_row_sources_map_file_name()))?;

    let mut map_files = vec![
        inverted_row_sources_map_file_name(),
        inverted_row_ids_map_file_name(),
    ];
    for (source, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        map_files.push(forward_row_ids_map_file_name(source, &part.name));
    }
    let mut hashed = Vec::with_capacity(map_files.len());
    for name in &map_files {
        let (size, hash) = hash_file(&dir.join(name))?;
        hashed.push((name.clone(), size, hash));
    }

    let mut index_names = Vec::with_capacity(per_index.len());
    for (index_name, mut checksums) in per_index {
        for (name, size, hash) in &hashed {
            checksums.add_file(name.clone(), *size, *hash);
        }
        checksums.write_to(dir, &index_checksums_file_name(&index_name))?;
        index_names.push(index_name);
    }
    Ok(index_names)
}

/// Single reused index, no lightweight deletes: the new part is a plain
/// VPart. Index files keep their names and no row-ID maps exist.
pub(crate) fn finalize_single_vpart(g: &GlobalCtx, dir: &Path) -> Result<()> {
    let old_part = &g.params.future_part.parts[g.first_part_with_data];
    for index in &g.params.metadata.vector_indices {
        if g.all_parts_have_vector_index.get(&index.name) != Some(&true) {
            continue;
        }
        let checksums = move_vector_index_files(false, 0, old_part, &index.name, dir)?;
        checksums.write_to(dir, &index_checksums_file_name(&index.name))?;
    }
    Ok(())
}

/// Load the freshly written row-ID maps into the new part's decouple
/// cache so the first search pays no I/O.
pub(crate) fn prime_decouple_cache(part: &Part, index_names: &[String]) -> Result<()> {
    if index_names.is_empty() {
        return Ok(());
    }
    let inverted = read_row_ids_map(&part.path.join(inverted_row_ids_map_file_name()))?;
    for entry in &part.vector_index.merged_source_parts {
        if !entry.non_empty {
            continue;
        }
        let forward = read_row_ids_map(
            &part
                .path
                .join(forward_row_ids_map_file_name(entry.source_index, &entry.name)),
        )?;
        for index_name in index_names {
            part.vector_index.prime_decouple_cache(
                segment_cache_key(entry.source_index, &entry.name, index_name),
                SegmentMaps {
                    forward: forward.clone(),
                    inverted: inverted.clone(),
                },
            );
        }
    }
    Ok(())
}
