//! End-to-end merge scenarios over real part directories.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use strata::block::compare_rows;
use strata::merge::{ActionBlocker, MergeAlgorithm, MergeTask, MergeTaskParams};
use strata::part::builder::PartBuilder;
use strata::part::checksums::Checksums;
use strata::part::{FuturePart, Part, PartInfo};
use strata::schema::{
    ColumnDesc, MergeMode, MergingParams, ProjectionDesc, ProjectionKind, StorageMetadata,
    TtlExpression, VectorIndexDesc,
};
use strata::settings::{CleanDeletedRows, MergeSettings};
use strata::value::{DataType, Value};
use strata::vector::{
    forward_row_ids_map_file_name, index_checksums_file_name, inverted_row_ids_map_file_name,
    inverted_row_sources_map_file_name, read_row_ids_map, segment_cache_key,
};
use strata::Error;

fn kv_metadata() -> Arc<StorageMetadata> {
    Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("v", DataType::String),
        ],
        sort_key: vec!["k".to_string()],
        ..Default::default()
    })
}

fn indexed_metadata() -> Arc<StorageMetadata> {
    Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("v", DataType::String),
        ],
        sort_key: vec!["k".to_string()],
        vector_indices: vec![VectorIndexDesc {
            name: "v_idx".to_string(),
            column: "v".to_string(),
        }],
        ..Default::default()
    })
}

fn row(k: u64, v: &str) -> Vec<Value> {
    vec![Value::UInt64(k), Value::String(v.to_string())]
}

fn build_kv_part(
    dir: &Path,
    metadata: &Arc<StorageMetadata>,
    info: PartInfo,
    rows: Vec<Vec<Value>>,
    built_index: bool,
) -> Arc<Part> {
    let mut builder = PartBuilder::new(dir, metadata.clone(), info).with_rows(rows);
    if built_index {
        builder = builder.with_built_vector_index("v_idx");
    }
    builder.finish().unwrap()
}

fn merge_params(
    parts: Vec<Arc<Part>>,
    metadata: Arc<StorageMetadata>,
    data_dir: &Path,
) -> MergeTaskParams {
    let infos: Vec<PartInfo> = parts.iter().map(|p| p.info).collect();
    let future = FuturePart::new(PartInfo::covering(&infos), parts);
    MergeTaskParams::new(future, metadata, data_dir, 1_000_000)
}

#[test]
fn two_source_ordinary_merge_produces_row_id_maps() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = indexed_metadata();
    let a = build_kv_part(
        dir.path(),
        &metadata,
        PartInfo::new(1, 1, 0, 0),
        vec![row(1, "a"), row(3, "c")],
        true,
    );
    let b = build_kv_part(
        dir.path(),
        &metadata,
        PartInfo::new(2, 2, 0, 0),
        vec![row(2, "b"), row(4, "d")],
        true,
    );
    let a_name = a.name.clone();
    let b_name = b.name.clone();

    let mut params = merge_params(vec![a, b], metadata, dir.path());
    params.settings = Arc::new(MergeSettings::default().with_decouple_vector_index(true));
    let mut task = MergeTask::new(params);
    let part = task.run_to_completion().unwrap();

    assert_eq!(
        part.read_rows(None).unwrap(),
        vec![row(1, "a"), row(2, "b"), row(3, "c"), row(4, "d")]
    );

    let forward_a =
        read_row_ids_map(&part.path.join(forward_row_ids_map_file_name(0, &a_name))).unwrap();
    let forward_b =
        read_row_ids_map(&part.path.join(forward_row_ids_map_file_name(1, &b_name))).unwrap();
    assert_eq!(forward_a, vec![0, 2]);
    assert_eq!(forward_b, vec![1, 3]);

    let inverted =
        read_row_ids_map(&part.path.join(inverted_row_ids_map_file_name())).unwrap();
    assert_eq!(inverted, vec![0, 0, 1, 1]);

    let stream =
        std::fs::read(part.path.join(inverted_row_sources_map_file_name())).unwrap();
    assert_eq!(stream, vec![0x00, 0x01, 0x00, 0x01]);

    // The per-index checksums file lists exactly the moved index files and
    // all three kinds of map files.
    let checksums =
        Checksums::read_from(&part.path.join(index_checksums_file_name("v_idx"))).unwrap();
    let mut expected: Vec<String> = vec![
        format!("merged-0-{a_name}-v_idx-idx_data.vidx"),
        format!("merged-0-{a_name}-v_idx-idx_meta.vidx"),
        format!("merged-1-{b_name}-v_idx-idx_data.vidx"),
        format!("merged-1-{b_name}-v_idx-idx_meta.vidx"),
        forward_row_ids_map_file_name(0, &a_name),
        forward_row_ids_map_file_name(1, &b_name),
        inverted_row_ids_map_file_name(),
        inverted_row_sources_map_file_name(),
    ];
    expected.sort();
    let listed: Vec<String> = checksums.files.keys().cloned().collect();
    assert_eq!(listed, expected);
    for (name, sum) in &checksums.files {
        assert_eq!(
            sum.size,
            std::fs::metadata(part.path.join(name)).unwrap().len()
        );
    }

    // The decouple cache was primed for both segments.
    let cached = part
        .vector_index
        .cached_segment(&segment_cache_key(0, &a_name, "v_idx"))
        .unwrap();
    assert_eq!(cached.forward, vec![0, 2]);
    assert_eq!(cached.inverted, vec![0, 0, 1, 1]);
    assert!(part
        .vector_index
        .cached_segment(&segment_cache_key(1, &b_name, "v_idx"))
        .is_some());
}

#[test]
fn collapsing_cancels_balanced_sign_groups() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("sign", DataType::Int64),
            ColumnDesc::new("x", DataType::String),
        ],
        sort_key: vec!["k".to_string()],
        vector_indices: vec![VectorIndexDesc {
            name: "v_idx".to_string(),
            column: "x".to_string(),
        }],
        ..Default::default()
    });
    let sign_row = |k: u64, sign: i64, x: &str| {
        vec![
            Value::UInt64(k),
            Value::Int64(sign),
            Value::String(x.to_string()),
        ]
    };
    let a = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(1, 1, 0, 0))
        .with_rows(vec![sign_row(1, 1, "a1"), sign_row(2, 1, "a2")])
        .with_built_vector_index("v_idx")
        .finish()
        .unwrap();
    let b = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(2, 2, 0, 0))
        .with_rows(vec![sign_row(1, -1, "b1"), sign_row(3, 1, "b2")])
        .with_built_vector_index("v_idx")
        .finish()
        .unwrap();
    let (a_name, b_name) = (a.name.clone(), b.name.clone());

    let mut params = merge_params(vec![a.clone(), b.clone()], metadata, dir.path());
    params.settings = Arc::new(MergeSettings::default().with_decouple_vector_index(true));
    params.merging_params = MergingParams {
        sign_column: Some("sign".to_string()),
        ..MergingParams::with_mode(MergeMode::Collapsing)
    };
    let mut task = MergeTask::new(params);
    let part = task.run_to_completion().unwrap();

    assert_eq!(
        part.read_rows(Some(&["k".to_string(), "sign".to_string()])).unwrap(),
        vec![
            vec![Value::UInt64(2), Value::Int64(1)],
            vec![Value::UInt64(3), Value::Int64(1)],
        ]
    );

    // Stream replays as: A skipped, B skipped, A emitted, B emitted.
    let stream =
        std::fs::read(part.path.join(inverted_row_sources_map_file_name())).unwrap();
    assert_eq!(stream, vec![0x80, 0x81, 0x00, 0x01]);

    let forward_a =
        read_row_ids_map(&part.path.join(forward_row_ids_map_file_name(0, &a_name))).unwrap();
    let forward_b =
        read_row_ids_map(&part.path.join(forward_row_ids_map_file_name(1, &b_name))).unwrap();
    assert_eq!(forward_a, vec![u64::MAX, 0]);
    assert_eq!(forward_b, vec![u64::MAX, 1]);
    assert_eq!(
        read_row_ids_map(&part.path.join(inverted_row_ids_map_file_name())).unwrap(),
        vec![1, 1]
    );

    // Cancelled rows were pushed into the sources' delete bitmaps.
    let bitmap_a = a.vector_index.deleted_rows("v_idx").unwrap();
    assert!(bitmap_a.contains(0) && bitmap_a.len() == 1);
    let bitmap_b = b.vector_index.deleted_rows("v_idx").unwrap();
    assert!(bitmap_b.contains(0) && bitmap_b.len() == 1);
}

#[test]
fn replacing_keeps_the_greatest_version() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("ver", DataType::UInt64),
            ColumnDesc::new("x", DataType::String),
        ],
        sort_key: vec!["k".to_string()],
        vector_indices: vec![VectorIndexDesc {
            name: "v_idx".to_string(),
            column: "x".to_string(),
        }],
        ..Default::default()
    });
    let vrow = |k: u64, ver: u64, x: &str| {
        vec![
            Value::UInt64(k),
            Value::UInt64(ver),
            Value::String(x.to_string()),
        ]
    };
    let a = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(1, 1, 0, 0))
        .with_rows(vec![vrow(1, 5, "old")])
        .with_built_vector_index("v_idx")
        .finish()
        .unwrap();
    let b = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(2, 2, 0, 0))
        .with_rows(vec![vrow(1, 7, "new")])
        .with_built_vector_index("v_idx")
        .finish()
        .unwrap();
    let (a_name, b_name) = (a.name.clone(), b.name.clone());

    let mut params = merge_params(vec![a, b], metadata, dir.path());
    params.settings = Arc::new(MergeSettings::default().with_decouple_vector_index(true));
    params.merging_params = MergingParams {
        version_column: Some("ver".to_string()),
        ..MergingParams::with_mode(MergeMode::Replacing)
    };
    let mut task = MergeTask::new(params);
    let part = task.run_to_completion().unwrap();

    assert_eq!(part.read_rows(None).unwrap(), vec![vrow(1, 7, "new")]);
    assert_eq!(
        read_row_ids_map(&part.path.join(forward_row_ids_map_file_name(0, &a_name))).unwrap(),
        vec![u64::MAX]
    );
    assert_eq!(
        read_row_ids_map(&part.path.join(forward_row_ids_map_file_name(1, &b_name))).unwrap(),
        vec![0]
    );
}

#[test]
fn replacing_cleanup_truth_table() {
    let metadata = Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("ver", DataType::UInt64),
            ColumnDesc::new("is_deleted", DataType::UInt64),
        ],
        sort_key: vec!["k".to_string()],
        ..Default::default()
    });
    let drow = |k: u64, ver: u64, deleted: u64| {
        vec![
            Value::UInt64(k),
            Value::UInt64(ver),
            Value::UInt64(deleted),
        ]
    };

    for (clean_deleted_rows, cleanup, expect_rows) in [
        (CleanDeletedRows::Never, false, 1),
        (CleanDeletedRows::Never, true, 0),
        (CleanDeletedRows::Always, false, 0),
        (CleanDeletedRows::Auto, false, 1),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let a = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(1, 1, 0, 0))
            .with_rows(vec![drow(1, 1, 0)])
            .finish()
            .unwrap();
        let b = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(2, 2, 0, 0))
            .with_rows(vec![drow(1, 2, 1)])
            .finish()
            .unwrap();

        let mut params = merge_params(vec![a, b], metadata.clone(), dir.path());
        params.settings = Arc::new(MergeSettings {
            clean_deleted_rows,
            ..MergeSettings::default()
        });
        params.cleanup = cleanup;
        params.merging_params = MergingParams {
            version_column: Some("ver".to_string()),
            is_deleted_column: Some("is_deleted".to_string()),
            ..MergingParams::with_mode(MergeMode::Replacing)
        };
        let part = MergeTask::new(params).run_to_completion().unwrap();
        assert_eq!(
            part.rows_count, expect_rows,
            "clean_deleted_rows={clean_deleted_rows:?} cleanup={cleanup}"
        );
    }
}

#[test]
fn ttl_drops_matured_rows() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("ts", DataType::UInt64),
        ],
        sort_key: vec!["k".to_string()],
        ttl: strata::schema::TtlDescription {
            row_ttl: Some(TtlExpression {
                column: "ts".to_string(),
                delta_seconds: 100,
            }),
            column_ttls: BTreeMap::new(),
        },
        ..Default::default()
    });
    let trow = |k: u64, ts: u64| vec![Value::UInt64(k), Value::UInt64(ts)];
    let part = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(1, 1, 0, 0))
        .with_rows(vec![trow(1, 10), trow(2, 1_000)])
        .finish()
        .unwrap();

    let future = FuturePart::new(PartInfo::new(1, 1, 1, 0), vec![part]);
    let mut params = MergeTaskParams::new(future, metadata, dir.path(), 500);
    params.merging_params = MergingParams::ordinary();
    let mut task = MergeTask::new(params);
    let merged = task.run_to_completion().unwrap();

    assert_eq!(merged.rows_count, 1);
    assert_eq!(merged.read_rows(None).unwrap(), vec![trow(2, 1_000)]);
    assert_eq!(task.input_rows_filtered(), 1);
    assert_eq!(task.algorithm(), Some(MergeAlgorithm::Horizontal));
}

#[test]
fn fully_expired_column_materializes_as_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("ts", DataType::UInt64),
            ColumnDesc::new("x", DataType::String),
        ],
        sort_key: vec!["k".to_string()],
        ttl: strata::schema::TtlDescription {
            row_ttl: None,
            column_ttls: BTreeMap::from([(
                "x".to_string(),
                TtlExpression {
                    column: "ts".to_string(),
                    delta_seconds: 10,
                },
            )]),
        },
        ..Default::default()
    });
    let xrow = |k: u64, ts: u64, x: &str| {
        vec![
            Value::UInt64(k),
            Value::UInt64(ts),
            Value::String(x.to_string()),
        ]
    };
    let part = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(1, 1, 0, 0))
        .with_rows(vec![xrow(1, 10, "gone"), xrow(2, 20, "also gone")])
        .finish()
        .unwrap();

    let future = FuturePart::new(PartInfo::new(1, 1, 1, 0), vec![part]);
    let params = MergeTaskParams::new(future, metadata, dir.path(), 1_000);
    let merged = MergeTask::new(params).run_to_completion().unwrap();

    assert!(merged.expired_columns.contains("x"));
    assert_eq!(
        merged.read_rows(None).unwrap(),
        vec![xrow(1, 10, ""), xrow(2, 20, "")]
    );
}

#[test]
fn cancelled_merge_aborts_and_discards_the_directory() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = kv_metadata();
    let a = build_kv_part(
        dir.path(),
        &metadata,
        PartInfo::new(1, 1, 0, 0),
        (0..64).map(|i| row(i, "x")).collect(),
        false,
    );
    let blocker = ActionBlocker::new();

    let mut params = merge_params(vec![a], metadata, dir.path());
    params.settings = Arc::new(MergeSettings::default().with_merge_max_block_size(8));
    params.merges_blocker = blocker.clone();
    let mut task = MergeTask::new(params);

    // Prepare, then pull the first block.
    assert!(task.execute().unwrap());
    assert!(task.execute().unwrap());
    assert!(task.progress().rows_written() > 0);

    blocker.cancel_forever();
    let error = loop {
        match task.execute() {
            Ok(true) => continue,
            Ok(false) => panic!("merge finished despite cancellation"),
            Err(e) => break e,
        }
    };
    assert!(matches!(error, Error::Aborted(_)));
    assert!(task.finished_part().is_none());

    drop(task);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_merge_"))
        .collect();
    assert!(leftovers.is_empty(), "temporary directory was published");
}

#[test]
fn multi_source_merge_preserves_order_and_row_conservation() {
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let dir = tempfile::tempdir().unwrap();
    let metadata = kv_metadata();
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut keys: Vec<u64> = (0..300).collect();
    keys.shuffle(&mut rng);

    let mut parts = Vec::new();
    for (i, chunk) in keys.chunks(100).enumerate() {
        parts.push(build_kv_part(
            dir.path(),
            &metadata,
            PartInfo::new(i as u64 + 1, i as u64 + 1, 0, 0),
            chunk.iter().map(|&k| row(k, "p")).collect(),
            false,
        ));
    }
    let total: u64 = parts.iter().map(|p| p.rows_count).sum();

    let mut params = merge_params(parts, metadata, dir.path());
    params.settings = Arc::new(MergeSettings::default().with_merge_max_block_size(17));
    let mut task = MergeTask::new(params);
    let part = task.run_to_completion().unwrap();

    assert_eq!(part.rows_count, total);
    assert_eq!(task.progress().rows_read(), total);
    let rows = part.read_rows(None).unwrap();
    for pair in rows.windows(2) {
        assert!(compare_rows(&pair[0], &pair[1], &[0]) != std::cmp::Ordering::Greater);
    }
}

#[test]
fn single_source_ordinary_merge_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = kv_metadata();
    let source = build_kv_part(
        dir.path(),
        &metadata,
        PartInfo::new(1, 1, 0, 0),
        vec![row(1, "a"), row(2, "b"), row(3, "c")],
        false,
    );
    let source_checksums = source.checksums.clone();

    let params = merge_params(vec![source], metadata, dir.path());
    let merged = MergeTask::new(params).run_to_completion().unwrap();

    assert_eq!(merged.rows_count, 3);
    for name in ["k.col", "v.col"] {
        assert_eq!(
            merged.checksums.files.get(name),
            source_checksums.files.get(name),
            "column bytes changed for {name}"
        );
    }
}

#[test]
fn vertical_merge_matches_horizontal_and_keeps_maps() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("a", DataType::String),
            ColumnDesc::new("b", DataType::Int64),
            ColumnDesc::new("c", DataType::Float64),
        ],
        sort_key: vec!["k".to_string()],
        vector_indices: vec![VectorIndexDesc {
            name: "v_idx".to_string(),
            column: "c".to_string(),
        }],
        ..Default::default()
    });
    let wide_row = |k: u64| {
        vec![
            Value::UInt64(k),
            Value::String(format!("s{k}")),
            Value::Int64(k as i64 * 3),
            Value::Float64(k as f64 / 2.0),
        ]
    };
    let build = |data_dir: &Path, info: PartInfo, keys: Vec<u64>| {
        PartBuilder::new(data_dir, metadata.clone(), info)
            .with_rows(keys.into_iter().map(wide_row).collect())
            .with_built_vector_index("v_idx")
            .finish()
            .unwrap()
    };

    let a = build(dir.path(), PartInfo::new(1, 1, 0, 0), vec![1, 4, 5, 8]);
    let b = build(dir.path(), PartInfo::new(2, 2, 0, 0), vec![2, 3, 6, 7]);
    let a_name = a.name.clone();

    let mut params = merge_params(vec![a, b], metadata.clone(), dir.path());
    params.settings = Arc::new(
        MergeSettings::default()
            .with_vertical_thresholds(1, 1)
            .with_decouple_vector_index(true)
            .with_merge_max_block_size(3),
    );
    let mut task = MergeTask::new(params);
    let part = task.run_to_completion().unwrap();
    assert_eq!(task.algorithm(), Some(MergeAlgorithm::Vertical));

    let expected: Vec<Vec<Value>> = (1..=8).map(wide_row).collect();
    assert_eq!(part.read_rows(None).unwrap(), expected);

    // Same inputs through the horizontal algorithm give the same content.
    let horizontal_dir = tempfile::tempdir().unwrap();
    let a2 = build(horizontal_dir.path(), PartInfo::new(1, 1, 0, 0), vec![1, 4, 5, 8]);
    let b2 = build(horizontal_dir.path(), PartInfo::new(2, 2, 0, 0), vec![2, 3, 6, 7]);
    let mut params = merge_params(vec![a2, b2], metadata, horizontal_dir.path());
    params.settings = Arc::new(MergeSettings {
        enable_vertical_merge_algorithm: false,
        ..MergeSettings::default()
    });
    let mut task = MergeTask::new(params);
    let horizontal_part = task.run_to_completion().unwrap();
    assert_eq!(task.algorithm(), Some(MergeAlgorithm::Horizontal));
    assert_eq!(horizontal_part.read_rows(None).unwrap(), expected);

    // The vertical merge also produced the decouple bookkeeping.
    let forward_a =
        read_row_ids_map(&part.path.join(forward_row_ids_map_file_name(0, &a_name))).unwrap();
    assert_eq!(forward_a, vec![0, 3, 4, 7]);
}

#[test]
fn single_vpart_reuses_the_index_without_maps() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = indexed_metadata();
    let source = build_kv_part(
        dir.path(),
        &metadata,
        PartInfo::new(1, 1, 0, 0),
        vec![row(1, "a"), row(2, "b")],
        true,
    );

    let mut params = merge_params(vec![source], metadata, dir.path());
    params.settings = Arc::new(MergeSettings::default().with_decouple_vector_index(true));
    let part = MergeTask::new(params).run_to_completion().unwrap();

    // Index files keep their plain names; no row-ID maps are produced.
    assert!(part.path.join("v_idx-idx_data.vidx").exists());
    assert!(part.path.join(index_checksums_file_name("v_idx")).exists());
    assert!(!part.path.join(inverted_row_ids_map_file_name()).exists());
}

#[test]
fn lightweight_deletes_shift_row_id_maps() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = indexed_metadata();
    let source = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(1, 1, 0, 0))
        .with_rows((0..5).map(|k| row(k, "x")).collect())
        .with_built_vector_index("v_idx")
        .with_deleted_rows([1, 3])
        .finish()
        .unwrap();
    let source_name = source.name.clone();

    let mut params = merge_params(vec![source], metadata, dir.path());
    params.settings = Arc::new(MergeSettings::default().with_decouple_vector_index(true));
    let mut task = MergeTask::new(params);
    let part = task.run_to_completion().unwrap();

    // A single source with a delete mask still needs maps (it is not a
    // plain VPart), and the maps point at original offsets.
    assert_eq!(part.rows_count, 3);
    assert_eq!(task.input_rows_filtered(), 2);
    let forward = read_row_ids_map(
        &part
            .path
            .join(forward_row_ids_map_file_name(0, &source_name)),
    )
    .unwrap();
    assert_eq!(forward, vec![0, u64::MAX, 1, u64::MAX, 2]);
    assert_eq!(
        read_row_ids_map(&part.path.join(inverted_row_ids_map_file_name())).unwrap(),
        vec![0, 2, 4]
    );
}

#[test]
fn deduplication_drops_equal_rows_across_sources() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = kv_metadata();
    let a = build_kv_part(
        dir.path(),
        &metadata,
        PartInfo::new(1, 1, 0, 0),
        vec![row(1, "a")],
        false,
    );
    let b = build_kv_part(
        dir.path(),
        &metadata,
        PartInfo::new(2, 2, 0, 0),
        vec![row(1, "a"), row(1, "b")],
        false,
    );

    let mut params = merge_params(vec![a, b], metadata, dir.path());
    params.deduplicate = true;
    let part = MergeTask::new(params).run_to_completion().unwrap();
    assert_eq!(
        part.read_rows(None).unwrap(),
        vec![row(1, "a"), row(1, "b")]
    );
}

#[test]
fn projections_merge_recursively() {
    let dir = tempfile::tempdir().unwrap();
    let projection_metadata = Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("v", DataType::String),
            ColumnDesc::new("k", DataType::UInt64),
        ],
        sort_key: vec!["v".to_string()],
        ..Default::default()
    });
    let metadata = Arc::new(StorageMetadata {
        columns: vec![
            ColumnDesc::new("k", DataType::UInt64),
            ColumnDesc::new("v", DataType::String),
        ],
        sort_key: vec!["k".to_string()],
        projections: vec![ProjectionDesc {
            name: "by_v".to_string(),
            kind: ProjectionKind::Plain,
            metadata: projection_metadata,
        }],
        ..Default::default()
    });
    let prow = |v: &str, k: u64| vec![Value::String(v.to_string()), Value::UInt64(k)];

    let a = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(1, 1, 0, 0))
        .with_rows(vec![row(1, "b"), row(3, "d")])
        .with_projection_rows("by_v", vec![prow("b", 1), prow("d", 3)])
        .finish()
        .unwrap();
    let b = PartBuilder::new(dir.path(), metadata.clone(), PartInfo::new(2, 2, 0, 0))
        .with_rows(vec![row(2, "a"), row(4, "c")])
        .with_projection_rows("by_v", vec![prow("a", 2), prow("c", 4)])
        .finish()
        .unwrap();

    let params = merge_params(vec![a, b], metadata, dir.path());
    let part = MergeTask::new(params).run_to_completion().unwrap();

    let projection = part.projections.get("by_v").expect("projection merged");
    assert_eq!(projection.rows_count, 4);
    assert_eq!(
        projection.read_rows(None).unwrap(),
        vec![prow("a", 2), prow("b", 1), prow("c", 4), prow("d", 3)]
    );
}

#[test]
fn merging_only_empty_sources_yields_an_empty_part() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = kv_metadata();
    let a = build_kv_part(dir.path(), &metadata, PartInfo::new(1, 1, 0, 0), vec![], false);
    let b = build_kv_part(dir.path(), &metadata, PartInfo::new(2, 2, 0, 0), vec![], false);

    let params = merge_params(vec![a, b], metadata, dir.path());
    let part = MergeTask::new(params).run_to_completion().unwrap();
    assert_eq!(part.rows_count, 0);
    assert!(part.read_rows(None).unwrap().is_empty());
}
