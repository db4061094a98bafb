//! End-to-end window contents, malformed input handling and overflow policy.

mod common;

use common::{
    bundle_file, config, edge, index_of, read_bundle, row, write_lines, write_stream,
};
use edgeseq_core::{
    EntityId, Label, OverflowPolicy, PhaseOutcome, Pipeline, PipelineConfig, TemporalKeyStrategy,
};
use tempfile::TempDir;

fn close(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() < 1e-6
}

#[test]
fn keeps_the_two_most_recent_records_in_temporal_order() {
    let input = TempDir::new().unwrap();
    let stream = input.path().join("edges.csv");
    // Entity 5 receives txIds 10, 30, 20 in that stream order.
    write_stream(
        &stream,
        &[edge(9, 5, 10), edge(8, 5, 30), edge(7, 5, 20), edge(5, 9, 40)],
    );
    let work = TempDir::new().unwrap();
    let config = config(&stream, work.path())
        .window_len(2)
        .temporal_key(TemporalKeyStrategy::Fixed { max: 100 })
        .build();
    Pipeline::new(config, index_of(&[5])).unwrap().run().unwrap();

    let bundle = read_bundle(work.path(), 0);
    assert_eq!(bundle.entity_id, EntityId(5));
    assert_eq!(bundle.label, Label::Licit);
    assert_eq!(bundle.n_in, 3);
    assert_eq!(bundle.in_flow.row(0)[..2], [20.0, -10.0]);
    assert!(close(bundle.in_flow.row(0)[2], 0.2));
    assert_eq!(bundle.in_flow.row(1)[..2], [30.0, -15.0]);
    assert!(close(bundle.in_flow.row(1)[2], 0.3));

    assert_eq!(bundle.n_out, 1);
    assert!(bundle.out_flow.row(0).iter().all(|value| *value == 0.0));
    assert!(close(bundle.out_flow.row(1)[2], 0.4));
    assert_eq!(bundle.out_mask(), vec![false, true]);
}

#[test]
fn entity_without_outbound_edges_gets_zero_matrix() {
    let input = TempDir::new().unwrap();
    let stream = input.path().join("edges.csv");
    write_stream(&stream, &[edge(1, 2, 5), edge(3, 2, 6)]);
    let work = TempDir::new().unwrap();
    let summary = Pipeline::new(config(&stream, work.path()).build(), index_of(&[2]))
        .unwrap()
        .run()
        .unwrap();

    let bundle = read_bundle(work.path(), 0);
    assert_eq!(bundle.label, Label::Suspicious);
    assert_eq!(bundle.n_out, 0);
    assert!(bundle.out_flow.is_zero());
    assert_eq!(bundle.out_mask(), vec![false; 4]);
    assert_eq!(bundle.in_mask(), vec![false, false, true, true]);

    let sequences = summary.sequences.unwrap();
    assert_eq!(sequences.empty_out, 1);
    assert_eq!(sequences.empty_in, 0);
    // Observed strategy with the default margin normalises by the largest routed txId.
    assert_eq!(sequences.max_temporal_key, 6);
    assert!(close(bundle.in_flow.row(3)[2], 1.0));
}

#[test]
fn exactly_window_len_records_need_no_padding() {
    let input = TempDir::new().unwrap();
    let stream = input.path().join("edges.csv");
    let edges: Vec<_> = (1..=50).rev().map(|tx| edge(4, 100 + tx, tx)).collect();
    write_stream(&stream, &edges);
    let work = TempDir::new().unwrap();
    let config = config(&stream, work.path())
        .chunk_size(7)
        .window_len(50)
        .temporal_key(TemporalKeyStrategy::Fixed { max: 50 })
        .build();
    Pipeline::new(config, index_of(&[4])).unwrap().run().unwrap();

    let bundle = read_bundle(work.path(), 0);
    assert_eq!(bundle.n_out, 50);
    assert_eq!(bundle.out_mask(), vec![true; 50]);
    for (position, tx) in (1..=50u64).enumerate() {
        let row = bundle.out_flow.row(position);
        assert_eq!(row[0], tx as f64);
        assert!(close(row[2], tx as f64 / 50.0));
    }
}

#[test]
fn malformed_rows_are_skipped_and_counted() {
    let input = TempDir::new().unwrap();
    let stream = input.path().join("edges.csv");
    let lines = vec![
        row(&edge(1, 2, 10)),
        String::new(),
        "1,2,11".to_string(),
        "1,2,not-a-tx,1,1".to_string(),
        "x,2,12,1,1".to_string(),
        "1,2,13,NaN,1".to_string(),
        "1,2,14,abc,1".to_string(),
        // Irrelevant rows are not feature-checked.
        "8,9,15,abc,1".to_string(),
        row(&edge(2, 1, 16)),
    ];
    write_lines(&stream, &lines);
    let work = TempDir::new().unwrap();
    let summary = Pipeline::new(config(&stream, work.path()).build(), index_of(&[1, 2]))
        .unwrap()
        .run()
        .unwrap();

    let extraction = &summary.extraction;
    assert_eq!(extraction.rows_consumed, 9);
    assert_eq!(extraction.rows_irrelevant, 1);
    assert_eq!(extraction.rows_skipped.blank, 1);
    assert_eq!(extraction.rows_skipped.field_count, 1);
    assert_eq!(extraction.rows_skipped.invalid_tx_id, 1);
    assert_eq!(extraction.rows_skipped.invalid_entity_id, 1);
    assert_eq!(extraction.rows_skipped.non_finite_feature, 1);
    assert_eq!(extraction.rows_skipped.invalid_feature, 1);
    assert_eq!(extraction.rows_skipped.total(), 6);
    // Two good rows, each routed once per targeted endpoint.
    assert_eq!(extraction.records_routed, 4);

    let first = read_bundle(work.path(), 0);
    assert_eq!((first.n_in, first.n_out), (1, 1));
    let second = read_bundle(work.path(), 1);
    assert_eq!((second.n_in, second.n_out), (1, 1));
}

#[test]
fn overflow_fails_the_entity_until_clamping_is_allowed() {
    let input = TempDir::new().unwrap();
    let stream = input.path().join("edges.csv");
    write_stream(&stream, &[edge(1, 2, 40), edge(3, 1, 60)]);
    let work = TempDir::new().unwrap();
    let strict = config(&stream, work.path())
        .temporal_key(TemporalKeyStrategy::Fixed { max: 50 })
        .build();

    let summary = Pipeline::new(strict, index_of(&[1, 2])).unwrap().run().unwrap();
    assert_eq!(summary.outcome, PhaseOutcome::Completed);
    let sequences = summary.sequences.unwrap();
    assert_eq!(sequences.failed, 1);
    assert_eq!(sequences.overflow_rejected, 1);
    assert_eq!(sequences.processed, 1);
    assert!(!sequences.complete);
    assert!(!bundle_file(work.path(), 0).exists());
    assert!(bundle_file(work.path(), 1).exists());

    let lenient = config(&stream, work.path())
        .temporal_key(TemporalKeyStrategy::Fixed { max: 50 })
        .overflow_policy(OverflowPolicy::Clamp)
        .build();
    let summary = Pipeline::new(lenient, index_of(&[1, 2])).unwrap().run().unwrap();
    let sequences = summary.sequences.unwrap();
    assert_eq!(sequences.failed, 0);
    assert_eq!(sequences.proxy_clamped, 1);
    assert_eq!(sequences.already_done, 1);
    assert!(sequences.complete);

    let bundle = read_bundle(work.path(), 0);
    assert!(close(bundle.in_flow.row(3)[2], 1.0));
    assert!(close(bundle.out_flow.row(3)[2], 0.8));
    assert!(Pipeline::status(work.path()).unwrap().windowing_complete());
}

#[test]
fn retired_spools_are_removed_after_windowing() {
    let input = TempDir::new().unwrap();
    let stream = input.path().join("edges.csv");
    write_stream(&stream, &[edge(1, 2, 1), edge(2, 3, 2), edge(3, 1, 3)]);
    let work = TempDir::new().unwrap();
    let config = config(&stream, work.path()).retain_spools(false).build();
    let pipeline = Pipeline::new(config, index_of(&[1, 2, 3])).unwrap();
    pipeline.run().unwrap();

    let spool_files = walk_files(&pipeline.layout().spool_dir());
    assert!(spool_files.is_empty(), "left behind: {spool_files:?}");
    for dense in 0..3 {
        assert!(bundle_file(work.path(), dense).exists());
    }
}

#[test]
fn from_config_loads_index_and_json_config() {
    let input = TempDir::new().unwrap();
    let stream = input.path().join("edges.csv");
    write_stream(&stream, &[edge(10, 20, 1), edge(20, 30, 2)]);
    let index_path = input.path().join("index.json");
    std::fs::write(
        &index_path,
        r#"{"entities": [{"id": 30, "label": 1}, {"id": 20, "label": 0}, {"id": 10}]}"#,
    )
    .unwrap();
    let work = input.path().join("work");
    let config_path = input.path().join("config.json");
    std::fs::write(
        &config_path,
        serde_json::json!({
            "stream_path": stream,
            "index_path": index_path,
            "work_dir": work,
            "chunk_size": 1,
            "window_len": 3,
            "feature_width": 2,
            "sync_spools": false
        })
        .to_string(),
    )
    .unwrap();

    let config = PipelineConfig::from_json_file(&config_path).unwrap();
    let pipeline = Pipeline::from_config(config).unwrap();
    let summary = pipeline.run().unwrap();
    assert_eq!(summary.extraction.last_chunk_index, 2);
    assert!(summary.sequences.unwrap().complete);

    // Dense order follows ascending id; a missing label defaults to licit.
    let labels: Vec<(EntityId, Label)> = (0..3)
        .map(|dense| {
            let bundle = read_bundle(&work, dense);
            (bundle.entity_id, bundle.label)
        })
        .collect();
    assert_eq!(
        labels,
        vec![
            (EntityId(10), Label::Licit),
            (EntityId(20), Label::Licit),
            (EntityId(30), Label::Suspicious),
        ]
    );
    let summary_on_disk = Pipeline::status(&work).unwrap().last_summary.unwrap();
    assert_eq!(summary_on_disk.run_id, pipeline.run_id());
}

fn walk_files(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return files;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            files.extend(walk_files(&path));
        } else {
            files.push(path);
        }
    }
    files
}
