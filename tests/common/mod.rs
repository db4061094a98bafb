//! Fixtures shared by the integration tests: small edge streams with two
//! feature columns and in-memory entity indices.

#![allow(dead_code)]

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use edgeseq_core::{
    EntityId, EntityIndex, Label, PipelineConfig, PipelineConfigBuilder, SequenceBundle,
    WorkspaceLayout, bundle_path,
};

pub const HEADER: &str = "clId1,clId2,txId,feat#1,feat#2";

/// One stream row; features are derived from `tx` so windows are easy to check.
#[derive(Debug, Clone, Copy)]
pub struct Edge {
    pub src: u64,
    pub dst: u64,
    pub tx: u64,
}

pub fn edge(src: u64, dst: u64, tx: u64) -> Edge {
    Edge { src, dst, tx }
}

pub fn row(edge: &Edge) -> String {
    format!(
        "{},{},{},{},{}",
        edge.src,
        edge.dst,
        edge.tx,
        edge.tx as f32,
        -(edge.tx as f32) / 2.0
    )
}

/// Write `HEADER` followed by `lines` verbatim.
pub fn write_lines(path: &Path, lines: &[String]) {
    let mut text = String::from(HEADER);
    text.push('\n');
    for line in lines {
        writeln!(text, "{line}").unwrap();
    }
    std::fs::write(path, text).unwrap();
}

pub fn write_stream(path: &Path, edges: &[Edge]) {
    let lines: Vec<String> = edges.iter().map(row).collect();
    write_lines(path, &lines);
}

/// `count` edges over entities `1..=entities` with a fixed seed.
pub fn random_edges(seed: u64, count: usize, entities: u64) -> Vec<Edge> {
    let mut rng = fastrand::Rng::with_seed(seed);
    (0..count)
        .map(|_| edge(rng.u64(1..=entities), rng.u64(1..=entities), rng.u64(1..=900)))
        .collect()
}

/// Index over `ids`; even ids are suspicious, odd ids licit.
pub fn index_of(ids: &[u64]) -> EntityIndex {
    EntityIndex::from_entries(ids.iter().map(|id| {
        let label = if id % 2 == 0 {
            Label::Suspicious
        } else {
            Label::Licit
        };
        (EntityId(*id), Some(label))
    }))
    .unwrap()
}

/// Small chunks and cadences so every test crosses several checkpoints.
pub fn config(stream: &Path, work_dir: &Path) -> PipelineConfigBuilder {
    PipelineConfig::builder(stream, work_dir)
        .chunk_size(4)
        .feature_width(2)
        .window_len(4)
        .scan_checkpoint_every(2)
        .sequence_checkpoint_every(2)
        .sync_spools(false)
        .progress_every(1, 1)
}

pub fn read_bundle(work_dir: &Path, dense: u32) -> SequenceBundle {
    let layout = WorkspaceLayout::new(work_dir);
    SequenceBundle::read_npz(&bundle_path(&layout.sequence_dir(), dense)).unwrap()
}

pub fn bundle_file(work_dir: &Path, dense: u32) -> PathBuf {
    bundle_path(&WorkspaceLayout::new(work_dir).sequence_dir(), dense)
}

pub fn bundle_bytes(work_dir: &Path, entities: usize) -> Vec<Vec<u8>> {
    (0..entities as u32)
        .map(|dense| std::fs::read(bundle_file(work_dir, dense)).unwrap())
        .collect()
}
