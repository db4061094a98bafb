//! Temporal windowing of one entity's spools into fixed-shape sequences.

use crate::error::{PipelineError, Result};
use crate::io::{SpoolRead, SpoolStore};
use crate::types::{
    Direction, EntityId, EntityIndex, Label, OverflowPolicy, SequenceBundle, SequenceMatrix,
    SpoolEntry,
};

/// Shape and normalisation shared by every entity of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSpec {
    /// K: rows per sequence.
    pub window_len: usize,
    /// F: feature columns; each row has `F + 1` columns.
    pub feature_width: usize,
    pub max_temporal_key: u64,
    pub overflow: OverflowPolicy,
}

/// One direction's window.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub matrix: SequenceMatrix,
    /// Entries available before truncation to K.
    pub original_len: u64,
    /// Rows whose temporal proxy was clamped to 1.0.
    pub clamped: u64,
}

/// Order entries by `(txId, ordinal)`, keep the most recent K, right-align them
/// in a zero-filled `K x (F + 1)` matrix and append `txId / max_temporal_key`.
///
/// The ordinal tie-break reproduces spool arrival order, so the result does not
/// depend on how often extraction was resumed.
pub fn build_window(
    entity: EntityId,
    mut entries: Vec<SpoolEntry>,
    spec: &WindowSpec,
) -> Result<Window> {
    let width = spec.feature_width;
    let mut matrix = SequenceMatrix::zeros(spec.window_len, width + 1);
    let original_len = entries.len() as u64;

    entries.sort_unstable_by_key(|entry| (entry.tx_id, entry.ordinal));
    let keep = entries.len().min(spec.window_len);
    let recent = &entries[entries.len() - keep..];
    let padding = spec.window_len - keep;

    let mut clamped = 0;
    for (offset, entry) in recent.iter().enumerate() {
        if entry.features.len() != width {
            return Err(PipelineError::InvalidConfig {
                reason: format!(
                    "entity {entity}: spool entry has {} features, expected {width}",
                    entry.features.len()
                ),
            });
        }
        let proxy = if entry.tx_id > spec.max_temporal_key {
            match spec.overflow {
                OverflowPolicy::Reject => {
                    return Err(PipelineError::TemporalKeyOverflow {
                        entity,
                        tx_id: entry.tx_id,
                        max: spec.max_temporal_key,
                    });
                }
                OverflowPolicy::Clamp => {
                    clamped += 1;
                    1.0
                }
            }
        } else {
            entry.tx_id as f64 / spec.max_temporal_key as f64
        };
        let row = matrix.row_mut(padding + offset);
        for (slot, value) in row.iter_mut().zip(&entry.features) {
            *slot = f64::from(*value);
        }
        row[width] = proxy;
    }

    Ok(Window {
        matrix,
        original_len,
        clamped,
    })
}

/// Data-quality observations made while building one entity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub label_defaulted: bool,
    /// Directions whose spool could not be read and were treated as empty.
    pub read_errors: u64,
    pub duplicates: u64,
    pub corrupt: u64,
    pub clamped: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltSequence {
    pub dense: u32,
    pub bundle: SequenceBundle,
    pub stats: BuildStats,
}

/// Reads an entity's two spools and windows them.
///
/// Holds only shared references, so one builder can serve many workers.
#[derive(Debug, Clone, Copy)]
pub struct SequenceBuilder<'a> {
    spools: &'a SpoolStore,
    index: &'a EntityIndex,
    spec: WindowSpec,
}

impl<'a> SequenceBuilder<'a> {
    pub fn new(spools: &'a SpoolStore, index: &'a EntityIndex, spec: WindowSpec) -> Self {
        Self {
            spools,
            index,
            spec,
        }
    }

    pub fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    /// Build the bundle for `entity`. A spool that cannot be read is treated as
    /// empty and counted; a temporal key overflow under
    /// [`OverflowPolicy::Reject`] fails the entity.
    pub fn build(&self, entity: EntityId, dense: u32) -> Result<BuiltSequence> {
        let mut stats = BuildStats::default();
        let in_window = self.direction(entity, Direction::Inbound, &mut stats)?;
        let out_window = self.direction(entity, Direction::Outbound, &mut stats)?;

        let label = match self.index.label(entity) {
            Some(label) => label,
            None => {
                stats.label_defaulted = true;
                tracing::warn!(
                    target: "edgeseq::window",
                    entity = %entity,
                    "entity has no label; defaulting to 0"
                );
                Label::default()
            }
        };

        Ok(BuiltSequence {
            dense,
            bundle: SequenceBundle {
                entity_id: entity,
                label,
                in_flow: in_window.matrix,
                out_flow: out_window.matrix,
                n_in: in_window.original_len,
                n_out: out_window.original_len,
            },
            stats,
        })
    }

    fn direction(
        &self,
        entity: EntityId,
        direction: Direction,
        stats: &mut BuildStats,
    ) -> Result<Window> {
        let read = match self.spools.read(entity, direction) {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(
                    target: "edgeseq::window",
                    entity = %entity,
                    direction = direction.label(),
                    error = %err,
                    "spool unreadable; treating as empty"
                );
                stats.read_errors += 1;
                SpoolRead::default()
            }
        };
        stats.duplicates += read.duplicates;
        stats.corrupt += read.corrupt;
        let window = build_window(entity, read.entries, &self.spec)?;
        stats.clamped += window.clamped;
        Ok(window)
    }
}
