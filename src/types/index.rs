//! Immutable entity index supplied by the upstream indexing step.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::edge::EntityId;
use crate::error::{PipelineError, Result};

/// Binary class label attached to every emitted sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    #[default]
    Licit,
    Suspicious,
}

impl Label {
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Licit => 0,
            Self::Suspicious => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Licit),
            1 => Some(Self::Suspicious),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct IndexFile {
    entities: Vec<IndexFileEntry>,
}

#[derive(Debug, Deserialize)]
struct IndexFileEntry {
    id: u64,
    #[serde(default)]
    label: Option<i64>,
}

/// Maps raw entity ids to dense indices and labels.
///
/// Dense indices follow ascending entity id order, so the same input always
/// yields the same numbering.
#[derive(Debug, Clone, Default)]
pub struct EntityIndex {
    ids: Vec<EntityId>,
    positions: HashMap<EntityId, u32>,
    labels: HashMap<EntityId, Label>,
}

impl EntityIndex {
    /// Build an index from `(id, label)` pairs. Repeated ids are merged; repeated ids
    /// with different labels are rejected.
    pub fn from_entries<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (EntityId, Option<Label>)>,
    {
        let mut labels: HashMap<EntityId, Label> = HashMap::new();
        let mut ids = Vec::new();
        for (id, label) in entries {
            ids.push(id);
            let Some(label) = label else { continue };
            if let Some(previous) = labels.insert(id, label) {
                if previous != label {
                    return Err(PipelineError::InvalidEntityIndex {
                        reason: format!("entity {id} has conflicting labels"),
                    });
                }
            }
        }
        ids.sort_unstable();
        ids.dedup();
        if ids.len() > u32::MAX as usize {
            return Err(PipelineError::InvalidEntityIndex {
                reason: format!("{} entities exceed the dense index range", ids.len()),
            });
        }
        let positions = ids
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, pos as u32))
            .collect();
        Ok(Self {
            ids,
            positions,
            labels,
        })
    }

    /// Load the upstream JSON artifact `{"entities": [{"id": .., "label": 0|1|null}]}`.
    pub fn load_json(path: &Path) -> Result<Self> {
        let bytes = fs_err::read(path).map_err(|err| PipelineError::InvalidEntityIndex {
            reason: err.to_string(),
        })?;
        let file: IndexFile =
            serde_json::from_slice(&bytes).map_err(|err| PipelineError::InvalidEntityIndex {
                reason: format!("{}: {err}", path.display()),
            })?;
        let mut entries = Vec::with_capacity(file.entities.len());
        for entry in file.entities {
            let label = match entry.label {
                None => None,
                Some(raw) => Some(Label::from_i64(raw).ok_or_else(|| {
                    PipelineError::InvalidEntityIndex {
                        reason: format!("entity {} has label {raw}, expected 0 or 1", entry.id),
                    }
                })?),
            };
            entries.push((EntityId(entry.id), label));
        }
        let index = Self::from_entries(entries)?;
        tracing::info!(
            target: "edgeseq::index",
            entities = index.len(),
            labelled = index.labels.len(),
            path = %path.display(),
            "entity index loaded"
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.positions.contains_key(&id)
    }

    #[must_use]
    pub fn dense_index(&self, id: EntityId) -> Option<u32> {
        self.positions.get(&id).copied()
    }

    #[must_use]
    pub fn entity_at(&self, dense: u32) -> Option<EntityId> {
        self.ids.get(dense as usize).copied()
    }

    #[must_use]
    pub fn label(&self, id: EntityId) -> Option<Label> {
        self.labels.get(&id).copied()
    }

    /// Entities in dense index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, EntityId)> + '_ {
        self.ids
            .iter()
            .enumerate()
            .map(|(pos, id)| (pos as u32, *id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_indices_follow_id_order() {
        let index = EntityIndex::from_entries([
            (EntityId(30), Some(Label::Suspicious)),
            (EntityId(10), None),
            (EntityId(20), Some(Label::Licit)),
            (EntityId(10), None),
        ])
        .unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(index.dense_index(EntityId(10)), Some(0));
        assert_eq!(index.dense_index(EntityId(30)), Some(2));
        assert_eq!(index.entity_at(1), Some(EntityId(20)));
        assert_eq!(index.label(EntityId(30)), Some(Label::Suspicious));
        assert_eq!(index.label(EntityId(10)), None);
        assert!(!index.contains(EntityId(40)));
    }

    #[test]
    fn conflicting_labels_are_rejected() {
        let err = EntityIndex::from_entries([
            (EntityId(1), Some(Label::Licit)),
            (EntityId(1), Some(Label::Suspicious)),
        ])
        .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidEntityIndex { .. }));
    }

    #[test]
    fn load_json_reads_upstream_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(
            &path,
            r#"{"entities":[{"id":7,"label":1},{"id":3},{"id":5,"label":null}]}"#,
        )
        .unwrap();
        let index = EntityIndex::load_json(&path).unwrap();
        assert_eq!(index.iter().collect::<Vec<_>>(), vec![
            (0, EntityId(3)),
            (1, EntityId(5)),
            (2, EntityId(7)),
        ]);
        assert_eq!(index.label(EntityId(7)), Some(Label::Suspicious));
    }

    #[test]
    fn load_json_rejects_unknown_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, r#"{"entities":[{"id":7,"label":2}]}"#).unwrap();
        assert!(EntityIndex::load_json(&path).is_err());
    }
}
