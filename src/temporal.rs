//! Resolution of the global `maxTemporalKey` used to normalise `txId`.

use crate::constants::FALLBACK_MAX_TEMPORAL_KEY;
use crate::io::SpoolStore;
use crate::types::{Direction, EntityIndex, ScanCheckpoint, TemporalKeyStrategy};

/// Scale `max` by `margin`, rounding up. Never below `max` or 1.
#[must_use]
pub fn apply_margin(max: u64, margin: f64) -> u64 {
    let scaled = (max as f64 * margin).ceil();
    let scaled = if scaled >= u64::MAX as f64 {
        u64::MAX
    } else {
        scaled as u64
    };
    scaled.max(max).max(1)
}

/// Compute the normalisation bound once, before any entity is windowed.
///
/// `Sampled` reads the first `sample_spools` non-empty inbound spools in dense
/// index order; unreadable spools are skipped. Both estimating strategies fall
/// back to [`FALLBACK_MAX_TEMPORAL_KEY`] when they see no records at all.
#[must_use]
pub fn resolve_max_temporal_key(
    strategy: &TemporalKeyStrategy,
    scan: &ScanCheckpoint,
    spools: &SpoolStore,
    index: &EntityIndex,
) -> u64 {
    let resolved = match *strategy {
        TemporalKeyStrategy::Fixed { max } => max.max(1),
        TemporalKeyStrategy::Observed { margin } => scan
            .max_tx_id_routed
            .map_or(FALLBACK_MAX_TEMPORAL_KEY, |max| apply_margin(max, margin)),
        TemporalKeyStrategy::Sampled {
            sample_spools,
            margin,
        } => sample_inbound(spools, index, sample_spools)
            .map_or(FALLBACK_MAX_TEMPORAL_KEY, |max| apply_margin(max, margin)),
    };
    tracing::info!(
        target: "edgeseq::window",
        strategy = ?strategy,
        max_temporal_key = resolved,
        observed_max = ?scan.max_tx_id_routed,
        "max temporal key resolved"
    );
    resolved
}

fn sample_inbound(spools: &SpoolStore, index: &EntityIndex, wanted: usize) -> Option<u64> {
    let mut sampled = 0usize;
    let mut max = None;
    for (_, entity) in index.iter() {
        if sampled >= wanted {
            break;
        }
        let read = match spools.read(entity, Direction::Inbound) {
            Ok(read) => read,
            Err(err) => {
                tracing::warn!(
                    target: "edgeseq::window",
                    entity = %entity,
                    error = %err,
                    "skipping unreadable spool while sampling"
                );
                continue;
            }
        };
        let Some(spool_max) = read.max_tx_id() else {
            continue;
        };
        sampled += 1;
        max = Some(max.map_or(spool_max, |current: u64| current.max(spool_max)));
    }
    tracing::debug!(target: "edgeseq::window", sampled, max = ?max, "sampled inbound spools");
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EntityId, Label, SpoolEntry};

    fn store_with(dir: &std::path::Path, inbound: &[(u64, Vec<u64>)]) -> (SpoolStore, EntityIndex) {
        let index = EntityIndex::from_entries(
            inbound
                .iter()
                .map(|(id, _)| (EntityId(*id), Some(Label::Licit))),
        )
        .unwrap();
        let mut store = SpoolStore::open(dir, 1, false).unwrap();
        store.initialize(&index).unwrap();
        let mut ordinal = 0;
        for (id, txs) in inbound {
            for tx in txs {
                let entry = SpoolEntry {
                    ordinal,
                    tx_id: *tx,
                    features: vec![0.0],
                };
                store.append(EntityId(*id), Direction::Inbound, &entry).unwrap();
                ordinal += 1;
            }
        }
        store.flush().unwrap();
        (store, index)
    }

    #[test]
    fn margin_rounds_up_and_never_shrinks() {
        assert_eq!(apply_margin(1_000, 1.25), 1_250);
        assert_eq!(apply_margin(3, 1.5), 5);
        assert_eq!(apply_margin(100, 1.0), 100);
        assert_eq!(apply_margin(0, 1.1), 1);
        assert_eq!(apply_margin(u64::MAX, 1.1), u64::MAX);
    }

    #[test]
    fn sampled_uses_first_non_empty_spools() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = store_with(
            dir.path(),
            &[(1, vec![]), (2, vec![50, 70]), (3, vec![90]), (4, vec![1_000])],
        );
        let scan = ScanCheckpoint::default();
        let strategy = TemporalKeyStrategy::Sampled {
            sample_spools: 2,
            margin: 1.5,
        };
        assert_eq!(resolve_max_temporal_key(&strategy, &scan, &store, &index), 135);
    }

    #[test]
    fn observed_and_fixed_ignore_spools() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = store_with(dir.path(), &[(1, vec![5])]);
        let scan = ScanCheckpoint {
            max_tx_id_routed: Some(400),
            ..ScanCheckpoint::default()
        };
        let observed = TemporalKeyStrategy::Observed { margin: 1.0 };
        assert_eq!(resolve_max_temporal_key(&observed, &scan, &store, &index), 400);
        let fixed = TemporalKeyStrategy::Fixed { max: 77 };
        assert_eq!(resolve_max_temporal_key(&fixed, &scan, &store, &index), 77);
    }

    #[test]
    fn empty_corpus_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let (store, index) = store_with(dir.path(), &[(1, vec![])]);
        let scan = ScanCheckpoint::default();
        assert_eq!(
            resolve_max_temporal_key(&TemporalKeyStrategy::sampled(), &scan, &store, &index),
            FALLBACK_MAX_TEMPORAL_KEY
        );
        assert_eq!(
            resolve_max_temporal_key(&TemporalKeyStrategy::default(), &scan, &store, &index),
            FALLBACK_MAX_TEMPORAL_KEY
        );
    }
}
