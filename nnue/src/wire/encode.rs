use crate::config::NetConfig;
use crate::kernels::SENTINEL;

use super::{Batch, FeatureLayout, MoveLayout, Perspective, PolicyTarget, WireLayout};

fn put_i16(out: &mut Vec<u8>, value: i32) {
    out.extend_from_slice(&(value as i16).to_le_bytes());
}

fn put_weight(out: &mut Vec<u8>, target: PolicyTarget, value: f32) {
    match target {
        PolicyTarget::BestMove => out.push((value > 0.0) as u8),
        PolicyTarget::VisitCounts => out.push(value.round().clamp(0.0, u8::MAX as f32) as u8),
        PolicyTarget::VisitPercent => out.extend_from_slice(&value.to_le_bytes()),
    }
}

/// Appends `batch` to `out` as one record.
///
/// The encoder writes what it is given; validation is the decoder's job, so a
/// malformed batch encodes to a record that will be rejected on read. In
/// `BestMove` mode the best move is the first legal slot with a positive
/// weight, or `-1` when there is none.
pub fn encode_batch(batch: &Batch, layout: &WireLayout, config: &NetConfig, out: &mut Vec<u8>) {
    out.reserve(layout.record_size(config));
    let feature_capacity = config.batch_size * config.max_active_features;
    let move_capacity = config.batch_size * config.max_moves_per_pos;

    for perspective in Perspective::ALL {
        let features = batch.features(perspective);
        match layout.features {
            FeatureLayout::Slots => {
                for &feature in features {
                    put_i16(out, feature);
                }
            }
            FeatureLayout::Pairs => {
                let pairs: Vec<(usize, i32)> = features
                    .chunks(config.max_active_features)
                    .enumerate()
                    .flat_map(|(entry, slots)| {
                        slots
                            .iter()
                            .filter(|&&f| f != SENTINEL)
                            .map(move |&f| (entry, f))
                    })
                    .collect();

                out.extend_from_slice(&(pairs.len() as u64).to_le_bytes());
                for &(entry, feature) in &pairs {
                    put_i16(out, entry as i32);
                    put_i16(out, feature);
                }
                for _ in pairs.len()..feature_capacity {
                    put_i16(out, SENTINEL);
                    put_i16(out, SENTINEL);
                }
            }
        }
    }

    for &score in &batch.scores {
        out.extend_from_slice(&score.to_le_bytes());
    }
    for &wdl in &batch.wdl {
        out.extend_from_slice(&wdl.to_le_bytes());
    }

    if layout.target == PolicyTarget::BestMove {
        for entry in 0..batch.size {
            let best = batch
                .entry_moves(entry)
                .iter()
                .zip(batch.entry_weights(entry))
                .find(|(&m, &w)| m != SENTINEL && w > 0.0)
                .map_or(SENTINEL, |(&m, _)| m);
            put_i16(out, best);
        }
    }

    match layout.moves {
        MoveLayout::Slots => {
            for &slot in &batch.legal_moves {
                put_i16(out, slot);
            }
            if layout.target != PolicyTarget::BestMove {
                for &weight in &batch.move_weights {
                    put_weight(out, layout.target, weight);
                }
            }
        }
        MoveLayout::Pairs => {
            let mut count = 0usize;
            let count_at = out.len();
            out.extend_from_slice(&0u64.to_le_bytes());

            for entry in 0..batch.size {
                for (&slot, &weight) in batch.entry_moves(entry).iter().zip(batch.entry_weights(entry)) {
                    if slot == SENTINEL {
                        continue;
                    }
                    put_i16(out, entry as i32);
                    put_i16(out, slot);
                    // Every listed move is legal; the flag is not the best move marker
                    let weight = if layout.target == PolicyTarget::BestMove { 1.0 } else { weight };
                    put_weight(out, layout.target, weight);
                    count += 1;
                }
            }
            for _ in count..move_capacity {
                put_i16(out, SENTINEL);
                put_i16(out, SENTINEL);
                put_weight(out, layout.target, 0.0);
            }

            out[count_at..count_at + 8].copy_from_slice(&(count as u64).to_le_bytes());
        }
    }
}
