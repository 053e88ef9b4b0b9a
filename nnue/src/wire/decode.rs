use crate::config::NetConfig;
use crate::error::BatchError;
use crate::kernels::SENTINEL;

use super::{Batch, FeatureLayout, MoveLayout, Perspective, PolicyTarget, WireLayout};

/// Little-endian reads over a record whose length was checked up front.
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    #[inline]
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn i16(&mut self) -> i16 {
        i16::from_le_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_le_bytes(self.take())
    }

    fn weight(&mut self, target: PolicyTarget, pair: bool) -> f32 {
        match target {
            PolicyTarget::BestMove if pair => self.u8() as f32,
            PolicyTarget::BestMove => 0.0,
            PolicyTarget::VisitCounts => self.u8() as f32,
            PolicyTarget::VisitPercent => self.f32(),
        }
    }
}

/// Decodes and validates one record into `batch`.
///
/// Nothing the kernels index with is trusted: every feature and move index is
/// bounds checked here, so the kernels can skip per-element checks. On error
/// the contents of `batch` are unspecified.
pub fn decode_into(
    bytes: &[u8],
    layout: &WireLayout,
    config: &NetConfig,
    batch: &mut Batch,
) -> Result<(), BatchError> {
    let expected = layout.record_size(config);
    if bytes.len() != expected {
        return Err(BatchError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }

    let fits = batch.size == config.batch_size
        && batch.max_active == config.max_active_features
        && batch.max_moves == config.max_moves_per_pos
        && batch.policy_outputs == config.policy_output_size;
    if fits {
        batch.clear(layout.target);
    } else {
        *batch = Batch::new(config, layout.target);
    }

    let mut cursor = Cursor::new(bytes);
    let mut scratch = Vec::with_capacity(config.max_active_features.max(config.max_moves_per_pos));

    for perspective in Perspective::ALL {
        let dest = batch.features_mut(perspective);
        match layout.features {
            FeatureLayout::Slots => read_feature_slots(&mut cursor, dest, config, perspective)?,
            FeatureLayout::Pairs => read_feature_pairs(&mut cursor, dest, config, perspective)?,
        }
        check_unique_features(batch, perspective, &mut scratch)?;
    }

    for score in batch.scores.iter_mut() {
        *score = cursor.i16();
    }

    for (entry, wdl) in batch.wdl.iter_mut().enumerate() {
        let value = cursor.f32();
        if !(0.0..=1.0).contains(&value) {
            return Err(BatchError::InvalidWdl { entry, value });
        }
        *wdl = value;
    }

    let best_moves: Option<Vec<i16>> = (layout.target == PolicyTarget::BestMove)
        .then(|| (0..config.batch_size).map(|_| cursor.i16()).collect());

    match layout.moves {
        MoveLayout::Slots => read_move_slots(&mut cursor, batch, config, layout.target)?,
        MoveLayout::Pairs => read_move_pairs(&mut cursor, batch, config, layout.target)?,
    }

    for entry in 0..batch.size {
        check_entry_moves(batch, entry, &mut scratch)?;
    }

    match best_moves {
        Some(best) => mark_best_moves(batch, &best),
        None => check_visit_weights(batch),
    }
}

fn check_feature(
    value: i16,
    entry: usize,
    config: &NetConfig,
    perspective: Perspective,
) -> Result<i32, BatchError> {
    let index = value as i32;
    if index < 0 || index as usize >= config.input_size() {
        return Err(BatchError::FeatureOutOfRange {
            entry,
            perspective,
            index: index as i64,
            limit: config.input_size(),
        });
    }
    Ok(index)
}

fn read_feature_slots(
    cursor: &mut Cursor,
    dest: &mut [i32],
    config: &NetConfig,
    perspective: Perspective,
) -> Result<(), BatchError> {
    for (slot, feature) in dest.iter_mut().enumerate() {
        let value = cursor.i16();
        if value as i32 == SENTINEL {
            continue;
        }
        *feature = check_feature(value, slot / config.max_active_features, config, perspective)?;
    }
    Ok(())
}

fn read_count(cursor: &mut Cursor, section: &'static str, capacity: usize) -> Result<usize, BatchError> {
    let count = cursor.u64();
    if count > capacity as u64 {
        return Err(BatchError::CountExceedsCapacity {
            section,
            count: count as usize,
            capacity,
        });
    }
    Ok(count as usize)
}

fn check_entry(value: i16, batch_size: usize) -> Result<usize, BatchError> {
    if value < 0 || value as usize >= batch_size {
        return Err(BatchError::EntryOutOfRange {
            entry: value as i64,
            batch_size,
        });
    }
    Ok(value as usize)
}

fn read_feature_pairs(
    cursor: &mut Cursor,
    dest: &mut [i32],
    config: &NetConfig,
    perspective: Perspective,
) -> Result<(), BatchError> {
    let max_active = config.max_active_features;
    let section = match perspective {
        Perspective::Stm => "stm features",
        Perspective::Ntm => "ntm features",
    };
    let count = read_count(cursor, section, dest.len())?;
    let mut filled = vec![0usize; config.batch_size];

    for pair in 0..dest.len() {
        let (entry, value) = (cursor.i16(), cursor.i16());
        if pair >= count {
            continue;
        }

        let entry = check_entry(entry, config.batch_size)?;
        let feature = check_feature(value, entry, config, perspective)?;
        if filled[entry] == max_active {
            return Err(BatchError::TooManyFeatures {
                entry,
                perspective,
                limit: max_active,
            });
        }
        dest[entry * max_active + filled[entry]] = feature;
        filled[entry] += 1;
    }
    Ok(())
}

fn check_unique_features(
    batch: &Batch,
    perspective: Perspective,
    scratch: &mut Vec<i32>,
) -> Result<(), BatchError> {
    for entry in 0..batch.size {
        if let Some(index) = first_duplicate(batch.entry_features(perspective, entry), scratch) {
            return Err(BatchError::DuplicateFeature {
                entry,
                perspective,
                index,
            });
        }
    }
    Ok(())
}

fn first_duplicate(slots: &[i32], scratch: &mut Vec<i32>) -> Option<i32> {
    scratch.clear();
    scratch.extend(slots.iter().copied().filter(|&s| s != SENTINEL));
    scratch.sort_unstable();
    scratch.windows(2).find(|w| w[0] == w[1]).map(|w| w[0])
}

fn check_move(value: i16, entry: usize, config: &NetConfig) -> Result<i32, BatchError> {
    let index = value as i32;
    if index < 0 || index as usize >= config.policy_output_size {
        return Err(BatchError::MoveOutOfRange {
            entry,
            index: index as i64,
            limit: config.policy_output_size,
        });
    }
    Ok(index)
}

fn read_move_slots(
    cursor: &mut Cursor,
    batch: &mut Batch,
    config: &NetConfig,
    target: PolicyTarget,
) -> Result<(), BatchError> {
    let max_moves = config.max_moves_per_pos;

    for (slot, legal) in batch.legal_moves.iter_mut().enumerate() {
        let value = cursor.i16();
        if value as i32 == SENTINEL {
            continue;
        }
        *legal = check_move(value, slot / max_moves, config)?;
    }

    if target == PolicyTarget::BestMove {
        return Ok(());
    }

    for (weight, &legal) in batch.move_weights.iter_mut().zip(&batch.legal_moves) {
        let value = cursor.weight(target, false);
        if legal != SENTINEL {
            *weight = value;
        }
    }
    Ok(())
}

fn read_move_pairs(
    cursor: &mut Cursor,
    batch: &mut Batch,
    config: &NetConfig,
    target: PolicyTarget,
) -> Result<(), BatchError> {
    let max_moves = config.max_moves_per_pos;
    let capacity = batch.legal_moves.len();
    let count = read_count(cursor, "moves", capacity)?;
    let mut filled = vec![0usize; config.batch_size];

    for pair in 0..capacity {
        let (entry, value) = (cursor.i16(), cursor.i16());
        let weight = cursor.weight(target, true);
        if pair >= count {
            continue;
        }

        let entry = check_entry(entry, config.batch_size)?;
        let slot = check_move(value, entry, config)?;

        // A zero flag marks a move the producer considered illegal
        if target == PolicyTarget::BestMove && weight == 0.0 {
            continue;
        }

        if filled[entry] == max_moves {
            return Err(BatchError::TooManyMoves {
                entry,
                limit: max_moves,
            });
        }
        let at = entry * max_moves + filled[entry];
        batch.legal_moves[at] = slot;
        if target != PolicyTarget::BestMove {
            batch.move_weights[at] = weight;
        }
        filled[entry] += 1;
    }
    Ok(())
}

fn check_entry_moves(batch: &Batch, entry: usize, scratch: &mut Vec<i32>) -> Result<(), BatchError> {
    let moves = batch.entry_moves(entry);
    if moves.iter().all(|&m| m == SENTINEL) {
        return Err(BatchError::NoLegalMoves { entry });
    }
    if let Some(index) = first_duplicate(moves, scratch) {
        return Err(BatchError::DuplicateMove { entry, index });
    }
    Ok(())
}

fn mark_best_moves(batch: &mut Batch, best: &[i16]) -> Result<(), BatchError> {
    let max_moves = batch.max_moves;

    for (entry, &best) in best.iter().enumerate() {
        let position = batch
            .entry_moves(entry)
            .iter()
            .position(|&m| m == best as i32 && m != SENTINEL)
            .ok_or(BatchError::BestMoveNotLegal {
                entry,
                index: best as i64,
            })?;
        batch.move_weights[entry * max_moves + position] = 1.0;
    }
    Ok(())
}

fn check_visit_weights(batch: &Batch) -> Result<(), BatchError> {
    for entry in 0..batch.size {
        let mut total = 0f32;
        for (&slot, &value) in batch.entry_moves(entry).iter().zip(batch.entry_weights(entry)) {
            if slot == SENTINEL {
                continue;
            }
            if !value.is_finite() || value < 0.0 {
                return Err(BatchError::InvalidVisitWeight { entry, value });
            }
            total += value;
        }
        if total <= 0.0 {
            return Err(BatchError::ZeroVisits { entry });
        }
    }
    Ok(())
}
