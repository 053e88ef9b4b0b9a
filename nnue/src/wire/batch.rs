use crate::config::NetConfig;
use crate::kernels::SENTINEL;

use super::{Perspective, PolicyTarget};

/// A decoded, validated batch.
///
/// Every buffer has a fixed size derived from the [`NetConfig`], so a `Batch`
/// can be decoded into over and over without reallocating.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub size: usize,
    pub max_active: usize,
    pub max_moves: usize,
    pub policy_outputs: usize,
    pub target: PolicyTarget,
    /// `[size × max_active]` side-to-move feature indices, `-1` padded.
    pub stm_features: Vec<i32>,
    /// `[size × max_active]` not-to-move feature indices, `-1` padded.
    pub ntm_features: Vec<i32>,
    /// Search scores in centipawns, side-to-move relative.
    pub scores: Vec<i16>,
    /// Game outcome from the side to move's view, in `[0, 1]`.
    pub wdl: Vec<f32>,
    /// `[size × max_moves]` policy slots of the legal moves, `-1` padded.
    pub legal_moves: Vec<i32>,
    /// Raw target weight per legal move slot: `1.0` on the best move, the
    /// visit count, or the visit fraction, depending on `target`.
    pub move_weights: Vec<f32>,
}

impl Batch {
    pub fn new(config: &NetConfig, target: PolicyTarget) -> Self {
        let size = config.batch_size;
        let features = size * config.max_active_features;
        let moves = size * config.max_moves_per_pos;

        Self {
            size,
            max_active: config.max_active_features,
            max_moves: config.max_moves_per_pos,
            policy_outputs: config.policy_output_size,
            target,
            stm_features: vec![SENTINEL; features],
            ntm_features: vec![SENTINEL; features],
            scores: vec![0; size],
            wdl: vec![0.0; size],
            legal_moves: vec![SENTINEL; moves],
            move_weights: vec![0.0; moves],
        }
    }

    /// Restores the freshly constructed state, keeping allocations.
    pub(super) fn clear(&mut self, target: PolicyTarget) {
        self.target = target;
        self.stm_features.fill(SENTINEL);
        self.ntm_features.fill(SENTINEL);
        self.scores.fill(0);
        self.wdl.fill(0.0);
        self.legal_moves.fill(SENTINEL);
        self.move_weights.fill(0.0);
    }

    pub fn features(&self, perspective: Perspective) -> &[i32] {
        match perspective {
            Perspective::Stm => &self.stm_features,
            Perspective::Ntm => &self.ntm_features,
        }
    }

    pub fn features_mut(&mut self, perspective: Perspective) -> &mut [i32] {
        match perspective {
            Perspective::Stm => &mut self.stm_features,
            Perspective::Ntm => &mut self.ntm_features,
        }
    }

    /// Feature slots of one entry, including padding.
    pub fn entry_features(&self, perspective: Perspective, entry: usize) -> &[i32] {
        &self.features(perspective)[entry * self.max_active..(entry + 1) * self.max_active]
    }

    /// Legal move slots of one entry, including padding.
    pub fn entry_moves(&self, entry: usize) -> &[i32] {
        &self.legal_moves[entry * self.max_moves..(entry + 1) * self.max_moves]
    }

    pub fn entry_weights(&self, entry: usize) -> &[f32] {
        &self.move_weights[entry * self.max_moves..(entry + 1) * self.max_moves]
    }

    /// Dense `[size × policy_outputs]` target distribution.
    ///
    /// Each entry's weights are normalized over its legal moves; every slot
    /// that is not a legal move is zero.
    pub fn policy_targets(&self) -> Vec<f32> {
        let mut targets = vec![0f32; self.size * self.policy_outputs];

        for (entry, dense) in targets.chunks_mut(self.policy_outputs).enumerate() {
            let moves = self.entry_moves(entry);
            let weights = self.entry_weights(entry);

            let total: f32 = moves
                .iter()
                .zip(weights)
                .filter(|(&m, _)| m != SENTINEL)
                .map(|(_, &w)| w)
                .sum();
            if total <= 0.0 {
                continue;
            }

            for (&slot, &weight) in moves.iter().zip(weights) {
                if slot != SENTINEL {
                    dense[slot as usize] = weight / total;
                }
            }
        }

        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> NetConfig {
        NetConfig {
            batch_size: 2,
            max_active_features: 4,
            max_moves_per_pos: 3,
            policy_output_size: 10,
            ..NetConfig::default()
        }
    }

    #[test]
    fn policy_targets_normalize_over_legal_moves() {
        let mut batch = Batch::new(&small_config(), PolicyTarget::VisitCounts);
        batch.legal_moves = vec![2, 7, SENTINEL, 9, SENTINEL, 0];
        batch.move_weights = vec![30.0, 10.0, 99.0, 1.0, 5.0, 3.0];

        let targets = batch.policy_targets();

        assert_eq!(targets.len(), 20);
        assert_eq!(targets[2], 0.75);
        assert_eq!(targets[7], 0.25);
        assert_eq!(targets[10 + 9], 0.25);
        assert_eq!(targets[10], 0.75);
        assert_eq!(targets.iter().filter(|&&t| t != 0.0).count(), 4);
    }
}
