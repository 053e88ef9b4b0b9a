//! Batch wire protocol.
//!
//! A batch travels as one flat little-endian record whose size depends only on
//! the [`NetConfig`] and the [`WireLayout`]. With `B` = batch size,
//! `A` = max active features and `M` = max moves per position, a record is:
//!
//! | section            | `Slots`                    | `Pairs`                                     |
//! |--------------------|----------------------------|---------------------------------------------|
//! | stm features       | `i16 [B × A]`              | `u64` count, `(i16 entry, i16 feature) [B × A]` |
//! | ntm features       | `i16 [B × A]`              | same                                        |
//! | scores             | `i16 [B]`                  | `i16 [B]`                                   |
//! | WDL labels         | `f32 [B]`                  | `f32 [B]`                                   |
//! | best move          | `i16 [B]` (`BestMove` only)| `i16 [B]` (`BestMove` only)                 |
//! | legal moves        | `i16 [B × M]` then weights `[B × M]` | `u64` count, `(i16 entry, i16 move, weight) [B × M]` |
//!
//! The weight type follows [`PolicyTarget`]: none in slot form and a `u8`
//! legality flag in pair form for `BestMove`, `u8` for `VisitCounts`, `f32`
//! for `VisitPercent`. Pair sections always occupy their full capacity; the
//! entries past `count` are padding. Unused slots hold `-1`.

mod batch;
mod decode;
mod encode;

pub use batch::Batch;
pub use decode::decode_into;
pub use encode::encode_batch;

use crate::config::NetConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Perspective {
    /// Side to move
    Stm,
    /// Not to move
    Ntm,
}

impl Perspective {
    pub const ALL: [Perspective; 2] = [Perspective::Stm, Perspective::Ntm];
}

/// How feature index lists are laid out in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeatureLayout {
    /// `max_active_features` slots per entry.
    #[default]
    Slots,
    /// A count followed by `(entry, feature)` pairs.
    Pairs,
}

/// How legal moves and their target weights are laid out in a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MoveLayout {
    /// `max_moves_per_pos` slots per entry, followed by a parallel weight array.
    #[default]
    Slots,
    /// A count followed by `(entry, move, weight)` triples.
    Pairs,
}

/// What the policy head is trained against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyTarget {
    /// A single best move per entry, one-hot over the legal moves.
    #[default]
    BestMove,
    /// Raw `u8` visit counts per legal move, normalized by the consumer.
    VisitCounts,
    /// Visit fractions per legal move, already normalized by the producer.
    VisitPercent,
}

impl PolicyTarget {
    /// Bytes per weight in the slot form of the moves section.
    fn slot_weight_bytes(self) -> usize {
        match self {
            PolicyTarget::BestMove => 0,
            PolicyTarget::VisitCounts => 1,
            PolicyTarget::VisitPercent => 4,
        }
    }

    /// Bytes per weight in the pair form of the moves section.
    fn pair_weight_bytes(self) -> usize {
        match self {
            PolicyTarget::BestMove | PolicyTarget::VisitCounts => 1,
            PolicyTarget::VisitPercent => 4,
        }
    }
}

impl std::str::FromStr for FeatureLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slots" => Ok(Self::Slots),
            "pairs" => Ok(Self::Pairs),
            other => Err(format!("unknown feature layout: {other}")),
        }
    }
}

impl std::str::FromStr for MoveLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "slots" => Ok(Self::Slots),
            "pairs" => Ok(Self::Pairs),
            other => Err(format!("unknown move layout: {other}")),
        }
    }
}

impl std::str::FromStr for PolicyTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-move" => Ok(Self::BestMove),
            "visit-counts" => Ok(Self::VisitCounts),
            "visit-percent" => Ok(Self::VisitPercent),
            other => Err(format!("unknown policy target: {other}")),
        }
    }
}

/// The representation choices a producer and consumer must agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireLayout {
    pub features: FeatureLayout,
    pub moves: MoveLayout,
    pub target: PolicyTarget,
}

const INDEX_BYTES: usize = 2;
const COUNT_BYTES: usize = 8;

impl WireLayout {
    /// Size in bytes of one batch record.
    pub fn record_size(&self, config: &NetConfig) -> usize {
        let batch = config.batch_size;
        let feature_capacity = batch * config.max_active_features;
        let move_capacity = batch * config.max_moves_per_pos;

        let features = match self.features {
            FeatureLayout::Slots => feature_capacity * INDEX_BYTES,
            FeatureLayout::Pairs => COUNT_BYTES + feature_capacity * 2 * INDEX_BYTES,
        };

        let best_move = match self.target {
            PolicyTarget::BestMove => batch * INDEX_BYTES,
            _ => 0,
        };

        let moves = match self.moves {
            MoveLayout::Slots => move_capacity * (INDEX_BYTES + self.target.slot_weight_bytes()),
            MoveLayout::Pairs => {
                COUNT_BYTES + move_capacity * (2 * INDEX_BYTES + self.target.pair_weight_bytes())
            }
        };

        2 * features + batch * (2 + 4) + best_move + moves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size_matches_the_documented_layout() {
        let config = NetConfig {
            batch_size: 4,
            max_active_features: 32,
            max_moves_per_pos: 218,
            ..NetConfig::default()
        };

        let slots = WireLayout::default();
        assert_eq!(
            slots.record_size(&config),
            2 * (4 * 32 * 2) + 4 * 2 + 4 * 4 + 4 * 2 + 4 * 218 * 2
        );

        let pairs = WireLayout {
            features: FeatureLayout::Pairs,
            moves: MoveLayout::Pairs,
            target: PolicyTarget::VisitPercent,
        };
        assert_eq!(
            pairs.record_size(&config),
            2 * (8 + 4 * 32 * 4) + 4 * 2 + 4 * 4 + 8 + 4 * 218 * 8
        );
    }
}
