//! Policy head restricted to legal moves.
//!
//! The policy head is a `[policy_output_size][hidden]` linear layer, but a
//! position only has a handful of legal moves. Only the logits named by the
//! example's legal-move list are computed; every other slot holds
//! [`MASKED_LOGIT`].

use rayon::prelude::*;

use super::scatter::{group_reduce, row_source, AtomicRows, Contribution};
use super::{active, add_scaled, dot_product, ScatterStrategy, MASKED_LOGIT};

static ONE: [f32; 1] = [1.0];

#[derive(Debug, Clone)]
pub struct MoveProjectionGrads {
    pub hidden: Vec<f32>,
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

/// Computes `[batch][policy_output_size]` logits.
///
/// `logits[e][s] = bias[s] + hidden[e] · weights[s]` for every legal slot `s`
/// of example `e`, and [`MASKED_LOGIT`] everywhere else.
pub fn forward(
    hidden: &[f32],
    weights: &[f32],
    bias: &[f32],
    legal_moves: &[i32],
    max_moves: usize,
) -> Vec<f32> {
    let outputs = bias.len();
    let width = weights.len() / outputs;
    let batch = legal_moves.len() / max_moves;
    debug_assert_eq!(hidden.len(), batch * width);

    let mut logits = vec![MASKED_LOGIT; batch * outputs];

    logits
        .par_chunks_mut(outputs)
        .zip(hidden.par_chunks(width))
        .zip(legal_moves.par_chunks(max_moves))
        .for_each(|((out, h), moves)| {
            for slot in active(moves) {
                let row = &weights[slot * width..(slot + 1) * width];
                out[slot] = bias[slot] + dot_product(h, row);
            }
        });

    logits
}

/// Backpropagates `out_grad` (`[batch][policy_output_size]`). Gradient on
/// masked slots is ignored: those logits are constants.
///
/// The hidden gradient of an example only depends on that example's legal
/// moves, so each task owns its row and needs no synchronization. Weight and
/// bias rows are shared between examples and go through `strategy`.
pub fn backward(
    out_grad: &[f32],
    hidden: &[f32],
    weights: &[f32],
    legal_moves: &[i32],
    max_moves: usize,
    strategy: ScatterStrategy,
) -> MoveProjectionGrads {
    let batch = legal_moves.len() / max_moves;
    let width = hidden.len() / batch.max(1);
    let outputs = weights.len() / width.max(1);
    debug_assert_eq!(out_grad.len(), batch * outputs);

    let mut hidden_grad = vec![0f32; batch * width];
    hidden_grad
        .par_chunks_mut(width)
        .zip(out_grad.par_chunks(outputs))
        .zip(legal_moves.par_chunks(max_moves))
        .for_each(|((dest, grad), moves)| {
            for slot in active(moves) {
                add_scaled(dest, &weights[slot * width..(slot + 1) * width], grad[slot]);
            }
        });

    let (weight_grad, bias_grad) = match strategy {
        ScatterStrategy::Atomic => {
            let weight_grad = AtomicRows::zeros(outputs, width);
            let bias_grad = AtomicRows::zeros(outputs, 1);

            out_grad
                .par_chunks(outputs)
                .zip(hidden.par_chunks(width))
                .zip(legal_moves.par_chunks(max_moves))
                .for_each(|((grad, h), moves)| {
                    for slot in active(moves) {
                        weight_grad.add_scaled_row(slot, grad[slot], h);
                        bias_grad.add(slot, grad[slot]);
                    }
                });

            (weight_grad.into_vec(), bias_grad.into_vec())
        }
        ScatterStrategy::Grouped => {
            let contributions: Vec<Contribution> = legal_moves
                .chunks(max_moves)
                .enumerate()
                .flat_map(|(e, moves)| {
                    active(moves).map(move |slot| Contribution {
                        row: slot as u32,
                        example: e as u32,
                        coeff: out_grad[e * outputs + slot],
                    })
                })
                .collect();

            (
                group_reduce(outputs, width, &contributions, row_source(hidden, width)),
                group_reduce(outputs, 1, &contributions, |_| &ONE[..]),
            )
        }
    };

    MoveProjectionGrads {
        hidden: hidden_grad,
        weights: weight_grad,
        bias: bias_grad,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{assert_approx_eq, SENTINEL};
    use rand::Rng;

    const HIDDEN: usize = 8;
    const OUTPUTS: usize = 1882;
    const MAX_MOVES: usize = 16;

    fn random_vec(len: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    fn padded(moves: &[i32]) -> Vec<i32> {
        let mut slots = vec![SENTINEL; MAX_MOVES];
        slots[..moves.len()].copy_from_slice(moves);
        slots
    }

    #[test]
    fn unlisted_slots_are_masked_and_listed_slots_are_dot_products() {
        let weights = random_vec(OUTPUTS * HIDDEN);
        let bias = random_vec(OUTPUTS);
        let legal = padded(&[5, 1881]);

        for _ in 0..3 {
            let hidden = random_vec(HIDDEN);
            let logits = forward(&hidden, &weights, &bias, &legal, MAX_MOVES);

            for slot in 0..OUTPUTS {
                if slot == 5 || slot == 1881 {
                    let row = &weights[slot * HIDDEN..(slot + 1) * HIDDEN];
                    let expected =
                        bias[slot] + hidden.iter().zip(row).map(|(a, b)| a * b).sum::<f32>();
                    assert_approx_eq(logits[slot], expected, "Logit");
                } else {
                    assert_eq!(logits[slot], MASKED_LOGIT);
                }
            }
        }
    }

    #[test]
    fn backward_matches_dense_reference() {
        const BATCH: usize = 3;
        let weights = random_vec(OUTPUTS * HIDDEN);
        let hidden = random_vec(BATCH * HIDDEN);
        let mut legal = padded(&[0, 17, 1881]);
        legal.extend(padded(&[17]));
        legal.extend(padded(&[3, 17, 900, 1000]));
        let out_grad = random_vec(BATCH * OUTPUTS);

        for strategy in [ScatterStrategy::Atomic, ScatterStrategy::Grouped] {
            let grads = backward(&out_grad, &hidden, &weights, &legal, MAX_MOVES, strategy);

            let mut hidden_ref = vec![0f32; BATCH * HIDDEN];
            let mut weight_ref = vec![0f32; OUTPUTS * HIDDEN];
            let mut bias_ref = vec![0f32; OUTPUTS];
            for e in 0..BATCH {
                for slot in active(&legal[e * MAX_MOVES..(e + 1) * MAX_MOVES]) {
                    let g = out_grad[e * OUTPUTS + slot];
                    bias_ref[slot] += g;
                    for h in 0..HIDDEN {
                        hidden_ref[e * HIDDEN + h] += g * weights[slot * HIDDEN + h];
                        weight_ref[slot * HIDDEN + h] += g * hidden[e * HIDDEN + h];
                    }
                }
            }

            for (got, want) in grads.hidden.iter().zip(&hidden_ref) {
                assert_approx_eq(*got, *want, "Hidden gradient");
            }
            for (got, want) in grads.weights.iter().zip(&weight_ref) {
                assert_approx_eq(*got, *want, "Weight gradient");
            }
            for (got, want) in grads.bias.iter().zip(&bias_ref) {
                assert_approx_eq(*got, *want, "Bias gradient");
            }
        }
    }

    #[test]
    fn gradient_on_masked_slots_is_ignored() {
        let weights = random_vec(OUTPUTS * HIDDEN);
        let hidden = random_vec(HIDDEN);
        let legal = padded(&[5]);
        let mut out_grad = vec![1.0f32; OUTPUTS];
        out_grad[5] = 0.0;

        let grads = backward(&out_grad, &hidden, &weights, &legal, MAX_MOVES, ScatterStrategy::Atomic);

        assert!(grads.hidden.iter().all(|&g| g == 0.0));
        assert!(grads.weights.iter().all(|&g| g == 0.0));
        assert!(grads.bias.iter().all(|&g| g == 0.0));
    }
}
