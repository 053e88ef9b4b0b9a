//! Sparse feature accumulation.
//!
//! The feature transformer is a linear layer whose input is a one-hot vector
//! with at most `max_active` set entries out of `input_size`. Instead of a
//! dense matmul, each example's hidden vector is the bias plus the weight rows
//! named by its index list.
//!
//! Weights are laid out `[input_size][hidden]`, so every active feature reads
//! one contiguous row.

use rayon::prelude::*;

use super::scatter::{group_reduce, row_source, AtomicRows, Contribution};
use super::{active, add_scaled, ScatterStrategy};

/// Gradients of the feature transformer. There is deliberately no gradient for
/// the index lists: feature selection is a lookup.
#[derive(Debug, Clone)]
pub struct FeatureTransformerGrads {
    pub weights: Vec<f32>,
    pub bias: Vec<f32>,
}

/// `hidden[e] = bias + Σ weights[idx]` over the active indices of example `e`.
///
/// `indices` holds `max_active` slots per example; the output is
/// `[batch][bias.len()]`.
pub fn forward(indices: &[i32], weights: &[f32], bias: &[f32], max_active: usize) -> Vec<f32> {
    let hidden = bias.len();
    let batch = indices.len() / max_active;
    debug_assert_eq!(indices.len(), batch * max_active);
    debug_assert_eq!(weights.len() % hidden, 0);

    let mut output = vec![0f32; batch * hidden];

    output
        .par_chunks_mut(hidden)
        .zip(indices.par_chunks(max_active))
        .for_each(|(out, features)| {
            out.copy_from_slice(bias);
            for idx in active(features) {
                let offset = idx * hidden;
                add_scaled(out, &weights[offset..offset + hidden], 1.0);
            }
        });

    output
}

/// Scatters `out_grad` (`[batch][hidden]`) back into the rows each example
/// selected. Rows no example selected get an all-zero gradient.
pub fn backward(
    out_grad: &[f32],
    indices: &[i32],
    input_size: usize,
    hidden: usize,
    max_active: usize,
    strategy: ScatterStrategy,
) -> FeatureTransformerGrads {
    let batch = indices.len() / max_active;
    debug_assert_eq!(out_grad.len(), batch * hidden);

    match strategy {
        ScatterStrategy::Atomic => {
            let weights = AtomicRows::zeros(input_size, hidden);
            let bias = AtomicRows::zeros(1, hidden);

            out_grad
                .par_chunks(hidden)
                .zip(indices.par_chunks(max_active))
                .for_each(|(grad, features)| {
                    bias.add_scaled_row(0, 1.0, grad);
                    for idx in active(features) {
                        weights.add_scaled_row(idx, 1.0, grad);
                    }
                });

            FeatureTransformerGrads {
                weights: weights.into_vec(),
                bias: bias.into_vec(),
            }
        }
        ScatterStrategy::Grouped => {
            let row_of = row_source(out_grad, hidden);

            let contributions: Vec<Contribution> = indices
                .chunks(max_active)
                .enumerate()
                .flat_map(|(e, features)| {
                    active(features).map(move |idx| Contribution {
                        row: idx as u32,
                        example: e as u32,
                        coeff: 1.0,
                    })
                })
                .collect();

            let every_example: Vec<Contribution> = (0..batch)
                .map(|e| Contribution {
                    row: 0,
                    example: e as u32,
                    coeff: 1.0,
                })
                .collect();

            FeatureTransformerGrads {
                weights: group_reduce(input_size, hidden, &contributions, row_of),
                bias: group_reduce(1, hidden, &every_example, row_of),
            }
        }
    }
}
