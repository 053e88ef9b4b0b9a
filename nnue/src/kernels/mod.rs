//! Sparse kernels for the feature transformer and the policy head.
//!
//! Both kernels work on flat row-major `f32` slices and fixed-width `i32`
//! index lists padded with [`SENTINEL`]. Indices are trusted here: the wire
//! decoder has already rejected anything outside its declared space.
//!
//! Work is split one rayon task per example, with the hidden units (or move
//! slots) as the lanes inside it. Forward passes never share output cells.
//! Backward passes scatter into weight rows that several examples may select,
//! which is resolved by one of the [`ScatterStrategy`] variants.

pub mod feature_transformer;
pub mod move_projection;
pub mod scatter;

/// Marks an unused slot in a fixed-width index list.
pub const SENTINEL: i32 = -1;

/// Logit written to every slot that is not a legal move. A softmax over the
/// full output assigns these slots practically zero mass.
pub const MASKED_LOGIT: f32 = -10_000.0;

/// How colliding writes into shared gradient rows are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScatterStrategy {
    /// Every example adds into the shared rows with atomic float adds.
    #[default]
    Atomic,
    /// Contributions are grouped by target row and each row is reduced by a
    /// single task, in example order. Bit-for-bit deterministic.
    Grouped,
}

impl std::str::FromStr for ScatterStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atomic" => Ok(Self::Atomic),
            "grouped" => Ok(Self::Grouped),
            other => Err(format!("unknown scatter strategy: {other}")),
        }
    }
}

/// Iterates the non-sentinel entries of one example's index list.
#[inline(always)]
pub(crate) fn active(indices: &[i32]) -> impl Iterator<Item = usize> + '_ {
    indices
        .iter()
        .filter(|&&idx| idx != SENTINEL)
        .map(|&idx| idx as usize)
}

#[inline(always)]
pub(crate) fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[inline(always)]
pub(crate) fn add_scaled(dest: &mut [f32], src: &[f32], coeff: f32) {
    for (d, s) in dest.iter_mut().zip(src) {
        *d += coeff * s;
    }
}

#[cfg(test)]
pub(crate) fn assert_approx_eq(a: f32, b: f32, description: &str) {
    const EPSILON: f32 = 1e-4;

    assert!(
        (a - b).abs() < EPSILON,
        "{} differ by more than epsilon: |{} - {}| = {} > {}",
        description,
        a,
        b,
        (a - b).abs(),
        EPSILON
    );
}
