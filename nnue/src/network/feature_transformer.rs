use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use super::ops::FeatureTransformerOp;
use super::INIT_RANGE;
use crate::kernels::ScatterStrategy;

/// Shared sparse input layer. Both perspectives use the same weights.
pub struct FeatureTransformer {
    weight: Tensor,
    bias: Tensor,
    max_active: usize,
    strategy: ScatterStrategy,
}

impl FeatureTransformer {
    pub fn new(
        vs: VarBuilder,
        input_size: usize,
        hidden_size: usize,
        max_active: usize,
        strategy: ScatterStrategy,
    ) -> Result<Self> {
        let init = Init::Uniform {
            lo: -INIT_RANGE,
            up: INIT_RANGE,
        };

        Ok(Self {
            weight: vs.get_with_hints((input_size, hidden_size), "weight", init)?,
            bias: vs.get_with_hints(hidden_size, "bias", init)?,
            max_active,
            strategy,
        })
    }

    /// `[batch × hidden]` accumulators for `indices` (`[batch × max_active]`).
    pub fn forward(&self, indices: Arc<[i32]>) -> Result<Tensor> {
        let op = FeatureTransformerOp::new(
            indices,
            self.max_active,
            self.weight.dim(0)?,
            self.strategy,
        )?;
        self.weight.apply_op2(&self.bias, op)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}
