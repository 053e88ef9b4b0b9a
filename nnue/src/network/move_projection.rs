use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::{Init, VarBuilder};

use super::ops::MoveProjectionOp;
use super::INIT_RANGE;
use crate::kernels::ScatterStrategy;

/// Policy head that only evaluates legal moves.
pub struct MoveProjection {
    weight: Tensor,
    bias: Tensor,
    max_moves: usize,
    strategy: ScatterStrategy,
}

impl MoveProjection {
    pub fn new(
        vs: VarBuilder,
        hidden_size: usize,
        outputs: usize,
        max_moves: usize,
        strategy: ScatterStrategy,
    ) -> Result<Self> {
        let init = Init::Uniform {
            lo: -INIT_RANGE,
            up: INIT_RANGE,
        };

        Ok(Self {
            weight: vs.get_with_hints((outputs, hidden_size), "weight", init)?,
            bias: vs.get_with_hints(outputs, "bias", init)?,
            max_moves,
            strategy,
        })
    }

    /// `[batch × outputs]` logits for `hidden` (`[batch × hidden]`).
    pub fn forward(&self, hidden: &Tensor, legal_moves: Arc<[i32]>) -> Result<Tensor> {
        let op = MoveProjectionOp::new(
            legal_moves,
            self.max_moves,
            self.weight.dim(0)?,
            self.strategy,
        )?;
        hidden.contiguous()?.apply_op3(&self.weight, &self.bias, op)
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{MASKED_LOGIT, SENTINEL};
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;

    #[test]
    fn masked_logits_and_gradients() -> Result<()> {
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let policy = MoveProjection::new(vs, 3, 6, 2, ScatterStrategy::Atomic)?;

        let hidden = Var::from_vec(vec![1f32, 2.0, 3.0, -1.0, 0.5, 0.0], (2, 3), &Device::Cpu)?;
        let logits = policy.forward(hidden.as_tensor(), Arc::from(vec![4, SENTINEL, 0, 4]))?;
        let values = logits.to_vec2::<f32>()?;

        assert_eq!(values[0][0], MASKED_LOGIT);
        assert_ne!(values[0][4], MASKED_LOGIT);
        assert_eq!(values[1][1], MASKED_LOGIT);

        // Differentiate only the legal logits; the masked constants drop out
        let mask = Tensor::from_vec(
            vec![0f32, 0., 0., 0., 1., 0., 1., 0., 0., 0., 1., 0.],
            (2, 6),
            &Device::Cpu,
        )?;
        let grads = (logits * mask)?.sum_all()?.backward()?;

        let weight = policy.weight().to_vec2::<f32>()?;
        let hidden_grad = grads.get(hidden.as_tensor()).expect("hidden gradient").to_vec2::<f32>()?;
        for h in 0..3 {
            assert!((hidden_grad[0][h] - weight[4][h]).abs() < 1e-6);
            assert!((hidden_grad[1][h] - (weight[0][h] + weight[4][h])).abs() < 1e-6);
        }

        let bias_grad = grads.get(policy.bias()).expect("bias gradient").to_vec1::<f32>()?;
        assert_eq!(bias_grad, vec![1.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        Ok(())
    }
}
