//! Candle custom ops over the sparse kernels.
//!
//! Each op owns the index lists it was built with, so the backward pass sees
//! exactly the indices the forward pass used. Indices never receive a
//! gradient. Only CPU storage is supported.

use std::sync::Arc;

use candle_core::{bail, CpuStorage, CustomOp2, CustomOp3, Layout, Result, Shape, Tensor};

use crate::kernels::{feature_transformer, move_projection, ScatterStrategy, SENTINEL};

fn contiguous_f32<'a>(storage: &'a CpuStorage, layout: &Layout, name: &str) -> Result<&'a [f32]> {
    let data = storage.as_slice::<f32>()?;
    match layout.contiguous_offsets() {
        Some((start, end)) => Ok(&data[start..end]),
        None => bail!("{name} must be contiguous"),
    }
}

fn to_vec(tensor: &Tensor) -> Result<Vec<f32>> {
    tensor.contiguous()?.flatten_all()?.to_vec1::<f32>()
}

/// Checks that `indices` is `[batch × slots]`, padded with the sentinel, and
/// that every index is below `limit`.
fn check_indices(indices: &[i32], slots: usize, limit: usize, name: &str) -> Result<usize> {
    if slots == 0 || indices.len() % slots != 0 {
        bail!("{name}: {} indices do not split into {slots} slots", indices.len());
    }
    if let Some(bad) = indices
        .iter()
        .find(|&&i| i != SENTINEL && (i < 0 || i as usize >= limit))
    {
        bail!("{name}: index {bad} outside [0, {limit})");
    }
    Ok(indices.len() / slots)
}

/// `(weight [input × hidden], bias [hidden]) -> [batch × hidden]`
pub struct FeatureTransformerOp {
    indices: Arc<[i32]>,
    max_active: usize,
    batch: usize,
    strategy: ScatterStrategy,
}

impl FeatureTransformerOp {
    pub fn new(
        indices: Arc<[i32]>,
        max_active: usize,
        input_size: usize,
        strategy: ScatterStrategy,
    ) -> Result<Self> {
        let batch = check_indices(&indices, max_active, input_size, "feature transformer")?;
        Ok(Self {
            indices,
            max_active,
            batch,
            strategy,
        })
    }
}

impl CustomOp2 for FeatureTransformerOp {
    fn name(&self) -> &'static str {
        "sparse-feature-transformer"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let (input_size, hidden) = l1.shape().dims2()?;
        if l2.shape().dims1()? != hidden {
            bail!("feature transformer bias does not match {hidden} hidden units");
        }
        let weights = contiguous_f32(s1, l1, "feature transformer weight")?;
        let bias = contiguous_f32(s2, l2, "feature transformer bias")?;
        debug_assert_eq!(weights.len(), input_size * hidden);

        let output = feature_transformer::forward(&self.indices, weights, bias, self.max_active);
        Ok((CpuStorage::F32(output), Shape::from((self.batch, hidden))))
    }

    fn bwd(
        &self,
        weights: &Tensor,
        bias: &Tensor,
        _res: &Tensor,
        grad: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>)> {
        let (input_size, hidden) = weights.dims2()?;
        let grads = feature_transformer::backward(
            &to_vec(grad)?,
            &self.indices,
            input_size,
            hidden,
            self.max_active,
            self.strategy,
        );

        let weight_grad = Tensor::from_vec(grads.weights, (input_size, hidden), weights.device())?;
        let bias_grad = Tensor::from_vec(grads.bias, hidden, bias.device())?;
        Ok((Some(weight_grad), Some(bias_grad)))
    }
}

/// `(hidden [batch × H], weight [P × H], bias [P]) -> [batch × P]` logits,
/// masked outside each example's legal moves.
pub struct MoveProjectionOp {
    legal_moves: Arc<[i32]>,
    max_moves: usize,
    strategy: ScatterStrategy,
}

impl MoveProjectionOp {
    pub fn new(
        legal_moves: Arc<[i32]>,
        max_moves: usize,
        outputs: usize,
        strategy: ScatterStrategy,
    ) -> Result<Self> {
        check_indices(&legal_moves, max_moves, outputs, "move projection")?;
        Ok(Self {
            legal_moves,
            max_moves,
            strategy,
        })
    }
}

impl CustomOp3 for MoveProjectionOp {
    fn name(&self) -> &'static str {
        "sparse-move-projection"
    }

    fn cpu_fwd(
        &self,
        s1: &CpuStorage,
        l1: &Layout,
        s2: &CpuStorage,
        l2: &Layout,
        s3: &CpuStorage,
        l3: &Layout,
    ) -> Result<(CpuStorage, Shape)> {
        let (batch, width) = l1.shape().dims2()?;
        let (outputs, weight_width) = l2.shape().dims2()?;
        if weight_width != width || l3.shape().dims1()? != outputs {
            bail!("move projection parameters do not match {width} hidden units");
        }
        if batch * self.max_moves != self.legal_moves.len() {
            bail!("move projection: hidden batch {batch} does not match the legal move lists");
        }

        let hidden = contiguous_f32(s1, l1, "move projection input")?;
        let weights = contiguous_f32(s2, l2, "move projection weight")?;
        let bias = contiguous_f32(s3, l3, "move projection bias")?;

        let logits = move_projection::forward(hidden, weights, bias, &self.legal_moves, self.max_moves);
        Ok((CpuStorage::F32(logits), Shape::from((batch, outputs))))
    }

    fn bwd(
        &self,
        hidden: &Tensor,
        weights: &Tensor,
        bias: &Tensor,
        _res: &Tensor,
        grad: &Tensor,
    ) -> Result<(Option<Tensor>, Option<Tensor>, Option<Tensor>)> {
        let grads = move_projection::backward(
            &to_vec(grad)?,
            &to_vec(hidden)?,
            &to_vec(weights)?,
            &self.legal_moves,
            self.max_moves,
            self.strategy,
        );

        Ok((
            Some(Tensor::from_vec(grads.hidden, hidden.dims(), hidden.device())?),
            Some(Tensor::from_vec(grads.weights, weights.dims(), weights.device())?),
            Some(Tensor::from_vec(grads.bias, bias.dims(), bias.device())?),
        ))
    }
}
