use candle_core::{Result as CandleResult, Tensor};
use candle_nn::ops::{log_softmax, sigmoid};

const VALUE_LOSS_POWER: f64 = 2.5;

/// `mean(|σ(v) − t|^2.5)` with `t = σ(score / scale)·(1 − w) + wdl·w`.
pub fn value_loss(
    pred: &Tensor,
    scores: &Tensor,
    wdl: &Tensor,
    score_scale: f64,
    wdl_weight: f64,
) -> CandleResult<Tensor> {
    let from_score = (sigmoid(&scores.affine(1.0 / score_scale, 0.0)?)? * (1.0 - wdl_weight))?;
    let expected = (from_score + (wdl * wdl_weight)?)?;

    (sigmoid(pred)? - expected)?
        .abs()?
        .powf(VALUE_LOSS_POWER)?
        .mean_all()
}

/// Cross-entropy of the logits against a soft target distribution, averaged
/// over the batch. Masked logits carry no target mass.
pub fn policy_loss(logits: &Tensor, targets: &Tensor) -> CandleResult<Tensor> {
    let batch = logits.dim(0)?;
    (log_softmax(logits, 1)? * targets)?
        .sum_all()?
        .affine(-1.0 / batch as f64, 0.0)
}
