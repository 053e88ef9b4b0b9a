use std::sync::Arc;

use candle_core::{Result, Tensor};
use candle_nn::{Init, Linear, Module, VarBuilder, VarMap};

use super::{FeatureTransformer, MoveProjection, INIT_RANGE};
use crate::config::NetConfig;
use crate::export::{ExportShape, NetworkParams};
use crate::kernels::ScatterStrategy;
use crate::wire::{Batch, Perspective};

/// Index lists of one batch, shared with the ops that read them.
#[derive(Debug, Clone)]
pub struct NetworkInputs {
    pub stm: Arc<[i32]>,
    pub ntm: Arc<[i32]>,
    pub legal_moves: Arc<[i32]>,
}

impl NetworkInputs {
    pub fn from_batch(batch: &Batch) -> Self {
        Self {
            stm: Arc::from(batch.features(Perspective::Stm)),
            ntm: Arc::from(batch.features(Perspective::Ntm)),
            legal_moves: Arc::from(batch.legal_moves.as_slice()),
        }
    }
}

// Candle network definition (used for training)
pub struct Network {
    pub(crate) ft: FeatureTransformer,
    pub(crate) value: Linear,
    pub(crate) policy: MoveProjection,
    hidden_size: usize,
}

impl Network {
    pub fn new(vs: &VarBuilder, config: &NetConfig, strategy: ScatterStrategy) -> Result<Self> {
        let hidden = config.hidden_size;
        let init = Init::Uniform {
            lo: -INIT_RANGE,
            up: INIT_RANGE,
        };
        let value_vs = vs.pp("value");

        Ok(Self {
            ft: FeatureTransformer::new(
                vs.pp("ft"),
                config.input_size(),
                hidden,
                config.max_active_features,
                strategy,
            )?,
            value: Linear::new(
                value_vs.get_with_hints((1, hidden), "weight", init)?,
                Some(value_vs.get_with_hints(1, "bias", init)?),
            ),
            policy: MoveProjection::new(
                vs.pp("policy"),
                hidden,
                config.policy_output_size,
                config.max_moves_per_pos,
                strategy,
            )?,
            hidden_size: hidden,
        })
    }

    /// Returns `(value [batch × 1], policy logits [batch × policy_outputs])`.
    pub fn forward(&self, inputs: &NetworkInputs) -> Result<(Tensor, Tensor)> {
        let stm = self.ft.forward(inputs.stm.clone())?;
        let ntm = self.ft.forward(inputs.ntm.clone())?;

        // CReLU
        let x = Tensor::cat(&[&stm, &ntm], 1)?.clamp(0f32, 1f32)?;

        // Pairwise multiply adjacent units: [B, 2H] -> [B, H]
        let batch = x.dim(0)?;
        let pairs = x.reshape((batch, self.hidden_size, 2))?;
        let hidden = (pairs.narrow(2, 0, 1)? * pairs.narrow(2, 1, 1)?)?.squeeze(2)?;

        let value = self.value.forward(&hidden)?;
        let logits = self.policy.forward(&hidden, inputs.legal_moves.clone())?;

        Ok((value, logits))
    }

    /// Clamps the feature transformer into `[-bound, bound]` in place.
    ///
    /// Run after every optimizer step so the exported accumulator cannot
    /// overflow. `varmap` must be the map this network was built from; the
    /// variables are matched by tensor identity, whatever prefix they were
    /// registered under.
    pub fn clamp_feature_transformer(&self, varmap: &VarMap, bound: f32) -> Result<()> {
        let targets = [self.ft.weight().id(), self.ft.bias().id()];
        let mut clamped = 0;

        for var in varmap.all_vars() {
            if targets.contains(&var.id()) {
                var.set(&var.as_tensor().clamp(-bound, bound)?)?;
                clamped += 1;
            }
        }

        if clamped != targets.len() {
            candle_core::bail!("feature transformer variables are missing from the variable map");
        }
        Ok(())
    }

    /// Copies all parameters out in export order and layout.
    pub fn params(&self) -> Result<NetworkParams> {
        let flat = |t: &Tensor| t.flatten_all()?.to_vec1::<f32>();
        let value_bias = match self.value.bias() {
            Some(bias) => flat(bias)?,
            None => vec![0.0],
        };

        Ok(NetworkParams {
            shape: ExportShape {
                input_size: self.ft.weight().dim(0)?,
                hidden_size: self.hidden_size,
                policy_outputs: self.policy.weight().dim(0)?,
            },
            ft_weight: flat(self.ft.weight())?,
            ft_bias: flat(self.ft.bias())?,
            value_weight: flat(self.value.weight())?,
            value_bias,
            policy_weight: flat(self.policy.weight())?,
            policy_bias: flat(self.policy.bias())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::MASKED_LOGIT;
    use crate::wire::PolicyTarget;
    use candle_core::{DType, Device};

    fn small_config() -> NetConfig {
        NetConfig {
            hidden_size: 8,
            max_active_features: 4,
            policy_output_size: 32,
            max_moves_per_pos: 4,
            batch_size: 2,
            ..NetConfig::default()
        }
    }

    fn small_batch(config: &NetConfig) -> Batch {
        let mut batch = Batch::new(config, PolicyTarget::BestMove);
        batch.stm_features[..2].copy_from_slice(&[10, 700]);
        batch.ntm_features[..2].copy_from_slice(&[11, 701]);
        batch.stm_features[4] = 1000;
        batch.ntm_features[4] = 1001;
        batch.legal_moves[..2].copy_from_slice(&[3, 31]);
        batch.legal_moves[4] = 0;
        batch
    }

    #[test]
    fn forward_shapes_and_masking() -> Result<()> {
        let config = small_config();
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = Network::new(&vs, &config, ScatterStrategy::Atomic)?;

        let (value, logits) = network.forward(&NetworkInputs::from_batch(&small_batch(&config)))?;

        assert_eq!(value.dims(), &[2, 1]);
        assert_eq!(logits.dims(), &[2, 32]);

        let logits = logits.to_vec2::<f32>()?;
        for (entry, legal) in [vec![3usize, 31], vec![0]].iter().enumerate() {
            for slot in 0..32 {
                if legal.contains(&slot) {
                    assert!(logits[entry][slot] > MASKED_LOGIT);
                } else {
                    assert_eq!(logits[entry][slot], MASKED_LOGIT);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn clamp_bounds_feature_transformer_only() -> Result<()> {
        let config = small_config();
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = Network::new(&vs, &config, ScatterStrategy::Atomic)?;

        network.clamp_feature_transformer(&varmap, 0.01)?;

        let params = network.params()?;
        assert!(params.ft_weight.iter().all(|w| w.abs() <= 0.01));
        assert!(params.ft_bias.iter().all(|w| w.abs() <= 0.01));
        assert!(params.policy_weight.iter().any(|w| w.abs() > 0.01));
        Ok(())
    }

    #[test]
    fn clamp_follows_a_prefixed_builder() -> Result<()> {
        let config = small_config();
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu).pp("net");
        let network = Network::new(&vs, &config, ScatterStrategy::Atomic)?;
        assert!(varmap.data().lock().unwrap().contains_key("net.ft.weight"));

        network.clamp_feature_transformer(&varmap, 0.01)?;

        let params = network.params()?;
        assert!(params.ft_weight.iter().all(|w| w.abs() <= 0.01));
        assert!(params.ft_bias.iter().all(|w| w.abs() <= 0.01));
        Ok(())
    }

    #[test]
    fn clamp_rejects_a_foreign_variable_map() -> Result<()> {
        let config = small_config();
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = Network::new(&vs, &config, ScatterStrategy::Atomic)?;

        assert!(network.clamp_feature_transformer(&VarMap::new(), 0.01).is_err());
        Ok(())
    }

    #[test]
    fn every_parameter_receives_a_gradient() -> Result<()> {
        let config = small_config();
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let network = Network::new(&vs, &config, ScatterStrategy::Grouped)?;

        let batch = small_batch(&config);
        let (value, logits) = network.forward(&NetworkInputs::from_batch(&batch))?;
        let loss = (value.sum_all()? + candle_nn::ops::log_softmax(&logits, 1)?.sum_all()?)?;
        let grads = loss.backward()?;

        for var in varmap.all_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
        Ok(())
    }
}
