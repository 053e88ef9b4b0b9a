use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Optimizer, ParamsAdamW, VarMap};
use std::path::Path;

const STEP: &str = "step";

struct Moments {
    param: Var,
    first: Var,
    second: Var,
}

/// AdamW with decoupled weight decay, whose moment estimates and step count
/// are variables of their own `VarMap`. That map is saved and loaded next to
/// the weights, so a resumed run continues with the same optimizer state.
pub struct CheckpointedAdamW {
    moments: Vec<Moments>,
    steps: Var,
    state: VarMap,
    params: ParamsAdamW,
}

impl CheckpointedAdamW {
    /// Tracks every variable of `varmap`. Moments are named after the
    /// variables (`<name>.m`, `<name>.v`), so state saved from one run loads
    /// into a freshly built network.
    pub fn from_varmap(varmap: &VarMap, params: ParamsAdamW) -> Result<Self> {
        let mut named: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("variable map lock poisoned".into()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));
        Self::with_names(named, params)
    }

    fn with_names(named: Vec<(String, Var)>, params: ParamsAdamW) -> Result<Self> {
        let device = named
            .first()
            .map_or(Device::Cpu, |(_, var)| var.device().clone());
        let state = VarMap::new();
        let steps = Var::zeros(1, DType::F64, &device)?;
        let mut moments = Vec::with_capacity(named.len());

        {
            let mut data = state
                .data()
                .lock()
                .map_err(|_| candle_core::Error::Msg("optimizer state lock poisoned".into()))?;
            data.insert(STEP.to_string(), steps.clone());

            for (name, param) in named {
                if !param.dtype().is_float() {
                    continue;
                }
                let first = Var::from_tensor(&param.zeros_like()?)?;
                let second = Var::from_tensor(&param.zeros_like()?)?;
                data.insert(format!("{name}.m"), first.clone());
                data.insert(format!("{name}.v"), second.clone());
                moments.push(Moments {
                    param,
                    first,
                    second,
                });
            }
        }

        Ok(Self {
            moments,
            steps,
            state,
            params,
        })
    }

    /// Number of optimizer steps taken, including those of resumed runs.
    pub fn steps(&self) -> Result<u64> {
        Ok(self.steps.get(0)?.to_scalar::<f64>()? as u64)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.state.save(path)
    }

    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.state.load(path)
    }
}

impl Optimizer for CheckpointedAdamW {
    type Config = ParamsAdamW;

    /// Unnamed variables get positional state names; use
    /// [`CheckpointedAdamW::from_varmap`] for state that is checkpointed.
    fn new(vars: Vec<Var>, params: ParamsAdamW) -> Result<Self> {
        let named = vars
            .into_iter()
            .enumerate()
            .map(|(i, var)| (i.to_string(), var))
            .collect();
        Self::with_names(named, params)
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let t = self.steps.get(0)?.to_scalar::<f64>()? + 1.0;
        self.steps.set(&Tensor::new(&[t], self.steps.device())?)?;

        let ParamsAdamW {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params.clone();
        let scale_m = 1.0 / (1.0 - beta1.powi(t as i32));
        let scale_v = 1.0 / (1.0 - beta2.powi(t as i32));

        for moments in &self.moments {
            let Some(grad) = grads.get(moments.param.as_tensor()) else {
                continue;
            };

            let first = ((moments.first.as_tensor() * beta1)? + (grad * (1.0 - beta1))?)?;
            let second = ((moments.second.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
            let adjusted = ((&first * scale_m)? / ((&second * scale_v)?.sqrt()? + eps)?)?;
            let decayed = (moments.param.as_tensor() * (1.0 - lr * weight_decay))?;

            moments.param.set(&(decayed - (adjusted * lr)?)?)?;
            moments.first.set(&first)?;
            moments.second.set(&second)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}
