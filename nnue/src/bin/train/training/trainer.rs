use candle_core::{DType, Device, Result as CandleResult, Tensor};
use candle_nn::{Optimizer, ParamsAdamW, VarBuilder, VarMap};
use nnue::network::{Network, NetworkInputs};
use nnue::wire::Batch;
use nnue::NetConfig;
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::args::Args;
use crate::checkpoint;
use crate::loss::{policy_loss, value_loss};
use crate::training::optimizer::CheckpointedAdamW;
use crate::training::progress::TrainingProgressBar;
use crate::training::schedule::StepLr;

/// Where a batch comes from. The data loader in production, fixed batches in tests.
pub trait BatchSource {
    fn next_batch(&mut self) -> Result<&Batch, Box<dyn Error>>;
}

impl BatchSource for nnue::loader::BatchReader {
    fn next_batch(&mut self) -> Result<&Batch, Box<dyn Error>> {
        Ok(nnue::loader::BatchReader::next_batch(self)?)
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct LossTotals {
    value: f64,
    policy: f64,
    batches: usize,
}

impl LossTotals {
    fn add(&mut self, value: f32, policy: f32) {
        self.value += value as f64;
        self.policy += policy as f64;
        self.batches += 1;
    }

    fn mean(&self) -> (f32, f32) {
        let n = self.batches.max(1) as f64;
        ((self.value / n) as f32, (self.policy / n) as f32)
    }
}

pub struct Trainer {
    network: Network,
    optimizer: CheckpointedAdamW,
    varmap: VarMap,
    device: Device,
    config: NetConfig,
    schedule: StepLr,
    net_name: String,
    checkpoint_dir: PathBuf,
    start_superbatch: usize,
    end_superbatch: usize,
    save_interval: usize,
    batches_per_superbatch: usize,
    score_scale: f64,
    wdl_weight: f64,
    value_loss_weight: f64,
}

impl Trainer {
    pub fn new(args: &Args, config: NetConfig) -> Result<Self, Box<dyn Error>> {
        // The sparse ops only have CPU kernels
        let device = Device::Cpu;
        log::info!("Using device: {:?}", device);

        let mut varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = Network::new(&vs, &config, args.scatter)?;

        if let Some(path) = &args.checkpoint {
            checkpoint::load(&mut varmap, path)?;
        }
        network.clamp_feature_transformer(&varmap, config.ft_max_weight)?;

        let schedule = StepLr::new(args.learning_rate, args.lr_multiplier, args.lr_drop_interval);
        let mut optimizer = CheckpointedAdamW::from_varmap(
            &varmap,
            ParamsAdamW {
                lr: schedule.at(args.start_superbatch),
                weight_decay: 0.01,
                ..Default::default()
            },
        )?;
        if let Some(path) = &args.checkpoint {
            checkpoint::load_optimizer(&mut optimizer, path)?;
        }

        Ok(Self {
            network,
            optimizer,
            varmap,
            device,
            batches_per_superbatch: args.superbatch_positions.div_ceil(config.batch_size),
            config,
            schedule,
            net_name: args.net_name.clone(),
            checkpoint_dir: args.checkpoint_dir.clone(),
            start_superbatch: args.start_superbatch,
            end_superbatch: args.end_superbatch,
            save_interval: args.save_interval,
            score_scale: args.score_scale,
            wdl_weight: args.wdl_weight,
            value_loss_weight: args.value_loss_weight,
        })
    }

    /// Trains until the last superbatch or until `stop` is raised. A stop
    /// finishes the current step and writes a checkpoint.
    pub fn train<S: BatchSource>(&mut self, source: &mut S, stop: &AtomicBool) -> Result<(), Box<dyn Error>> {
        for superbatch in self.start_superbatch..=self.end_superbatch {
            let lr = self.schedule.at(superbatch);
            if superbatch > self.start_superbatch && lr != self.optimizer.learning_rate() {
                log::info!("LR dropped to {:e}", lr);
            }
            self.optimizer.set_learning_rate(lr);

            let (value, policy) = match self.train_superbatch(superbatch, source, stop)? {
                Some(losses) => losses,
                None => {
                    log::info!("Interrupted during superbatch {}", superbatch);
                    checkpoint::save(
                        &self.varmap,
                        &self.optimizer,
                        &self.checkpoint_dir,
                        &self.net_name,
                        superbatch,
                    )?;
                    return Ok(());
                }
            };

            log::info!(
                "Superbatch {}/{}: value loss {:.5}, policy loss {:.5}, total {:.5}",
                superbatch,
                self.end_superbatch,
                value,
                policy,
                value as f64 * self.value_loss_weight + policy as f64 * (1.0 - self.value_loss_weight),
            );

            let completed = superbatch - self.start_superbatch + 1;
            if completed % self.save_interval == 0 || superbatch == self.end_superbatch {
                checkpoint::save(
                    &self.varmap,
                    &self.optimizer,
                    &self.checkpoint_dir,
                    &self.net_name,
                    superbatch,
                )?;
            }
        }

        Ok(())
    }

    /// Mean (value, policy) loss of the superbatch, or `None` if stopped.
    fn train_superbatch<S: BatchSource>(
        &mut self,
        superbatch: usize,
        source: &mut S,
        stop: &AtomicBool,
    ) -> Result<Option<(f32, f32)>, Box<dyn Error>> {
        let progress = TrainingProgressBar::new(self.batches_per_superbatch, superbatch, self.end_superbatch)?;
        let started = Instant::now();
        let mut totals = LossTotals::default();

        for batch_num in 1..=self.batches_per_superbatch {
            if stop.load(Ordering::Relaxed) {
                progress.finish();
                return Ok(None);
            }

            let batch = source
                .next_batch()
                .map_err(|e| format!("superbatch {superbatch}, batch {batch_num}: {e}"))?;
            let (value, policy) = self
                .step(batch)
                .map_err(|e| format!("superbatch {superbatch}, batch {batch_num}: {e}"))?;
            totals.add(value, policy);

            let (value, policy) = totals.mean();
            let positions = (batch_num * self.config.batch_size) as f64;
            progress.update(value, policy, positions / started.elapsed().as_secs_f64().max(1e-9));
        }

        progress.finish();
        Ok(Some(totals.mean()))
    }

    /// One optimizer step: forward, loss, backward, update, clamp.
    fn step(&mut self, batch: &Batch) -> CandleResult<(f32, f32)> {
        let size = batch.size;
        let (value, logits) = self.network.forward(&NetworkInputs::from_batch(batch))?;

        let scores = Tensor::from_iter(batch.scores.iter().map(|&s| s as f32), &self.device)?
            .reshape((size, 1))?;
        let wdl = Tensor::from_slice(&batch.wdl, (size, 1), &self.device)?;
        let targets = Tensor::from_vec(
            batch.policy_targets(),
            (size, batch.policy_outputs),
            &self.device,
        )?;

        let value_loss = value_loss(&value, &scores, &wdl, self.score_scale, self.wdl_weight)?;
        let policy_loss = policy_loss(&logits, &targets)?;
        let loss = ((&value_loss * self.value_loss_weight)?
            + (&policy_loss * (1.0 - self.value_loss_weight))?)?;

        self.optimizer.backward_step(&loss)?;
        self.network
            .clamp_feature_transformer(&self.varmap, self.config.ft_max_weight)?;

        Ok((value_loss.to_scalar::<f32>()?, policy_loss.to_scalar::<f32>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use nnue::kernels::SENTINEL;
    use nnue::wire::PolicyTarget;

    struct Repeat(Batch);

    impl BatchSource for Repeat {
        fn next_batch(&mut self) -> Result<&Batch, Box<dyn Error>> {
            Ok(&self.0)
        }
    }

    fn args(dir: &std::path::Path) -> Args {
        Args::parse_from([
            "train",
            "--hidden-size",
            "8",
            "--max-active-features",
            "4",
            "--policy-output-size",
            "16",
            "--max-moves-per-pos",
            "4",
            "--batch-size",
            "2",
            "--superbatch-positions",
            "6",
            "--end-superbatch",
            "2",
            "--save-interval",
            "1",
            "--learning-rate",
            "0.01",
            "--checkpoint-dir",
            dir.to_str().unwrap(),
        ])
    }

    fn batch(config: &NetConfig) -> Batch {
        let mut batch = Batch::new(config, PolicyTarget::BestMove);
        batch.stm_features[..2].copy_from_slice(&[3, 40]);
        batch.ntm_features[..2].copy_from_slice(&[9, 700]);
        batch.stm_features[4] = 100;
        batch.ntm_features[4] = SENTINEL;
        batch.scores = vec![150, -300];
        batch.wdl = vec![1.0, 0.0];
        batch.legal_moves[..2].copy_from_slice(&[1, 5]);
        batch.move_weights[1] = 1.0;
        batch.legal_moves[4] = 15;
        batch.move_weights[4] = 1.0;
        batch
    }

    #[test]
    fn trains_superbatches_and_writes_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path());
        let config = args.net.to_config().unwrap();
        let mut trainer = Trainer::new(&args, config.clone()).unwrap();
        assert_eq!(trainer.batches_per_superbatch, 3);

        let before = trainer.step(&batch(&config)).unwrap();
        trainer.train(&mut Repeat(batch(&config)), &AtomicBool::new(false)).unwrap();
        let after = trainer.step(&batch(&config)).unwrap();

        assert!(after.1 < before.1, "policy loss {} -> {}", before.1, after.1);
        assert!(dir.path().join("net768x2-1.safetensors").exists());
        assert!(dir.path().join("net768x2-2.safetensors").exists());
    }

    #[test]
    fn stop_flag_checkpoints_and_returns() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path());
        let config = args.net.to_config().unwrap();
        let mut trainer = Trainer::new(&args, config.clone()).unwrap();

        trainer.train(&mut Repeat(batch(&config)), &AtomicBool::new(true)).unwrap();

        assert!(dir.path().join("net768x2-1.safetensors").exists());
        assert!(!dir.path().join("net768x2-2.safetensors").exists());
    }

    #[test]
    fn resuming_restores_weights_and_optimizer_state() {
        let dir = tempfile::tempdir().unwrap();
        let args = args(dir.path());
        let config = args.net.to_config().unwrap();
        let mut trainer = Trainer::new(&args, config.clone()).unwrap();
        trainer.train(&mut Repeat(batch(&config)), &AtomicBool::new(false)).unwrap();
        assert_eq!(trainer.optimizer.steps().unwrap(), 6);

        let checkpoint = dir.path().join("net768x2-2.safetensors");
        assert!(checkpoint::optimizer_path(&checkpoint).exists());

        let mut resumed_args = args.clone();
        resumed_args.checkpoint = Some(checkpoint);
        resumed_args.start_superbatch = 3;
        resumed_args.end_superbatch = 3;
        let resumed = Trainer::new(&resumed_args, config).unwrap();

        assert_eq!(resumed.optimizer.steps().unwrap(), 6);
        assert_eq!(
            resumed.network.params().unwrap().policy_weight,
            trainer.network.params().unwrap().policy_weight
        );
    }
}
