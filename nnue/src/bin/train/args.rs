use std::path::PathBuf;

use clap::Parser;
use nnue::config::NetArgs;
use nnue::kernels::ScatterStrategy;
use nnue::wire::{FeatureLayout, MoveLayout, PolicyTarget, WireLayout};

#[derive(Parser, Debug, Clone)]
#[command(name = "Sparse NNUE Trainer")]
#[command(author = "Jørgen Hanssen <jorgen@hanssen.io>")]
#[command(version = "0.1.0")]
pub struct Args {
    #[command(flatten)]
    pub net: NetArgs,

    /// File of batch records written by the data loader.
    #[arg(long, default_value = "data.bin")]
    pub data_path: PathBuf,

    /// Name used for checkpoint files.
    #[arg(long, default_value = "net768x2")]
    pub net_name: String,

    /// Checkpoint to resume from.
    #[arg(long)]
    pub checkpoint: Option<PathBuf>,

    /// Directory checkpoints are written to.
    #[arg(long, default_value = "checkpoints")]
    pub checkpoint_dir: PathBuf,

    /// Number of data loader reader threads. Defaults to the number of cores.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Layout of the feature sections: slots or pairs.
    #[arg(long, default_value = "slots")]
    pub feature_layout: FeatureLayout,

    /// Layout of the legal move section: slots or pairs.
    #[arg(long, default_value = "slots")]
    pub move_layout: MoveLayout,

    /// Policy target: best-move, visit-counts or visit-percent.
    #[arg(long, default_value = "best-move")]
    pub policy_target: PolicyTarget,

    /// Gradient scatter: atomic, or grouped for deterministic results.
    #[arg(long, default_value = "atomic")]
    pub scatter: ScatterStrategy,

    /// First superbatch. Greater than 1 only when resuming.
    #[arg(long, default_value_t = 1)]
    pub start_superbatch: usize,

    /// Last superbatch, inclusive.
    #[arg(long, default_value_t = 500)]
    pub end_superbatch: usize,

    /// Positions per superbatch.
    #[arg(long, default_value_t = 100_000_000)]
    pub superbatch_positions: usize,

    /// Save a checkpoint every this many superbatches.
    #[arg(long, default_value_t = 100)]
    pub save_interval: usize,

    /// Learning rate at superbatch 1.
    #[arg(long, default_value_t = 0.001)]
    pub learning_rate: f64,

    /// Superbatches between learning rate drops.
    #[arg(long, default_value_t = 1)]
    pub lr_drop_interval: usize,

    /// Factor applied to the learning rate at each drop.
    #[arg(long, default_value_t = 0.99)]
    pub lr_multiplier: f64,

    /// Centipawn scale of the value target sigmoid.
    #[arg(long, default_value_t = 400.0)]
    pub score_scale: f64,

    /// Weight of the game result in the value target.
    #[arg(long, default_value_t = 0.0)]
    pub wdl_weight: f64,

    /// Weight of the value loss; the policy loss gets the rest.
    #[arg(long, default_value_t = 0.99)]
    pub value_loss_weight: f64,
}

impl Args {
    pub fn threads(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get)
    }

    pub fn layout(&self) -> WireLayout {
        WireLayout {
            features: self.feature_layout,
            moves: self.move_layout,
            target: self.policy_target,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint.is_none() && self.start_superbatch != 1 {
            return Err("start superbatch must be 1 without a checkpoint".into());
        }
        if self.start_superbatch == 0 || self.start_superbatch > self.end_superbatch {
            return Err(format!(
                "invalid superbatch range {}..={}",
                self.start_superbatch, self.end_superbatch
            ));
        }
        if self.save_interval == 0 || self.lr_drop_interval == 0 || self.superbatch_positions == 0 {
            return Err("intervals and superbatch size must be greater than zero".into());
        }
        if !(self.learning_rate > 0.0 && self.lr_multiplier > 0.0 && self.score_scale > 0.0) {
            return Err("learning rate, multiplier and score scale must be positive".into());
        }
        if !(0.0..=1.0).contains(&self.wdl_weight) {
            return Err(format!("WDL weight {} outside [0, 1]", self.wdl_weight));
        }
        if !(self.value_loss_weight > 0.0 && self.value_loss_weight < 1.0) {
            return Err(format!(
                "value loss weight {} outside (0, 1)",
                self.value_loss_weight
            ));
        }
        Ok(())
    }
}
