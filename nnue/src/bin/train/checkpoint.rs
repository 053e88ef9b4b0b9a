use candle_nn::VarMap;
use std::{
    error::Error,
    path::{Path, PathBuf},
};

use crate::training::optimizer::CheckpointedAdamW;

pub fn path(dir: &Path, net_name: &str, superbatch: usize) -> PathBuf {
    dir.join(format!("{}-{}.safetensors", net_name, superbatch))
}

/// Optimizer state file belonging to a weights checkpoint.
pub fn optimizer_path(checkpoint_path: &Path) -> PathBuf {
    checkpoint_path.with_extension("optimizer.safetensors")
}

pub fn save(
    varmap: &VarMap,
    optimizer: &CheckpointedAdamW,
    dir: &Path,
    net_name: &str,
    superbatch: usize,
) -> Result<PathBuf, Box<dyn Error>> {
    std::fs::create_dir_all(dir)?;
    let checkpoint_path = path(dir, net_name, superbatch);
    varmap.save(&checkpoint_path)?;
    optimizer.save(&optimizer_path(&checkpoint_path))?;
    log::info!("Checkpoint saved to {}", checkpoint_path.display());
    Ok(checkpoint_path)
}

pub fn load(varmap: &mut VarMap, checkpoint_path: &Path) -> Result<(), Box<dyn Error>> {
    varmap.load(checkpoint_path)?;
    log::info!("Resumed from checkpoint {}", checkpoint_path.display());
    Ok(())
}

pub fn load_optimizer(
    optimizer: &mut CheckpointedAdamW,
    checkpoint_path: &Path,
) -> Result<(), Box<dyn Error>> {
    let state_path = optimizer_path(checkpoint_path);
    optimizer
        .load(&state_path)
        .map_err(|e| format!("optimizer state {}: {e}", state_path.display()))?;
    log::info!("Resumed optimizer after {} steps", optimizer.steps()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimizer_state_sits_next_to_the_weights() {
        let weights = path(Path::new("checkpoints"), "net768x2", 7);
        assert_eq!(weights, Path::new("checkpoints/net768x2-7.safetensors"));
        assert_eq!(
            optimizer_path(&weights),
            Path::new("checkpoints/net768x2-7.optimizer.safetensors")
        );
    }
}
