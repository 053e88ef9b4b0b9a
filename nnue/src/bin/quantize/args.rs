use std::path::PathBuf;

use clap::Parser;
use nnue::config::NetArgs;

#[derive(Parser, Debug, Clone)]
#[command(name = "Sparse NNUE Quantizer")]
#[command(author = "Jørgen Hanssen <jorgen@hanssen.io>")]
#[command(version = "0.1.0")]
pub struct Args {
    #[command(flatten)]
    pub net: NetArgs,

    /// Checkpoint (.safetensors) to export.
    #[arg(long)]
    pub checkpoint: PathBuf,

    /// Output file. Defaults to the checkpoint path with a .bin extension.
    #[arg(long)]
    pub output: Option<PathBuf>,
}
