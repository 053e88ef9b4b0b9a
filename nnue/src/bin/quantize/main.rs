mod args;

use args::Args;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use log::LevelFilter;
use nnue::export::{write_quantized, ExportShape, ExportSpec, QuantizedNetwork};
use nnue::kernels::ScatterStrategy;
use nnue::network::Network;
use simplelog::{Config, SimpleLogger};
use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    let args = init()?;
    let config = args.net.to_config()?;

    let mut varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let network = Network::new(&vs, &config, ScatterStrategy::default())?;
    varmap.load(&args.checkpoint)?;
    log::info!("Loaded {}", args.checkpoint.display());

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.checkpoint.with_extension("bin"));
    let spec = ExportSpec::from_config(&config);

    // Fails before writing if any feature transformer value is outside the clamp
    write_quantized(&output, &network.params()?, &spec)?;

    let exported = QuantizedNetwork::read(&output, ExportShape::from_config(&config), &spec)?;
    log::info!(
        "Verified {}: ft {}x{} i16, value {} f32, policy {}x{} f32",
        output.display(),
        exported.shape.input_size,
        exported.shape.hidden_size,
        exported.value_weight.len() + 1,
        exported.shape.policy_outputs,
        exported.shape.hidden_size
    );

    Ok(())
}

fn init() -> Result<Args, Box<dyn Error>> {
    let args = Args::parse();
    SimpleLogger::init(LevelFilter::Info, Config::default())?;

    Ok(args)
}
