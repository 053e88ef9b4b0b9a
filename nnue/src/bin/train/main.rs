mod args;
mod checkpoint;
mod loss;
mod training;

use args::Args;
use clap::Parser;
use log::LevelFilter;
use nnue::loader::{BatchReader, BatchStream, ProducerConfig, RecordFile};
use nnue::NetConfig;
use simplelog::{Config, SimpleLogger};
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use training::trainer::Trainer;

fn main() -> Result<(), Box<dyn Error>> {
    let args = init()?;
    args.validate()?;
    let config = args.net.to_config()?;
    log_summary(&args, &config);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        ctrlc::set_handler(move || {
            log::warn!("Stopping after the current step");
            stop.store(true, Ordering::Relaxed);
        })?;
    }

    let layout = args.layout();
    let producer = ProducerConfig {
        data_path: args.data_path.clone(),
        batch_size: config.batch_size,
        threads: args.threads(),
        buckets: Some(config.buckets.clone()),
    };
    let file = RecordFile::open(&producer, &config, &layout)?;
    let mut reader = BatchReader::new(BatchStream::spawn(file), layout, config.clone());

    let mut trainer = Trainer::new(&args, config)?;
    let result = trainer.train(&mut reader, &stop);

    reader.shutdown();
    log::info!("Done!");
    result
}

fn init() -> Result<Args, Box<dyn Error>> {
    let args = Args::parse();
    SimpleLogger::init(LevelFilter::Info, Config::default())?;

    Ok(args)
}

fn log_summary(args: &Args, config: &NetConfig) {
    log::info!("Net name: {}", args.net_name);
    log::info!(
        "Net arch: ({} inputs, {} buckets -> {})x2 -> pairwise {} -> value 1, policy {}",
        config.input_size(),
        config.buckets.count,
        config.hidden_size,
        config.hidden_size,
        config.policy_output_size
    );
    log::info!("Checkpoint to load: {:?}", args.checkpoint);
    log::info!(
        "Superbatches: {} to {} ({} positions each)",
        args.start_superbatch,
        args.end_superbatch,
        args.superbatch_positions
    );
    log::info!("Data file: {}", args.data_path.display());
    log::info!("Wire layout: {:?}", args.layout());
    log::info!("Batch size: {}, threads: {}", config.batch_size, args.threads());
    log::info!(
        "LR: start {} multiply by {} every {} superbatches",
        args.learning_rate,
        args.lr_multiplier,
        args.lr_drop_interval
    );
    log::info!(
        "Scale: {}, WDL: {}, value loss weight: {}",
        args.score_scale,
        args.wdl_weight,
        args.value_loss_weight
    );
    log::info!(
        "Feature transformer clipping: [{}, {}], Q = {}",
        -config.ft_max_weight,
        config.ft_max_weight,
        config.ft_q
    );
}
