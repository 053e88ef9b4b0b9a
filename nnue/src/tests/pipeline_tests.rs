use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use rand::Rng;

use crate::config::NetConfig;
use crate::export::{export_bytes, ExportShape, ExportSpec, QuantizedNetwork};
use crate::kernels::{assert_approx_eq, ScatterStrategy, SENTINEL};
use crate::loader::{BatchReader, BatchStream, ProducerConfig, RecordFile, RecordWriter};
use crate::network::{FeatureTransformer, Network, NetworkInputs};
use crate::wire::{Batch, FeatureLayout, MoveLayout, PolicyTarget, WireLayout};

fn small_config() -> NetConfig {
    NetConfig {
        hidden_size: 16,
        max_active_features: 8,
        policy_output_size: 64,
        max_moves_per_pos: 6,
        batch_size: 4,
        ..NetConfig::default()
    }
}

/// Distinct random values in `0..limit`, sentinel padded to `slots`.
fn random_list(rng: &mut impl Rng, count: usize, limit: i32, slots: usize) -> Vec<i32> {
    let mut list = Vec::with_capacity(slots);
    while list.len() < count {
        let value = rng.gen_range(0..limit);
        if !list.contains(&value) {
            list.push(value);
        }
    }
    list.resize(slots, SENTINEL);
    list
}

fn random_batch(config: &NetConfig, target: PolicyTarget) -> Batch {
    let mut rng = rand::thread_rng();
    let mut batch = Batch::new(config, target);
    let input = config.input_size() as i32;
    let (a, m) = (config.max_active_features, config.max_moves_per_pos);

    for entry in 0..config.batch_size {
        let counts = (rng.gen_range(0..=a), rng.gen_range(0..=a), rng.gen_range(1..=m));
        let stm = random_list(&mut rng, counts.0, input, a);
        let ntm = random_list(&mut rng, counts.1, input, a);
        let moves = random_list(&mut rng, counts.2, config.policy_output_size as i32, m);

        batch.stm_features[entry * a..(entry + 1) * a].copy_from_slice(&stm);
        batch.ntm_features[entry * a..(entry + 1) * a].copy_from_slice(&ntm);
        batch.legal_moves[entry * m..(entry + 1) * m].copy_from_slice(&moves);
        batch.scores[entry] = rng.gen_range(-800..800);
        batch.wdl[entry] = [0.0, 0.5, 1.0][rng.gen_range(0..3)];

        let legal = moves.iter().filter(|&&mv| mv != SENTINEL).count();
        let weights = &mut batch.move_weights[entry * m..(entry + 1) * m];
        match target {
            PolicyTarget::BestMove => weights[rng.gen_range(0..legal)] = 1.0,
            PolicyTarget::VisitCounts => {
                for w in &mut weights[..legal] {
                    *w = rng.gen_range(1..=255) as f32;
                }
            }
            PolicyTarget::VisitPercent => {
                for w in &mut weights[..legal] {
                    *w = 1.0 / legal as f32;
                }
            }
        }
    }
    batch
}

#[test]
fn sparse_transformer_matches_dense_matmul() -> Result<()> {
    let config = small_config();
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let input = config.input_size();
    let ft = FeatureTransformer::new(vs, input, 16, 8, ScatterStrategy::Atomic)?;

    let batch = random_batch(&config, PolicyTarget::BestMove);
    let inputs = NetworkInputs::from_batch(&batch);

    let mut one_hot = vec![0f32; config.batch_size * input];
    for (slot, &idx) in inputs.stm.iter().enumerate() {
        if idx != SENTINEL {
            one_hot[(slot / 8) * input + idx as usize] = 1.0;
        }
    }
    let one_hot = Tensor::from_vec(one_hot, (config.batch_size, input), &device)?;

    let coeffs = Tensor::rand(-1f32, 1f32, (config.batch_size, 16), &device)?;
    let sparse = ft.forward(inputs.stm.clone())?;
    let dense = one_hot.matmul(ft.weight())?.broadcast_add(ft.bias())?;

    for (s, d) in sparse.flatten_all()?.to_vec1::<f32>()?.iter().zip(dense.flatten_all()?.to_vec1::<f32>()?) {
        assert_approx_eq(*s, d, "Accumulator");
    }

    let sparse_grads = (sparse * &coeffs)?.sum_all()?.backward()?;
    let dense_grads = (dense * &coeffs)?.sum_all()?.backward()?;
    for tensor in [ft.weight(), ft.bias()] {
        let s = sparse_grads.get(tensor).expect("sparse gradient").flatten_all()?.to_vec1::<f32>()?;
        let d = dense_grads.get(tensor).expect("dense gradient").flatten_all()?.to_vec1::<f32>()?;
        for (s, d) in s.iter().zip(d) {
            assert_approx_eq(*s, d, "Gradient");
        }
    }
    Ok(())
}

#[test]
fn file_to_training_step_to_export() -> Result<()> {
    let config = small_config();
    let layout = WireLayout {
        features: FeatureLayout::Pairs,
        moves: MoveLayout::Slots,
        target: PolicyTarget::VisitCounts,
    };

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("train.bin");
    let mut writer = RecordWriter::create(&path, layout, config.clone()).expect("writer");
    for _ in 0..3 {
        writer.write(&random_batch(&config, layout.target)).expect("write");
    }
    writer.finish().expect("flush");

    let producer = ProducerConfig {
        data_path: path,
        batch_size: config.batch_size,
        threads: 2,
        buckets: Some(config.buckets.clone()),
    };
    let file = RecordFile::open(&producer, &config, &layout).expect("open");
    let mut reader = BatchReader::new(BatchStream::spawn(file), layout, config.clone());

    let varmap = VarMap::new();
    let vs = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let network = Network::new(&vs, &config, ScatterStrategy::Grouped)?;
    let mut optimizer = AdamW::new(
        varmap.all_vars(),
        ParamsAdamW {
            lr: 0.5,
            ..Default::default()
        },
    )?;

    // A huge learning rate drives weights into the clamp
    for _ in 0..4 {
        let batch = reader.next_batch().expect("batch");
        let targets = Tensor::from_vec(
            batch.policy_targets(),
            (config.batch_size, config.policy_output_size),
            &Device::Cpu,
        )?;
        let (value, logits) = network.forward(&NetworkInputs::from_batch(batch))?;
        let policy = (candle_nn::ops::log_softmax(&logits, 1)? * targets)?.sum_all()?.neg()?;
        let loss = (value.sqr()?.mean_all()? + policy)?;
        optimizer.backward_step(&loss)?;
        network.clamp_feature_transformer(&varmap, config.ft_max_weight)?;
    }
    reader.shutdown();

    let params = network.params()?;
    assert!(params
        .ft_weight
        .iter()
        .chain(&params.ft_bias)
        .all(|w| w.abs() <= config.ft_max_weight));

    let spec = ExportSpec::from_config(&config);
    let bytes = export_bytes(&params, &spec).expect("export");
    assert_eq!(bytes.len() % 64, 0);

    let restored = QuantizedNetwork::from_bytes(&bytes, ExportShape::from_config(&config), &spec)
        .expect("read back")
        .dequantize(spec.ft_q);
    let tolerance = 1.0 / (2.0 * spec.ft_q as f32) + 1e-5;
    for (a, b) in restored.ft_weight.iter().zip(&params.ft_weight) {
        assert!((a - b).abs() <= tolerance);
    }
    assert_eq!(restored.policy_weight, params.policy_weight);
    assert_eq!(restored.value_bias, params.value_bias);
    Ok(())
}
