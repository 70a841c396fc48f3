use genbounds::checkpoint::load_checkpoint;
use genbounds::config::{MeasureOptions, NetworkKind, TrainConfig};
use genbounds::data::{DataLoader, Dataset, Sampler};
use genbounds::measures::calculate;
use genbounds::models::{build_network, Fc};
use genbounds::module::{snapshot_layers, snapshot_layers_from, Module};
use genbounds::optim::SGD;
use genbounds::train::{train_epoch, validate, Trainer};
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// 两类可分的玩具数据：类别 0 的像素为负，类别 1 为正
fn toy_dataset(n: usize) -> Dataset {
    let labels: Vec<usize> = (0..n).map(|i| i % 2).collect();
    let images = Array4::from_shape_fn((n, 1, 2, 2), |(i, _, y, x)| {
        let sign = if labels[i] == 0 { -1.0 } else { 1.0 };
        sign * (1.0 + 0.1 * ((i + y + x) % 3) as f32)
    });
    Dataset::new(images, labels, 2)
}

fn fc_config(savedir: &std::path::Path) -> TrainConfig {
    TrainConfig {
        network: NetworkKind::Fc,
        numhidden: 6,
        numhiddenlayers: 1,
        epochs: 3,
        batchsize: 4,
        learningrate: 0.05,
        stopcond: 0.0,
        save_epochs: vec![0, 1],
        savedir: savedir.to_path_buf(),
        seed: 1,
        ..TrainConfig::default()
    }
}

#[test]
fn sgd_training_reduces_loss_on_separable_data() {
    let ds = toy_dataset(16);
    let mut rng = StdRng::seed_from_u64(3);
    let mut net = Fc::new(1, 2, 2, 8, 1, &mut rng);
    let mut opt = SGD::new(net.parameters(), 0.1).with_momentum(0.9);
    let loader = DataLoader::new(&ds, 4, Sampler::SubsetRandom(16));

    let first = train_epoch(&mut net, &loader, &mut opt, false, &mut rng);
    let mut last = first;
    for _ in 0..20 {
        last = train_epoch(&mut net, &loader, &mut opt, false, &mut rng);
    }
    assert!(last.loss < 0.5 * first.loss, "loss {} -> {}", first.loss, last.loss);

    let eval = validate(&mut net, &DataLoader::new(&ds, 8, Sampler::Sequential), &mut rng);
    assert_eq!(eval.error, 0.0);
    assert!(eval.margin > 0.0);
}

#[test]
fn trainer_saves_checkpoints_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let train_set = toy_dataset(12);
    let val_set = toy_dataset(6);
    let config = fc_config(dir.path());

    let outcome = Trainer::new(config.clone()).run(&train_set, &val_set).unwrap();
    assert_eq!(outcome.epoch, 2);
    for epoch in 0..3 {
        assert!(dir.path().join(format!("checkpoint_-1_{}.safetensors", epoch)).exists());
    }
    assert_eq!(outcome.checkpoint, dir.path().join("checkpoint_-1_2.safetensors"));

    // 初始权重与同一 seed 新建的网络一致
    let mut rng = StdRng::seed_from_u64(config.seed);
    let fresh = build_network(&config, train_set.info(), &mut rng);
    assert_eq!(outcome.init_layers, snapshot_layers(&fresh));

    let ckpt = load_checkpoint(&outcome.checkpoint).unwrap();
    assert_eq!(ckpt.meta.epoch, 2);
    assert_eq!(ckpt.meta.config, config);
    assert!((ckpt.meta.tr_loss - outcome.train.loss).abs() < 1e-9);
    assert!((ckpt.meta.val_margin - outcome.train.margin).abs() < 1e-9);

    let resumed_config = TrainConfig {
        modelpath: Some(dir.path().join("checkpoint_-1_1.safetensors")),
        ..config
    };
    let resumed = Trainer::new(resumed_config).run(&train_set, &val_set).unwrap();
    assert_eq!(resumed.epoch, 2);
    assert_eq!(resumed.init_layers, outcome.init_layers);
}

#[test]
fn measures_from_saved_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let train_set = toy_dataset(12);
    let val_set = toy_dataset(6);
    let config = fc_config(dir.path());
    let outcome = Trainer::new(config).run(&train_set, &val_set).unwrap();

    let ckpt = load_checkpoint(&outcome.checkpoint).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    let mut model = build_network(&ckpt.meta.config, train_set.info(), &mut rng);
    ckpt.apply_parameters(&model).unwrap();
    let init_layers = snapshot_layers_from(&model, &ckpt.init_params(&model).unwrap()).unwrap();
    assert_eq!(init_layers, outcome.init_layers);
    assert_eq!(snapshot_layers(&model), snapshot_layers(&outcome.model));

    let loader = DataLoader::new(&train_set, 4, Sampler::SubsetRandom(12));
    let report = calculate(
        &mut model,
        &init_layers,
        &loader,
        outcome.train.margin,
        train_set.info(),
        &MeasureOptions::default(),
        &mut rng,
    )
    .unwrap();

    assert_eq!(report.measures.len(), 13);
    assert_eq!(report.bounds.len(), 6);
    assert_eq!(report.measure("depth"), Some(2.0));
    assert_eq!(report.measure("#parameters"), Some((4 * 6 + 6 + 6 * 2 + 2) as f64));
    assert!(report.measure("Frobenious distance").unwrap() > 0.0);
    let pac = report.bound("PAC-Bayes Bound (McAllester 1999)").unwrap();
    assert!(pac.is_finite() && pac > 0.0);
}

#[test]
fn training_stops_once_loss_falls_below_stopcond() {
    let dir = tempfile::tempdir().unwrap();
    let train_set = toy_dataset(12);
    let val_set = toy_dataset(6);
    let config = TrainConfig {
        epochs: 5,
        stopcond: 100.0,
        ..fc_config(dir.path())
    };

    let outcome = Trainer::new(config).run(&train_set, &val_set).unwrap();
    assert_eq!(outcome.epoch, 0);
    assert_eq!(outcome.checkpoint, dir.path().join("checkpoint_-1_0.safetensors"));
    assert!(!dir.path().join("checkpoint_-1_1.safetensors").exists());
    assert_eq!(load_checkpoint(&outcome.checkpoint).unwrap().meta.epoch, 0);
}

#[test]
fn resume_past_last_epoch_keeps_weights_and_momentum() {
    let dir = tempfile::tempdir().unwrap();
    let train_set = toy_dataset(12);
    let val_set = toy_dataset(6);
    let config = fc_config(&dir.path().join("first"));
    Trainer::new(config.clone()).run(&train_set, &val_set).unwrap();

    let source = dir.path().join("first").join("checkpoint_-1_1.safetensors");
    let saved = load_checkpoint(&source).unwrap();
    let resumed_config = TrainConfig {
        epochs: 2,
        savedir: dir.path().join("resumed"),
        modelpath: Some(source),
        ..config
    };
    let outcome = Trainer::new(resumed_config).run(&train_set, &val_set).unwrap();

    // epoch 1 + 1 >= epochs: nothing is trained, the state is written back as-is
    assert_eq!(outcome.epoch, 1);
    let resumed = load_checkpoint(&outcome.checkpoint).unwrap();
    assert_eq!(resumed.meta.epoch, 1);

    let model = build_network(&saved.meta.config, train_set.info(), &mut StdRng::seed_from_u64(0));
    saved.apply_parameters(&model).unwrap();
    assert_eq!(snapshot_layers(&outcome.model), snapshot_layers(&model));

    let n = model.parameters().len();
    let before = saved.velocities(n);
    assert!(before.iter().all(|v| v.is_some()));
    assert_eq!(resumed.velocities(n), before);
    assert_eq!(resumed.init_params(&model).unwrap(), saved.init_params(&model).unwrap());
}
