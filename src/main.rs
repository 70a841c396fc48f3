use mimalloc::MiMalloc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use tracing::info;

use genbounds::checkpoint::load_checkpoint;
use genbounds::config::{MeasureOptions, TrainConfig};
use genbounds::data::{load_data, Split};
use genbounds::measures::{calculate, MeasureReport};
use genbounds::models::build_network;
use genbounds::module::snapshot_layers_from;
use genbounds::telemetry::init_tracing;
use genbounds::train::{train_loader, validate, Trainer};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "genbounds", version, about = "Train image classifiers and compute generalization measures")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a network, save checkpoints, then compute measures and bounds
    Train {
        #[command(flatten)]
        config: TrainConfig,
        #[command(flatten)]
        measure: MeasureOptions,
        /// also write the measure report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Compute measures and bounds of a saved checkpoint
    Measure {
        /// checkpoint written by `train`
        #[arg(long)]
        checkpoint: PathBuf,
        /// overrides the dataset directory stored in the checkpoint
        #[arg(long)]
        datadir: Option<PathBuf>,
        #[command(flatten)]
        measure: MeasureOptions,
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

fn emit(report: &MeasureReport, path: Option<&PathBuf>) -> anyhow::Result<()> {
    println!("{}", report);
    if let Some(path) = path {
        report
            .write_json(path)
            .with_context(|| format!("writing report to {}", path.display()))?;
    }
    Ok(())
}

fn run_train(config: TrainConfig, opts: MeasureOptions, report: Option<PathBuf>) -> anyhow::Result<()> {
    let train_set = load_data(Split::Train, config.dataset, &config.datadir)
        .with_context(|| format!("loading {} training split", config.dataset))?;
    let val_set = load_data(Split::Val, config.dataset, &config.datadir)
        .with_context(|| format!("loading {} validation split", config.dataset))?;

    let mut trainer = Trainer::new(config);
    let mut outcome = trainer.run(&train_set, &val_set)?;
    info!("final checkpoint: {}", outcome.checkpoint.display());

    // margin、训练损失和 sharpness 用同一次抽样
    let loader = train_loader(trainer.config(), &train_set);
    let rng = trainer.rng_mut();
    let loader = loader.freeze(rng);
    let stats = validate(&mut outcome.model, &loader, rng);
    let result = calculate(
        &mut outcome.model,
        &outcome.init_layers,
        &loader,
        stats.margin,
        train_set.info(),
        &opts,
        rng,
    )?;
    emit(&result, report.as_ref())
}

fn run_measure(
    checkpoint: PathBuf,
    datadir: Option<PathBuf>,
    opts: MeasureOptions,
    report: Option<PathBuf>,
) -> anyhow::Result<()> {
    let ckpt = load_checkpoint(&checkpoint)
        .with_context(|| format!("loading checkpoint {}", checkpoint.display()))?;
    let mut config = ckpt.meta.config.clone();
    if let Some(dir) = datadir {
        config.datadir = dir;
    }
    info!(
        "checkpoint epoch {}: tr_loss {:.3}, tr_err {:.3}, val_err {:.3}",
        ckpt.meta.epoch + 1,
        ckpt.meta.tr_loss,
        ckpt.meta.tr_err,
        ckpt.meta.val_err
    );

    let train_set = load_data(Split::Train, config.dataset, &config.datadir)
        .with_context(|| format!("loading {} training split", config.dataset))?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut model = build_network(&config, train_set.info(), &mut rng);
    ckpt.apply_parameters(&model)?;
    let init_params = ckpt.init_params(&model)?;
    let init_layers = snapshot_layers_from(&model, &init_params)?;

    let loader = train_loader(&config, &train_set).freeze(&mut rng);
    let stats = validate(&mut model, &loader, &mut rng);
    info!(
        "Training loss: {:.3}\t Training margin {:.3}\t Training error: {:.3}",
        stats.loss, stats.margin, stats.error
    );

    let result = calculate(
        &mut model,
        &init_layers,
        &loader,
        stats.margin,
        train_set.info(),
        &opts,
        &mut rng,
    )?;
    emit(&result, report.as_ref())
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Train { config, measure, report } => run_train(config, measure, report),
        Command::Measure {
            checkpoint,
            datadir,
            measure,
            report,
        } => run_measure(checkpoint, datadir, measure, report),
    }
}
