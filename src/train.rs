// src/train.rs
use crate::autograd::no_grad;
use crate::checkpoint::{load_checkpoint, save_checkpoint, CheckpointMeta, CheckpointState};
use crate::config::{SamplerKind, TrainConfig};
use crate::data::{Batch, DataLoader, Dataset, Sampler};
use crate::error::{Error, Result};
use crate::loss::{one_hot, CrossEntropyLoss};
use crate::models::{build_network, Network};
use crate::module::{snapshot_layers_from, LayerWeights, Module};
use crate::optim::{Optimizer, SGD};
use ndarray::{ArrayD, ArrayView2, Ix2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Percentile of the per-sample margins reported as "the" margin.
pub const MARGIN_PERCENTILE: f64 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub error: f64,
    pub loss: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalStats {
    pub error: f64,
    pub loss: f64,
    pub margin: f64,
}

/// Training loader as configured: the first `trainingsetsize` samples
/// reshuffled, or the same count drawn with replacement.
pub fn train_loader<'a>(config: &TrainConfig, dataset: &'a Dataset) -> DataLoader<'a> {
    let n = config.effective_set_size(dataset.len());
    let sampler = match config.sampler {
        SamplerKind::Subset => Sampler::SubsetRandom(n),
        SamplerKind::Replacement => Sampler::RandomWithReplacement(n),
    };
    DataLoader::new(dataset, config.batchsize, sampler)
}

fn argmax(row: ndarray::ArrayView1<'_, f32>) -> usize {
    let mut best = 0;
    for (j, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = j;
        }
    }
    best
}

fn count_correct(output: &ArrayView2<'_, f32>, labels: &[usize]) -> usize {
    output
        .outer_iter()
        .zip(labels)
        .filter(|(row, &label)| argmax(row.view()) == label)
        .count()
}

/// out[i, y_i] - max_{j != y_i} out[i, j]
fn sample_margins(output: &ArrayView2<'_, f32>, labels: &[usize]) -> Vec<f64> {
    output
        .outer_iter()
        .zip(labels)
        .map(|(row, &label)| {
            let other = row
                .iter()
                .enumerate()
                .filter(|&(j, _)| j != label)
                .map(|(_, &v)| v)
                .fold(f32::NEG_INFINITY, f32::max);
            // 只有一个类别时没有竞争者
            if other == f32::NEG_INFINITY {
                0.0
            } else {
                (row[label] - other) as f64
            }
        })
        .collect()
}

/// `q`-th percentile with linear interpolation between order statistics.
pub fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

/// One pass over `loader` with SGD steps. Error and loss are averaged over
/// the loader's sampler length.
pub fn train_epoch<R: Rng + ?Sized>(
    model: &mut dyn Module,
    loader: &DataLoader<'_>,
    optimizer: &mut dyn Optimizer,
    random_labels: bool,
    rng: &mut R,
) -> EpochStats {
    model.train_mode();
    let nclasses = loader.dataset().nclasses;
    let mut sum_loss = 0.0f64;
    let mut sum_correct = 0usize;

    for Batch { images, mut labels } in loader.iter(rng) {
        if random_labels {
            labels.shuffle(rng);
        }

        let output = model.forward(images);
        let loss = CrossEntropyLoss::apply(&output, &one_hot(&labels, nclasses));

        {
            let out = output.data_ref();
            let out2 = out.view().into_dimensionality::<Ix2>().expect("logits are [B, K]");
            sum_correct += count_correct(&out2, &labels);
        }
        sum_loss += labels.len() as f64 * loss.item() as f64;

        optimizer.zero_grad();
        loss.backward();
        optimizer.step();
    }

    let n = loader.len().max(1) as f64;
    EpochStats {
        error: 1.0 - sum_correct as f64 / n,
        loss: sum_loss / n,
    }
}

/// Error, loss and the 5th-percentile margin of `model` on `loader`, without building a graph.
pub fn validate<R: Rng + ?Sized>(model: &mut dyn Module, loader: &DataLoader<'_>, rng: &mut R) -> EvalStats {
    model.eval_mode();
    let nclasses = loader.dataset().nclasses;
    let mut sum_loss = 0.0f64;
    let mut sum_correct = 0usize;
    let mut margins = Vec::with_capacity(loader.len());

    no_grad(|| {
        for Batch { images, labels } in loader.iter(rng) {
            let output = model.forward(images);
            let loss = CrossEntropyLoss::apply(&output, &one_hot(&labels, nclasses));

            let out = output.data_ref();
            let out2 = out.view().into_dimensionality::<Ix2>().expect("logits are [B, K]");
            sum_correct += count_correct(&out2, &labels);
            sum_loss += labels.len() as f64 * loss.item() as f64;
            margins.extend(sample_margins(&out2, &labels));
        }
    });

    let n = loader.len().max(1) as f64;
    EvalStats {
        error: 1.0 - sum_correct as f64 / n,
        loss: sum_loss / n,
        margin: percentile(&margins, MARGIN_PERCENTILE),
    }
}

/// A finished (or early-stopped) training run.
pub struct TrainOutcome {
    pub model: Network,
    /// weighted layers of the network as initialized
    pub init_layers: Vec<LayerWeights>,
    /// last epoch trained (0-based)
    pub epoch: usize,
    /// final statistics on the training loader
    pub train: EvalStats,
    /// statistics of the last validation pass
    pub val: EvalStats,
    pub checkpoint: PathBuf,
}

pub struct Trainer {
    config: TrainConfig,
    rng: StdRng,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Trainer { config, rng }
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// RNG state after the run; the measure pass continues from it.
    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    fn checkpoint_path(&self, epoch: usize) -> PathBuf {
        self.config
            .savedir
            .join(format!("checkpoint_{}_{}.safetensors", self.config.trainingsetsize, epoch))
    }

    fn save(
        &self,
        epoch: usize,
        model: &Network,
        init_params: &[(String, ArrayD<f32>)],
        optimizer: &SGD,
        stats: (EpochStats, EvalStats),
        margin: f64,
    ) -> Result<PathBuf> {
        let (tr, val) = stats;
        let path = self.checkpoint_path(epoch);
        let state = CheckpointState {
            meta: CheckpointMeta {
                epoch,
                randomlabels: self.config.randomlabels,
                tr_loss: tr.loss,
                tr_err: tr.error,
                val_err: val.error,
                val_margin: margin,
                config: self.config.clone(),
            },
            model,
            init_params,
            velocities: optimizer.velocities(),
        };
        save_checkpoint(&path, &state)?;
        Ok(path)
    }

    pub fn run(&mut self, train_set: &Dataset, val_set: &Dataset) -> Result<TrainOutcome> {
        if self.config.batchsize == 0 {
            return Err(Error::InvalidArgument("batchsize must be positive".to_string()));
        }
        if train_set.is_empty() {
            return Err(Error::InvalidArgument("training set is empty".to_string()));
        }

        let info = train_set.info();
        let mut model = build_network(&self.config, info, &mut self.rng);
        let mut init_params: Vec<(String, ArrayD<f32>)> = model
            .named_parameters("")
            .into_iter()
            .map(|(name, p)| (name, p.data()))
            .collect();
        let mut optimizer =
            SGD::new(model.parameters(), self.config.learningrate).with_momentum(self.config.momentum);

        let mut start_epoch = 0;
        if let Some(path) = &self.config.modelpath {
            let ckpt = load_checkpoint(path)?;
            ckpt.apply_parameters(&model)?;
            init_params = ckpt.init_params(&model)?;
            optimizer.set_velocities(ckpt.velocities(model.parameters().len()));
            start_epoch = ckpt.meta.epoch + 1;
            info!("Resuming from {} at epoch {}", path.display(), start_epoch + 1);
        }

        let train_loader = train_loader(&self.config, train_set);
        let val_loader = DataLoader::new(val_set, self.config.batchsize, Sampler::Sequential);
        info!("trainings set size: {}", train_loader.len());

        let epochs = self.config.epochs;
        let mut last: Option<(usize, EvalStats)> = None;
        for epoch in start_epoch..epochs {
            let tr = train_epoch(&mut model, &train_loader, &mut optimizer, self.config.randomlabels, &mut self.rng);
            let val = validate(&mut model, &val_loader, &mut self.rng);

            info!(
                "Epoch: {}/{}\t Training loss: {:.3}\t Training error: {:.3}\t Validation error: {:.3}",
                epoch + 1,
                epochs,
                tr.loss,
                tr.error,
                val.error
            );
            debug!("epoch {} validation margin {:.4}", epoch + 1, val.margin);

            if self.config.save_epochs.contains(&epoch) {
                self.save(epoch, &model, &init_params, &optimizer, (tr, val), val.margin)?;
            }
            last = Some((epoch, val));

            if tr.loss < self.config.stopcond {
                info!("training loss {:.4} below {}, stopping", tr.loss, self.config.stopcond);
                break;
            }
        }

        let (epoch, val) = match last {
            Some(last) => last,
            None => {
                warn!("no epochs left to train (start {} >= epochs {})", start_epoch, epochs);
                (start_epoch.saturating_sub(1), validate(&mut model, &val_loader, &mut self.rng))
            }
        };

        let train = validate(&mut model, &train_loader, &mut self.rng);
        let checkpoint = self.save(
            epoch,
            &model,
            &init_params,
            &optimizer,
            (EpochStats { error: train.error, loss: train.loss }, val),
            train.margin,
        )?;

        info!(
            "Final: Training loss: {:.3}\t Training margin {:.3}\t Training error: {:.3}\t Validation error: {:.3}",
            train.loss, train.margin, train.error, val.error
        );

        let init_layers = snapshot_layers_from(&model, &init_params)?;
        Ok(TrainOutcome {
            model,
            init_layers,
            epoch,
            train,
            val,
            checkpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn percentile_interpolates_linearly() {
        let v: Vec<f64> = (1..=5).map(|x| x as f64).collect();
        assert_abs_diff_eq!(percentile(&v, 5.0), 1.2, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&v, 50.0), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(percentile(&v, 100.0), 5.0, epsilon = 1e-12);
        assert_eq!(percentile(&[7.0], 5.0), 7.0);
        assert!(percentile(&[], 5.0).is_nan());
    }

    #[test]
    fn margins_compare_true_class_with_best_other() {
        let out = arr2(&[[3.0f32, 1.0, 2.0], [0.0, 5.0, 1.0]]);
        let m = sample_margins(&out.view(), &[0, 2]);
        assert_eq!(m, vec![1.0, -4.0]);
        assert_eq!(count_correct(&out.view(), &[0, 2]), 1);
    }

    fn two_class_set(labels: Vec<usize>) -> Dataset {
        let images = ndarray::Array4::from_shape_fn((labels.len(), 1, 2, 2), |(i, _, y, x)| {
            ((i * 3 + y + 2 * x) % 5) as f32 * 0.3 - 0.6
        });
        Dataset::new(images, labels, 2)
    }

    fn run_epoch(ds: &Dataset, batch: usize, random_labels: bool) -> (EpochStats, Vec<ArrayD<f32>>) {
        let mut rng = StdRng::seed_from_u64(13);
        let mut net = crate::models::Fc::new(1, 2, 2, 4, 1, &mut rng);
        let mut opt = SGD::new(net.parameters(), 0.1).with_momentum(0.9);
        let loader = DataLoader::new(ds, batch, Sampler::Sequential);
        let stats = train_epoch(&mut net, &loader, &mut opt, random_labels, &mut rng);
        (stats, net.parameters().iter().map(|p| p.data()).collect())
    }

    #[test]
    fn random_labels_stay_within_their_batch() {
        // 每个 batch 只有一个类别：batch 内打乱不改变任何东西
        let ds = two_class_set(vec![0, 0, 0, 0, 1, 1, 1, 1]);
        let (plain, plain_params) = run_epoch(&ds, 4, false);
        let (shuffled, shuffled_params) = run_epoch(&ds, 4, true);
        assert_abs_diff_eq!(plain.loss, shuffled.loss, epsilon = 1e-9);
        assert_abs_diff_eq!(plain.error, shuffled.error, epsilon = 1e-12);
        for (a, b) in plain_params.iter().zip(&shuffled_params) {
            let diff = a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0f32, f32::max);
            assert!(diff < 1e-6, "parameters diverged by {}", diff);
        }

        // 混合类别的 batch 会真的被打乱
        let mixed = two_class_set((0..16).map(|i| i % 2).collect());
        let (plain, _) = run_epoch(&mixed, 16, false);
        let (shuffled, _) = run_epoch(&mixed, 16, true);
        assert!((plain.loss - shuffled.loss).abs() > 1e-9);
    }

    #[test]
    fn train_loader_follows_sampler_setting() {
        let images = ndarray::Array4::<f32>::zeros((10, 1, 2, 2));
        let ds = Dataset::new(images, vec![0; 10], 2);
        let mut config = TrainConfig { trainingsetsize: 4, batchsize: 3, ..TrainConfig::default() };
        let loader = train_loader(&config, &ds);
        assert_eq!(loader.sampler(), Sampler::SubsetRandom(4));
        assert_eq!(loader.num_batches(), 2);

        config.sampler = SamplerKind::Replacement;
        config.trainingsetsize = -1;
        assert_eq!(train_loader(&config, &ds).sampler(), Sampler::RandomWithReplacement(10));
    }
}
