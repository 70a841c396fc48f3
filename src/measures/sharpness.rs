// src/measures/sharpness.rs
use crate::data::DataLoader;
use crate::module::{Module, ParamSnapshot};
use crate::train::validate;
use ndarray::{ArrayD, Zip};
use rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::Rng;
use tracing::debug;

/// w += alpha * (|w| + 1) * ξ for every Linear / Conv weight, ξ ~ N(0, 1).
pub fn add_perturbation<R: Rng + ?Sized>(model: &dyn Module, alpha: f32, rng: &mut R) {
    for layer in model.weighted_layers() {
        let mut weight = layer.weight.data_mut();
        let noise: ArrayD<f32> = ArrayD::random_using(weight.raw_dim(), StandardNormal, rng);
        Zip::from(&mut *weight).and(&noise).for_each(|w, &xi| {
            *w += alpha * (w.abs() + 1.0) * xi;
        });
    }
}

/// Clean training loss and the mean loss increase over `samples` perturbations.
/// Every loss is taken on the same draw of `loader`'s sampler.
pub(crate) fn loss_and_sharpness<R: Rng + ?Sized>(
    model: &mut dyn Module,
    loader: &DataLoader<'_>,
    alpha: f32,
    samples: usize,
    rng: &mut R,
) -> (f64, f64) {
    let loader = &loader.freeze(rng);
    let clean = validate(model, loader, rng).loss;
    if samples == 0 {
        return (clean, 0.0);
    }

    let snapshot = ParamSnapshot::capture(model);
    let mut total = 0.0;
    for i in 0..samples {
        add_perturbation(model, alpha, rng);
        let perturbed = validate(model, loader, rng).loss;
        debug!("perturbation {}: loss {:.5} (clean {:.5})", i, perturbed, clean);
        total += perturbed - clean;
        snapshot.restore();
    }
    (clean, total / samples as f64)
}

/// Expected sharpness: E[loss(w + ν)] - loss(w) with ν from `add_perturbation`.
/// The model is left unchanged.
pub fn expected_sharpness<R: Rng + ?Sized>(
    model: &mut dyn Module,
    loader: &DataLoader<'_>,
    alpha: f32,
    samples: usize,
    rng: &mut R,
) -> f64 {
    loss_and_sharpness(model, loader, alpha, samples, rng).1
}

/// tr_loss + exp_sharpness + 4 * sqrt((||w||² / (2σ²) + ln(2m/δ)) / m)
pub fn pac_bayes_bound(tr_loss: f64, exp_sharpness: f64, l2_sq: f64, m: f64, sigma: f64, delta: f64) -> f64 {
    let kl = l2_sq / (2.0 * sigma * sigma);
    let confidence = (2.0 * m / delta).ln();
    tr_loss + exp_sharpness + 4.0 * ((kl + confidence) / m).sqrt()
}
