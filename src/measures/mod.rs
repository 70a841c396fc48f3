// src/measures/mod.rs
//! Post-hoc generalization measures of a trained network, relative to its
//! initialization, and the bounds assembled from them.
pub mod aggregate;
pub mod norms;
pub mod path_norm;
pub mod sharpness;

pub use aggregate::{calc_measure, Operator};
pub use path_norm::lp_path_norm;
pub use sharpness::{add_perturbation, expected_sharpness, pac_bayes_bound};

use crate::config::{DatasetInfo, MeasureOptions};
use crate::data::DataLoader;
use crate::error::Result;
use crate::module::{snapshot_layers, LayerWeights, Module};
use norms::{depth, distance, h_dist_op_norm, n_param, norm, op_norm};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const INF: f64 = f64::INFINITY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub value: f64,
}

/// Measures and bounds in computation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasureReport {
    pub measures: Vec<Entry>,
    pub bounds: Vec<Entry>,
}

impl MeasureReport {
    fn push_measure(&mut self, name: &str, value: f64) {
        debug!("{}: {}", name, value);
        self.measures.push(Entry { name: name.to_string(), value });
    }

    fn push_bound(&mut self, name: &str, value: f64) {
        debug!("{}: {}", name, value);
        self.bounds.push(Entry { name: name.to_string(), value });
    }

    pub fn measure(&self, name: &str) -> Option<f64> {
        self.measures.iter().find(|e| e.name == name).map(|e| e.value)
    }

    pub fn bound(&self, name: &str) -> Option<f64> {
        self.bounds.iter().find(|e| e.name == name).map(|e| e.value)
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        info!("Report written to {}", path.display());
        Ok(())
    }
}

impl fmt::Display for MeasureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n###### Measures")?;
        for e in &self.measures {
            writeln!(f, "{:<25}:{:.4e}", e.name, e.value)?;
        }
        writeln!(f, "\n###### Generalization Bounds")?;
        for e in &self.bounds {
            writeln!(f, "{:<45}:{:.4e}", e.name, e.value)?;
        }
        Ok(())
    }
}

/// Computes every measure and bound for `model` against `init_layers`.
///
/// `margin` is the 5th-percentile training margin; norm-based measures are
/// divided by it. `m` in the bounds is the number of samples the training
/// loader draws per epoch. The training loss and expected sharpness are taken
/// on one draw of `train_loader`; pass a frozen loader to tie them to the
/// draw `margin` came from.
pub fn calculate<R: rand::Rng + ?Sized>(
    model: &mut dyn Module,
    init_layers: &[LayerWeights],
    train_loader: &DataLoader<'_>,
    margin: f64,
    info: DatasetInfo,
    opts: &MeasureOptions,
    rng: &mut R,
) -> Result<MeasureReport> {
    if margin <= 0.0 {
        warn!("training margin {:.4} is not positive; margin-normalized measures are not meaningful", margin);
    }

    let layers = snapshot_layers(model);
    let input_size = [1, info.nchannels, info.img_dim, info.img_dim];
    let mut report = MeasureReport::default();

    info!("norm-based measures over {} weighted layers", layers.len());
    let product = |f: &dyn Fn(&LayerWeights) -> f64| calc_measure(&layers, init_layers, |m, _| f(m), Operator::Product);

    let l1_inf = product(&|m| norm(m, 1.0, INF))? / margin;
    let fro = product(&|m| norm(m, 2.0, 2.0))? / margin;
    let l3_15 = product(&|m| norm(m, 3.0, 1.5))? / margin;
    let spectral_product = product(&|m| op_norm(m, INF))?;
    report.push_measure("L_{1,inf} norm", l1_inf);
    report.push_measure("Frobenious norm", fro);
    report.push_measure("L_{3,1.5} norm", l3_15);
    report.push_measure("Spectral norm", spectral_product / margin);
    report.push_measure("L_1.5 operator norm", product(&|m| op_norm(m, 1.5))? / margin);
    report.push_measure("Trace norm", product(&|m| op_norm(m, 1.0))? / margin);

    info!("path norms");
    for (name, p) in [("L1_path norm", 1.0), ("L1.5_path norm", 1.5), ("L2_path norm", 2.0)] {
        report.push_measure(name, lp_path_norm(model, p, &input_size) / margin);
    }

    let fro_dist = calc_measure(&layers, init_layers, |m, m0| distance(m, m0, 2.0, 2.0), Operator::Norm(2.0))?;
    let n_params = calc_measure(&layers, init_layers, |m, _| n_param(m) as f64, Operator::Sum)?;
    let d = calc_measure(&layers, init_layers, |m, _| depth(m) as f64, Operator::Sum)?;
    report.push_measure("Frobenious distance", fro_dist);
    report.push_measure("#parameters", n_params);
    report.push_measure("depth", d);

    info!(
        "expected sharpness ({} samples, alpha {})",
        opts.sharpness_samples, opts.sharpness_alpha
    );
    let (tr_loss, sharpness) =
        sharpness::loss_and_sharpness(model, train_loader, opts.sharpness_alpha, opts.sharpness_samples, rng);
    report.push_measure("Expected sharpness", sharpness);

    info!("bounds");
    let m = train_loader.len() as f64;
    let alpha = (d + ((info.nchannels * info.img_dim * info.img_dim) as f64).ln()).sqrt();
    let beta = spectral_product;

    report.push_bound("L1_max Bound (Bartlett and Mendelson 2002)", alpha * l1_inf / m.sqrt());
    report.push_bound("Frobenious Bound (Neyshabur et al. 2015)", alpha * fro / m.sqrt());
    report.push_bound("L_{3,1.5} Bound (Neyshabur et al. 2015)", alpha * l3_15 / m.cbrt());

    let spec_l21 = calc_measure(
        &layers,
        init_layers,
        |l, l0| h_dist_op_norm(l, l0, 2.0, 1.0, INF),
        Operator::Norm(2.0 / 3.0),
    )?;
    report.push_bound(
        "Spec_L_{2,1} Bound (Bartlett et al. 2017)",
        beta * spec_l21 / margin / m.sqrt(),
    );

    let spec_fro = calc_measure(
        &layers,
        init_layers,
        |l, l0| h_dist_op_norm(l, l0, 2.0, 2.0, INF),
        Operator::Norm(2.0),
    )?;
    report.push_bound(
        "Spec_Fro Bound (Neyshabur et al. 2018)",
        d * beta * spec_fro / margin / m.sqrt(),
    );

    let l2_sq: f64 = model
        .parameters()
        .iter()
        .map(|p| p.data_ref().iter().map(|&w| (w as f64) * (w as f64)).sum::<f64>())
        .sum();
    report.push_bound(
        "PAC-Bayes Bound (McAllester 1999)",
        pac_bayes_bound(tr_loss, sharpness, l2_sq, m, opts.pac_sigma, opts.pac_delta),
    );

    Ok(report)
}
