// src/measures/norms.rs
//! Per-layer quantities. Convolution kernels `[out, in, kh, kw]` are read as
//! `[out, in*kh*kw]` matrices, so row `i` holds the incoming weights of unit `i`.
use crate::module::LayerWeights;
use nalgebra::DMatrix;
use ndarray::Array2;

/// `(Σ|x|^p)^(1/p)`; `p = inf` gives `max |x|`.
pub fn lp_norm<I: IntoIterator<Item = f64>>(values: I, p: f64) -> f64 {
    if p.is_infinite() {
        return values.into_iter().fold(0.0, |acc, x| acc.max(x.abs()));
    }
    values.into_iter().map(|x| x.abs().powf(p)).sum::<f64>().powf(1.0 / p)
}

/// l_q over rows of the row-wise l_p norms
pub fn lpq_norm(matrix: &Array2<f32>, p: f64, q: f64) -> f64 {
    let rows = matrix
        .outer_iter()
        .map(|row| lp_norm(row.iter().map(|&x| x as f64), p));
    lp_norm(rows, q)
}

pub fn singular_values(matrix: &Array2<f32>) -> Vec<f64> {
    let (rows, cols) = matrix.dim();
    if rows == 0 || cols == 0 {
        return vec![];
    }
    let m = DMatrix::<f64>::from_fn(rows, cols, |i, j| matrix[[i, j]] as f64);
    m.singular_values().iter().copied().collect()
}

/// l_{p,q} norm of the weight matrix.
pub fn norm(layer: &LayerWeights, p: f64, q: f64) -> f64 {
    lpq_norm(&layer.weight_matrix(), p, q)
}

/// l_p norm of the singular values: `inf` is the spectral norm, `1` the trace norm.
pub fn op_norm(layer: &LayerWeights, p: f64) -> f64 {
    lp_norm(singular_values(&layer.weight_matrix()), p)
}

/// l_{p,q} norm of `W - W0`. Both layers must have the same shape.
pub fn distance(layer: &LayerWeights, init: &LayerWeights, p: f64, q: f64) -> f64 {
    let diff = &layer.weight_matrix() - &init.weight_matrix();
    lpq_norm(&diff, p, q)
}

/// `distance` scaled by `n_hidden^(1 - 1/q)`
pub fn h_dist(layer: &LayerWeights, init: &LayerWeights, p: f64, q: f64) -> f64 {
    let hidden = (n_hidden(layer) as f64).powf(1.0 - 1.0 / q);
    hidden * distance(layer, init, p, q)
}

pub fn h_dist_op_norm(layer: &LayerWeights, init: &LayerWeights, p: f64, q: f64, p_op: f64) -> f64 {
    h_dist(layer, init, p, q) / op_norm(layer, p_op)
}

pub fn n_hidden(layer: &LayerWeights) -> usize {
    layer.n_hidden()
}

/// Every Linear / Conv layer counts as one.
pub fn depth(_layer: &LayerWeights) -> usize {
    1
}

pub fn n_param(layer: &LayerWeights) -> usize {
    layer.n_param()
}
