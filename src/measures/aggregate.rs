// src/measures/aggregate.rs
use crate::error::{Error, Result};
use crate::module::LayerWeights;

/// How per-layer values combine into one number for the whole network.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operator {
    /// exp(Σ ln f)
    Product,
    Sum,
    /// (Σ f^p)^(1/p)
    Norm(f64),
    Max,
}

impl Operator {
    pub fn combine<I: IntoIterator<Item = f64>>(self, values: I) -> f64 {
        let values = values.into_iter();
        match self {
            Operator::Product => values.map(f64::ln).sum::<f64>().exp(),
            Operator::Sum => values.sum(),
            Operator::Norm(p) => values.map(|v| v.powf(p)).sum::<f64>().powf(1.0 / p),
            // 空网络为 0
            Operator::Max => values.reduce(f64::max).unwrap_or(0.0),
        }
    }
}

/// 训练后的层和初始层必须一一对应（个数、种类、形状）
fn check_pairing(model: &[LayerWeights], init: &[LayerWeights]) -> Result<()> {
    if model.len() != init.len() {
        return Err(Error::Measure(format!(
            "model has {} weighted layers, initial model has {}",
            model.len(),
            init.len()
        )));
    }
    for (i, (m, m0)) in model.iter().zip(init).enumerate() {
        if m.kind != m0.kind || m.weight.shape() != m0.weight.shape() {
            return Err(Error::Measure(format!(
                "layer {} differs from its initial counterpart: {:?} {:?} vs {:?} {:?}",
                i,
                m.kind,
                m.weight.shape(),
                m0.kind,
                m0.weight.shape()
            )));
        }
    }
    Ok(())
}

/// Applies `measure` to every (trained, initial) layer pair in forward order
/// and folds the results with `op`.
pub fn calc_measure<F>(model: &[LayerWeights], init: &[LayerWeights], measure: F, op: Operator) -> Result<f64>
where
    F: Fn(&LayerWeights, &LayerWeights) -> f64,
{
    check_pairing(model, init)?;
    Ok(op.combine(model.iter().zip(init).map(|(m, m0)| measure(m, m0))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measures::norms::{distance, n_param, norm};
    use crate::module::LayerKind;
    use approx::assert_relative_eq;
    use ndarray::ArrayD;

    fn filled(shape: &[usize], v: f32) -> LayerWeights {
        LayerWeights {
            kind: LayerKind::Linear,
            weight: ArrayD::from_elem(shape.to_vec(), v),
            bias: None,
        }
    }

    #[test]
    fn operators_fold_as_documented() {
        let v = [2.0, 3.0, 6.0];
        assert_relative_eq!(Operator::Product.combine(v), 36.0, epsilon = 1e-9);
        assert_relative_eq!(Operator::Sum.combine(v), 11.0);
        assert_relative_eq!(Operator::Norm(2.0).combine(v), 7.0, epsilon = 1e-12);
        assert_relative_eq!(Operator::Max.combine(v), 6.0);
        assert_relative_eq!(Operator::Product.combine(std::iter::empty()), 1.0);
        assert_eq!(Operator::Max.combine(std::iter::empty()), 0.0);
        assert_eq!(Operator::Max.combine([-3.0, -1.5]), -1.5);
    }

    #[test]
    fn product_of_frobenius_norms_over_layers() {
        let model = vec![filled(&[2, 2], 1.0), filled(&[1, 2], 2.0)];
        let init = vec![filled(&[2, 2], 0.0), filled(&[1, 2], 0.0)];
        // ||W1||_F = 2, ||W2||_F = sqrt(8)
        let fro = calc_measure(&model, &init, |m, _| norm(m, 2.0, 2.0), Operator::Product).unwrap();
        assert_relative_eq!(fro, 2.0 * 8.0f64.sqrt(), epsilon = 1e-9);

        let dist = calc_measure(&model, &init, |m, m0| distance(m, m0, 2.0, 2.0), Operator::Norm(2.0)).unwrap();
        assert_relative_eq!(dist, 12.0f64.sqrt(), epsilon = 1e-9);

        let params = calc_measure(&model, &init, |m, _| n_param(m) as f64, Operator::Sum).unwrap();
        assert_eq!(params, 6.0);
    }

    #[test]
    fn mismatched_trees_are_rejected() {
        let model = vec![filled(&[2, 2], 1.0)];
        assert!(calc_measure(&model, &[], |_, _| 1.0, Operator::Sum).is_err());
        let init = vec![filled(&[2, 3], 1.0)];
        assert!(matches!(
            calc_measure(&model, &init, |_, _| 1.0, Operator::Sum),
            Err(Error::Measure(_))
        ));
    }
}
