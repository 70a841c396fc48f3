// src/layers/basic/linear.rs
use crate::autograd::Tensor;
use crate::init::{tensor_init, InitType};
use crate::module::{join_name, LayerKind, Module, WeightedLayer};
use crate::ops::matmul::matmul;
use rand::Rng;

pub struct Linear {
    pub weight: Tensor,       // shape: [out_features, in_features]
    pub bias: Option<Tensor>, // shape: [out_features]
}

impl Linear {
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        // 对齐 PyTorch nn.Linear.weight 的布局，weight 存成 [out, in]
        let weight = tensor_init(
            vec![out_features, in_features],
            InitType::KaimingUniform { fan_in: in_features },
            rng,
        );
        let bias = tensor_init(
            vec![out_features],
            InitType::KaimingUniform { fan_in: in_features },
            rng,
        );

        Linear {
            weight,
            bias: Some(bias),
        }
    }

    pub fn new_no_bias<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let weight = tensor_init(
            vec![out_features, in_features],
            InitType::KaimingUniform { fan_in: in_features },
            rng,
        );

        Linear { weight, bias: None }
    }
}

impl Module for Linear {
    fn forward(&self, input: Tensor) -> Tensor {
        let y = matmul(&input, &self.weight);

        if let Some(bias) = &self.bias {
            y + bias.clone() // bias: [out]
        } else {
            y
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            params.push(b.clone());
        }
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = vec![(join_name(prefix, "weight"), self.weight.clone())];
        if let Some(b) = &self.bias {
            params.push((join_name(prefix, "bias"), b.clone()));
        }
        params
    }

    fn weighted_layers(&self) -> Vec<WeightedLayer> {
        vec![WeightedLayer {
            kind: LayerKind::Linear,
            weight: self.weight.clone(),
            bias: self.bias.clone(),
        }]
    }
}
