use crate::autograd::Tensor;
use crate::init::{tensor_init, InitType};
use crate::module::{join_name, LayerKind, Module, WeightedLayer};
use crate::ops::convolution::conv2d;
use rand::Rng;

pub struct Conv2D {
    pub weight: Tensor, // [out, in, k, k]
    pub bias: Option<Tensor>,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2D {
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        padding: usize,
        rng: &mut R,
    ) -> Self {
        let fan_in = in_channels * kernel_size * kernel_size;
        let weight = tensor_init(
            vec![out_channels, in_channels, kernel_size, kernel_size],
            InitType::KaimingNormal { fan_in },
            rng,
        );
        let bias = tensor_init(vec![out_channels], InitType::Zeros, rng);
        Conv2D { weight, bias: Some(bias), stride, padding }
    }
}

impl Module for Conv2D {
    fn forward(&self, input: Tensor) -> Tensor {
        conv2d(&input, &self.weight, self.bias.as_ref(), (self.stride, self.stride), (self.padding, self.padding))
    }
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(b) = &self.bias { params.push(b.clone()); }
        params
    }
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = vec![(join_name(prefix, "weight"), self.weight.clone())];
        if let Some(b) = &self.bias { params.push((join_name(prefix, "bias"), b.clone())); }
        params
    }
    fn weighted_layers(&self) -> Vec<WeightedLayer> {
        vec![WeightedLayer { kind: LayerKind::Conv2d, weight: self.weight.clone(), bias: self.bias.clone() }]
    }
}
