// src/models/vgg.rs
use crate::autograd::Tensor;
use crate::config::VggConfig;
use crate::layers::{Conv2D, Flatten, Linear, MaxPool2D, ReLU};
use crate::module::{join_name, Module, Sequential, WeightedLayer};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VggItem {
    /// 3x3 conv (padding 1) + ReLU with the given output width
    Conv(usize),
    /// 2x2 max-pool, stride 2
    Pool,
}

use VggItem::{Conv, Pool};

const VGG11: &[VggItem] = &[Conv(64), Pool, Conv(128), Pool, Conv(256), Conv(256), Pool, Conv(512), Conv(512), Pool, Conv(512), Conv(512), Pool];
const VGG13: &[VggItem] = &[Conv(64), Conv(64), Pool, Conv(128), Conv(128), Pool, Conv(256), Conv(256), Pool, Conv(512), Conv(512), Pool, Conv(512), Conv(512), Pool];
const VGG16: &[VggItem] = &[
    Conv(64), Conv(64), Pool, Conv(128), Conv(128), Pool, Conv(256), Conv(256), Conv(256), Pool,
    Conv(512), Conv(512), Conv(512), Pool, Conv(512), Conv(512), Conv(512), Pool,
];
const VGG19: &[VggItem] = &[
    Conv(64), Conv(64), Pool, Conv(128), Conv(128), Pool, Conv(256), Conv(256), Conv(256), Conv(256), Pool,
    Conv(512), Conv(512), Conv(512), Conv(512), Pool, Conv(512), Conv(512), Conv(512), Conv(512), Pool,
];

impl VggConfig {
    pub fn layout(self) -> &'static [VggItem] {
        match self {
            VggConfig::Vgg11 => VGG11,
            VggConfig::Vgg13 => VGG13,
            VggConfig::Vgg16 => VGG16,
            VggConfig::Vgg19 => VGG19,
        }
    }
}

/// VGG-style network: conv/pool feature stack followed by a single linear classifier.
pub struct Vgg {
    features: Sequential,
    flatten: Flatten,
    classifier: Linear,
}

impl Vgg {
    pub fn new<R: Rng + ?Sized>(
        nchannels: usize,
        nclasses: usize,
        img_dim: usize,
        layout: &[VggItem],
        rng: &mut R,
    ) -> Self {
        let mut layers: Vec<Box<dyn Module>> = Vec::new();
        let mut in_channels = nchannels;
        let mut spatial = img_dim;
        for item in layout {
            match *item {
                Conv(width) => {
                    layers.push(Box::new(Conv2D::new(in_channels, width, 3, 1, 1, rng)));
                    layers.push(Box::new(ReLU::new()));
                    in_channels = width;
                }
                Pool => {
                    layers.push(Box::new(MaxPool2D::new(2, 2)));
                    spatial /= 2;
                }
            }
        }
        assert!(spatial > 0, "VGG layout pools a {0}x{0} input down to nothing", img_dim);

        let classifier = Linear::new(in_channels * spatial * spatial, nclasses, rng);
        Vgg {
            features: Sequential::new(layers),
            flatten: Flatten::new(),
            classifier,
        }
    }
}

impl Module for Vgg {
    fn forward(&self, input: Tensor) -> Tensor {
        let x = self.features.forward(input);
        let x = self.flatten.forward(x);
        self.classifier.forward(x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.features.parameters();
        params.extend(self.classifier.parameters());
        params
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let mut params = self.features.named_parameters(&join_name(prefix, "features"));
        params.extend(self.classifier.named_parameters(&join_name(prefix, "classifier")));
        params
    }

    fn weighted_layers(&self) -> Vec<WeightedLayer> {
        let mut layers = self.features.weighted_layers();
        layers.extend(self.classifier.weighted_layers());
        layers
    }

    fn train_mode(&mut self) {
        self.features.train_mode();
        self.classifier.train_mode();
    }

    fn eval_mode(&mut self) {
        self.features.eval_mode();
        self.classifier.eval_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::no_grad;
    use crate::module::LayerKind;
    use ndarray::ArrayD;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn small_vgg_forward_shape_and_layer_tree() {
        let mut rng = StdRng::seed_from_u64(0);
        let net = Vgg::new(3, 10, 8, &[Conv(4), Pool, Conv(8), Pool], &mut rng);

        let x = Tensor::from_data_no_grad(ArrayD::ones(vec![2, 3, 8, 8]));
        let y = no_grad(|| net.forward(x));
        assert_eq!(y.shape(), vec![2, 10]);

        let kinds: Vec<LayerKind> = net.weighted_layers().iter().map(|l| l.kind).collect();
        assert_eq!(kinds, vec![LayerKind::Conv2d, LayerKind::Conv2d, LayerKind::Linear]);

        let names: Vec<String> = net.named_parameters("").into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec![
                "features.0.weight",
                "features.0.bias",
                "features.3.weight",
                "features.3.bias",
                "classifier.weight",
                "classifier.bias"
            ]
        );
    }

    #[test]
    fn vgg11_head_sees_512_features_on_32x32() {
        let mut rng = StdRng::seed_from_u64(0);
        let net = Vgg::new(3, 10, 32, VggConfig::Vgg11.layout(), &mut rng);
        assert_eq!(net.classifier.weight.shape(), vec![10, 512]);
        assert_eq!(net.weighted_layers().len(), 9);
    }
}
