// src/models/fc.rs
use crate::autograd::Tensor;
use crate::layers::{Flatten, Linear, ReLU};
use crate::module::{join_name, Module, Sequential, WeightedLayer};
use rand::Rng;

/// Fully-connected network: flatten, `nlayers` hidden ReLU layers of `nunits`, linear head.
pub struct Fc {
    flatten: Flatten,
    classifier: Sequential,
}

impl Fc {
    pub fn new<R: Rng + ?Sized>(
        nchannels: usize,
        nclasses: usize,
        img_dim: usize,
        nunits: usize,
        nlayers: usize,
        rng: &mut R,
    ) -> Self {
        let mut layers: Vec<Box<dyn Module>> = Vec::new();
        let mut in_features = nchannels * img_dim * img_dim;
        for _ in 0..nlayers {
            layers.push(Box::new(Linear::new(in_features, nunits, rng)));
            layers.push(Box::new(ReLU::new()));
            in_features = nunits;
        }
        layers.push(Box::new(Linear::new(in_features, nclasses, rng)));

        Fc {
            flatten: Flatten::new(),
            classifier: Sequential::new(layers),
        }
    }
}

impl Module for Fc {
    fn forward(&self, input: Tensor) -> Tensor {
        self.classifier.forward(self.flatten.forward(input))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.classifier.parameters()
    }

    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.classifier.named_parameters(&join_name(prefix, "classifier"))
    }

    fn weighted_layers(&self) -> Vec<WeightedLayer> {
        self.classifier.weighted_layers()
    }

    fn train_mode(&mut self) {
        self.classifier.train_mode();
    }

    fn eval_mode(&mut self) {
        self.classifier.eval_mode();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn hidden_layers_are_stacked() {
        let mut rng = StdRng::seed_from_u64(0);
        let net = Fc::new(1, 10, 4, 8, 2, &mut rng);
        let shapes: Vec<Vec<usize>> = net.weighted_layers().iter().map(|l| l.weight.shape()).collect();
        assert_eq!(shapes, vec![vec![8, 16], vec![8, 8], vec![10, 8]]);
    }
}
