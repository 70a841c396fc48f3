pub mod fc;
pub mod vgg;

pub use fc::Fc;
pub use vgg::{Vgg, VggItem};

use crate::autograd::Tensor;
use crate::config::{DatasetInfo, NetworkKind, TrainConfig};
use crate::module::{Module, WeightedLayer};
use rand::Rng;

/// The two architectures a run can train.
pub enum Network {
    Vgg(Vgg),
    Fc(Fc),
}

pub fn build_network<R: Rng + ?Sized>(config: &TrainConfig, info: DatasetInfo, rng: &mut R) -> Network {
    match config.network {
        NetworkKind::Vgg => Network::Vgg(Vgg::new(
            info.nchannels,
            info.nclasses,
            info.img_dim,
            config.vgg_config.layout(),
            rng,
        )),
        NetworkKind::Fc => Network::Fc(Fc::new(
            info.nchannels,
            info.nclasses,
            info.img_dim,
            config.numhidden,
            config.numhiddenlayers,
            rng,
        )),
    }
}

impl Network {
    fn inner(&self) -> &dyn Module {
        match self {
            Network::Vgg(m) => m,
            Network::Fc(m) => m,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Module {
        match self {
            Network::Vgg(m) => m,
            Network::Fc(m) => m,
        }
    }
}

impl Module for Network {
    fn forward(&self, input: Tensor) -> Tensor {
        self.inner().forward(input)
    }
    fn parameters(&self) -> Vec<Tensor> {
        self.inner().parameters()
    }
    fn named_parameters(&self, prefix: &str) -> Vec<(String, Tensor)> {
        self.inner().named_parameters(prefix)
    }
    fn weighted_layers(&self) -> Vec<WeightedLayer> {
        self.inner().weighted_layers()
    }
    fn train_mode(&mut self) {
        self.inner_mut().train_mode();
    }
    fn eval_mode(&mut self) {
        self.inner_mut().eval_mode();
    }
}
