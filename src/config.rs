// src/config.rs
use clap::{Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    /// customized VGG network
    Vgg,
    /// fully-connected network
    Fc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Mnist,
    Cifar10,
    Cifar100,
    Svhn,
}

/// 数据集的形状信息（所有图像统一到 32x32）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetInfo {
    pub nchannels: usize,
    pub nclasses: usize,
    pub img_dim: usize,
}

impl DatasetKind {
    pub fn info(self) -> DatasetInfo {
        let nchannels = match self {
            DatasetKind::Mnist => 1,
            _ => 3,
        };
        let nclasses = match self {
            DatasetKind::Cifar100 => 100,
            _ => 10,
        };
        DatasetInfo {
            nchannels,
            nclasses,
            img_dim: 32,
        }
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DatasetKind::Mnist => "MNIST",
            DatasetKind::Cifar10 => "CIFAR10",
            DatasetKind::Cifar100 => "CIFAR100",
            DatasetKind::Svhn => "SVHN",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VggConfig {
    Vgg11,
    Vgg13,
    Vgg16,
    Vgg19,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SamplerKind {
    /// the first `trainingsetsize` samples, reshuffled every epoch
    Subset,
    /// `trainingsetsize` samples drawn with replacement every epoch
    Replacement,
}

pub const DEFAULT_SAVE_EPOCHS: [usize; 12] = [1, 5, 10, 30, 50, 100, 200, 300, 400, 500, 600, 1000];

/// Training run configuration; stored as JSON in every checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Args)]
pub struct TrainConfig {
    /// type of network
    #[arg(long, value_enum, default_value_t = NetworkKind::Vgg)]
    pub network: NetworkKind,

    /// name of the dataset
    #[arg(long, value_enum, default_value_t = DatasetKind::Cifar10)]
    pub dataset: DatasetKind,

    /// path to the directory that contains the datasets
    #[arg(long, default_value = "../datasets")]
    pub datadir: PathBuf,

    /// number of epochs to train
    #[arg(long, default_value_t = 600)]
    pub epochs: usize,

    /// stopping condition based on the cross-entropy loss
    #[arg(long, default_value_t = 0.01)]
    pub stopcond: f64,

    #[arg(long, default_value_t = 64)]
    pub batchsize: usize,

    #[arg(long, default_value_t = 0.01)]
    pub learningrate: f32,

    #[arg(long, default_value_t = 0.9)]
    pub momentum: f32,

    /// train with labels permuted within every batch
    #[arg(long, default_value_t = false)]
    pub randomlabels: bool,

    /// size of the training set, -1 uses the whole set
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub trainingsetsize: i64,

    /// hidden units per layer (fc only)
    #[arg(long, default_value_t = 1024)]
    pub numhidden: usize,

    /// number of hidden layers (fc only)
    #[arg(long, default_value_t = 1)]
    pub numhiddenlayers: usize,

    #[arg(long, value_enum, default_value_t = VggConfig::Vgg11)]
    pub vgg_config: VggConfig,

    #[arg(long, value_enum, default_value_t = SamplerKind::Subset)]
    pub sampler: SamplerKind,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// directory for checkpoints
    #[arg(long, default_value = "../saved_models")]
    pub savedir: PathBuf,

    /// epochs (0-based) after which a checkpoint is written
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_SAVE_EPOCHS.to_vec())]
    pub save_epochs: Vec<usize>,

    /// checkpoint to continue training from
    #[arg(long)]
    pub modelpath: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            network: NetworkKind::Vgg,
            dataset: DatasetKind::Cifar10,
            datadir: PathBuf::from("../datasets"),
            epochs: 600,
            stopcond: 0.01,
            batchsize: 64,
            learningrate: 0.01,
            momentum: 0.9,
            randomlabels: false,
            trainingsetsize: -1,
            numhidden: 1024,
            numhiddenlayers: 1,
            vgg_config: VggConfig::Vgg11,
            sampler: SamplerKind::Subset,
            seed: 0,
            savedir: PathBuf::from("../saved_models"),
            save_epochs: DEFAULT_SAVE_EPOCHS.to_vec(),
            modelpath: None,
        }
    }
}

impl TrainConfig {
    /// 实际使用的训练样本数（-1 或超出时取整个训练集）
    pub fn effective_set_size(&self, dataset_len: usize) -> usize {
        if self.trainingsetsize < 0 {
            dataset_len
        } else {
            (self.trainingsetsize as usize).min(dataset_len)
        }
    }
}

/// Options of the post-training measure computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Args)]
pub struct MeasureOptions {
    /// scale of the weight perturbation alpha * (|w| + 1)
    #[arg(long, default_value_t = 5e-4)]
    pub sharpness_alpha: f32,

    /// number of perturbations averaged for the expected sharpness
    #[arg(long, default_value_t = 5)]
    pub sharpness_samples: usize,

    /// standard deviation of the PAC-Bayes prior/posterior
    #[arg(long, default_value_t = 1.0)]
    pub pac_sigma: f64,

    /// confidence parameter of the PAC-Bayes bound
    #[arg(long, default_value_t = 0.2)]
    pub pac_delta: f64,
}

impl Default for MeasureOptions {
    fn default() -> Self {
        MeasureOptions {
            sharpness_alpha: 5e-4,
            sharpness_samples: 5,
            pac_sigma: 1.0,
            pac_delta: 0.2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_shapes() {
        assert_eq!(DatasetKind::Mnist.info().nchannels, 1);
        assert_eq!(DatasetKind::Cifar100.info().nclasses, 100);
        assert_eq!(DatasetKind::Svhn.info(), DatasetInfo { nchannels: 3, nclasses: 10, img_dim: 32 });
    }

    #[test]
    fn negative_set_size_means_whole_dataset() {
        let mut config = TrainConfig::default();
        assert_eq!(config.effective_set_size(500), 500);
        config.trainingsetsize = 100;
        assert_eq!(config.effective_set_size(500), 100);
        config.trainingsetsize = 1000;
        assert_eq!(config.effective_set_size(500), 500);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let config = TrainConfig { network: NetworkKind::Fc, seed: 3, ..TrainConfig::default() };
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
