// src/data/mod.rs
pub mod cifar;
pub mod loader;
pub mod mnist;

pub use loader::{Batch, DataLoader, Sampler};

use crate::config::{DatasetInfo, DatasetKind};
use crate::error::Result;
use ndarray::{Array4, Axis};
use std::path::Path;
use tracing::info;

pub const IMG_DIM: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

/// In-memory image classification set: images `[N, C, 32, 32]`, one label per image.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub images: Array4<f32>,
    pub labels: Vec<usize>,
    pub nclasses: usize,
}

impl Dataset {
    pub fn new(images: Array4<f32>, labels: Vec<usize>, nclasses: usize) -> Self {
        assert_eq!(
            images.shape()[0],
            labels.len(),
            "image count and label count differ"
        );
        Dataset {
            images,
            labels,
            nclasses,
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn nchannels(&self) -> usize {
        self.images.shape()[1]
    }

    pub fn info(&self) -> DatasetInfo {
        DatasetInfo {
            nchannels: self.nchannels(),
            nclasses: self.nclasses,
            img_dim: self.images.shape()[2],
        }
    }

    /// 按通道做 (x - mean) / std
    pub fn normalize(&mut self, mean: &[f32], std: &[f32]) {
        for (c, mut plane) in self.images.axis_iter_mut(Axis(1)).enumerate() {
            let (m, s) = (mean[c], std[c]);
            plane.mapv_inplace(|x| (x - m) / s);
        }
    }

    /// 取出一个 batch（拷贝）
    pub fn gather(&self, indices: &[usize]) -> (Array4<f32>, Vec<usize>) {
        let images = self.images.select(Axis(0), indices);
        let labels = indices.iter().map(|&i| self.labels[i]).collect();
        (images, labels)
    }
}

/// Per-channel mean and std of the training split.
pub fn normalization(kind: DatasetKind) -> (&'static [f32], &'static [f32]) {
    match kind {
        DatasetKind::Mnist => (&[0.1307], &[0.3081]),
        DatasetKind::Cifar10 => (&[0.4914, 0.4822, 0.4465], &[0.2470, 0.2435, 0.2616]),
        DatasetKind::Cifar100 => (&[0.5071, 0.4865, 0.4409], &[0.2673, 0.2564, 0.2762]),
        DatasetKind::Svhn => (&[0.4377, 0.4438, 0.4728], &[0.1980, 0.2010, 0.1970]),
    }
}

/// Loads one split of a dataset from `datadir` and normalizes it.
pub fn load_data(split: Split, kind: DatasetKind, datadir: &Path) -> Result<Dataset> {
    let mut dataset = match kind {
        DatasetKind::Mnist => mnist::load(split, datadir)?,
        DatasetKind::Cifar10 => cifar::load_cifar10(split, datadir)?,
        DatasetKind::Cifar100 => cifar::load_cifar100(split, datadir)?,
        DatasetKind::Svhn => cifar::load_svhn(split, datadir)?,
    };
    let (mean, std) = normalization(kind);
    dataset.normalize(mean, std);
    info!("{} {:?}: {} samples", kind, split, dataset.len());
    Ok(dataset)
}
