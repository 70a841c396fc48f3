// src/data/mnist.rs
use super::{Dataset, Split, IMG_DIM};
use crate::error::{Error, Result};
use mnist::{Mnist, MnistBuilder};
use ndarray::prelude::*;
use std::path::Path;
use tracing::info;

const TRAIN_SIZE: usize = 60_000;
const TEST_SIZE: usize = 10_000;
const RAW_DIM: usize = 28;

const REQUIRED_FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

/// 读取 `datadir/MNIST/raw` 下解压后的 4 个 idx 文件
pub fn load(split: Split, datadir: &Path) -> Result<Dataset> {
    let data_dir = datadir.join("MNIST").join("raw");
    for name in REQUIRED_FILES {
        let path = data_dir.join(name);
        if !path.exists() {
            return Err(Error::dataset(path, "MNIST idx file not found"));
        }
    }

    info!("Loading MNIST {:?} split from {}", split, data_dir.display());

    let base_path = data_dir
        .to_str()
        .ok_or_else(|| Error::dataset(&data_dir, "path is not valid UTF-8"))?;

    let Mnist {
        trn_img,
        trn_lbl,
        tst_img,
        tst_lbl,
        ..
    } = MnistBuilder::new()
        .label_format_digit()
        .training_set_length(TRAIN_SIZE as u32)
        .validation_set_length(0)
        .test_set_length(TEST_SIZE as u32)
        .base_path(base_path)
        .finalize();

    let (images, labels, size) = match split {
        Split::Train => (trn_img, trn_lbl, TRAIN_SIZE),
        Split::Val => (tst_img, tst_lbl, TEST_SIZE),
    };

    let images = process_images(&images, size)?;
    let labels = labels.into_iter().map(|l| l as usize).collect();
    Ok(Dataset::new(images, labels, 10))
}

/// 28x28 灰度图零填充到 32x32，像素缩放到 [0,1]
pub(crate) fn process_images(data: &[u8], size: usize) -> Result<Array4<f32>> {
    let raw = Array3::from_shape_vec((size, RAW_DIM, RAW_DIM), data.to_vec())?;
    let pad = (IMG_DIM - RAW_DIM) / 2;
    let mut images = Array4::<f32>::zeros((size, 1, IMG_DIM, IMG_DIM));
    images
        .slice_mut(s![.., 0, pad..pad + RAW_DIM, pad..pad + RAW_DIM])
        .assign(&raw.mapv(|x| x as f32 / 255.0));
    Ok(images)
}
