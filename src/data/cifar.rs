// src/data/cifar.rs
use super::{Dataset, Split, IMG_DIM};
use crate::error::{Error, Result};
use ndarray::Array4;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const PIXELS: usize = 3 * IMG_DIM * IMG_DIM;

/// Binary record layout: label bytes followed by 3x32x32 channel-major pixels.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordLayout {
    /// bytes before the pixels
    pub header: usize,
    /// which header byte holds the label
    pub label_offset: usize,
}

impl RecordLayout {
    pub const CIFAR10: RecordLayout = RecordLayout { header: 1, label_offset: 0 };
    /// coarse label, fine label
    pub const CIFAR100: RecordLayout = RecordLayout { header: 2, label_offset: 1 };

    fn record_len(&self) -> usize {
        self.header + PIXELS
    }
}

pub fn load_cifar10(split: Split, datadir: &Path) -> Result<Dataset> {
    let dir = datadir.join("cifar-10-batches-bin");
    let files: Vec<PathBuf> = match split {
        Split::Train => (1..=5).map(|i| dir.join(format!("data_batch_{}.bin", i))).collect(),
        Split::Val => vec![dir.join("test_batch.bin")],
    };
    load_files(&files, RecordLayout::CIFAR10, 10, |l| Some(l as usize))
}

pub fn load_cifar100(split: Split, datadir: &Path) -> Result<Dataset> {
    let dir = datadir.join("cifar-100-binary");
    let file = match split {
        Split::Train => dir.join("train.bin"),
        Split::Val => dir.join("test.bin"),
    };
    load_files(&[file], RecordLayout::CIFAR100, 100, |l| Some(l as usize))
}

/// SVHN converted to the CIFAR10 record layout; digit "0" may be stored as label 10.
pub fn load_svhn(split: Split, datadir: &Path) -> Result<Dataset> {
    let dir = datadir.join("svhn");
    let file = match split {
        Split::Train => dir.join("train.bin"),
        Split::Val => dir.join("test.bin"),
    };
    load_files(&[file], RecordLayout::CIFAR10, 10, |l| match l {
        10 => Some(0),
        0..=9 => Some(l as usize),
        _ => None,
    })
}

fn load_files(
    files: &[PathBuf],
    layout: RecordLayout,
    nclasses: usize,
    map_label: impl Fn(u8) -> Option<usize>,
) -> Result<Dataset> {
    let mut pixels: Vec<u8> = Vec::new();
    let mut labels: Vec<usize> = Vec::new();

    for path in files {
        if !path.exists() {
            return Err(Error::dataset(path, "binary batch file not found"));
        }
        info!("Loading {}", path.display());
        let bytes = fs::read(path)?;
        let n = parse_records(&bytes, layout, path, &map_label, &mut pixels, &mut labels)?;
        debug!("{}: {} records", path.display(), n);
    }

    let n = labels.len();
    let images = Array4::from_shape_vec((n, 3, IMG_DIM, IMG_DIM), pixels)?.mapv(|x| x as f32 / 255.0);
    Ok(Dataset::new(images, labels, nclasses))
}

pub(crate) fn parse_records(
    bytes: &[u8],
    layout: RecordLayout,
    path: &Path,
    map_label: &impl Fn(u8) -> Option<usize>,
    pixels: &mut Vec<u8>,
    labels: &mut Vec<usize>,
) -> Result<usize> {
    let record_len = layout.record_len();
    if bytes.len() % record_len != 0 {
        return Err(Error::dataset(
            path,
            format!("size {} is not a multiple of the record length {}", bytes.len(), record_len),
        ));
    }

    let mut count = 0;
    for record in bytes.chunks_exact(record_len) {
        let raw = record[layout.label_offset];
        let label = map_label(raw)
            .ok_or_else(|| Error::dataset(path, format!("label {} out of range in record {}", raw, count)))?;
        labels.push(label);
        pixels.extend_from_slice(&record[layout.header..]);
        count += 1;
    }
    Ok(count)
}
