// src/data/loader.rs
use super::Dataset;
use crate::autograd::Tensor;
use ndarray::Array4;
use rand::seq::SliceRandom;
use rand::Rng;

/// Which sample indices an epoch visits, and in what order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sampler {
    /// 0..N in order
    Sequential,
    /// the first `n` indices, reshuffled every epoch
    SubsetRandom(usize),
    /// `n` indices drawn uniformly with replacement every epoch
    RandomWithReplacement(usize),
}

pub struct Batch {
    pub images: Tensor,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

pub struct DataLoader<'a> {
    dataset: &'a Dataset,
    batch_size: usize,
    sampler: Sampler,
    /// 固定的一次抽样；存在时每个 epoch 都重放它
    fixed: Option<Vec<usize>>,
}

impl<'a> DataLoader<'a> {
    pub fn new(dataset: &'a Dataset, batch_size: usize, sampler: Sampler) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        let sampler = match sampler {
            Sampler::SubsetRandom(n) => Sampler::SubsetRandom(n.min(dataset.len())),
            other => other,
        };
        DataLoader {
            dataset,
            batch_size,
            sampler,
            fixed: None,
        }
    }

    /// Draws one epoch of indices and returns a loader that replays exactly
    /// that draw every epoch. Freezing a frozen loader keeps its indices.
    pub fn freeze<R: Rng + ?Sized>(&self, rng: &mut R) -> DataLoader<'a> {
        DataLoader {
            dataset: self.dataset,
            batch_size: self.batch_size,
            sampler: self.sampler,
            fixed: Some(self.epoch_indices(rng)),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.fixed.is_some()
    }

    pub fn dataset(&self) -> &Dataset {
        self.dataset
    }

    pub fn sampler(&self) -> Sampler {
        self.sampler
    }

    /// Number of samples visited per epoch.
    pub fn len(&self) -> usize {
        match self.sampler {
            Sampler::Sequential => self.dataset.len(),
            Sampler::SubsetRandom(n) | Sampler::RandomWithReplacement(n) => n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    pub fn epoch_indices<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        if let Some(indices) = &self.fixed {
            return indices.clone();
        }
        match self.sampler {
            Sampler::Sequential => (0..self.dataset.len()).collect(),
            Sampler::SubsetRandom(n) => {
                let mut idx: Vec<usize> = (0..n).collect();
                idx.shuffle(rng);
                idx
            }
            Sampler::RandomWithReplacement(n) => {
                let len = self.dataset.len();
                if len == 0 {
                    return vec![];
                }
                (0..n).map(|_| rng.gen_range(0..len)).collect()
            }
        }
    }

    /// 一个 epoch 的所有 batch（索引先确定，数据按需拷贝）
    pub fn iter<R: Rng + ?Sized>(&self, rng: &mut R) -> impl Iterator<Item = Batch> + '_ {
        let indices = self.epoch_indices(rng);
        let batch_size = self.batch_size;
        let dataset = self.dataset;
        let n_batches = indices.len().div_ceil(batch_size);
        (0..n_batches).map(move |b| {
            let end = ((b + 1) * batch_size).min(indices.len());
            let (images, labels): (Array4<f32>, Vec<usize>) = dataset.gather(&indices[b * batch_size..end]);
            Batch {
                images: Tensor::from_data_no_grad(images.into_dyn()),
                labels,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn toy(n: usize) -> Dataset {
        let images = Array4::from_shape_fn((n, 1, 2, 2), |(i, _, _, _)| i as f32);
        Dataset::new(images, (0..n).collect(), n)
    }

    #[test]
    fn subset_sampler_visits_each_of_first_n_once() {
        let ds = toy(10);
        let loader = DataLoader::new(&ds, 3, Sampler::SubsetRandom(7));
        let mut rng = StdRng::seed_from_u64(5);
        let mut seen: Vec<usize> = loader.iter(&mut rng).flat_map(|b| b.labels).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..7).collect::<Vec<_>>());
        assert_eq!(loader.len(), 7);
        assert_eq!(loader.num_batches(), 3);
    }

    #[test]
    fn last_batch_is_partial() {
        let ds = toy(5);
        let loader = DataLoader::new(&ds, 2, Sampler::Sequential);
        let mut rng = StdRng::seed_from_u64(0);
        let sizes: Vec<usize> = loader.iter(&mut rng).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }

    #[test]
    fn replacement_sampler_draws_requested_count() {
        let ds = toy(4);
        let loader = DataLoader::new(&ds, 8, Sampler::RandomWithReplacement(20));
        let mut rng = StdRng::seed_from_u64(1);
        let idx = loader.epoch_indices(&mut rng);
        assert_eq!(idx.len(), 20);
        assert!(idx.iter().all(|&i| i < 4));
    }

    #[test]
    fn frozen_loader_replays_one_draw() {
        let ds = toy(6);
        let loader = DataLoader::new(&ds, 4, Sampler::RandomWithReplacement(9));
        let mut rng = StdRng::seed_from_u64(2);
        let frozen = loader.freeze(&mut rng);
        assert!(frozen.is_frozen() && !loader.is_frozen());

        let first: Vec<usize> = frozen.iter(&mut rng).flat_map(|b| b.labels).collect();
        let second: Vec<usize> = frozen.iter(&mut rng).flat_map(|b| b.labels).collect();
        assert_eq!(first.len(), 9);
        assert_eq!(first, second);
        assert_eq!(frozen.freeze(&mut rng).epoch_indices(&mut rng), first);
        assert_eq!(frozen.len(), 9);
    }

    #[test]
    fn subset_larger_than_dataset_is_clamped() {
        let ds = toy(3);
        let loader = DataLoader::new(&ds, 2, Sampler::SubsetRandom(100));
        assert_eq!(loader.len(), 3);
    }
}
