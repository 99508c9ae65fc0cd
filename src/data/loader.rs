use anyhow::Result;
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;

use super::split::DatasetSplit;
use super::transform::{load_rgb, ImageTransform};

/// Trait for data loading
pub trait DataLoader<B: Backend> {
    /// Get the next batch of data
    fn next_batch(&mut self) -> Result<Option<ImageBatch<B>>>;

    /// Rewind to the beginning for the next epoch
    fn reset(&mut self);

    /// Get the total number of batches (if known)
    fn num_batches(&self) -> Option<usize>;
}

#[derive(Clone, Debug)]
pub struct ImageBatch<B: Backend> {
    /// `[batch, 3, size, size]`, ImageNet-normalized.
    pub images: Tensor<B, 4>,
    /// `[batch]` class indices.
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> ImageBatch<B> {
    pub fn new(images: Tensor<B, 4>, targets: Tensor<B, 1, Int>) -> Self {
        Self { images, targets }
    }

    pub fn len(&self) -> usize {
        self.targets.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stack flat CHW buffers into an image tensor.
pub fn images_to_tensor<B: Backend>(
    values: Vec<f32>,
    count: usize,
    size: u32,
    device: &B::Device,
) -> Tensor<B, 4> {
    let size = size as usize;
    Tensor::from_data(TensorData::new(values, [count, 3, size, size]), device)
}

/// Loads a dataset split in (optionally shuffled) batches, decoding and
/// transforming each batch's images in parallel.
pub struct ImageDataLoader<B: Backend> {
    split: DatasetSplit,
    transform: ImageTransform,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: u64,
    order: Vec<usize>,
    cursor: usize,
    device: B::Device,
}

impl<B: Backend> ImageDataLoader<B> {
    pub fn new(
        split: DatasetSplit,
        transform: ImageTransform,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        device: B::Device,
    ) -> Self {
        let mut loader = Self {
            order: (0..split.len()).collect(),
            split,
            transform,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
            epoch: 0,
            cursor: 0,
            device,
        };
        loader.reorder();
        loader
    }

    pub fn num_samples(&self) -> usize {
        self.split.len()
    }

    fn reorder(&mut self) {
        self.order = (0..self.split.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
            self.order.shuffle(&mut rng);
        }
    }

    /// Per-sample RNG so augmentation does not depend on thread scheduling.
    fn sample_rng(&self, index: usize) -> StdRng {
        let mixed = self.seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (self.epoch << 32)
            ^ index as u64;
        StdRng::seed_from_u64(mixed)
    }
}

impl<B: Backend> DataLoader<B> for ImageDataLoader<B> {
    fn next_batch(&mut self) -> Result<Option<ImageBatch<B>>> {
        if self.cursor >= self.order.len() {
            return Ok(None);
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        let count = indices.len();

        let decoded: Vec<(Vec<f32>, i64)> = indices
            .par_iter()
            .map(|&index| {
                let sample = &self.split.samples()[index];
                let img = load_rgb(&sample.path, self.transform.size());
                let values = self.transform.apply(&img, &mut self.sample_rng(index));
                (values, sample.label as i64)
            })
            .collect();

        let mut values = Vec::with_capacity(count * self.transform.values_per_image());
        let mut labels = Vec::with_capacity(count);
        for (chw, label) in decoded {
            values.extend_from_slice(&chw);
            labels.push(label);
        }

        self.cursor = end;

        let images = images_to_tensor::<B>(values, count, self.transform.size(), &self.device);
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(labels, [count]), &self.device);
        Ok(Some(ImageBatch::new(images, targets)))
    }

    fn reset(&mut self) {
        self.epoch += 1;
        self.cursor = 0;
        self.reorder();
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.split.len().div_ceil(self.batch_size))
    }
}
