mod labels;
mod loader;
mod sources;
mod split;
mod transform;

pub use labels::LabelMap;
pub use loader::{images_to_tensor, DataLoader, ImageBatch, ImageDataLoader};
pub use sources::{load_splits, DatasetSplits, BENCHMARK_SOURCE, LOCAL_SOURCE};
pub use split::{balance, DatasetSplit, Sample};
pub use transform::{load_rgb, Augment, ImageTransform, IMAGENET_MEAN, IMAGENET_STD};

#[cfg(test)]
pub(crate) use loader::tests::write_color_split;
