use anyhow::Result;
use tracing::info;

use super::labels::LabelMap;
use super::split::{balance, DatasetSplit};
use crate::config::{DataConfig, DiscriminatorDataConfig, Food101DataConfig, LocalDataConfig};
use crate::error::FinetuneError;

/// Label index of benchmark images in the discriminator task.
pub const BENCHMARK_SOURCE: usize = 0;
/// Label index of local-dataset images in the discriminator task.
pub const LOCAL_SOURCE: usize = 1;

/// Train/val/test splits of one task plus its label map.
#[derive(Debug, Clone)]
pub struct DatasetSplits {
    pub labels: LabelMap,
    pub train: DatasetSplit,
    pub val: DatasetSplit,
    pub test: DatasetSplit,
}

impl DatasetSplits {
    pub fn by_name(&self, name: &str) -> Option<&DatasetSplit> {
        match name {
            "train" => Some(&self.train),
            "val" => Some(&self.val),
            "test" => Some(&self.test),
            _ => None,
        }
    }

    fn ensure_non_empty(self) -> Result<Self> {
        for (name, split) in [("train", &self.train), ("val", &self.val)] {
            if split.is_empty() {
                return Err(FinetuneError::EmptyDataset(name.to_string()).into());
            }
        }
        Ok(self)
    }
}

pub fn load_splits(config: &DataConfig, seed: u64) -> Result<DatasetSplits> {
    let splits = match config {
        DataConfig::Local(local) => load_local(local)?,
        DataConfig::Food101(food101) => load_food101(food101)?,
        DataConfig::Discriminator(disc) => load_discriminator(disc, seed)?,
    };
    info!(
        "Dataset sizes: train={}, val={}, test={}, classes={}",
        splits.train.len(),
        splits.val.len(),
        splits.test.len(),
        splits.labels.len()
    );
    splits.ensure_non_empty()
}

fn load_local(config: &LocalDataConfig) -> Result<DatasetSplits> {
    let labels = LabelMap::from_name_file(&config.root.join(&config.name_file))?;
    let train = DatasetSplit::from_list_file(&config.root, &config.train_list, &labels)?;
    let val = DatasetSplit::from_list_file(&config.root, &config.val_list, &labels)?;
    let test = DatasetSplit::from_list_file(&config.root, &config.test_list, &labels)?;
    Ok(DatasetSplits {
        labels,
        train,
        val,
        test,
    })
}

/// Food-101 ships train and test lists only; the test list doubles as validation.
fn load_food101(config: &Food101DataConfig) -> Result<DatasetSplits> {
    let labels = LabelMap::from_class_list(&config.root.join("meta").join("classes.txt"))?;
    let train = DatasetSplit::from_food101_meta(&config.root, "train", &labels)?;
    let test = DatasetSplit::from_food101_meta(&config.root, "test", &labels)?;
    Ok(DatasetSplits {
        labels,
        train,
        val: test.clone(),
        test,
    })
}

fn load_discriminator(config: &DiscriminatorDataConfig, seed: u64) -> Result<DatasetSplits> {
    let food101 = load_food101(&config.food101)?;
    let local = load_local(&config.local)?;

    let benchmark_parts = food101
        .train
        .relabel(BENCHMARK_SOURCE)
        .random_split(&config.fractions, seed);
    let local_parts = [
        local.train.relabel(LOCAL_SOURCE),
        local.val.relabel(LOCAL_SOURCE),
        local.test.relabel(LOCAL_SOURCE),
    ];

    let mut joined = Vec::with_capacity(3);
    for (i, (name, (benchmark, local))) in ["train", "val", "test"]
        .iter()
        .zip(benchmark_parts.iter().zip(local_parts.iter()))
        .enumerate()
    {
        let (benchmark, local) = balance(benchmark, local, seed.wrapping_add(10 * i as u64 + 1));
        info!(
            "Discriminator {}: {} benchmark + {} local images",
            name,
            benchmark.len(),
            local.len()
        );
        joined.push(DatasetSplit::concat(*name, &[benchmark, local]));
    }

    let mut joined = joined.into_iter();
    let (Some(train), Some(val), Some(test)) = (joined.next(), joined.next(), joined.next()) else {
        return Err(FinetuneError::InvalidConfig("expected three split fractions".into()).into());
    };

    Ok(DatasetSplits {
        labels: LabelMap::sources("Food-101", "local"),
        train,
        val,
        test,
    })
}
