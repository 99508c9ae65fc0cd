use anyhow::Context;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::labels::LabelMap;
use crate::error::FinetuneError;

/// One image on disk and its contiguous class index.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub path: PathBuf,
    pub label: usize,
}

/// Immutable list of samples, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetSplit {
    name: String,
    samples: Vec<Sample>,
}

impl DatasetSplit {
    pub fn new(name: impl Into<String>, samples: Vec<Sample>) -> Self {
        Self {
            name: name.into(),
            samples,
        }
    }

    /// Load a `<split>_list.txt` file of `relative/path label` lines.
    ///
    /// Images live under `root/<split>/`, where `<split>` is the list file name
    /// up to its first underscore. Labels missing from `labels` are skipped.
    pub fn from_list_file(root: &Path, list_file: &str, labels: &LabelMap) -> anyhow::Result<Self> {
        let list_path = root.join(list_file);
        let text = fs::read_to_string(&list_path)
            .with_context(|| format!("Failed to read list file: {:?}", list_path))?;

        let split_type = list_file.split('_').next().unwrap_or(list_file);
        let image_dir = root.join(split_type);

        let mut samples = Vec::new();
        let mut skipped = 0usize;
        for (line_no, line) in text.lines().enumerate() {
            let mut fields = line.split_whitespace();
            let (Some(rel_path), Some(label)) = (fields.next(), fields.next()) else {
                continue;
            };
            let class_id = label.parse::<i64>().map_err(|e| FinetuneError::Parse {
                path: list_path.clone(),
                line: line_no + 1,
                reason: format!("bad label {:?}: {}", label, e),
            })?;

            match labels.index_of(class_id) {
                Some(index) => samples.push(Sample {
                    path: image_dir.join(rel_path),
                    label: index,
                }),
                None => {
                    warn!("Ignoring label {} in {:?}: not in the class map", class_id, list_path);
                    skipped += 1;
                }
            }
        }

        info!(
            "Local {}: {} images ({} skipped), {} classes",
            split_type,
            samples.len(),
            skipped,
            labels.len()
        );
        Ok(Self::new(split_type, samples))
    }

    /// Load a Food-101 `meta/<split>.txt` file of `class/image_id` lines.
    pub fn from_food101_meta(root: &Path, split: &str, labels: &LabelMap) -> anyhow::Result<Self> {
        let meta_path = root.join("meta").join(format!("{}.txt", split));
        let text = fs::read_to_string(&meta_path)
            .with_context(|| format!("Failed to read Food-101 meta file: {:?}", meta_path))?;

        let mut samples = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let class = line.split('/').next().unwrap_or(line);
            match labels.index_of_name(class) {
                Some(label) => samples.push(Sample {
                    path: root.join("images").join(format!("{}.jpg", line)),
                    label,
                }),
                None => warn!("Ignoring {:?} in {:?}: unknown class", line, meta_path),
            }
        }

        info!(
            "Food-101 {}: {} images, {} classes",
            split,
            samples.len(),
            labels.len()
        );
        Ok(Self::new(split, samples))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Shuffle and cut into consecutive parts sized by `fractions`.
    ///
    /// Every part but the last gets `floor(len * fraction)` samples; the last
    /// takes the remainder.
    pub fn random_split(&self, fractions: &[f64], seed: u64) -> Vec<DatasetSplit> {
        let mut samples = self.samples.clone();
        samples.shuffle(&mut StdRng::seed_from_u64(seed));

        let total = samples.len();
        let mut parts = Vec::with_capacity(fractions.len());
        let mut start = 0;
        for (i, fraction) in fractions.iter().enumerate() {
            let end = if i + 1 == fractions.len() {
                total
            } else {
                (start + (total as f64 * fraction) as usize).min(total)
            };
            parts.push(DatasetSplit::new(
                format!("{}[{}]", self.name, i),
                samples[start..end].to_vec(),
            ));
            start = end;
        }
        parts
    }

    /// Random subset of `n` samples (all of them if `n >= len`).
    pub fn subsample(&self, n: usize, seed: u64) -> DatasetSplit {
        if n >= self.samples.len() {
            return self.clone();
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let samples = self
            .samples
            .choose_multiple(&mut rng, n)
            .cloned()
            .collect();
        DatasetSplit::new(self.name.clone(), samples)
    }

    /// Same images, every label replaced by `label`.
    pub fn relabel(&self, label: usize) -> DatasetSplit {
        let samples = self
            .samples
            .iter()
            .map(|s| Sample {
                path: s.path.clone(),
                label,
            })
            .collect();
        DatasetSplit::new(self.name.clone(), samples)
    }

    pub fn concat(name: impl Into<String>, parts: &[DatasetSplit]) -> DatasetSplit {
        let samples = parts.iter().flat_map(|p| p.samples.iter().cloned()).collect();
        DatasetSplit::new(name, samples)
    }

    pub fn class_counts(&self, num_classes: usize) -> Vec<usize> {
        let mut counts = vec![0; num_classes];
        for sample in &self.samples {
            if let Some(count) = counts.get_mut(sample.label) {
                *count += 1;
            }
        }
        counts
    }
}

/// Subsample the larger split down to the size of the smaller one.
pub fn balance(a: &DatasetSplit, b: &DatasetSplit, seed: u64) -> (DatasetSplit, DatasetSplit) {
    let n = a.len().min(b.len());
    (a.subsample(n, seed), b.subsample(n, seed.wrapping_add(1)))
}
