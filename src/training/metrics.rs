use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Mean loss and accuracy over one pass of a loader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub samples: usize,
}

/// Sums per-batch results into [`EpochMetrics`], weighting loss by batch size.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    correct: usize,
    total: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `loss` is the batch mean.
    pub fn update(&mut self, loss: f64, correct: usize, batch_size: usize) {
        self.loss_sum += loss * batch_size as f64;
        self.correct += correct;
        self.total += batch_size;
    }

    pub fn finish(&self) -> EpochMetrics {
        if self.total == 0 {
            return EpochMetrics {
                loss: 0.0,
                accuracy: 0.0,
                samples: 0,
            };
        }
        EpochMetrics {
            loss: self.loss_sum / self.total as f64,
            accuracy: self.correct as f64 / self.total as f64,
            samples: self.total,
        }
    }
}

/// Per-class correct/total counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassTally {
    correct: Vec<usize>,
    total: Vec<usize>,
}

impl ClassTally {
    pub fn new(num_classes: usize) -> Self {
        Self {
            correct: vec![0; num_classes],
            total: vec![0; num_classes],
        }
    }

    pub fn record(&mut self, target: usize, predicted: usize) {
        if target >= self.total.len() {
            return;
        }
        self.total[target] += 1;
        if target == predicted {
            self.correct[target] += 1;
        }
    }

    /// Accuracy of each class; `None` for classes with no samples.
    pub fn accuracies(&self) -> Vec<Option<f64>> {
        self.correct
            .iter()
            .zip(&self.total)
            .map(|(&c, &t)| (t > 0).then(|| c as f64 / t as f64))
            .collect()
    }

    pub fn total(&self, class: usize) -> usize {
        self.total.get(class).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub phase: String,
    /// 1-based within the phase.
    pub epoch: usize,
    pub train: EpochMetrics,
    pub val: EpochMetrics,
    pub lr_scale: f64,
}

/// Every epoch of a run, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.epochs
            .iter()
            .map(|r| r.val.accuracy)
            .fold(None, |best, acc| Some(best.map_or(acc, |b: f64| b.max(acc))))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .with_context(|| "Failed to serialize training history")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write training history: {:?}", path))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read training history: {:?}", path))?;
        serde_json::from_str(&json).with_context(|| "Failed to parse training history")
    }
}
