use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::ModelConfig;
use crate::error::FinetuneError;
use crate::model::FoodClassifier;
use crate::training::PhaseOptimizer;

/// Checkpoint metadata; the JSON file is the handle of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub model: ModelConfig,
    pub class_names: Vec<String>,
    pub phase: String,
    pub epoch: usize,
    /// Validation accuracy at save time.
    pub accuracy: f64,
    pub loss: f64,
    pub timestamp: u64,
    pub model_file: String,
    pub optimizer_file: Option<String>,
}

/// Where in training a checkpoint was taken.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPoint {
    pub phase: String,
    pub epoch: usize,
    pub accuracy: f64,
    pub loss: f64,
}

/// Writes the checkpoints of one run as `<run>_<tag>.json` plus record files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    run_name: String,
    model: ModelConfig,
    class_names: Vec<String>,
}

impl CheckpointStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        run_name: impl Into<String>,
        model: ModelConfig,
        class_names: Vec<String>,
    ) -> Self {
        Self {
            dir: dir.into(),
            run_name: run_name.into(),
            model,
            class_names,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn meta_path(&self, tag: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.json", self.run_name, tag))
    }

    /// Save model weights, optionally the optimizer state, and metadata.
    /// A checkpoint with the same tag is replaced.
    pub fn save<B: AutodiffBackend>(
        &self,
        tag: &str,
        model: &FoodClassifier<B>,
        optimizer: Option<&PhaseOptimizer<B>>,
        point: TrainingPoint,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create checkpoint directory: {:?}", self.dir))?;

        let base = format!("{}_{}", self.run_name, tag);
        let model_file = format!("{}_model", base);
        let model_path = self.dir.join(&model_file);

        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        recorder
            .record(model.clone().into_record(), model_path.clone())
            .with_context(|| "Failed to save model weights")?;

        let optimizer_file = match optimizer {
            Some(optimizer) => {
                let file = format!("{}_optim", base);
                optimizer.save(&self.dir.join(&file))?;
                Some(file)
            }
            None => None,
        };

        let meta = CheckpointMeta {
            model: self.model.clone(),
            class_names: self.class_names.clone(),
            phase: point.phase,
            epoch: point.epoch,
            accuracy: point.accuracy,
            loss: point.loss,
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            model_file,
            optimizer_file,
        };

        let meta_path = self.meta_path(tag);
        let meta_json = serde_json::to_string_pretty(&meta)
            .with_context(|| "Failed to serialize checkpoint metadata")?;
        fs::write(&meta_path, meta_json)
            .with_context(|| format!("Failed to write checkpoint metadata: {:?}", meta_path))?;

        info!(
            "Checkpoint '{}' saved ({} epoch {}, val acc {:.4}): {:?}",
            tag, meta.phase, meta.epoch, meta.accuracy, meta_path
        );
        Ok(meta_path)
    }
}

pub fn read_meta(meta_path: &Path) -> Result<CheckpointMeta> {
    let meta_json = fs::read_to_string(meta_path)
        .with_context(|| format!("Failed to read checkpoint file: {:?}", meta_path))?;
    serde_json::from_str(&meta_json).with_context(|| "Failed to parse checkpoint metadata")
}

/// Rebuild the classifier described by a checkpoint and load its weights.
pub fn load_checkpoint<B: Backend>(
    meta_path: &Path,
    device: &B::Device,
) -> Result<(FoodClassifier<B>, CheckpointMeta)> {
    let meta = read_meta(meta_path)?;
    if meta.class_names.len() != meta.model.num_classes {
        return Err(FinetuneError::ClassCountMismatch {
            model: meta.model.num_classes,
            labels: meta.class_names.len(),
        }
        .into());
    }

    let dir = meta_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("Invalid checkpoint path: {:?}", meta_path))?;
    let model_path = dir.join(&meta.model_file);

    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(model_path.clone(), device)
        .with_context(|| format!("Failed to load model weights from: {:?}", model_path))?;
    let model = FoodClassifier::<B>::new(&meta.model, device).load_record(record);

    info!(
        "Loaded {} checkpoint ({} classes, {} epoch {}, val acc {:.4})",
        meta.model.arch,
        meta.class_names.len(),
        meta.phase,
        meta.epoch,
        meta.accuracy
    );
    Ok((model, meta))
}

/// All checkpoints in `dir`, oldest first.
pub fn list_checkpoints(dir: &Path) -> Result<Vec<(PathBuf, CheckpointMeta)>> {
    if !dir.exists() {
        warn!("Checkpoint directory does not exist: {:?}", dir);
        return Ok(Vec::new());
    }

    let mut checkpoints = Vec::new();
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        // history files and other JSON live next to checkpoints
        if let Ok(meta) = read_meta(path) {
            checkpoints.push((path.to_path_buf(), meta));
        }
    }

    checkpoints.sort_by(|(a_path, a), (b_path, b)| {
        a.timestamp.cmp(&b.timestamp).then_with(|| a_path.cmp(b_path))
    });
    Ok(checkpoints)
}
