//! Staged fine-tuning: phases run strictly in order, each with a fresh
//! optimizer over only the parameter groups it names.

use anyhow::Result;
use burn::module::Module;
use burn::tensor::backend::AutodiffBackend;
use std::path::PathBuf;
use tracing::info;

use super::metrics::{EpochRecord, TrainingHistory};
use super::trainer::Trainer;
use crate::checkpoint::{CheckpointStore, TrainingPoint};
use crate::config::{validate_phases, PhaseConfig};
use crate::data::DataLoader;
use crate::model::FoodClassifier;

/// Result of a full staged run.
pub struct StagedOutcome<B: AutodiffBackend> {
    pub model: FoodClassifier<B>,
    pub history: TrainingHistory,
    /// Best validation accuracy seen over all phases.
    pub best_accuracy: Option<f64>,
    pub best_checkpoint: Option<PathBuf>,
    pub final_checkpoint: PathBuf,
    pub history_file: PathBuf,
}

pub struct StagedFineTuner<B: AutodiffBackend> {
    phases: Vec<PhaseConfig>,
    store: CheckpointStore,
    restore_best: bool,
    save_optimizer_state: bool,
    device: B::Device,
}

/// Validation result of the weights the model currently holds.
#[derive(Clone)]
struct Snapshot {
    phase: String,
    epoch: usize,
    accuracy: f64,
    loss: f64,
}

impl<B: AutodiffBackend> StagedFineTuner<B> {
    pub fn new(
        phases: Vec<PhaseConfig>,
        store: CheckpointStore,
        restore_best: bool,
        save_optimizer_state: bool,
        device: B::Device,
    ) -> Result<Self> {
        validate_phases(&phases)?;
        Ok(Self {
            phases,
            store,
            restore_best,
            save_optimizer_state,
            device,
        })
    }

    pub fn run<T, V>(
        &self,
        model: FoodClassifier<B>,
        train: &mut T,
        val: &mut V,
    ) -> Result<StagedOutcome<B>>
    where
        T: DataLoader<B>,
        V: DataLoader<B::InnerBackend>,
    {
        let mut model = model;
        let mut history = TrainingHistory::default();
        // stays None until some epoch beats 0.0
        let mut best_accuracy: Option<f64> = None;
        let mut best_checkpoint = None;
        let mut current: Option<Snapshot> = None;

        for (index, phase) in self.phases.iter().enumerate() {
            let trainable: usize = phase
                .groups
                .iter()
                .map(|g| model.group_num_params(g.group))
                .sum();
            let groups: Vec<String> = phase
                .groups
                .iter()
                .map(|g| format!("{}@{:e}", g.group, g.lr))
                .collect();
            info!(
                "Phase {}/{} '{}': {} epochs, groups [{}], {} trainable parameters",
                index + 1,
                self.phases.len(),
                phase.name,
                phase.epochs,
                groups.join(", "),
                trainable
            );

            let mut trainer = Trainer::new(model, phase, &self.device);
            // records, not module clones: clones share batch-norm running state
            let mut phase_best: Option<(<FoodClassifier<B> as Module<B>>::Record, Snapshot)> =
                None;

            for epoch in 1..=phase.epochs {
                let lr_scale = trainer.lr_scale();
                let train_metrics = trainer.train_epoch(train)?;
                let val_metrics = trainer.validate(val)?;
                info!(
                    "[{}] epoch {}/{}: train loss {:.4} acc {:.4} | val loss {:.4} acc {:.4}",
                    phase.name,
                    epoch,
                    phase.epochs,
                    train_metrics.loss,
                    train_metrics.accuracy,
                    val_metrics.loss,
                    val_metrics.accuracy
                );

                let snapshot = Snapshot {
                    phase: phase.name.clone(),
                    epoch,
                    accuracy: val_metrics.accuracy,
                    loss: val_metrics.loss,
                };

                if val_metrics.accuracy > best_accuracy.unwrap_or(0.0) {
                    let optimizer = self.save_optimizer_state.then(|| trainer.optimizer());
                    let path = self.store.save(
                        "best",
                        trainer.model(),
                        optimizer,
                        snapshot.point(),
                    )?;
                    best_accuracy = Some(val_metrics.accuracy);
                    best_checkpoint = Some(path);
                }

                if phase_best
                    .as_ref()
                    .map_or(true, |(_, best)| val_metrics.accuracy > best.accuracy)
                {
                    phase_best = Some((trainer.model().clone().into_record(), snapshot.clone()));
                }

                history.push(EpochRecord {
                    phase: phase.name.clone(),
                    epoch,
                    train: train_metrics,
                    val: val_metrics,
                    lr_scale,
                });
                current = Some(snapshot);

                if trainer.end_epoch(val_metrics.loss) {
                    info!(
                        "[{}] learning rate multiplier reduced to {:e}",
                        phase.name,
                        trainer.lr_scale()
                    );
                }
            }

            model = match phase_best {
                Some((record, snapshot)) if self.restore_best => {
                    info!(
                        "Phase '{}' done; restoring epoch {} weights (val acc {:.4})",
                        phase.name, snapshot.epoch, snapshot.accuracy
                    );
                    current = Some(snapshot);
                    trainer.into_model().load_record(record)
                }
                _ => trainer.into_model(),
            };
        }

        let point = match current {
            Some(snapshot) => snapshot.point(),
            None => anyhow::bail!("no epochs were run"),
        };
        let final_checkpoint = self.store.save::<B>("final", &model, None, point)?;

        let history_file = self
            .store
            .dir()
            .join(format!("{}_history.json", self.store.run_name()));
        history.save(&history_file)?;

        info!(
            "Training finished: best val acc {:.4}",
            best_accuracy.unwrap_or(0.0)
        );
        Ok(StagedOutcome {
            model,
            history,
            best_accuracy,
            best_checkpoint,
            final_checkpoint,
            history_file,
        })
    }
}

impl Snapshot {
    fn point(&self) -> TrainingPoint {
        TrainingPoint {
            phase: self.phase.clone(),
            epoch: self.epoch,
            accuracy: self.accuracy,
            loss: self.loss,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::load_checkpoint;
    use crate::config::{
        GroupLr, ModelConfig, OptimizerConfig, ParamGroup, ResNetArch, SchedulerConfig,
    };
    use crate::data::{
        write_color_split, DatasetSplit, ImageBatch, ImageDataLoader, ImageTransform,
    };
    use crate::error::FinetuneError;
    use crate::training::evaluate;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type Inner = NdArray<f32>;
    type TestBackend = Autodiff<Inner>;

    const COLORS: [[u8; 3]; 2] = [[230, 20, 20], [20, 20, 230]];

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            arch: ResNetArch::Resnet18,
            base_width: 4,
            num_classes: 2,
            head_hidden: None,
            dropout: 0.5,
        }
    }

    fn phase(name: &str, groups: &[ParamGroup], epochs: usize) -> PhaseConfig {
        PhaseConfig {
            name: name.into(),
            groups: groups.iter().map(|g| GroupLr { group: *g, lr: 1e-3 }).collect(),
            epochs,
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::Step {
                step_size: 1,
                gamma: 0.5,
            },
        }
    }

    fn store(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(
            dir.path().join("ckpt"),
            "colors",
            tiny_config(),
            vec!["red".into(), "blue".into()],
        )
    }

    #[test]
    fn test_reloaded_checkpoints_reproduce_accuracy() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let train_split = write_color_split(dir.path(), "train", &COLORS, 4);
        let val_split = write_color_split(dir.path(), "val", &COLORS, 3);

        let mut train = ImageDataLoader::<TestBackend>::new(
            train_split,
            ImageTransform::train(32),
            4,
            true,
            7,
            Default::default(),
        );
        let val_loader = || {
            ImageDataLoader::<Inner>::new(
                val_split.clone(),
                ImageTransform::eval(32),
                4,
                false,
                7,
                Default::default(),
            )
        };
        let mut val = val_loader();

        let tuner = StagedFineTuner::<TestBackend>::new(
            vec![
                phase("head", &[ParamGroup::Head], 2),
                phase("top", &[ParamGroup::Layer4, ParamGroup::Head], 1),
            ],
            store(&dir),
            true,
            true,
            Default::default(),
        )
        .unwrap();

        let model = FoodClassifier::<TestBackend>::new(&tiny_config(), &device);
        let outcome = tuner.run(model, &mut train, &mut val).unwrap();

        assert_eq!(outcome.history.epochs.len(), 3);
        assert_eq!(outcome.history.epochs[1].lr_scale, 0.5);
        assert_eq!(outcome.history.epochs[2].phase, "top");
        assert_eq!(outcome.best_accuracy, outcome.history.best_val_accuracy());
        assert!(outcome.history_file.exists());

        let best = outcome
            .best_checkpoint
            .expect("separable colors score above 0.0");
        for path in [best, outcome.final_checkpoint] {
            let (model, meta) = load_checkpoint::<Inner>(&path, &device).unwrap();
            assert_eq!(meta.class_names, vec!["red".to_string(), "blue".to_string()]);
            let (metrics, _) = evaluate(&model, &mut val_loader()).unwrap();
            assert!(
                (metrics.accuracy - meta.accuracy).abs() < 1e-9,
                "{:?}: reloaded {} vs saved {}",
                path,
                metrics.accuracy,
                meta.accuracy
            );
            assert!((metrics.loss - meta.loss).abs() < 1e-4);
        }
    }

    #[test]
    fn test_shrinking_phases_are_rejected_before_training() {
        let dir = TempDir::new().unwrap();
        let result = StagedFineTuner::<TestBackend>::new(
            vec![
                phase("full", &ParamGroup::ALL, 1),
                phase("head", &[ParamGroup::Head], 1),
            ],
            store(&dir),
            true,
            false,
            Default::default(),
        );
        let err = result.err().expect("shrinking phases must be rejected");
        assert!(matches!(
            err.downcast_ref::<FinetuneError>(),
            Some(FinetuneError::ShrinkingPhase { .. })
        ));
        assert!(!dir.path().join("ckpt").exists());
    }

    /// Yields batches from the inner loader until `fail_at` calls, then errors.
    struct FailingLoader {
        inner: ImageDataLoader<TestBackend>,
        calls: usize,
        fail_at: usize,
    }

    impl DataLoader<TestBackend> for FailingLoader {
        fn next_batch(&mut self) -> Result<Option<ImageBatch<TestBackend>>> {
            self.calls += 1;
            if self.calls == self.fail_at {
                anyhow::bail!("image store went away");
            }
            self.inner.next_batch()
        }

        fn reset(&mut self) {
            self.inner.reset();
        }

        fn num_batches(&self) -> Option<usize> {
            self.inner.num_batches()
        }
    }

    #[test]
    fn test_loader_failure_aborts_run() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let train_split = write_color_split(dir.path(), "train", &COLORS, 4);
        let val_split = write_color_split(dir.path(), "val", &COLORS, 2);

        // 8 images in batches of 4: each epoch makes 3 calls, the 4th is epoch 2's first
        let mut train = FailingLoader {
            inner: ImageDataLoader::new(
                train_split,
                ImageTransform::train(32),
                4,
                true,
                3,
                Default::default(),
            ),
            calls: 0,
            fail_at: 4,
        };
        let mut val = ImageDataLoader::<Inner>::new(
            val_split,
            ImageTransform::eval(32),
            4,
            false,
            3,
            Default::default(),
        );

        let tuner = StagedFineTuner::<TestBackend>::new(
            vec![
                phase("head", &[ParamGroup::Head], 3),
                phase("top", &[ParamGroup::Layer4, ParamGroup::Head], 1),
            ],
            store(&dir),
            true,
            false,
            Default::default(),
        )
        .unwrap();

        let model = FoodClassifier::<TestBackend>::new(&tiny_config(), &device);
        let err = match tuner.run(model, &mut train, &mut val) {
            Ok(_) => panic!("run must fail when the loader fails"),
            Err(err) => err,
        };
        assert_eq!(err.to_string(), "image store went away");
        assert_eq!(train.calls, 4);

        let ckpt = dir.path().join("ckpt");
        assert!(!ckpt.join("colors_final.json").exists());
        assert!(!ckpt.join("colors_history.json").exists());
    }

    #[test]
    fn test_zero_accuracy_never_saves_best() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let train_split = write_color_split(dir.path(), "train", &COLORS, 2);

        let mut train = ImageDataLoader::<TestBackend>::new(
            train_split,
            ImageTransform::train(32),
            4,
            true,
            5,
            Default::default(),
        );
        // an empty validation split scores 0.0 every epoch
        let mut val = ImageDataLoader::<Inner>::new(
            DatasetSplit::new("val", Vec::new()),
            ImageTransform::eval(32),
            4,
            false,
            5,
            Default::default(),
        );

        let tuner = StagedFineTuner::<TestBackend>::new(
            vec![phase("head", &[ParamGroup::Head], 2)],
            store(&dir),
            true,
            false,
            Default::default(),
        )
        .unwrap();

        let model = FoodClassifier::<TestBackend>::new(&tiny_config(), &device);
        let outcome = tuner.run(model, &mut train, &mut val).unwrap();
        assert!(outcome.best_checkpoint.is_none());
        assert_eq!(outcome.best_accuracy, None);
        assert!(outcome.final_checkpoint.exists());
        assert!(!dir.path().join("ckpt").join("colors_best.json").exists());
    }
}
