use anyhow::{Context, Result};
use burn::module::AutodiffModule;
use burn::nn::loss::CrossEntropyLoss;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor};
use std::path::Path;
use tracing::debug;

use super::metrics::{ClassTally, EpochMetrics, MetricAccumulator};
use super::schedule::LrSchedule;
use crate::config::{GroupLr, OptimizerConfig, PhaseConfig};
use crate::data::{DataLoader, ImageBatch};
use crate::model::FoodClassifier;

#[derive(Clone, Copy, Debug)]
pub struct TrainOutput {
    /// Batch-mean cross-entropy.
    pub loss: f64,
    pub correct: usize,
    pub batch_size: usize,
}

/// The optimizer of one phase. Its state only ever covers the groups the
/// phase trains.
pub enum PhaseOptimizer<B: AutodiffBackend> {
    Adam(OptimizerAdaptor<Adam, FoodClassifier<B>, B>),
    Sgd(OptimizerAdaptor<Sgd<B::InnerBackend>, FoodClassifier<B>, B>),
}

impl<B: AutodiffBackend> PhaseOptimizer<B> {
    pub fn new(config: &OptimizerConfig) -> Self {
        match config {
            OptimizerConfig::Adam { weight_decay } => PhaseOptimizer::Adam(
                AdamConfig::new()
                    .with_weight_decay(weight_decay.map(WeightDecayConfig::new))
                    .init::<B, FoodClassifier<B>>(),
            ),
            OptimizerConfig::Sgd {
                momentum,
                weight_decay,
            } => PhaseOptimizer::Sgd(
                SgdConfig::new()
                    .with_momentum(Some(MomentumConfig::new().with_momentum(*momentum)))
                    .with_weight_decay(weight_decay.map(WeightDecayConfig::new))
                    .init::<B, FoodClassifier<B>>(),
            ),
        }
    }

    fn step(
        &mut self,
        lr: f64,
        model: FoodClassifier<B>,
        grads: GradientsParams,
    ) -> FoodClassifier<B> {
        match self {
            PhaseOptimizer::Adam(optimizer) => optimizer.step(lr, model, grads),
            PhaseOptimizer::Sgd(optimizer) => optimizer.step(lr, model, grads),
        }
    }

    /// Write the optimizer state (moments / momentum buffers) to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        match self {
            PhaseOptimizer::Adam(optimizer) => {
                Recorder::<B>::record(&recorder, optimizer.to_record(), path.to_path_buf())
            }
            PhaseOptimizer::Sgd(optimizer) => {
                Recorder::<B>::record(&recorder, optimizer.to_record(), path.to_path_buf())
            }
        }
        .with_context(|| format!("Failed to save optimizer state to: {:?}", path))
    }
}

/// Trains a [`FoodClassifier`] for one phase: only the phase's parameter
/// groups are stepped, each at its base rate times the schedule multiplier.
pub struct Trainer<B: AutodiffBackend> {
    model: FoodClassifier<B>,
    optimizer: PhaseOptimizer<B>,
    loss_fn: CrossEntropyLoss<B>,
    groups: Vec<GroupLr>,
    schedule: LrSchedule,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(model: FoodClassifier<B>, phase: &PhaseConfig, device: &B::Device) -> Self {
        Self {
            model,
            optimizer: PhaseOptimizer::new(&phase.optimizer),
            loss_fn: CrossEntropyLoss::new(None, device),
            groups: phase.groups.clone(),
            schedule: LrSchedule::new(&phase.scheduler),
        }
    }

    pub fn train_step(&mut self, batch: ImageBatch<B>) -> TrainOutput {
        let batch_size = batch.len();
        let logits = self.model.forward(batch.images);
        let loss = self.loss_fn.forward(logits.clone(), batch.targets.clone());
        let loss_value = loss.clone().into_scalar().elem::<f64>();
        let correct = count_correct(logits, batch.targets);

        let mut grads = loss.backward();
        let group_grads: Vec<(f64, GradientsParams)> = self
            .groups
            .iter()
            .map(|g| (g.lr, self.model.group_gradients(g.group, &mut grads)))
            .collect();

        let scale = self.schedule.scale();
        let mut model = self.model.clone();
        for (lr, params) in group_grads {
            model = self.optimizer.step(lr * scale, model, params);
        }
        self.model = model;

        TrainOutput {
            loss: loss_value,
            correct,
            batch_size,
        }
    }

    /// One pass over `loader`, then rewinds it for the next epoch.
    pub fn train_epoch<L: DataLoader<B>>(&mut self, loader: &mut L) -> Result<EpochMetrics> {
        let mut acc = MetricAccumulator::new();
        let total = loader.num_batches().unwrap_or(0);
        let mut index = 0;

        while let Some(batch) = loader.next_batch()? {
            let output = self.train_step(batch);
            acc.update(output.loss, output.correct, output.batch_size);
            index += 1;
            debug!("batch {}/{}: loss {:.4}", index, total, output.loss);
        }
        loader.reset();
        Ok(acc.finish())
    }

    /// Validation pass on the inference copy of the current model.
    pub fn validate<L: DataLoader<B::InnerBackend>>(
        &self,
        loader: &mut L,
    ) -> Result<EpochMetrics> {
        let model = self.model.inference();
        let (metrics, _) = evaluate(&model, loader)?;
        Ok(metrics)
    }

    /// Advance the schedule with the epoch's validation loss.
    pub fn end_epoch(&mut self, val_loss: f64) -> bool {
        self.schedule.step_epoch(val_loss)
    }

    pub fn lr_scale(&self) -> f64 {
        self.schedule.scale()
    }

    pub fn model(&self) -> &FoodClassifier<B> {
        &self.model
    }

    pub fn optimizer(&self) -> &PhaseOptimizer<B> {
        &self.optimizer
    }

    pub fn into_model(self) -> FoodClassifier<B> {
        self.model
    }
}

/// Number of rows whose argmax equals the target.
pub fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    logits
        .argmax(1)
        .flatten::<1>(0, 1)
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem::<i64>() as usize
}

/// Loss, accuracy and per-class tallies of `model` over one pass of `loader`.
/// The loader is rewound afterwards.
pub fn evaluate<B: Backend, L: DataLoader<B>>(
    model: &FoodClassifier<B>,
    loader: &mut L,
) -> Result<(EpochMetrics, ClassTally)> {
    let mut acc = MetricAccumulator::new();
    let mut tally = ClassTally::new(model.num_classes());
    let mut loss_fn = None;

    while let Some(batch) = loader.next_batch()? {
        let batch_size = batch.len();
        let loss_fn = loss_fn
            .get_or_insert_with(|| CrossEntropyLoss::new(None, &batch.images.device()));

        let logits = model.forward(batch.images);
        let loss = loss_fn
            .forward(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem::<f64>();

        let predicted = logits.argmax(1).flatten::<1>(0, 1).into_data();
        let targets = batch.targets.into_data();
        let mut correct = 0;
        for (target, pred) in targets.iter::<i64>().zip(predicted.iter::<i64>()) {
            tally.record(target as usize, pred as usize);
            if target == pred {
                correct += 1;
            }
        }
        acc.update(loss, correct, batch_size);
    }
    loader.reset();
    Ok((acc.finish(), tally))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ParamGroup, ResNetArch, SchedulerConfig};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn tiny_model(device: &<TestBackend as Backend>::Device) -> FoodClassifier<TestBackend> {
        let config = ModelConfig {
            arch: ResNetArch::Resnet18,
            base_width: 4,
            num_classes: 3,
            head_hidden: None,
            dropout: 0.0,
        };
        FoodClassifier::new(&config, device)
    }

    fn phase(groups: &[ParamGroup], optimizer: OptimizerConfig) -> PhaseConfig {
        PhaseConfig {
            name: "test".into(),
            groups: groups.iter().map(|g| GroupLr { group: *g, lr: 1e-2 }).collect(),
            epochs: 1,
            optimizer,
            scheduler: SchedulerConfig::Constant,
        }
    }

    fn batch(device: &<TestBackend as Backend>::Device) -> ImageBatch<TestBackend> {
        ImageBatch::new(
            Tensor::random(
                [4, 3, 32, 32],
                burn::tensor::Distribution::Normal(0.0, 1.0),
                device,
            ),
            Tensor::from_ints([0, 1, 2, 1], device),
        )
    }

    fn max_diff(a: Tensor<TestBackend, 4>, b: Tensor<TestBackend, 4>) -> f32 {
        (a - b).abs().max().into_scalar().elem::<f32>()
    }

    #[test]
    fn test_frozen_groups_are_untouched() {
        let device = Default::default();
        let model = tiny_model(&device);
        let stem_before = model.backbone.stem.conv.weight.val();
        let head_before = model.head.output.weight.val();

        let mut trainer = Trainer::new(
            model,
            &phase(&[ParamGroup::Head], OptimizerConfig::default()),
            &device,
        );
        let output = trainer.train_step(batch(&device));
        assert_eq!(output.batch_size, 4);
        assert!(output.loss.is_finite());

        let stem_after = trainer.model().backbone.stem.conv.weight.val();
        assert_eq!(max_diff(stem_after, stem_before), 0.0);
        let head_diff = (trainer.model().head.output.weight.val() - head_before)
            .abs()
            .max()
            .into_scalar()
            .elem::<f32>();
        assert!(head_diff > 0.0);
    }

    #[test]
    fn test_sgd_phase_updates_unfrozen_stage() {
        let device = Default::default();
        let model = tiny_model(&device);
        let layer4_before = model.backbone.layer4[0].conv1.weight.val();
        let layer1_before = model.backbone.layer1[0].conv1.weight.val();

        let mut trainer = Trainer::new(
            model,
            &phase(
                &[ParamGroup::Layer4, ParamGroup::Head],
                OptimizerConfig::Sgd {
                    momentum: 0.9,
                    weight_decay: None,
                },
            ),
            &device,
        );
        trainer.train_step(batch(&device));

        let backbone = &trainer.model().backbone;
        assert!(max_diff(backbone.layer4[0].conv1.weight.val(), layer4_before) > 0.0);
        assert_eq!(max_diff(backbone.layer1[0].conv1.weight.val(), layer1_before), 0.0);
    }

    #[test]
    fn test_count_correct() {
        let device = Default::default();
        let logits = Tensor::<NdArray<f32>, 2>::from_floats(
            [[0.1, 0.9, 0.0], [0.8, 0.1, 0.1], [0.2, 0.3, 0.5]],
            &device,
        );
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([1, 2, 2], &device);
        assert_eq!(count_correct(logits, targets), 2);
    }
}
