use anyhow::{Context, Result};
use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use food_finetune::checkpoint::{list_checkpoints, load_checkpoint, CheckpointStore};
use food_finetune::config::{DataConfig, ExperimentConfig};
use food_finetune::data::{load_splits, DatasetSplit, ImageDataLoader, ImageTransform, LabelMap};
use food_finetune::error::FinetuneError;
use food_finetune::inference::{CascadePredictor, Predictor};
use food_finetune::model::FoodClassifier;
use food_finetune::training::{evaluate, ClassTally, StagedFineTuner};

#[cfg(feature = "wgpu-backend")]
type InferenceBackend = burn_wgpu::Wgpu;
#[cfg(all(feature = "tch-backend", not(feature = "wgpu-backend")))]
type InferenceBackend = burn_tch::LibTorch<f32>;
#[cfg(not(any(feature = "wgpu-backend", feature = "tch-backend")))]
type InferenceBackend = burn_ndarray::NdArray<f32>;

type TrainBackend = Autodiff<InferenceBackend>;

#[derive(Debug, Parser)]
#[command(author, version, about = "Staged fine-tuning of food image classifiers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run all phases of an experiment config
    Train(TrainArgs),
    /// Evaluate a checkpoint on one split of the config's dataset
    Eval(EvalArgs),
    /// Classify an image with the discriminator cascade
    Predict(PredictArgs),
    /// List checkpoints in a directory
    Checkpoints(CheckpointsArgs),
}

#[derive(Debug, Args)]
struct TrainArgs {
    /// Path to experiment configuration JSON file
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct EvalArgs {
    /// Path to checkpoint metadata (.json)
    #[arg(long)]
    checkpoint: PathBuf,
    /// Experiment config describing the dataset
    #[arg(long)]
    config: PathBuf,
    /// Split to evaluate: train, val or test
    #[arg(long, default_value = "test")]
    split: String,
}

#[derive(Debug, Args)]
struct PredictArgs {
    /// Image to classify
    #[arg(long)]
    image: PathBuf,
    /// Dataset discriminator checkpoint
    #[arg(long)]
    discriminator: PathBuf,
    /// Food-101 classifier checkpoint
    #[arg(long)]
    benchmark: PathBuf,
    /// Local dataset classifier checkpoint
    #[arg(long)]
    local: PathBuf,
    #[arg(long, default_value_t = 5)]
    top_k: usize,
    #[arg(long, default_value_t = 224)]
    image_size: u32,
}

#[derive(Debug, Args)]
struct CheckpointsArgs {
    #[arg(long, default_value = "checkpoints")]
    dir: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => train_command(args),
        Commands::Eval(args) => eval_command(args),
        Commands::Predict(args) => predict_command(args),
        Commands::Checkpoints(args) => checkpoints_command(args),
    }
}

fn train_command(args: TrainArgs) -> Result<()> {
    info!("Loading configuration from: {:?}", args.config);
    let config = ExperimentConfig::from_file(&args.config)?;
    info!("Model: {}", config.model);

    let device = Default::default();
    TrainBackend::seed(&device, config.seed);

    info!("Dataset: {}", describe(&config.data));
    let splits = load_splits(&config.data, config.seed)?;
    if splits.labels.len() != config.model.num_classes {
        return Err(FinetuneError::ClassCountMismatch {
            model: config.model.num_classes,
            labels: splits.labels.len(),
        }
        .into());
    }

    let model = match &config.init {
        Some(init) => {
            let (model, meta) = load_checkpoint::<TrainBackend>(&init.checkpoint, &device)?;
            if meta.model.arch != config.model.arch || meta.model.base_width != config.model.base_width
            {
                return Err(FinetuneError::InvalidConfig(format!(
                    "init checkpoint is {} width {}, config asks for {} width {}",
                    meta.model.arch, meta.model.base_width, config.model.arch, config.model.base_width
                ))
                .into());
            }
            if meta.model == config.model {
                model
            } else {
                info!(
                    "Replacing {}-class head with a fresh {}-class head",
                    meta.model.num_classes, config.model.num_classes
                );
                model.with_head(&config.model, &device)
            }
        }
        None => FoodClassifier::<TrainBackend>::new(&config.model, &device),
    };

    let mut train = ImageDataLoader::<TrainBackend>::new(
        splits.train.clone(),
        ImageTransform::train(config.loader.image_size),
        config.loader.batch_size,
        true,
        config.seed,
        device.clone(),
    );
    let mut val = eval_loader(&splits.val, &config);
    info!(
        "{} training images, {} validation images",
        train.num_samples(),
        val.num_samples()
    );

    let store = CheckpointStore::new(
        config.output.checkpoint_dir.clone(),
        config.output.run_name.clone(),
        config.model.clone(),
        splits.labels.names().to_vec(),
    );
    let tuner = StagedFineTuner::<TrainBackend>::new(
        config.phases.clone(),
        store,
        config.restore_best,
        config.output.save_optimizer_state,
        device.clone(),
    )?;
    let outcome = tuner.run(model, &mut train, &mut val)?;
    info!("Training history written to {:?}", outcome.history_file);

    if splits.test.is_empty() {
        warn!("Test split is empty; skipping final evaluation");
        return Ok(());
    }
    let checkpoint = outcome
        .best_checkpoint
        .unwrap_or(outcome.final_checkpoint);
    let (model, _) = load_checkpoint::<InferenceBackend>(&checkpoint, &device)?;
    let (metrics, tally) = evaluate(&model, &mut eval_loader(&splits.test, &config))?;
    info!(
        "Test ({:?}): loss {:.4}, accuracy {:.4} over {} images",
        checkpoint, metrics.loss, metrics.accuracy, metrics.samples
    );
    log_class_accuracy(&splits.labels, &tally);
    Ok(())
}

fn eval_command(args: EvalArgs) -> Result<()> {
    let config = ExperimentConfig::from_file(&args.config)?;
    let device = Default::default();

    let splits = load_splits(&config.data, config.seed)?;
    let split = splits.by_name(&args.split).ok_or_else(|| {
        FinetuneError::InvalidConfig(format!("unknown split `{}`", args.split))
    })?;

    let (model, meta) = load_checkpoint::<InferenceBackend>(&args.checkpoint, &device)?;
    if meta.class_names.len() != splits.labels.len() {
        return Err(FinetuneError::ClassCountMismatch {
            model: meta.class_names.len(),
            labels: splits.labels.len(),
        }
        .into());
    }

    let (metrics, tally) = evaluate(&model, &mut eval_loader(split, &config))?;
    info!(
        "{} split: loss {:.4}, accuracy {:.4} over {} images (saved val acc {:.4})",
        args.split, metrics.loss, metrics.accuracy, metrics.samples, meta.accuracy
    );
    log_class_accuracy(&splits.labels, &tally);
    Ok(())
}

fn predict_command(args: PredictArgs) -> Result<()> {
    let device: <InferenceBackend as Backend>::Device = Default::default();
    let load = |path: &PathBuf| {
        Predictor::<InferenceBackend>::from_checkpoint(path, args.image_size, device.clone())
            .with_context(|| format!("Failed to load predictor from {:?}", path))
    };
    let cascade = CascadePredictor::new(
        load(&args.discriminator)?,
        load(&args.benchmark)?,
        load(&args.local)?,
    )?;

    let result = cascade.predict_path(&args.image, args.top_k)?;
    println!("Image: {:?}", args.image);
    println!(
        "Dataset: {} (confidence {:.2}%)",
        result.source_name,
        result.source_confidence * 100.0
    );
    for (rank, score) in result.prediction.top.iter().enumerate() {
        println!(
            "  {}. {} ({:.2}%)",
            rank + 1,
            score.name,
            score.probability * 100.0
        );
    }
    if result.prediction.low_confidence {
        println!("Warning: low confidence, the image may not show a known food");
    }
    Ok(())
}

fn checkpoints_command(args: CheckpointsArgs) -> Result<()> {
    let checkpoints = list_checkpoints(&args.dir)?;
    if checkpoints.is_empty() {
        println!("No checkpoints in {:?}", args.dir);
    }
    for (path, meta) in checkpoints {
        println!(
            "{}  {}  {} classes  {} epoch {}  val acc {:.4}",
            path.display(),
            meta.model.arch,
            meta.class_names.len(),
            meta.phase,
            meta.epoch,
            meta.accuracy
        );
    }
    Ok(())
}

fn eval_loader(split: &DatasetSplit, config: &ExperimentConfig) -> ImageDataLoader<InferenceBackend> {
    ImageDataLoader::new(
        split.clone(),
        ImageTransform::eval(config.loader.image_size),
        config.loader.batch_size,
        false,
        config.seed,
        Default::default(),
    )
}

fn log_class_accuracy(labels: &LabelMap, tally: &ClassTally) {
    // the discriminator's two classes are the per-source accuracies
    let verbose = labels.len() <= 10;
    for (index, accuracy) in tally.accuracies().into_iter().enumerate() {
        let Some(accuracy) = accuracy else { continue };
        let name = labels.name(index).unwrap_or("?");
        if verbose {
            info!("  {}: {:.4} ({} images)", name, accuracy, tally.total(index));
        } else {
            debug!("  {}: {:.4} ({} images)", name, accuracy, tally.total(index));
        }
    }
}

fn describe(data: &DataConfig) -> &'static str {
    match data {
        DataConfig::Local(_) => "local",
        DataConfig::Food101(_) => "food-101",
        DataConfig::Discriminator(_) => "discriminator",
    }
}
