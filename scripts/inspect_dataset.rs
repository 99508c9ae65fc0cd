use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use food_finetune::config::ExperimentConfig;
use food_finetune::data::{load_splits, DatasetSplit, LabelMap};

#[derive(Debug, Parser)]
#[command(author, version, about = "Summarize the dataset of an experiment config")]
struct Args {
    /// Experiment configuration JSON file
    #[arg(short, long)]
    config: PathBuf,

    /// Also check that every listed image file exists
    #[arg(long, default_value = "false")]
    check_files: bool,

    /// Print per-class counts for at most this many classes
    #[arg(long, default_value_t = 20)]
    max_classes: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ExperimentConfig::from_file(&args.config)?;
    let splits = load_splits(&config.data, config.seed)?;

    println!("{} classes", splits.labels.len());
    for split in [&splits.train, &splits.val, &splits.test] {
        summarize(split, &splits.labels, args.max_classes);
        if args.check_files {
            check_files(split);
        }
    }
    Ok(())
}

fn summarize(split: &DatasetSplit, labels: &LabelMap, max_classes: usize) {
    let counts = split.class_counts(labels.len());
    let present = counts.iter().filter(|&&c| c > 0).count();
    println!(
        "\n[{}] {} images, {}/{} classes present",
        split.name(),
        split.len(),
        present,
        labels.len()
    );

    let mut ranked: Vec<(usize, usize)> = counts.into_iter().enumerate().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    if let (Some(most), Some(least)) = (ranked.first(), ranked.last()) {
        println!(
            "  largest class {} ({}), smallest class {} ({})",
            labels.name(most.0).unwrap_or("?"),
            most.1,
            labels.name(least.0).unwrap_or("?"),
            least.1
        );
    }
    for (index, count) in ranked.into_iter().take(max_classes) {
        println!("  {:>6}  {}", count, labels.name(index).unwrap_or("?"));
    }
}

fn check_files(split: &DatasetSplit) {
    let missing: Vec<_> = split
        .samples()
        .iter()
        .filter(|s| !s.path.exists())
        .collect();
    if missing.is_empty() {
        info!("[{}] all {} image files exist", split.name(), split.len());
        return;
    }
    warn!(
        "[{}] {} of {} image files are missing",
        split.name(),
        missing.len(),
        split.len()
    );
    for sample in missing.iter().take(10) {
        warn!("  missing: {:?}", sample.path);
    }
}
