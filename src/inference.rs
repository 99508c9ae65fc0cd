use anyhow::{Context, Result};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use image::RgbImage;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use crate::checkpoint::load_checkpoint;
use crate::data::{images_to_tensor, ImageTransform, BENCHMARK_SOURCE};
use crate::error::FinetuneError;
use crate::model::FoodClassifier;

/// Top-1 probability under which a prediction is flagged.
pub const LOW_CONFIDENCE: f32 = 0.10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassScore {
    pub index: usize,
    pub name: String,
    pub probability: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// Highest probability first.
    pub top: Vec<ClassScore>,
    pub low_confidence: bool,
}

impl Prediction {
    pub fn best(&self) -> Option<&ClassScore> {
        self.top.first()
    }
}

/// One classifier plus the class names its outputs index.
pub struct Predictor<B: Backend> {
    model: FoodClassifier<B>,
    class_names: Vec<String>,
    transform: ImageTransform,
    device: B::Device,
}

impl<B: Backend> Predictor<B> {
    pub fn new(
        model: FoodClassifier<B>,
        class_names: Vec<String>,
        image_size: u32,
        device: B::Device,
    ) -> Result<Self> {
        if model.num_classes() != class_names.len() {
            return Err(FinetuneError::ClassCountMismatch {
                model: model.num_classes(),
                labels: class_names.len(),
            }
            .into());
        }
        Ok(Self {
            model,
            class_names,
            transform: ImageTransform::eval(image_size),
            device,
        })
    }

    pub fn from_checkpoint(path: &Path, image_size: u32, device: B::Device) -> Result<Self> {
        let (model, meta) = load_checkpoint::<B>(path, &device)?;
        Self::new(model, meta.class_names, image_size, device)
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Softmax over all classes.
    pub fn probabilities(&self, img: &RgbImage) -> Vec<f32> {
        // the eval transform draws nothing from the rng
        let values = self.transform.apply(img, &mut StdRng::seed_from_u64(0));
        let input = images_to_tensor::<B>(values, 1, self.transform.size(), &self.device);
        let probs = softmax(self.model.forward(input), 1);
        probs.into_data().iter::<f32>().collect()
    }

    pub fn predict(&self, img: &RgbImage, top_k: usize) -> Prediction {
        let probs = self.probabilities(img);
        let mut ranked: Vec<(usize, f32)> = probs.into_iter().enumerate().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let top: Vec<ClassScore> = ranked
            .into_iter()
            .take(top_k.max(1))
            .map(|(index, probability)| ClassScore {
                index,
                name: self.class_names[index].clone(),
                probability,
            })
            .collect();

        let low_confidence = top.first().map_or(true, |s| s.probability < LOW_CONFIDENCE);
        if low_confidence {
            warn!(
                "Low confidence prediction: top class has p < {:.2}",
                LOW_CONFIDENCE
            );
        }
        Prediction {
            top,
            low_confidence,
        }
    }

    pub fn predict_path(&self, path: &Path, top_k: usize) -> Result<Prediction> {
        let img = open_image(path)?;
        Ok(self.predict(&img, top_k))
    }
}

pub fn open_image(path: &Path) -> Result<RgbImage> {
    let img = image::open(path).with_context(|| format!("Failed to open image: {:?}", path))?;
    Ok(img.to_rgb8())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadePrediction {
    /// 0 for the benchmark, 1 for the local dataset.
    pub source: usize,
    pub source_name: String,
    pub source_confidence: f32,
    pub prediction: Prediction,
}

/// Discriminator picks the dataset, that dataset's classifier picks the class.
pub struct CascadePredictor<B: Backend> {
    discriminator: Predictor<B>,
    benchmark: Predictor<B>,
    local: Predictor<B>,
}

impl<B: Backend> CascadePredictor<B> {
    pub fn new(
        discriminator: Predictor<B>,
        benchmark: Predictor<B>,
        local: Predictor<B>,
    ) -> Result<Self> {
        if discriminator.class_names.len() != 2 {
            return Err(FinetuneError::InvalidConfig(format!(
                "a dataset discriminator has 2 classes, got {}",
                discriminator.class_names.len()
            ))
            .into());
        }
        Ok(Self {
            discriminator,
            benchmark,
            local,
        })
    }

    pub fn predict(&self, img: &RgbImage, top_k: usize) -> CascadePrediction {
        let source_probs = self.discriminator.probabilities(img);
        let (source, source_confidence) = source_probs
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .unwrap_or((BENCHMARK_SOURCE, 0.0));
        let source_name = self.discriminator.class_names[source].clone();
        info!(
            "Dataset: {} (confidence {:.2}%)",
            source_name,
            source_confidence * 100.0
        );

        let classifier = if source == BENCHMARK_SOURCE {
            &self.benchmark
        } else {
            &self.local
        };
        CascadePrediction {
            source,
            source_name,
            source_confidence,
            prediction: classifier.predict(img, top_k),
        }
    }

    pub fn predict_path(&self, path: &Path, top_k: usize) -> Result<CascadePrediction> {
        let img = open_image(path)?;
        Ok(self.predict(&img, top_k))
    }
}
