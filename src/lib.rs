// Library exports for the training binary and the dataset tools

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod inference;
pub mod model;
pub mod training;

// Re-export commonly used types
pub use config::{ExperimentConfig, ModelConfig, ParamGroup, PhaseConfig};
pub use error::FinetuneError;
pub use inference::{CascadePredictor, Predictor};
pub use model::FoodClassifier;
pub use training::{StagedFineTuner, Trainer};
