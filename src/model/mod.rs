pub mod classifier;
pub mod resnet;

pub use classifier::{ClassifierHead, FoodClassifier};
pub use resnet::{Downsample, ResNetBackbone, ResidualBlock, Stem};
