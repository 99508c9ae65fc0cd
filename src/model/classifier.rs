use burn::module::{AutodiffModule, Module};
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::optim::GradientsParams;
use burn::tensor::activation::relu;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use super::resnet::ResNetBackbone;
use crate::config::{ModelConfig, ParamGroup};

/// Dropout + linear, or linear + ReLU + dropout + linear when a hidden
/// width is configured.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    pub hidden: Option<Linear<B>>,
    pub dropout: Dropout,
    pub output: Linear<B>,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        let features = config.feature_dim();
        let hidden = config
            .head_hidden
            .map(|width| LinearConfig::new(features, width).init(device));
        let output_in = config.head_hidden.unwrap_or(features);

        Self {
            hidden,
            dropout: DropoutConfig::new(config.dropout).init(),
            output: LinearConfig::new(output_in, config.num_classes).init(device),
        }
    }

    pub fn forward(&self, features: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = match &self.hidden {
            Some(hidden) => relu(hidden.forward(features)),
            None => features,
        };
        self.output.forward(self.dropout.forward(x))
    }

    pub fn num_classes(&self) -> usize {
        self.output.weight.val().dims()[1]
    }
}

/// ResNet backbone with a replaceable classification head.
#[derive(Module, Debug)]
pub struct FoodClassifier<B: Backend> {
    pub backbone: ResNetBackbone<B>,
    pub head: ClassifierHead<B>,
}

impl<B: Backend> FoodClassifier<B> {
    pub fn new(config: &ModelConfig, device: &B::Device) -> Self {
        Self {
            backbone: ResNetBackbone::new(config.arch, config.base_width, device),
            head: ClassifierHead::new(config, device),
        }
    }

    /// `[batch, 3, h, w]` normalized images to `[batch, num_classes]` logits.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.head.forward(self.backbone.forward(images))
    }

    /// Keep the backbone, swap in a freshly initialized head sized by `config`.
    pub fn with_head(self, config: &ModelConfig, device: &B::Device) -> Self {
        Self {
            backbone: self.backbone,
            head: ClassifierHead::new(config, device),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    pub fn group_num_params(&self, group: ParamGroup) -> usize {
        match group {
            ParamGroup::Stem => self.backbone.stem.num_params(),
            ParamGroup::Layer1 => self.backbone.layer1.num_params(),
            ParamGroup::Layer2 => self.backbone.layer2.num_params(),
            ParamGroup::Layer3 => self.backbone.layer3.num_params(),
            ParamGroup::Layer4 => self.backbone.layer4.num_params(),
            ParamGroup::Head => self.head.num_params(),
        }
    }
}

impl<B: AutodiffBackend> FoodClassifier<B> {
    /// Move the gradients of one parameter group out of `grads`.
    pub fn group_gradients(&self, group: ParamGroup, grads: &mut B::Gradients) -> GradientsParams {
        match group {
            ParamGroup::Stem => GradientsParams::from_module(grads, &self.backbone.stem),
            ParamGroup::Layer1 => GradientsParams::from_module(grads, &self.backbone.layer1),
            ParamGroup::Layer2 => GradientsParams::from_module(grads, &self.backbone.layer2),
            ParamGroup::Layer3 => GradientsParams::from_module(grads, &self.backbone.layer3),
            ParamGroup::Layer4 => GradientsParams::from_module(grads, &self.backbone.layer4),
            ParamGroup::Head => GradientsParams::from_module(grads, &self.head),
        }
    }

    /// Inference copy on the inner backend: no autodiff, dropout off.
    pub fn inference(&self) -> FoodClassifier<B::InnerBackend> {
        self.valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResNetArch;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;
    type TestAutodiff = Autodiff<NdArray<f32>>;

    fn tiny_config(num_classes: usize) -> ModelConfig {
        ModelConfig {
            arch: ResNetArch::Resnet18,
            base_width: 4,
            num_classes,
            head_hidden: None,
            dropout: 0.5,
        }
    }

    #[test]
    fn test_forward_shape() {
        let device = Default::default();
        let model = FoodClassifier::<TestBackend>::new(&tiny_config(7), &device);
        let logits = model.forward(Tensor::zeros([3, 3, 32, 32], &device));
        assert_eq!(logits.dims(), [3, 7]);
        assert_eq!(model.num_classes(), 7);
    }

    #[test]
    fn test_two_layer_head() {
        let device = Default::default();
        let mut config = tiny_config(2);
        config.head_hidden = Some(16);
        let model = FoodClassifier::<TestBackend>::new(&config, &device);
        assert_eq!(model.group_num_params(ParamGroup::Head), 32 * 16 + 16 + 16 * 2 + 2);
        let logits = model.forward(Tensor::zeros([1, 3, 32, 32], &device));
        assert_eq!(logits.dims(), [1, 2]);
    }

    #[test]
    fn test_head_replacement_keeps_backbone() {
        let device = Default::default();
        let model = FoodClassifier::<TestBackend>::new(&tiny_config(101), &device);
        let stem_before = model.backbone.stem.num_params();
        let input = Tensor::<TestBackend, 4>::ones([1, 3, 32, 32], &device);
        let features_before = model.backbone.forward(input.clone());

        let model = model.with_head(&tiny_config(208), &device);
        assert_eq!(model.num_classes(), 208);
        assert_eq!(model.backbone.stem.num_params(), stem_before);
        let features_after = model.backbone.forward(input);
        let diff: f32 = (features_before - features_after).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_group_gradients_are_disjoint() {
        let device = Default::default();
        let model = FoodClassifier::<TestAutodiff>::new(&tiny_config(3), &device);
        let loss = model.forward(Tensor::ones([2, 3, 32, 32], &device)).sum();
        let mut grads = loss.backward();

        let head = model.group_gradients(ParamGroup::Head, &mut grads);
        let layer4 = model.group_gradients(ParamGroup::Layer4, &mut grads);
        let head_again = model.group_gradients(ParamGroup::Head, &mut grads);

        assert_eq!(head.len(), 2);
        assert!(layer4.len() > 0);
        assert!(head_again.is_empty());
    }
}
