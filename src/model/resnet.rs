use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::tensor::activation::relu;
use burn::tensor::{backend::Backend, Tensor};

use crate::config::ResNetArch;

fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    device: &B::Device,
) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .init(device)
}

/// 1x1 projection on the identity path when shape changes.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B>,
}

impl<B: Backend> Downsample<B> {
    fn new(channels: [usize; 2], stride: usize, device: &B::Device) -> Self {
        Self {
            conv: conv(channels, 1, stride, device),
            bn: BatchNormConfig::new(channels[1]).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.bn.forward(self.conv.forward(x))
    }
}

/// Basic block (two 3x3 convs) or, with `conv3` present, a bottleneck block
/// (1x1 reduce, 3x3, 1x1 expand).
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    pub conv3: Option<Conv2d<B>>,
    pub bn3: Option<BatchNorm<B>>,
    pub downsample: Option<Downsample<B>>,
}

impl<B: Backend> ResidualBlock<B> {
    fn basic(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let downsample = (stride != 1 || in_channels != width)
            .then(|| Downsample::new([in_channels, width], stride, device));
        Self {
            conv1: conv([in_channels, width], 3, stride, device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: conv([width, width], 3, 1, device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: None,
            bn3: None,
            downsample,
        }
    }

    fn bottleneck(in_channels: usize, width: usize, stride: usize, device: &B::Device) -> Self {
        let out_channels = width * 4;
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new([in_channels, out_channels], stride, device));
        Self {
            conv1: conv([in_channels, width], 1, 1, device),
            bn1: BatchNormConfig::new(width).init(device),
            conv2: conv([width, width], 3, stride, device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: Some(conv([width, out_channels], 1, 1, device)),
            bn3: Some(BatchNormConfig::new(out_channels).init(device)),
            downsample,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.downsample {
            Some(downsample) => downsample.forward(x.clone()),
            None => x.clone(),
        };

        let out = relu(self.bn1.forward(self.conv1.forward(x)));
        let mut out = self.bn2.forward(self.conv2.forward(out));
        if let (Some(conv3), Some(bn3)) = (&self.conv3, &self.bn3) {
            out = bn3.forward(conv3.forward(relu(out)));
        }
        relu(out + identity)
    }
}

/// 7x7 stride-2 conv, batch norm, ReLU and 3x3 stride-2 max pool.
#[derive(Module, Debug)]
pub struct Stem<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B>,
    pool: MaxPool2d,
}

impl<B: Backend> Stem<B> {
    fn new(width: usize, device: &B::Device) -> Self {
        Self {
            conv: conv([3, width], 7, 2, device),
            bn: BatchNormConfig::new(width).init(device),
            pool: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pool.forward(relu(self.bn.forward(self.conv.forward(x))))
    }
}

/// ResNet feature extractor: everything up to and including global pooling.
#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    pub stem: Stem<B>,
    pub layer1: Vec<ResidualBlock<B>>,
    pub layer2: Vec<ResidualBlock<B>>,
    pub layer3: Vec<ResidualBlock<B>>,
    pub layer4: Vec<ResidualBlock<B>>,
    pool: AdaptiveAvgPool2d,
}

impl<B: Backend> ResNetBackbone<B> {
    pub fn new(arch: ResNetArch, base_width: usize, device: &B::Device) -> Self {
        let blocks = arch.blocks();
        let mut in_channels = base_width;

        let mut make_layer = |stage: usize| {
            let width = base_width << stage;
            let stride = if stage == 0 { 1 } else { 2 };
            (0..blocks[stage])
                .map(|i| {
                    let stride = if i == 0 { stride } else { 1 };
                    let block = if arch.bottleneck() {
                        ResidualBlock::bottleneck(in_channels, width, stride, device)
                    } else {
                        ResidualBlock::basic(in_channels, width, stride, device)
                    };
                    in_channels = width * arch.expansion();
                    block
                })
                .collect::<Vec<_>>()
        };

        let layer1 = make_layer(0);
        let layer2 = make_layer(1);
        let layer3 = make_layer(2);
        let layer4 = make_layer(3);

        Self {
            stem: Stem::new(base_width, device),
            layer1,
            layer2,
            layer3,
            layer4,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    /// `[batch, 3, h, w]` images to `[batch, features]`.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.stem.forward(images);
        for block in self
            .layer1
            .iter()
            .chain(&self.layer2)
            .chain(&self.layer3)
            .chain(&self.layer4)
        {
            x = block.forward(x);
        }
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        x.reshape([batch, channels])
    }
}
