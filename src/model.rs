use burn::prelude::*;
use nn::{Linear, LinearConfig};

use crate::module::{
    conv_pool::{ConvPool, ConvPoolConfig},
    dense::{Dense, DenseConfig},
};

const CONV_SETTINGS: [[usize; 5]; 5] = [
    // (c = channels; k = kernel size; s = stride; p = padding; pool = max pool after)
    // c, k, s, p, pool
    [96, 11, 4, 0, 1],
    [256, 5, 1, 2, 1],
    [384, 3, 1, 1, 0],
    [384, 3, 1, 1, 0],
    [256, 3, 1, 1, 1],
];

/// Anything that maps a batch of images to per-class logits.
pub trait ImageClassifier<B: Backend> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// CaffeNet: five convolution stages and three fully connected layers.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    features: Vec<ConvPool<B>>,
    classifier: Vec<Dense<B>>,
    output: Linear<B>,
}

impl<B: Backend> Model<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .features
            .iter()
            .fold(x, |x, conv_pool| conv_pool.forward(x));

        let x = x.flatten(1, 3);
        let x = self
            .classifier
            .iter()
            .fold(x, |x, dense| dense.forward(x));

        self.output.forward(x)
    }
}

impl<B: Backend> ImageClassifier<B> for Model<B> {
    fn logits(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.forward(images)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub classes: usize,

    #[config(default = 0.5)]
    pub dropout: f64,

    #[config(default = 4096)]
    pub hidden: usize,

    /// Side length of the square input images.
    #[config(default = 224)]
    pub input_size: usize,
}

impl ModelConfig {
    /// Smallest input side the convolution stack accepts.
    pub const MIN_INPUT_SIZE: usize = 67;

    fn conv_configs(&self) -> Vec<ConvPoolConfig> {
        let mut input_channel = 3;

        CONV_SETTINGS
            .iter()
            .map(|&[c, k, s, p, pool]| {
                let config = ConvPoolConfig::new([input_channel, c], k)
                    .with_stride(s)
                    .with_padding(p)
                    .with_pool(pool == 1);
                input_channel = c;
                config
            })
            .collect()
    }

    /// Length of the flattened convolutional feature vector, `None` when
    /// `input_size` is below [`Self::MIN_INPUT_SIZE`].
    pub fn feature_size(&self) -> Option<usize> {
        let side = self
            .conv_configs()
            .iter()
            .try_fold(self.input_size, |side, config| config.output_side(side))?;
        let [.., [channels, ..]] = CONV_SETTINGS;

        Some(channels * side * side)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let Some(feature_size) = self.feature_size() else {
            panic!(
                "input size {} is below the minimum of {}",
                self.input_size,
                Self::MIN_INPUT_SIZE
            );
        };

        let features = self
            .conv_configs()
            .iter()
            .map(|config| config.init(device))
            .collect();

        let classifier = vec![
            DenseConfig::new([feature_size, self.hidden])
                .with_dropout(self.dropout)
                .init(device),
            DenseConfig::new([self.hidden, self.hidden])
                .with_dropout(self.dropout)
                .init(device),
        ];

        Model {
            features,
            classifier,
            output: LinearConfig::new(self.hidden, self.classes).init(device),
        }
    }
}
