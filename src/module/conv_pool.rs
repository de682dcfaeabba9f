use burn::{module::Module, nn::conv::Conv2d, prelude::*, tensor::activation::relu};
use nn::{
    conv::Conv2dConfig,
    pool::{MaxPool2d, MaxPool2dConfig},
    PaddingConfig2d,
};

/// Convolution and ReLU, optionally followed by a 3x3 stride-2 max pool.
#[derive(Module, Debug)]
pub struct ConvPool<B: Backend> {
    conv: Conv2d<B>,
    pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvPool<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu(self.conv.forward(x));

        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

#[derive(Config, Debug)]
pub struct ConvPoolConfig {
    channels: [usize; 2],

    kernel_size: usize,

    #[config(default = "1")]
    stride: usize,

    #[config(default = "0")]
    padding: usize,

    #[config(default = false)]
    pool: bool,
}

impl ConvPoolConfig {
    pub const POOL_SIZE: usize = 3;
    pub const POOL_STRIDE: usize = 2;

    pub fn init<B: Backend>(&self, device: &B::Device) -> ConvPool<B> {
        ConvPool {
            conv: Conv2dConfig::new(self.channels, [self.kernel_size, self.kernel_size])
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
                .init(device),
            pool: self.pool.then(|| {
                MaxPool2dConfig::new([Self::POOL_SIZE, Self::POOL_SIZE])
                    .with_strides([Self::POOL_STRIDE, Self::POOL_STRIDE])
                    .init()
            }),
        }
    }

    /// Spatial side length after this block for an input of side `side`, or
    /// `None` when the input is smaller than a kernel.
    pub fn output_side(&self, side: usize) -> Option<usize> {
        let side = (side + 2 * self.padding).checked_sub(self.kernel_size)? / self.stride + 1;

        if self.pool {
            Some(side.checked_sub(Self::POOL_SIZE)? / Self::POOL_STRIDE + 1)
        } else {
            Some(side)
        }
    }
}
