use burn::{prelude::*, tensor::activation::relu};
use nn::{Dropout, DropoutConfig, Linear, LinearConfig};

/// Fully connected layer with ReLU and dropout. Dropout only fires on an
/// autodiff backend.
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    linear: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> Dense<B> {
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let x = relu(self.linear.forward(x));
        self.dropout.forward(x)
    }
}

#[derive(Config, Debug)]
pub struct DenseConfig {
    features: [usize; 2],

    #[config(default = 0.5)]
    dropout: f64,
}

impl DenseConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Dense<B> {
        Dense {
            linear: LinearConfig::new(self.features[0], self.features[1]).init(device),
            dropout: DropoutConfig::new(self.dropout).init(),
        }
    }
}
