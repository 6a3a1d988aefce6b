use burn::nn::{Linear, LinearConfig, Relu, Tanh};
use burn::prelude::*;

/// Hidden width of the value network.
const HIDDEN: usize = 256;

/// Value head applied position-wise to language-model hidden states.
///
/// ```text
/// Input:  [batch, seq, n_embd]
/// FC1:    n_embd -> 256, ReLU
/// FC2:    256 -> 256, ReLU
/// FC3:    256 -> 1, Tanh  =>  [batch, seq, 1]
/// ```
#[derive(Module, Debug)]
pub struct ValueNetwork<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    fc3: Linear<B>,
    relu: Relu,
    tanh: Tanh,
}

#[derive(Config, Debug)]
pub struct ValueNetworkConfig {
    pub n_embd: usize,
}

impl ValueNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ValueNetwork<B> {
        ValueNetwork {
            fc1: LinearConfig::new(self.n_embd, HIDDEN).init(device),
            fc2: LinearConfig::new(HIDDEN, HIDDEN).init(device),
            fc3: LinearConfig::new(HIDDEN, 1).init(device),
            relu: Relu::new(),
            tanh: Tanh::new(),
        }
    }
}

impl<B: Backend> ValueNetwork<B> {
    /// Forward pass: hidden [batch, seq, n_embd] -> values [batch, seq, 1] in (-1, 1).
    pub fn forward(&self, hidden: Tensor<B, 3>) -> Tensor<B, 3> {
        let x = self.relu.forward(self.fc1.forward(hidden));
        let x = self.relu.forward(self.fc2.forward(x));
        self.tanh.forward(self.fc3.forward(x))
    }
}
