//! Floating-point network and the trace used as quantization input.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::matrices::Matrix;

/// Fully connected layer, `weights` laid out `out_features × in_features`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    pub weights: Matrix<f32>,
    pub bias: Vec<f32>,
}

impl Linear {
    /// Xavier-uniform weights, zero bias.
    pub fn xavier(in_features: usize, out_features: usize, rng: &mut impl Rng) -> Self {
        let limit = (6.0 / (in_features + out_features) as f32).sqrt();
        Linear {
            weights: Matrix::random(out_features, in_features, -limit..limit, rng),
            bias: vec![0.0; out_features],
        }
    }

    pub fn in_features(&self) -> usize {
        self.weights.cols
    }

    pub fn out_features(&self) -> usize {
        self.weights.rows
    }

    pub fn forward(&self, x: &Matrix<f32>) -> Result<Matrix<f32>> {
        x.affine(&self.weights, &self.bias)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Layer {
    Linear(Linear),
    ReLU,
}

/// Layers applied in order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Sequential {
    pub layers: Vec<Layer>,
}

impl Sequential {
    /// Multi-layer perceptron `in → hidden... → out` with ReLU between linear layers.
    pub fn mlp(in_features: usize, hidden: &[usize], out_features: usize, rng: &mut impl Rng) -> Self {
        let mut widths = Vec::with_capacity(hidden.len() + 2);
        widths.push(in_features);
        widths.extend_from_slice(hidden);
        widths.push(out_features);

        let mut layers = Vec::new();
        for (i, pair) in widths.windows(2).enumerate() {
            if i > 0 {
                layers.push(Layer::ReLU);
            }
            layers.push(Layer::Linear(Linear::xavier(pair[0], pair[1], &mut *rng)));
        }
        Sequential { layers }
    }

    pub fn in_features(&self) -> Option<usize> {
        self.linear_layers().next().map(Linear::in_features)
    }

    pub fn out_features(&self) -> Option<usize> {
        self.linear_layers().last().map(Linear::out_features)
    }

    pub fn linear_layers(&self) -> impl Iterator<Item = &Linear> {
        self.layers.iter().filter_map(|layer| match layer {
            Layer::Linear(linear) => Some(linear),
            Layer::ReLU => None,
        })
    }

    pub fn forward(&self, x: &Matrix<f32>) -> Result<Matrix<f32>> {
        self.forward_traced(x).map(|mut outputs| outputs.pop().unwrap_or_else(|| x.clone()))
    }

    /// Output of every layer, in order.
    pub fn forward_traced(&self, x: &Matrix<f32>) -> Result<Vec<Matrix<f32>>> {
        let mut outputs: Vec<Matrix<f32>> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let input = outputs.last().unwrap_or(x);
            let output = match layer {
                Layer::Linear(linear) => linear.forward(input)?,
                Layer::ReLU => relu(input),
            };
            outputs.push(output);
        }
        Ok(outputs)
    }
}

pub fn relu(x: &Matrix<f32>) -> Matrix<f32> {
    x.map(|v| v.max(0.0))
}

/// A trained network captured together with one representative input row.
///
/// The trace owns its own copy of the network, so it stays valid whatever happens to
/// the estimator that trained it.
#[derive(Clone, Debug, PartialEq)]
pub struct TracedModule {
    module: Sequential,
    sample: Vec<f32>,
    layer_widths: Vec<usize>,
}

impl TracedModule {
    pub fn new(module: &Sequential, sample: &[f32]) -> Result<Self> {
        let in_features = module.in_features().ok_or(Error::NoLinearLayer)?;
        if sample.len() != in_features {
            return Err(Error::Shape {
                expected: in_features,
                actual: sample.len(),
            });
        }

        let outputs = module.forward_traced(&Matrix::row_vector(sample))?;
        let layer_widths = outputs.iter().map(|o| o.cols).collect();

        Ok(TracedModule {
            module: module.clone(),
            sample: sample.to_vec(),
            layer_widths,
        })
    }

    pub fn module(&self) -> &Sequential {
        &self.module
    }

    pub fn sample(&self) -> &[f32] {
        &self.sample
    }

    /// Output width of each traced layer.
    pub fn layer_widths(&self) -> &[usize] {
        &self.layer_widths
    }

    pub fn in_features(&self) -> usize {
        self.sample.len()
    }
}
