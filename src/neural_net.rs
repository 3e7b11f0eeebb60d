//! Multi-layer perceptron classifier trained with mini-batch SGD.

use log::debug;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::estimator::{TrainableEstimator, TrainingOptions};
use crate::matrices::{argmax, Matrix};
use crate::module::{Layer, Sequential};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuralNetParams {
    /// Widths of the hidden layers.
    pub hidden_layers: Vec<usize>,
    /// Quantization bit width for weights and activations.
    pub n_bits: u32,
    pub max_epochs: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub seed: Option<u64>,
    /// Starting network; built from `hidden_layers` when absent.
    pub module: Option<Sequential>,
}

impl Default for NeuralNetParams {
    fn default() -> Self {
        NeuralNetParams {
            hidden_layers: vec![8],
            n_bits: 2,
            max_epochs: 50,
            learning_rate: 0.05,
            batch_size: 16,
            seed: None,
            module: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NeuralNetClassifier {
    params: NeuralNetParams,
    network: Option<Sequential>,
    initialized: bool,
}

impl NeuralNetClassifier {
    pub fn new(params: NeuralNetParams) -> Self {
        NeuralNetClassifier {
            params,
            network: None,
            initialized: false,
        }
    }

    /// Replace the hyperparameters; the trained network is kept until the next fit.
    pub fn set_params(&mut self, params: NeuralNetParams) {
        self.params = params;
    }

    pub fn network(&self) -> Option<&Sequential> {
        self.network.as_ref()
    }

    /// Softmax class probabilities, one row per sample.
    pub fn predict_proba(&self, data: &Matrix<f32>) -> Result<Matrix<f32>> {
        let network = self.trained_network()?;
        if Some(data.cols) != network.in_features() {
            return Err(Error::Shape {
                expected: network.in_features().unwrap_or(0),
                actual: data.cols,
            });
        }
        Ok(softmax(&network.forward(data)?))
    }

    fn trained_network(&self) -> Result<&Sequential> {
        match &self.network {
            Some(network) if self.initialized => Ok(network),
            _ => Err(Error::NotFitted),
        }
    }

    /// Network to train: the current one on warm start, else the configured module,
    /// else a fresh MLP.
    fn starting_network(
        &self,
        in_features: usize,
        n_classes: usize,
        warm_start: bool,
        rng: &mut StdRng,
    ) -> Result<Sequential> {
        let network = match (&self.network, &self.params.module) {
            (Some(current), _) if warm_start && self.initialized => current.clone(),
            (_, Some(module)) => module.clone(),
            _ => Sequential::mlp(in_features, &self.params.hidden_layers, n_classes, rng),
        };

        if network.in_features() != Some(in_features) {
            return Err(Error::Shape {
                expected: network.in_features().unwrap_or(0),
                actual: in_features,
            });
        }
        let outputs = network.out_features().unwrap_or(0);
        if outputs < n_classes {
            return Err(Error::Shape {
                expected: n_classes,
                actual: outputs,
            });
        }
        Ok(network)
    }
}

impl TrainableEstimator for NeuralNetClassifier {
    type Params = NeuralNetParams;

    fn fit(&mut self, data: &Matrix<f32>, labels: &[i64], options: &TrainingOptions) -> Result<()> {
        data.ensure_non_empty()?;
        if labels.len() != data.rows {
            return Err(Error::Shape {
                expected: data.rows,
                actual: labels.len(),
            });
        }
        if let Some(&bad) = labels.iter().find(|&&l| l < 0) {
            return Err(Error::InvalidLabel(bad));
        }
        let targets: Vec<usize> = labels.iter().map(|&l| l as usize).collect();
        let n_classes = targets.iter().copied().max().unwrap_or(0).max(1) + 1;

        let seed = options
            .seed
            .or(self.params.seed)
            .unwrap_or_else(|| rand::rng().random());
        let mut rng = StdRng::seed_from_u64(seed);

        let mut network = self.starting_network(data.cols, n_classes, options.warm_start, &mut rng)?;
        let epochs = options.max_epochs.unwrap_or(self.params.max_epochs);
        let batch_size = self.params.batch_size.max(1);

        let mut order: Vec<usize> = (0..data.rows).collect();
        for epoch in 0..epochs {
            order.shuffle(&mut rng);
            let mut total_loss = 0.0;
            for batch in order.chunks(batch_size) {
                let x = data.select_rows(batch);
                let y: Vec<usize> = batch.iter().map(|&i| targets[i]).collect();
                total_loss += sgd_step(&mut network, &x, &y, self.params.learning_rate)?
                    * batch.len() as f32;
            }
            debug!("epoch {epoch}: loss {:.4}", total_loss / data.rows as f32);
        }

        self.network = Some(network);
        self.initialized = true;
        Ok(())
    }

    fn predict(&self, data: &Matrix<f32>) -> Result<Vec<i64>> {
        let proba = self.predict_proba(data)?;
        Ok(proba.row_iter().map(|row| argmax(row) as i64).collect())
    }

    fn params(&self) -> NeuralNetParams {
        self.params.clone()
    }

    fn from_trained(params: NeuralNetParams, module: Sequential) -> Self {
        NeuralNetClassifier {
            params: NeuralNetParams {
                module: None,
                ..params
            },
            network: Some(module),
            initialized: false,
        }
    }

    /// Marks the estimator trained. Without a network, the configured module is
    /// taken as the trained one; with neither, the estimator stays untrained.
    fn initialize(&mut self) {
        if self.network.is_none() {
            self.network = self.params.module.clone();
        }
        self.initialized = self.network.is_some();
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn module_to_compile(&self) -> Result<&Sequential> {
        self.trained_network()
    }

    fn n_bits_quant(&self) -> u32 {
        self.params.n_bits
    }
}

/// Row-wise softmax, shifted by the row maximum for stability.
pub fn softmax(logits: &Matrix<f32>) -> Matrix<f32> {
    let mut out = logits.clone();
    for row in out.data.chunks_mut(logits.cols.max(1)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in row.iter_mut() {
            *v = (*v - max).exp();
            sum += *v;
        }
        for v in row.iter_mut() {
            *v /= sum;
        }
    }
    out
}

/// One SGD step of softmax cross-entropy; returns the mean batch loss.
fn sgd_step(network: &mut Sequential, x: &Matrix<f32>, targets: &[usize], lr: f32) -> Result<f32> {
    let outputs = network.forward_traced(x)?;
    let logits = outputs.last().unwrap_or(x);
    let probs = softmax(logits);

    let n = x.rows as f32;
    let mut loss = 0.0;
    let mut grad = probs.clone();
    for (i, &t) in targets.iter().enumerate() {
        loss -= probs.data[i * probs.cols + t].max(1e-12).ln();
        grad.data[i * probs.cols + t] -= 1.0;
    }
    grad.data.iter_mut().for_each(|g| *g /= n);

    for l in (0..network.layers.len()).rev() {
        let input = if l == 0 { x } else { &outputs[l - 1] };
        match &mut network.layers[l] {
            Layer::Linear(linear) => {
                // dL/dx uses the weights before this step's update
                let grad_input = grad.affine(&linear.weights.transpose(), &[])?;
                let (out_features, in_features) = (linear.weights.rows, linear.weights.cols);
                for j in 0..out_features {
                    let mut bias_grad = 0.0;
                    for i in 0..grad.rows {
                        bias_grad += grad.data[i * out_features + j];
                    }
                    linear.bias[j] -= lr * bias_grad;
                    for k in 0..in_features {
                        let mut weight_grad = 0.0;
                        for i in 0..grad.rows {
                            weight_grad += grad.data[i * out_features + j] * input.data[i * in_features + k];
                        }
                        linear.weights.data[j * in_features + k] -= lr * weight_grad;
                    }
                }
                grad = grad_input;
            }
            Layer::ReLU => {
                for (g, &v) in grad.data.iter_mut().zip(&input.data) {
                    if v <= 0.0 {
                        *g = 0.0;
                    }
                }
            }
        }
    }

    Ok(loss / n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::make_classification;

    fn params(seed: u64) -> NeuralNetParams {
        NeuralNetParams {
            hidden_layers: vec![8],
            max_epochs: 30,
            seed: Some(seed),
            ..Default::default()
        }
    }

    fn accuracy(predictions: &[i64], labels: &[i64]) -> f32 {
        let hits = predictions.iter().zip(labels).filter(|(p, l)| p == l).count();
        hits as f32 / labels.len() as f32
    }

    #[test]
    fn learns_separable_blobs() {
        let (x, y) = make_classification(120, 4, 3, 1);
        let mut model = NeuralNetClassifier::new(params(1));
        model.fit(&x, &y, &TrainingOptions::default()).unwrap();
        let acc = accuracy(&model.predict(&x).unwrap(), &y);
        assert!(acc > 0.8, "accuracy {acc}");
    }

    #[test]
    fn training_is_reproducible_with_seed() {
        let (x, y) = make_classification(40, 4, 2, 2);
        let mut a = NeuralNetClassifier::new(params(9));
        let mut b = NeuralNetClassifier::new(params(9));
        a.fit(&x, &y, &TrainingOptions::default()).unwrap();
        b.fit(&x, &y, &TrainingOptions::default()).unwrap();
        assert_eq!(a.network(), b.network());
    }

    #[test]
    fn predict_before_fit_fails() {
        let model = NeuralNetClassifier::new(params(3));
        assert!(matches!(model.predict(&Matrix::new(1, 4)), Err(Error::NotFitted)));
        assert!(matches!(model.module_to_compile(), Err(Error::NotFitted)));
    }

    #[test]
    fn negative_labels_are_rejected() {
        let (x, _) = make_classification(4, 2, 2, 4);
        let mut model = NeuralNetClassifier::new(params(4));
        assert!(matches!(
            model.fit(&x, &[0, 1, -3, 0], &TrainingOptions::default()),
            Err(Error::InvalidLabel(-3))
        ));
    }

    #[test]
    fn warm_start_continues_from_current_weights() {
        let (x, y) = make_classification(40, 4, 2, 5);
        let mut model = NeuralNetClassifier::new(params(5));
        model.fit(&x, &y, &TrainingOptions::default()).unwrap();
        let trained = model.network().cloned();

        let zero_epochs = TrainingOptions {
            max_epochs: Some(0),
            warm_start: true,
            ..Default::default()
        };
        model.fit(&x, &y, &zero_epochs).unwrap();
        assert_eq!(model.network().cloned(), trained);

        let cold = TrainingOptions {
            max_epochs: Some(0),
            ..Default::default()
        };
        model.fit(&x, &y, &cold).unwrap();
        assert_ne!(model.network().cloned(), trained);
    }

    #[test]
    fn from_trained_needs_initialize() {
        let (x, y) = make_classification(40, 4, 2, 6);
        let mut model = NeuralNetClassifier::new(params(6));
        model.fit(&x, &y, &TrainingOptions::default()).unwrap();

        let network = model.network().cloned().unwrap();
        let mut reference = NeuralNetClassifier::from_trained(model.params(), network);
        assert!(!reference.is_initialized());
        reference.initialize();
        assert!(reference.is_initialized());
        assert_eq!(reference.predict(&x).unwrap(), model.predict(&x).unwrap());
    }

    #[test]
    fn configured_module_must_fit_the_data() {
        let mut rng = StdRng::seed_from_u64(7);
        let module = Sequential::mlp(3, &[4], 2, &mut rng);
        let (x, y) = make_classification(10, 4, 2, 7);
        let mut model = NeuralNetClassifier::new(NeuralNetParams {
            module: Some(module),
            ..params(7)
        });
        assert!(matches!(
            model.fit(&x, &y, &TrainingOptions::default()),
            Err(Error::Shape {
                expected: 3,
                actual: 4
            })
        ));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let logits = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, -5.0, 0.0, 5.0]).unwrap();
        let p = softmax(&logits);
        for row in p.row_iter() {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-6);
        }
    }
}
