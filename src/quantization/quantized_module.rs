use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::matrices::{fixed_point_multiply, rounding_rshift, Matrix};
use crate::module::{Linear, TracedModule};

use super::{quantize_multiplier, AffineQuantizer, QuantizedArray};

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

/// Integer-only replacement for a [`Linear`] layer, optionally followed by ReLU.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedLinear {
    q_weights: QuantizedArray,
    /// Bias at scale `input_scale * weight_scale`, zero point 0.
    q_bias: Vec<i64>,
    input_zero_point: i64,
    output_quantizer: AffineQuantizer,
    q_multiplier: i32,
    shift: i32,
    fused_relu: bool,
}

impl QuantizedLinear {
    pub fn new(
        linear: &Linear,
        input_quantizer: &AffineQuantizer,
        output_quantizer: AffineQuantizer,
        n_bits: u32,
        fused_relu: bool,
    ) -> Result<Self> {
        let q_weights = QuantizedArray::calibrate(n_bits, linear.weights.clone(), true)?;
        let accumulator_scale = input_quantizer.scale as f64 * q_weights.quantizer().scale as f64;
        let q_bias = linear
            .bias
            .iter()
            .map(|&b| (b as f64 / accumulator_scale).round() as i64)
            .collect();
        let (q_multiplier, shift) =
            quantize_multiplier(accumulator_scale / output_quantizer.scale as f64);

        Ok(QuantizedLinear {
            q_weights,
            q_bias,
            input_zero_point: input_quantizer.zero_point,
            output_quantizer,
            q_multiplier,
            shift,
            fused_relu,
        })
    }

    /// Raw accumulators `(q_x - z_x) · (q_w - z_w)ᵀ + q_bias`.
    pub fn accumulate(&self, q_x: &Matrix<i64>) -> Result<Matrix<i64>> {
        let weight_zero_point = self.q_weights.quantizer().zero_point;
        let mut acc = q_x.qmultiply(
            self.q_weights.qvalues(),
            -self.input_zero_point,
            -weight_zero_point,
        )?;
        let width = acc.cols;
        for (i, v) in acc.data.iter_mut().enumerate() {
            *v += self.q_bias[i % width];
        }
        Ok(acc)
    }

    /// Requantize accumulators into the output domain.
    pub fn requantize(&self, acc: &Matrix<i64>) -> Matrix<i64> {
        let zero_point = self.output_quantizer.zero_point;
        let lower = if self.fused_relu {
            zero_point
        } else {
            self.output_quantizer.qmin()
        };
        let upper = self.output_quantizer.qmax();
        acc.map(|a| {
            let a = if self.shift < 0 { a << -self.shift } else { a };
            let scaled = rounding_rshift(fixed_point_multiply(a, self.q_multiplier), self.shift);
            (zero_point + scaled).clamp(lower, upper)
        })
    }

    pub fn forward(&self, q_x: &Matrix<i64>) -> Result<Matrix<i64>> {
        Ok(self.requantize(&self.accumulate(q_x)?))
    }

    pub fn output_quantizer(&self) -> &AffineQuantizer {
        &self.output_quantizer
    }

    pub fn weights(&self) -> &QuantizedArray {
        &self.q_weights
    }

    pub fn has_fused_relu(&self) -> bool {
        self.fused_relu
    }

    pub fn in_features(&self) -> usize {
        self.q_weights.qvalues().cols
    }

    pub fn out_features(&self) -> usize {
        self.q_weights.qvalues().rows
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum QuantizedLayer {
    Linear(QuantizedLinear),
    /// ReLU that could not be fused; clamps at the zero point of its input.
    ReLU { zero_point: i64 },
}

impl QuantizedLayer {
    pub fn forward(&self, q_x: &Matrix<i64>) -> Result<Matrix<i64>> {
        match self {
            QuantizedLayer::Linear(linear) => linear.forward(q_x),
            QuantizedLayer::ReLU { zero_point } => Ok(q_x.map(|q| q.max(*zero_point))),
        }
    }
}

/// Calibrated integer version of a traced network.
///
/// Built once by [`super::PostTrainingAffineQuantization`]; nothing here is mutable
/// after construction. A new calibration produces a new module with a new id.
#[derive(Clone, Debug)]
pub struct QuantizedModule {
    module_id: u64,
    n_bits: u32,
    /// Quantized calibration inputs; `q_inputs[0]` is the network input.
    q_inputs: Vec<QuantizedArray>,
    layers: Vec<QuantizedLayer>,
    output_quantizer: AffineQuantizer,
    traced: TracedModule,
}

impl QuantizedModule {
    pub(crate) fn new(
        n_bits: u32,
        q_inputs: Vec<QuantizedArray>,
        layers: Vec<QuantizedLayer>,
        output_quantizer: AffineQuantizer,
        traced: TracedModule,
    ) -> Self {
        QuantizedModule {
            module_id: NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed),
            n_bits,
            q_inputs,
            layers,
            output_quantizer,
            traced,
        }
    }

    /// Identifies this calibration; circuits record it to reject foreign modules.
    pub fn module_id(&self) -> u64 {
        self.module_id
    }

    pub fn n_bits(&self) -> u32 {
        self.n_bits
    }

    pub fn q_inputs(&self) -> &[QuantizedArray] {
        &self.q_inputs
    }

    pub fn layers(&self) -> &[QuantizedLayer] {
        &self.layers
    }

    pub fn traced(&self) -> &TracedModule {
        &self.traced
    }

    pub fn input_quantizer(&self) -> &AffineQuantizer {
        self.q_inputs[0].quantizer()
    }

    pub fn output_quantizer(&self) -> &AffineQuantizer {
        &self.output_quantizer
    }

    pub fn in_features(&self) -> usize {
        self.traced.in_features()
    }

    pub fn n_outputs(&self) -> usize {
        self.traced.layer_widths().last().copied().unwrap_or(0)
    }

    pub fn quantize_input(&self, row: &[f32]) -> Vec<i64> {
        let quantizer = self.input_quantizer();
        row.iter().map(|&v| quantizer.quantize(v)).collect()
    }

    pub fn quantize_batch(&self, x: &Matrix<f32>) -> Matrix<i64> {
        let quantizer = self.input_quantizer();
        x.map(|v| quantizer.quantize(v))
    }

    /// Integer forward pass from quantized inputs to quantized outputs.
    pub fn forward(&self, q_x: &Matrix<i64>) -> Result<Matrix<i64>> {
        if q_x.cols != self.in_features() {
            return Err(Error::Shape {
                expected: self.in_features(),
                actual: q_x.cols,
            });
        }
        let mut q = q_x.clone();
        for layer in &self.layers {
            q = layer.forward(&q)?;
        }
        Ok(q)
    }

    pub fn dequantize_output(&self, q_y: &Matrix<i64>) -> Matrix<f32> {
        q_y.map(|q| self.output_quantizer.dequantize(q))
    }

    /// Quantize, run in the clear, dequantize.
    pub fn forward_and_dequant(&self, x: &Matrix<f32>) -> Result<Matrix<f32>> {
        let q_y = self.forward(&self.quantize_batch(x))?;
        Ok(self.dequantize_output(&q_y))
    }

    /// Widest accumulator, in signed bits, seen while running `inputset`.
    pub fn max_accumulator_bits(&self, inputset: &QuantizedArray) -> Result<u32> {
        let mut q = inputset.qvalues().clone();
        let mut widest = q.signed_bit_width();
        for layer in &self.layers {
            if let QuantizedLayer::Linear(linear) = layer {
                let acc = linear.accumulate(&q)?;
                widest = widest.max(acc.signed_bit_width());
                q = linear.requantize(&acc);
            } else {
                q = layer.forward(&q)?;
            }
        }
        Ok(widest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_linear(width: usize) -> Linear {
        let mut weights = Matrix::<f32>::new(width, width);
        for i in 0..width {
            weights.data[i * width + i] = 1.0;
        }
        Linear {
            weights,
            bias: vec![0.0; width],
        }
    }

    #[test]
    fn integer_linear_tracks_float_linear() {
        let linear = Linear {
            weights: Matrix::from_vec(2, 3, vec![0.5, -0.25, 1.0, -1.0, 0.75, 0.1]).unwrap(),
            bias: vec![0.2, -0.3],
        };
        let x = Matrix::from_vec(2, 3, vec![0.1, 0.9, -0.4, -0.7, 0.3, 0.6]).unwrap();
        let y = linear.forward(&x).unwrap();

        let (x_min, x_max) = x.min_and_max();
        let (y_min, y_max) = y.min_and_max();
        let in_q = AffineQuantizer::new(8, true, x_min, x_max).unwrap();
        let out_q = AffineQuantizer::new(8, true, y_min, y_max).unwrap();
        let q_linear = QuantizedLinear::new(&linear, &in_q, out_q, 8, false).unwrap();

        let q_y = q_linear.forward(&x.map(|v| in_q.quantize(v))).unwrap();
        for (q, f) in q_y.data.iter().zip(&y.data) {
            let err = (out_q.dequantize(*q) - f).abs();
            assert!(err < 0.05, "{f} vs {}", out_q.dequantize(*q));
        }
    }

    #[test]
    fn fused_relu_clamps_at_zero_point() {
        let linear = Linear {
            weights: Matrix::from_vec(1, 1, vec![-1.0]).unwrap(),
            bias: vec![0.0],
        };
        let in_q = AffineQuantizer::new(4, true, -1.0, 1.0).unwrap();
        let out_q = AffineQuantizer::new(4, true, 0.0, 1.0).unwrap();
        let q_linear = QuantizedLinear::new(&linear, &in_q, out_q, 4, true).unwrap();

        let q_x = Matrix::row_vector(&[in_q.quantize(1.0)]);
        let q_y = q_linear.forward(&q_x).unwrap();
        assert_eq!(q_y.data, vec![out_q.zero_point]);
    }

    #[test]
    fn standalone_relu_layer() {
        let layer = QuantizedLayer::ReLU { zero_point: -2 };
        let q = layer.forward(&Matrix::row_vector(&[-5, -2, 3])).unwrap();
        assert_eq!(q.data, vec![-2, -2, 3]);
    }

    #[test]
    fn accumulator_includes_bias() {
        let mut linear = identity_linear(2);
        linear.bias = vec![1.0, -1.0];
        let in_q = AffineQuantizer::new(8, true, -2.0, 2.0).unwrap();
        let out_q = AffineQuantizer::new(8, true, -3.0, 3.0).unwrap();
        let q_linear = QuantizedLinear::new(&linear, &in_q, out_q, 8, false).unwrap();

        let zero_input = Matrix::row_vector(&[in_q.zero_point, in_q.zero_point]);
        let acc = q_linear.accumulate(&zero_input).unwrap();
        let scale = in_q.scale * q_linear.weights().quantizer().scale;
        assert!((acc.data[0] as f32 * scale - 1.0).abs() < 0.01);
        assert!((acc.data[1] as f32 * scale + 1.0).abs() < 0.01);
    }
}
