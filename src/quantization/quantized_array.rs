use crate::error::{Error, Result};
use crate::matrices::Matrix;

use super::AffineQuantizer;

/// Float values together with their quantized image under a fixed quantizer.
///
/// The quantizer is derived once, at calibration. [`QuantizedArray::update_values`]
/// swaps in new values but never recomputes the parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct QuantizedArray {
    quantizer: AffineQuantizer,
    values: Matrix<f32>,
    qvalues: Matrix<i64>,
}

impl QuantizedArray {
    /// Derive parameters from the range of `values` and quantize them.
    pub fn calibrate(n_bits: u32, values: Matrix<f32>, is_signed: bool) -> Result<Self> {
        let (min_val, max_val) = values.min_and_max();
        let quantizer = AffineQuantizer::new(n_bits, is_signed, min_val, max_val)?;
        Ok(Self::with_quantizer(quantizer, values))
    }

    pub fn with_quantizer(quantizer: AffineQuantizer, values: Matrix<f32>) -> Self {
        let qvalues = values.map(|v| quantizer.quantize(v));
        QuantizedArray {
            quantizer,
            values,
            qvalues,
        }
    }

    /// Replace the values and re-quantize them with the existing parameters.
    ///
    /// The column count must stay the same, the row count may change.
    pub fn update_values(&mut self, values: &Matrix<f32>) -> Result<&Matrix<i64>> {
        if values.cols != self.values.cols {
            return Err(Error::Shape {
                expected: self.values.cols,
                actual: values.cols,
            });
        }
        self.values = values.clone();
        self.qvalues = values.map(|v| self.quantizer.quantize(v));
        Ok(&self.qvalues)
    }

    pub fn quantizer(&self) -> &AffineQuantizer {
        &self.quantizer
    }

    pub fn values(&self) -> &Matrix<f32> {
        &self.values
    }

    pub fn qvalues(&self) -> &Matrix<i64> {
        &self.qvalues
    }

    pub fn dequant(&self) -> Matrix<f32> {
        self.qvalues.map(|q| self.quantizer.dequantize(q))
    }
}
