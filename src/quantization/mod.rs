pub mod post_training;
pub mod quantized_array;
pub mod quantized_module;

pub use post_training::PostTrainingAffineQuantization;
pub use quantized_array::QuantizedArray;
pub use quantized_module::{QuantizedLayer, QuantizedLinear, QuantizedModule};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest and largest supported quantization bit widths.
pub const MIN_BITS: u32 = 2;
pub const MAX_BITS: u32 = 16;

/// n-bit affine quantization scheme: `real = scale * (q - zero_point)`.
///
/// Signed schemes map to `[-2^(n-1), 2^(n-1) - 1]`, unsigned ones to `[0, 2^n - 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AffineQuantizer {
    pub n_bits: u32,
    pub is_signed: bool,
    pub scale: f32,
    pub zero_point: i64,
}

impl AffineQuantizer {
    /// Parameters covering `[min_val, max_val]`. The range is widened to contain 0 so
    /// that 0.0 is exactly representable.
    pub fn new(n_bits: u32, is_signed: bool, min_val: f32, max_val: f32) -> Result<Self> {
        if !(MIN_BITS..=MAX_BITS).contains(&n_bits) {
            return Err(Error::InvalidBitWidth(n_bits));
        }
        let min_val = min_val.min(0.0);
        let max_val = max_val.max(0.0);

        let (qmin, qmax) = int_range(n_bits, is_signed);
        let range = max_val - min_val;
        let scale = if range < 1e-10 {
            1.0
        } else {
            range / (qmax - qmin) as f32
        };
        let zero_point = ((qmin as f32 - min_val / scale).round() as i64).clamp(qmin, qmax);

        Ok(AffineQuantizer {
            n_bits,
            is_signed,
            scale,
            zero_point,
        })
    }

    pub fn qmin(&self) -> i64 {
        int_range(self.n_bits, self.is_signed).0
    }

    pub fn qmax(&self) -> i64 {
        int_range(self.n_bits, self.is_signed).1
    }

    /// Nearest integer in range; values beyond the calibrated range saturate.
    pub fn quantize(&self, real_val: f32) -> i64 {
        // Saturate before the cast so the zero point is never added to i64::MAX
        let q = (real_val / self.scale).round() + self.zero_point as f32;
        q.clamp(self.qmin() as f32, self.qmax() as f32) as i64
    }

    pub fn dequantize(&self, q_val: i64) -> f32 {
        self.scale * (q_val - self.zero_point) as f32
    }
}

/// Integer range of an n-bit value.
pub fn int_range(n_bits: u32, is_signed: bool) -> (i64, i64) {
    if is_signed {
        (-(1_i64 << (n_bits - 1)), (1_i64 << (n_bits - 1)) - 1)
    } else {
        (0, (1_i64 << n_bits) - 1)
    }
}

/// Given a positive `real_multiplier`, produces a `(q_multiplier, shift)` pair with
/// `q_multiplier` in Q31 format such that
///
/// `real_multiplier * x ≈ rounding_rshift(fixed_point_multiply(x << max(-shift, 0), q_multiplier), shift)`
///
/// A negative shift means the multiplier was at least 1 and the input is shifted left
/// first. Multipliers too small to survive a 62-bit shift collapse to `(0, 0)`.
pub fn quantize_multiplier(real_multiplier: f64) -> (i32, i32) {
    if !(real_multiplier > 0.0) || !real_multiplier.is_finite() {
        return (0, 0);
    }

    let mut real_multiplier = real_multiplier;
    let mut s = 0;
    // Bring the real multiplier into the interval [1/2, 1).
    while real_multiplier < 0.5 {
        real_multiplier *= 2.0;
        s += 1;
        if s > 62 {
            return (0, 0);
        }
    }
    while real_multiplier >= 1.0 {
        real_multiplier /= 2.0;
        s -= 1;
    }

    let mut q = (real_multiplier * (1_i64 << 31) as f64).round() as i64;
    // Rounding can land exactly on 1.0 in Q31, which does not fit an i32.
    if q == (1_i64 << 31) {
        q /= 2;
        s -= 1;
    }

    (q as i32, s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrices::{fixed_point_multiply, rounding_rshift};

    fn apply(x: i64, (q, shift): (i32, i32)) -> i64 {
        let x = if shift < 0 { x << -shift } else { x };
        rounding_rshift(fixed_point_multiply(x, q), shift)
    }

    #[test]
    fn signed_range_is_twos_complement() {
        assert_eq!(int_range(4, true), (-8, 7));
        assert_eq!(int_range(4, false), (0, 15));
        assert_eq!(int_range(8, true), (-128, 127));
    }

    #[test]
    fn huge_values_saturate() {
        let quantizer = AffineQuantizer::new(4, true, -1.0, 3.0).unwrap();
        assert_ne!(quantizer.zero_point, 0);
        assert_eq!(quantizer.quantize(1e30), 7);
        assert_eq!(quantizer.quantize(-1e30), -8);
        assert_eq!(quantizer.quantize(f32::INFINITY), 7);
        assert_eq!(quantizer.quantize(f32::NEG_INFINITY), -8);

        let unsigned = AffineQuantizer::new(3, false, -2.0, 2.0).unwrap();
        assert_eq!(unsigned.quantize(1e30), 7);
        assert_eq!(unsigned.quantize(-1e30), 0);
    }

    #[test]
    fn quantizer_rejects_unsupported_widths() {
        assert!(matches!(
            AffineQuantizer::new(1, true, -1.0, 1.0),
            Err(Error::InvalidBitWidth(1))
        ));
        assert!(matches!(
            AffineQuantizer::new(17, false, -1.0, 1.0),
            Err(Error::InvalidBitWidth(17))
        ));
    }

    #[test]
    fn zero_is_exact() {
        let quantizer = AffineQuantizer::new(4, true, 0.3, 2.7).unwrap();
        assert_eq!(quantizer.dequantize(quantizer.quantize(0.0)), 0.0);
    }

    #[test]
    fn quantize_clamps_out_of_range_values() {
        let quantizer = AffineQuantizer::new(3, true, -1.0, 1.0).unwrap();
        assert_eq!(quantizer.quantize(100.0), quantizer.qmax());
        assert_eq!(quantizer.quantize(-100.0), quantizer.qmin());
    }

    #[test]
    fn dequantized_error_is_within_half_a_step() {
        let quantizer = AffineQuantizer::new(6, false, -2.0, 3.0).unwrap();
        for i in 0..=50 {
            let v = -2.0 + i as f32 * 0.1;
            let err = (quantizer.dequantize(quantizer.quantize(v)) - v).abs();
            assert!(err <= quantizer.scale / 2.0 + 1e-5, "{v}: {err}");
        }
    }

    #[test]
    fn degenerate_range_gets_unit_scale() {
        let quantizer = AffineQuantizer::new(4, true, 0.0, 0.0).unwrap();
        assert_eq!(quantizer.scale, 1.0);
    }

    #[test]
    fn multiplier_below_one() {
        let m = quantize_multiplier(0.3);
        assert!(m.1 > 0);
        assert_eq!(apply(1000, m), 300);
    }

    #[test]
    fn multiplier_above_one_shifts_left() {
        let m = quantize_multiplier(5.25);
        assert!(m.1 < 0);
        assert_eq!(apply(100, m), 525);
        assert_eq!(apply(-100, m), -525);
    }

    #[test]
    fn non_positive_multiplier_is_zero() {
        assert_eq!(quantize_multiplier(0.0), (0, 0));
        assert_eq!(quantize_multiplier(-1.0), (0, 0));
        assert_eq!(quantize_multiplier(1e-30), (0, 0));
    }
}
