use std::ops::Range;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dense row-major matrix. Rows are samples (or output units for weights).
#[derive(PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct Matrix<T> {
    pub data: Vec<T>,
    pub rows: usize,
    pub cols: usize,
}

impl<T> Matrix<T>
where
    T: Copy + Default,
{
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            data: vec![T::default(); rows * cols],
            rows,
            cols,
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(Error::Shape {
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { data, rows, cols })
    }

    /// Build from a list of rows; every row must have the width of the first.
    pub fn from_rows(rows: &[Vec<T>]) -> Result<Self> {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            if row.len() != cols {
                return Err(Error::Shape {
                    expected: cols,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Ok(Self {
            data,
            rows: rows.len(),
            cols,
        })
    }

    /// A batch of one built from a single row.
    pub fn row_vector(row: &[T]) -> Self {
        Self {
            data: row.to_vec(),
            rows: 1,
            cols: row.len(),
        }
    }

    pub fn row(&self, i: usize) -> &[T] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    pub fn row_iter(&self) -> impl Iterator<Item = &[T]> {
        // chunks(0) panics, a matrix without columns has no usable rows
        self.data.chunks(self.cols.max(1)).take(self.rows)
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Fail unless the matrix has at least one row and one column.
    pub fn ensure_non_empty(&self) -> Result<()> {
        if self.is_empty() {
            return Err(Error::EmptyData {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(())
    }

    pub fn transpose(&self) -> Self {
        let mut transposed = Matrix::new(self.cols, self.rows);

        for i in 0..self.rows {
            for j in 0..self.cols {
                transposed.data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }

        transposed
    }

    /// Gather rows by index, in the given order.
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        let mut data = Vec::with_capacity(indices.len() * self.cols);
        for &i in indices {
            data.extend_from_slice(self.row(i));
        }
        Matrix {
            data,
            rows: indices.len(),
            cols: self.cols,
        }
    }

    pub fn map<U>(&self, f: impl Fn(T) -> U) -> Matrix<U> {
        Matrix {
            data: self.data.iter().map(|&v| f(v)).collect(),
            rows: self.rows,
            cols: self.cols,
        }
    }
}

impl Matrix<f32> {
    pub fn random(rows: usize, cols: usize, range: Range<f32>, rng: &mut impl Rng) -> Self {
        let size = rows * cols;
        let mut data = Vec::<f32>::with_capacity(size);

        for _ in 0..size {
            data.push(rng.random_range(range.clone()));
        }

        Matrix { data, rows, cols }
    }

    /// Smallest and largest entry, `(0, 0)` for an empty matrix.
    pub fn min_and_max(&self) -> (f32, f32) {
        if self.data.is_empty() {
            return (0.0, 0.0);
        }
        self.data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// `self · weightsᵀ + bias` where `weights` is laid out `out × in`.
    pub fn affine(&self, weights: &Matrix<f32>, bias: &[f32]) -> Result<Matrix<f32>> {
        if weights.cols != self.cols {
            return Err(Error::Shape {
                expected: weights.cols,
                actual: self.cols,
            });
        }
        let mut out = Matrix::<f32>::new(self.rows, weights.rows);
        for (i, x) in self.row_iter().enumerate() {
            for (j, w) in weights.row_iter().enumerate() {
                let dot: f32 = x.iter().zip(w).map(|(a, b)| a * b).sum();
                out.data[i * weights.rows + j] = dot + bias.get(j).copied().unwrap_or(0.0);
            }
        }
        Ok(out)
    }
}

impl Matrix<i64> {
    /// Integer product `(self + lhs_offset) · (weights + rhs_offset)ᵀ` returned as raw
    /// accumulators. `weights` is laid out `out × in`, like the float weights.
    ///
    /// The offsets are never added entry by entry. Expanding the product gives
    ///
    /// lhs · rhs
    /// + lhs_offset · P · rhs
    /// + lhs · rhs_offset · Q
    /// + lhs_offset · rhs_offset · P · Q
    ///
    /// with `P`, `Q` all-ones matrices. Only `lhs · rhs` needs the inner loop: the
    /// second term is the column sums of `rhs` scaled by `lhs_offset` (one vector added
    /// to every row), the third is the row sums of `lhs` scaled by `rhs_offset`
    /// (one vector added to every column), and the fourth is the constant
    /// `lhs_offset · rhs_offset · depth`.
    pub fn qmultiply(
        &self,
        weights: &Matrix<i64>,
        lhs_offset: i64,
        rhs_offset: i64,
    ) -> Result<Matrix<i64>> {
        if weights.cols != self.cols {
            return Err(Error::Shape {
                expected: weights.cols,
                actual: self.cols,
            });
        }

        let depth = self.cols as i64;
        let constant = lhs_offset * rhs_offset * depth;

        // lhs_offset * P * rhs, one entry per output unit
        let lhs_offset_vec: Vec<i64> = weights
            .row_iter()
            .map(|w| w.iter().sum::<i64>() * lhs_offset)
            .collect();

        let mut accumulators = Vec::with_capacity(self.rows * weights.rows);
        for x in self.row_iter() {
            let rhs_offset_term = x.iter().sum::<i64>() * rhs_offset;
            for (j, w) in weights.row_iter().enumerate() {
                let mut accumulator: i64 = 0;
                for k in 0..self.cols {
                    accumulator += x[k] * w[k];
                }
                accumulators.push(accumulator + lhs_offset_vec[j] + rhs_offset_term + constant);
            }
        }

        Ok(Matrix {
            data: accumulators,
            rows: self.rows,
            cols: weights.rows,
        })
    }

    /// Number of bits needed to hold every entry as a signed integer.
    pub fn signed_bit_width(&self) -> u32 {
        self.data.iter().map(|&v| signed_bit_width(v)).max().unwrap_or(1)
    }
}

/// Index of the first maximum of a row.
pub fn argmax<T: PartialOrd + Copy>(row: &[T]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Bits needed to represent `v` in two's complement, sign bit included.
pub fn signed_bit_width(v: i64) -> u32 {
    let magnitude = if v < 0 { !v } else { v };
    64 - magnitude.leading_zeros() + 1
}

pub(crate) fn rounding_rshift(x: i64, rshift: i32) -> i64 {
    if rshift <= 0 {
        return x;
    };

    let rounding_offset = 1_i64 << (rshift - 1);
    (x + rounding_offset) >> rshift
}

/// Multiply by a Q31 fixed-point value with rounding.
pub(crate) fn fixed_point_multiply(a: i64, b: i32) -> i64 {
    let temp = a as i128 * b as i128 + (1_i128 << 30);
    (temp >> 31) as i64
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn from_rows_rejects_ragged_input() {
        let rows = vec![vec![1.0f32, 2.0], vec![3.0]];
        assert!(matches!(
            Matrix::from_rows(&rows),
            Err(Error::Shape {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn transpose_rectangular() {
        let m = Matrix::from_vec(2, 3, vec![1, 2, 3, 4, 5, 6]).unwrap();
        let t = m.transpose();
        assert_eq!(t.rows, 3);
        assert_eq!(t.cols, 2);
        assert_eq!(t.data, vec![1, 4, 2, 5, 3, 6]);
    }

    #[test]
    fn select_rows_keeps_requested_order() {
        let m = Matrix::from_vec(3, 2, vec![0, 0, 1, 1, 2, 2]).unwrap();
        let picked = m.select_rows(&[2, 0]);
        assert_eq!(picked.data, vec![2, 2, 0, 0]);
    }

    #[test]
    fn affine_matches_hand_computation() {
        let x = Matrix::from_vec(1, 2, vec![1.0f32, 2.0]).unwrap();
        let w = Matrix::from_vec(2, 2, vec![1.0f32, 0.0, 0.5, -1.0]).unwrap();
        let y = x.affine(&w, &[0.5, 1.0]).unwrap();
        assert_eq!(y.data, vec![1.5, -0.5]);
    }

    #[test]
    fn qmultiply_offsets_match_naive_expansion() {
        let mut rng = StdRng::seed_from_u64(7);
        let lhs = Matrix::random(4, 5, -8.0..8.0, &mut rng).map(|v| v.round() as i64);
        let rhs = Matrix::random(3, 5, -8.0..8.0, &mut rng).map(|v| v.round() as i64);
        let (lhs_offset, rhs_offset) = (3, -2);

        let fast = lhs.qmultiply(&rhs, lhs_offset, rhs_offset).unwrap();

        for i in 0..lhs.rows {
            for j in 0..rhs.rows {
                let naive: i64 = (0..lhs.cols)
                    .map(|k| (lhs.row(i)[k] + lhs_offset) * (rhs.row(j)[k] + rhs_offset))
                    .sum();
                assert_eq!(fast.data[i * rhs.rows + j], naive);
            }
        }
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        assert_eq!(argmax(&[1, 5, 5, 2]), 1);
        assert_eq!(argmax(&[-3.0f32]), 0);
    }

    #[test]
    fn signed_bit_width_examples() {
        assert_eq!(signed_bit_width(0), 1);
        assert_eq!(signed_bit_width(-1), 1);
        assert_eq!(signed_bit_width(1), 2);
        assert_eq!(signed_bit_width(127), 8);
        assert_eq!(signed_bit_width(-128), 8);
        assert_eq!(signed_bit_width(128), 9);
    }

    #[test]
    fn rounding_rshift_rounds_half_up() {
        assert_eq!(rounding_rshift(5, 1), 3);
        assert_eq!(rounding_rshift(4, 1), 2);
        assert_eq!(rounding_rshift(-5, 1), -2);
        assert_eq!(rounding_rshift(9, 0), 9);
    }
}
