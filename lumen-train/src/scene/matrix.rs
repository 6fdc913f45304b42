//! Row-major dense matrices for batched field evaluation.
//!
//! One row per sample; columns are feature channels.

use crate::scene::FieldError;

#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self, FieldError> {
        if data.len() != rows * cols {
            return Err(FieldError::Shape {
                rows,
                cols,
                expected: rows * cols,
                actual: data.len(),
            });
        }
        Ok(Self { rows, cols, data })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    /// `[left | right]`, row by row.
    pub fn hconcat(left: &Matrix, right: &Matrix) -> Matrix {
        debug_assert_eq!(left.rows, right.rows);
        let cols = left.cols + right.cols;
        let mut data = Vec::with_capacity(left.rows * cols);
        for r in 0..left.rows {
            data.extend_from_slice(left.row(r));
            data.extend_from_slice(right.row(r));
        }
        Matrix {
            rows: left.rows,
            cols,
            data,
        }
    }

    /// Split into columns `[0, at)` and `[at, cols)`.
    pub fn split_cols(&self, at: usize) -> (Matrix, Matrix) {
        debug_assert!(at <= self.cols);
        let mut left = Vec::with_capacity(self.rows * at);
        let mut right = Vec::with_capacity(self.rows * (self.cols - at));
        for r in 0..self.rows {
            let row = self.row(r);
            left.extend_from_slice(&row[..at]);
            right.extend_from_slice(&row[at..]);
        }
        (
            Matrix {
                rows: self.rows,
                cols: at,
                data: left,
            },
            Matrix {
                rows: self.rows,
                cols: self.cols - at,
                data: right,
            },
        )
    }

    pub fn add_assign(&mut self, other: &Matrix) {
        debug_assert_eq!((self.rows, self.cols), (other.rows, other.cols));
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
    }

    pub fn relu(mut self) -> Matrix {
        for v in &mut self.data {
            *v = v.max(0.0);
        }
        self
    }

    /// Gate an upstream gradient by the ReLU that produced `activated`.
    pub fn relu_backward(&self, activated: &Matrix) -> Matrix {
        debug_assert_eq!(self.data.len(), activated.data.len());
        let data = self
            .data
            .iter()
            .zip(&activated.data)
            .map(|(g, a)| if *a > 0.0 { *g } else { 0.0 })
            .collect();
        Matrix {
            rows: self.rows,
            cols: self.cols,
            data,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_length() {
        assert!(Matrix::from_vec(2, 3, vec![0.0; 6]).is_ok());
        assert!(matches!(
            Matrix::from_vec(2, 3, vec![0.0; 5]),
            Err(FieldError::Shape {
                expected: 6,
                actual: 5,
                ..
            })
        ));
    }

    #[test]
    fn test_hconcat_and_split_are_inverse() {
        let a = Matrix::from_vec(2, 1, vec![1.0, 2.0]).unwrap();
        let b = Matrix::from_vec(2, 2, vec![3.0, 4.0, 5.0, 6.0]).unwrap();
        let joined = Matrix::hconcat(&a, &b);
        assert_eq!(joined.rows(), 2);
        assert_eq!(joined.row(0), &[1.0, 3.0, 4.0]);
        assert_eq!(joined.row(1), &[2.0, 5.0, 6.0]);
        let (left, right) = joined.split_cols(1);
        assert_eq!(left, a);
        assert_eq!(right, b);
    }

    #[test]
    fn test_relu_backward_gates_on_activation() {
        let act = Matrix::from_vec(1, 3, vec![0.0, 2.0, 0.5]).unwrap();
        let grad = Matrix::from_vec(1, 3, vec![1.0, -1.0, 3.0]).unwrap();
        assert_eq!(grad.relu_backward(&act).data(), &[0.0, -1.0, 3.0]);
    }
}
