//! Core tensor data structures.
//!
//! # Core Tensor Utilities
//!
//! A [`Tensor`] is a shape plus flat data, with the first shape entry varying
//! fastest. For the 3-band images the convolution engine works on, the shape
//! is `[x, y, band]` and element `(x, y, b)` lives at `x + X * (y + Y * b)`.
//!
//! ## Design Highlights
//! - Tensors are strongly typed: `Tensor<T>` for any element type (usually `f64`)
//! - Shape is stored as a `Vec<usize>` and checked at construction
//! - `WithGrad<T>` pairs any value with its gradient
//! - Tensors lend their data as `&[T]`, so a batch of them can be handed
//!   straight to a [`ConvolutionController`](crate::controller::ConvolutionController)
//!
//! ## Example
//!
//! ```rust
//! use briny_conv::tensors::Tensor;
//! let t = Tensor::new(vec![2, 3, 1], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! assert_eq!(t.shape, vec![2, 3, 1]);
//! assert_eq!(t.get(&[1, 2, 0]), Some(&6.0));
//! ```

use crate::error::{ConvError, Result};

/// An N-dimensional tensor with a shape and flat data.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    /// Extent along each axis.
    pub shape: Vec<usize>,
    /// Flattened content, first axis fastest.
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Errors
    /// [`ConvError::TensorShape`] if `data.len()` is not the product of `shape`.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        if shape.iter().product::<usize>() != data.len() {
            return Err(ConvError::TensorShape {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    /// Flat offset of `coords`, if they are in bounds.
    #[must_use]
    pub fn index_of(&self, coords: &[usize]) -> Option<usize> {
        if coords.len() != self.shape.len() {
            return None;
        }
        let mut index = 0;
        for (&c, &extent) in coords.iter().zip(&self.shape).rev() {
            if c >= extent {
                return None;
            }
            index = index * extent + c;
        }
        Some(index)
    }

    /// Element at `coords`.
    #[must_use]
    pub fn get(&self, coords: &[usize]) -> Option<&T> {
        self.index_of(coords).map(|i| &self.data[i])
    }
}

impl<T: Clone + Default> Tensor<T> {
    /// A tensor of the given shape filled with `T::default()`.
    #[must_use]
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let data = vec![T::default(); shape.iter().product()];
        Self { shape, data }
    }
}

impl<T> AsRef<[T]> for Tensor<T> {
    fn as_ref(&self) -> &[T] {
        &self.data
    }
}

impl<T> AsMut<[T]> for Tensor<T> {
    fn as_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

/// A value paired with its gradient.
///
/// Typically used as `WithGrad<Tensor<f64>>`.
#[derive(Debug, Clone, PartialEq)]
pub struct WithGrad<T> {
    /// The value.
    pub value: T,
    /// Accumulated gradient, same shape as `value`.
    pub grad: T,
}

impl WithGrad<Tensor<f64>> {
    /// Wraps `value` with a zero gradient of the same shape.
    #[must_use]
    pub fn new(value: Tensor<f64>) -> Self {
        let grad = Tensor::zeros(value.shape.clone());
        Self { value, grad }
    }

    /// Resets the gradient to zero.
    pub fn zero_grad(&mut self) {
        self.grad.data.fill(0.0);
    }
}

/// Performs SGD update in-place: `param -= lr * grad`, resets gradient to 0.0.
pub fn sgd(w: &mut WithGrad<Tensor<f64>>, lr: f64) {
    for (w_i, g_i) in w.value.data.iter_mut().zip(&w.grad.data) {
        *w_i -= lr * *g_i;
    }
    w.zero_grad();
}
