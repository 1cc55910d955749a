//! Geometry resolution for 3-band convolutions.
//!
//! A convolution is described by three dimension triples `[x, y, band]`:
//! the input, the filter and the output. The output triple is derived from
//! the other two plus a [`Padding`] mode:
//!
//! - band axis: `output[2] = filter[2] / input[2]`; the filter packs
//!   `input_bands * output_bands` planes.
//! - spatial axes with [`Padding::Same`]: `output[i] = input[i]`.
//! - spatial axes with [`Padding::Explicit`]: `output[i] = 1 + input[i] - filter[i] + pad[i]`.
//!
//! All tensors are flat, with x varying fastest, then y, then band, then the
//! batch item.
//!
//! # Example
//!
//! ```rust
//! use briny_conv::geometry::{Geometry, Padding};
//!
//! let g = Geometry::new(&[8, 8, 7], &[3, 3, 21], Padding::Explicit { x: 0, y: 0 }).unwrap();
//! assert_eq!(g.output, [6, 6, 3]);
//! ```

use briny::prelude::*;

use crate::error::{BufferRole, ConvError, Result};

/// How the filter is placed relative to the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    /// Centred filter, output keeps the input's spatial size.
    ///
    /// The offset on each spatial axis is `(filter - 1) / 2`.
    #[default]
    Same,
    /// Explicit padding per spatial axis, used both to size the output and as
    /// the input/output coordinate offset.
    Explicit {
        /// Padding along x (width).
        x: i64,
        /// Padding along y (height).
        y: i64,
    },
}

/// The shift applied between output and input coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offset {
    /// Shift along x.
    pub x: isize,
    /// Shift along y.
    pub y: isize,
}

/// A fully resolved convolution geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Input dimensions `[x, y, band]`.
    pub input: [usize; 3],
    /// Filter dimensions `[x, y, input_bands * output_bands]`.
    pub filter: [usize; 3],
    /// Derived output dimensions.
    pub output: [usize; 3],
    /// Padding mode the geometry was resolved with.
    pub padding: Padding,
    /// Coordinate offset derived from `padding`.
    pub offset: Offset,
}

fn triple(role: BufferRole, dims: &[usize]) -> Result<[usize; 3]> {
    match dims {
        &[x, y, b] if x > 0 && y > 0 && b > 0 => Ok([x, y, b]),
        _ => Err(ConvError::InvalidDims {
            role,
            dims: dims.to_vec(),
        }),
    }
}

impl Geometry {
    /// Resolves the output dimensions for `input` convolved with `filter`.
    ///
    /// # Errors
    ///
    /// - [`ConvError::InvalidDims`] if either triple is not 3 positive entries
    /// - [`ConvError::BandMismatch`] if `filter[2]` is not a multiple of `input[2]`
    /// - [`ConvError::NonPositiveOutput`] if any output axis resolves to `<= 0`
    /// - [`ConvError::Overflow`] if the padding or any flat length leaves the
    ///   index range
    pub fn new(input: &[usize], filter: &[usize], padding: Padding) -> Result<Self> {
        let input = triple(BufferRole::Input, input)?;
        let filter = triple(BufferRole::Filter, filter)?;

        if filter[2] % input[2] != 0 {
            return Err(ConvError::BandMismatch {
                filter_bands: filter[2],
                input_bands: input[2],
            });
        }

        let overflow = || ConvError::Overflow {
            input,
            filter,
            padding,
        };
        let extent = |v: usize| i64::try_from(v).map_err(|_| overflow());

        let mut output = [0usize; 3];
        for (axis, out) in output.iter_mut().enumerate() {
            let size = match (axis, padding) {
                (2, _) => extent(filter[2] / input[2])?,
                (_, Padding::Same) => extent(input[axis])?,
                (_, Padding::Explicit { x, y }) => {
                    let pad = if axis == 0 { x } else { y };
                    extent(input[axis])?
                        .checked_sub(extent(filter[axis])?)
                        .and_then(|d| d.checked_add(1))
                        .and_then(|d| d.checked_add(pad))
                        .ok_or_else(overflow)?
                }
            };
            if size <= 0 {
                return Err(ConvError::NonPositiveOutput {
                    axis,
                    size,
                    input,
                    filter,
                });
            }
            *out = usize::try_from(size).map_err(|_| overflow())?;
        }

        // flat lengths are multiplied unchecked downstream
        for dims in [input, filter, output] {
            dims.iter()
                .try_fold(1usize, |acc, &d| acc.checked_mul(d))
                .filter(|&len| isize::try_from(len).is_ok())
                .ok_or_else(overflow)?;
        }

        let to_offset = |v: i64| isize::try_from(v).map_err(|_| overflow());
        let offset = match padding {
            Padding::Same => Offset {
                x: ((filter[0] - 1) / 2).cast_signed(),
                y: ((filter[1] - 1) / 2).cast_signed(),
            },
            Padding::Explicit { x, y } => Offset {
                x: to_offset(x)?,
                y: to_offset(y)?,
            },
        };

        Ok(Self {
            input,
            filter,
            output,
            padding,
            offset,
        })
    }

    /// Elements in one input tensor.
    #[must_use]
    pub const fn input_len(&self) -> usize {
        self.input[0] * self.input[1] * self.input[2]
    }

    /// Elements (taps) in the filter.
    #[must_use]
    pub const fn filter_len(&self) -> usize {
        self.filter[0] * self.filter[1] * self.filter[2]
    }

    /// Elements in one output tensor.
    #[must_use]
    pub const fn output_len(&self) -> usize {
        self.output[0] * self.output[1] * self.output[2]
    }
}

impl core::fmt::Display for Geometry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Convolve [{:?} x {:?} => {:?}]",
            self.input, self.filter, self.output
        )
    }
}

/// A geometry is valid when re-resolving its input, filter and padding
/// reproduces it exactly.
impl Validate for Geometry {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        match Self::new(&self.input, &self.filter, self.padding) {
            Ok(resolved) if resolved == *self => Ok(()),
            _ => Err(ValidationError),
        }
    }
}

/// Splits a flat index into `(c0, c1, c2, batch)` against `dims`.
#[inline]
pub(crate) const fn decompose(index: usize, dims: &[usize; 3]) -> (usize, usize, usize, usize) {
    let s0 = dims[0];
    let s1 = s0 * dims[1];
    let s2 = s1 * dims[2];
    (index % s0, index % s1 / s0, index % s2 / s1, index / s2)
}

/// Inverse of [`decompose`].
#[inline]
pub(crate) const fn flatten(c0: usize, c1: usize, c2: usize, batch: usize, dims: &[usize; 3]) -> usize {
    c0 + dims[0] * (c1 + dims[1] * (c2 + dims[2] * batch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_padding_keeps_spatial_size() {
        let g = Geometry::new(&[8, 8, 1], &[3, 3, 1], Padding::Same).unwrap();
        assert_eq!(g.output, [8, 8, 1]);
        assert_eq!(g.offset, Offset { x: 1, y: 1 });
    }

    #[test]
    fn explicit_padding_packs_output_bands() {
        let g = Geometry::new(&[8, 8, 7], &[3, 3, 21], Padding::Explicit { x: 0, y: 0 }).unwrap();
        assert_eq!(g.output, [6, 6, 3]);
        assert_eq!(g.offset, Offset { x: 0, y: 0 });
        assert_eq!(g.filter_len(), 189);
    }

    #[test]
    fn explicit_padding_is_per_axis() {
        let g = Geometry::new(&[10, 6, 1], &[5, 3, 2], Padding::Explicit { x: 2, y: 1 }).unwrap();
        assert_eq!(g.output, [8, 5, 2]);
        assert_eq!(g.offset, Offset { x: 2, y: 1 });
    }

    #[test]
    fn rejects_wrong_arity() {
        let err = Geometry::new(&[8, 8], &[3, 3, 1], Padding::Same).unwrap_err();
        assert!(matches!(err, ConvError::InvalidDims { role: BufferRole::Input, .. }));

        let err = Geometry::new(&[8, 8, 1], &[3, 3, 1, 1], Padding::Same).unwrap_err();
        assert!(matches!(err, ConvError::InvalidDims { role: BufferRole::Filter, .. }));
    }

    #[test]
    fn rejects_zero_dims() {
        assert!(Geometry::new(&[8, 0, 1], &[3, 3, 1], Padding::Same).is_err());
        assert!(Geometry::new(&[8, 8, 1], &[3, 3, 0], Padding::Same).is_err());
    }

    #[test]
    fn rejects_non_positive_output() {
        let err = Geometry::new(&[2, 8, 1], &[3, 3, 1], Padding::Explicit { x: 0, y: 0 }).unwrap_err();
        assert!(matches!(err, ConvError::NonPositiveOutput { axis: 0, size: 0, .. }));
    }

    #[test]
    fn extreme_padding_is_an_error() {
        for padding in [
            Padding::Explicit { x: i64::MAX, y: 0 },
            Padding::Explicit { x: 0, y: i64::MAX - 3 },
            Padding::Explicit { x: i64::MAX / 2, y: i64::MAX / 2 },
        ] {
            let err = Geometry::new(&[8, 8, 1], &[3, 3, 1], padding).unwrap_err();
            assert!(matches!(err, ConvError::Overflow { .. }), "{padding:?}: {err}");
        }

        let err = Geometry::new(&[8, 8, 1], &[3, 3, 1], Padding::Explicit { x: i64::MIN, y: 0 }).unwrap_err();
        assert!(matches!(err, ConvError::NonPositiveOutput { axis: 0, .. }));
    }

    #[test]
    fn rejects_band_remainder() {
        let err = Geometry::new(&[4, 4, 2], &[3, 3, 7], Padding::Same).unwrap_err();
        assert!(matches!(
            err,
            ConvError::BandMismatch {
                filter_bands: 7,
                input_bands: 2
            }
        ));
    }

    #[test]
    fn decompose_inverts_flatten() {
        let dims = [4, 3, 2];
        for i in 0..(4 * 3 * 2 * 3) {
            let (a, b, c, n) = decompose(i, &dims);
            assert_eq!(flatten(a, b, c, n, &dims), i);
        }
    }

    #[test]
    fn validate_detects_tampering() {
        let mut g = Geometry::new(&[5, 5, 2], &[3, 3, 4], Padding::Same).unwrap();
        assert!(g.validate().is_ok());
        g.offset.x = 0;
        assert!(g.validate().is_err());
    }

    #[test]
    fn display_reports_all_triples() {
        let g = Geometry::new(&[8, 8, 1], &[3, 3, 1], Padding::Same).unwrap();
        assert_eq!(g.to_string(), "Convolve [[8, 8, 1] x [3, 3, 1] => [8, 8, 1]]");
    }
}
