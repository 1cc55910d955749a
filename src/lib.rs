//! briny_conv: a batched 3-band convolution engine in Rust.
//!
//! Convolves batches of `[x, y, band]` tensors with a flat filter, and
//! computes both gradients a trainer needs: with respect to the input and
//! with respect to the filter.
//!
//! # Features
//!
//! - Output geometry derived from input and filter dimensions, with centred
//!   ("same") or explicit padding.
//! - Batches split into chunks under a transfer ceiling, with pooled scratch
//!   buffers reused across chunks and calls.
//! - One lock per kernel kind, so distinct passes may run concurrently.
//! - Pluggable executors: a `rayon` CPU backend and an opt-in `wgpu` backend.
//!
//! # Modules
//!
//! - [`geometry`]: Dimension triples, padding and output resolution.
//! - [`controller`]: The batch entry point: chunking, locking and dispatch.
//! - [`ops`]: The executor seam and its CPU and GPU kernels.
//! - [`pool`]: Reusable scratch buffers.
//! - [`backend`]: Global backend selection.
//! - [`tensors`] and [`layer`]: A small tensor type and a trainable layer on top.
//! - [`error`]: Error types.
//!
//! # Example
//!
//! ```rust
//! use briny_conv::{ConvolutionController, Padding};
//!
//! let c = ConvolutionController::new(&[8, 8, 7], &[3, 3, 21], Padding::Explicit { x: 0, y: 0 })?;
//! assert_eq!(c.output_dims(), [6, 6, 3]);
//!
//! let inputs = vec![vec![1.0; 8 * 8 * 7]; 2];
//! let mut outputs = vec![vec![0.0; 6 * 6 * 3]; 2];
//! c.convolve(&inputs, &vec![0.5; 3 * 3 * 21], &mut outputs)?;
//! # Ok::<(), briny_conv::ConvError>(())
//! ```

pub mod backend;
pub mod controller;
pub mod error;
pub mod geometry;
pub mod layer;
pub mod ops;
pub mod pool;
pub mod tensors;

pub use controller::{ChunkPlan, ControllerConfig, ConvolutionController, KernelKind, KernelStats};
pub use error::{ConvError, KernelError, Result};
pub use geometry::{Geometry, Padding};
