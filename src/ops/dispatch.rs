//! Executor Dispatch Layer
//!
//! This module defines the [`Executor`] seam between the controller and the
//! compute backends, and selects an executor at runtime based on the global
//! [`Backend`].
//!
//! Selection attempts backend-specific executors in priority order:
//! 1. `Wgpu` (if the `wgpu` feature is enabled and a device is available)
//! 2. Falls back to `Cpu`
//!
//! # Contract
//!
//! Every executor receives whole chunks: contiguous buffers holding
//! `items` batch items back to back, each laid out x-fastest. Executors must
//! honor the same index arithmetic; any that do are interchangeable.

use crate::backend::{get_backend, Backend};
use crate::error::KernelError;
use crate::geometry::Geometry;

use super::cpu::CpuExecutor;

/// A backend able to run the three convolution kernels over one chunk.
pub trait Executor: Send + Sync {
    /// Short backend name, used in logs.
    fn name(&self) -> &'static str;

    /// Largest contiguous buffer (in elements) this executor accepts.
    ///
    /// The controller never builds a chunk larger than this.
    fn max_buffer_len(&self) -> usize {
        usize::MAX
    }

    /// Forward pass: fills `output` (a chunk of output tensors) from `input`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] if the chunk cannot be transferred or computed.
    fn convolve(
        &self,
        geometry: &Geometry,
        input: &[f64],
        filter: &[f64],
        output: &mut [f64],
    ) -> Result<(), KernelError>;

    /// Input-gradient pass: fills `input` from the chunk of output errors.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] if the chunk cannot be transferred or computed.
    fn backprop(
        &self,
        geometry: &Geometry,
        input: &mut [f64],
        filter: &[f64],
        output: &[f64],
    ) -> Result<(), KernelError>;

    /// Weight-gradient pass: writes one partial sum per `(tap, shard)` into
    /// `partials[tap + filter_len * shard]`, with `partials.len() / filter_len`
    /// shards.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] if the chunk cannot be transferred or computed.
    fn gradient(
        &self,
        geometry: &Geometry,
        input: &[f64],
        partials: &mut [f64],
        output: &[f64],
    ) -> Result<(), KernelError>;
}

/// Lets a borrowed executor, such as `&'static dyn Executor`, sit behind an `Arc`.
impl<E: Executor + ?Sized> Executor for &E {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn max_buffer_len(&self) -> usize {
        (**self).max_buffer_len()
    }

    fn convolve(&self, g: &Geometry, input: &[f64], filter: &[f64], output: &mut [f64]) -> Result<(), KernelError> {
        (**self).convolve(g, input, filter, output)
    }

    fn backprop(&self, g: &Geometry, input: &mut [f64], filter: &[f64], output: &[f64]) -> Result<(), KernelError> {
        (**self).backprop(g, input, filter, output)
    }

    fn gradient(&self, g: &Geometry, input: &[f64], partials: &mut [f64], output: &[f64]) -> Result<(), KernelError> {
        (**self).gradient(g, input, partials, output)
    }
}

static CPU: CpuExecutor = CpuExecutor;

/// Returns the executor for the currently selected global backend.
///
/// # Behavior
///
/// Attempts WGPU, then CPU, depending on availability and features.
#[must_use]
pub fn current_executor() -> &'static dyn Executor {
    executor_for(get_backend())
}

/// Returns the executor for `backend`, falling back to the CPU.
#[must_use]
pub fn executor_for(backend: Backend) -> &'static dyn Executor {
    match backend {
        Backend::Wgpu => {
            #[cfg(feature = "wgpu")]
            {
                if let Some(executor) = super::wgpu::shared() {
                    return executor;
                }
            }
            tracing::warn!("wgpu backend requested but unavailable; falling back to cpu");
        }
        Backend::Cpu => {}
    }

    &CPU
}
