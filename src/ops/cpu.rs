//! Parallel CPU backend convolution kernels
//!
//! # CPU Backend
//!
//! This module provides the reference implementations of the three
//! convolution kernels. It is the default executor, used whenever the GPU
//! backend is disabled or unavailable.
//!
//! ## Features
//!
//! - Parallel execution using [`rayon`](https://docs.rs/rayon)
//! - One independent task per output element (forward), input element
//!   (input gradient) and `(tap, shard)` pair (weight gradient), so no task
//!   ever writes where another reads
//! - Zero-weight taps and zero-valued inputs are skipped
//!
//! ## Implemented Kernels
//!
//! - `convolve`: weighted sum over filter taps of input elements
//! - `backprop`: weighted sum over filter taps of output-error elements
//! - `gradient`: per-tap partial sums of `input * output_error`, sharded by
//!   input index residue
//!
//! ## Design Goals
//!
//! - Deterministic results: each element sums its taps in ascending order
//! - Same index arithmetic as the GPU shaders

use rayon::prelude::*;

use super::dispatch::Executor;
use crate::error::KernelError;
use crate::geometry::{decompose, flatten, Geometry};

/// Multi-threaded CPU executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuExecutor;

/// Returns `value` as an index if it lies in `[0, limit)`.
#[inline]
fn within(value: isize, limit: usize) -> Option<usize> {
    usize::try_from(value).ok().filter(|&v| v < limit)
}

/// Output coordinate reached from input `(i0, i1, i2)` through tap `(k0, k1, k2)`.
#[inline]
fn output_for(g: &Geometry, i: (usize, usize, usize), k: (usize, usize, usize)) -> Option<(usize, usize, usize)> {
    let (i0, i1, i2) = i;
    let (k0, k1, k2) = k;
    let o2 = k2.checked_sub(i2 * g.output[2]).filter(|&o2| o2 < g.output[2])?;
    let o1 = within(i1 as isize + k1 as isize - g.offset.y, g.output[1])?;
    let o0 = within(i0 as isize + k0 as isize - g.offset.x, g.output[0])?;
    Some((o0, o1, o2))
}

/// Input coordinate read by output `(o0, o1, o2)` through tap `(k0, k1, k2)`.
#[inline]
fn input_for(g: &Geometry, o: (usize, usize, usize), k: (usize, usize, usize)) -> Option<(usize, usize, usize)> {
    let (o0, o1, o2) = o;
    let (k0, k1, k2) = k;
    let x = k2.checked_sub(o2)?;
    if x % g.output[2] != 0 {
        return None;
    }
    let i2 = x / g.output[2];
    if i2 >= g.input[2] {
        return None;
    }
    let i0 = within(o0 as isize - k0 as isize + g.offset.x, g.input[0])?;
    let i1 = within(o1 as isize - k1 as isize + g.offset.y, g.input[1])?;
    Some((i0, i1, i2))
}

pub(crate) fn convolve_at(g: &Geometry, input: &[f64], filter: &[f64], o: usize) -> f64 {
    let (o0, o1, o2, batch) = decompose(o, &g.output);
    let mut accum = 0.0;
    for (k, &w) in filter.iter().enumerate() {
        if w == 0.0 {
            continue;
        }
        let (k0, k1, k2, _) = decompose(k, &g.filter);
        if let Some((i0, i1, i2)) = input_for(g, (o0, o1, o2), (k0, k1, k2)) {
            accum += input[flatten(i0, i1, i2, batch, &g.input)] * w;
        }
    }
    accum
}

pub(crate) fn backprop_at(g: &Geometry, filter: &[f64], output: &[f64], i: usize) -> f64 {
    let (i0, i1, i2, batch) = decompose(i, &g.input);
    let mut accum = 0.0;
    for (k, &w) in filter.iter().enumerate() {
        if w == 0.0 {
            continue;
        }
        let (k0, k1, k2, _) = decompose(k, &g.filter);
        if let Some((o0, o1, o2)) = output_for(g, (i0, i1, i2), (k0, k1, k2)) {
            accum += output[flatten(o0, o1, o2, batch, &g.output)] * w;
        }
    }
    accum
}

pub(crate) fn gradient_at(g: &Geometry, input: &[f64], output: &[f64], shards: usize, j: usize) -> f64 {
    let weights = g.filter_len();
    let (k, shard) = (j % weights, j / weights);
    let (k0, k1, k2, _) = decompose(k, &g.filter);
    let mut accum = 0.0;
    for i in (shard..input.len()).step_by(shards) {
        let x = input[i];
        if x == 0.0 {
            continue;
        }
        let (i0, i1, i2, batch) = decompose(i, &g.input);
        if let Some((o0, o1, o2)) = output_for(g, (i0, i1, i2), (k0, k1, k2)) {
            accum += x * output[flatten(o0, o1, o2, batch, &g.output)];
        }
    }
    accum
}

/// Checks that `input` and `output` hold the same whole number of items.
///
/// Returns the number of items in the chunk.
pub(crate) fn chunk_items(g: &Geometry, input: usize, output: usize, filter: usize) -> Result<usize, KernelError> {
    if filter != g.filter_len() {
        return Err(KernelError::BufferLength {
            what: "filter",
            expected: g.filter_len(),
            got: filter,
        });
    }
    let items = input / g.input_len();
    if input % g.input_len() != 0 {
        return Err(KernelError::BufferLength {
            what: "input",
            expected: (items + 1) * g.input_len(),
            got: input,
        });
    }
    if output != items * g.output_len() {
        return Err(KernelError::BufferLength {
            what: "output",
            expected: items * g.output_len(),
            got: output,
        });
    }
    Ok(items)
}

/// Checks the partial-sum buffer and returns its shard count.
pub(crate) fn shard_count(g: &Geometry, partials: usize) -> Result<usize, KernelError> {
    let weights = g.filter_len();
    if partials == 0 || partials % weights != 0 {
        return Err(KernelError::BufferLength {
            what: "partials",
            expected: weights * (partials / weights).max(1),
            got: partials,
        });
    }
    Ok(partials / weights)
}

impl Executor for CpuExecutor {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn convolve(
        &self,
        geometry: &Geometry,
        input: &[f64],
        filter: &[f64],
        output: &mut [f64],
    ) -> Result<(), KernelError> {
        chunk_items(geometry, input.len(), output.len(), filter.len())?;
        output
            .par_iter_mut()
            .enumerate()
            .for_each(|(o, out)| *out = convolve_at(geometry, input, filter, o));
        Ok(())
    }

    fn backprop(
        &self,
        geometry: &Geometry,
        input: &mut [f64],
        filter: &[f64],
        output: &[f64],
    ) -> Result<(), KernelError> {
        chunk_items(geometry, input.len(), output.len(), filter.len())?;
        input
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, x)| *x = backprop_at(geometry, filter, output, i));
        Ok(())
    }

    fn gradient(
        &self,
        geometry: &Geometry,
        input: &[f64],
        partials: &mut [f64],
        output: &[f64],
    ) -> Result<(), KernelError> {
        let shards = shard_count(geometry, partials.len())?;
        chunk_items(geometry, input.len(), output.len(), geometry.filter_len())?;
        partials
            .par_iter_mut()
            .enumerate()
            .for_each(|(j, p)| *p = gradient_at(geometry, input, output, shards, j));
        Ok(())
    }
}
