//! The convolution controller: batching, scratch buffers and dispatch.
//!
//! [`ConvolutionController`] is the only entry point collaborators need. It
//! owns a resolved [`Geometry`], an [`Executor`] and a [`ScratchPool`], and
//! exposes the three batch operations:
//!
//! - [`convolve`](ConvolutionController::convolve): forward pass
//! - [`backprop`](ConvolutionController::backprop): gradient with respect to the input
//! - [`gradient`](ConvolutionController::gradient): gradient with respect to the filter,
//!   accumulated into the caller's buffer
//!
//! # Chunking
//!
//! A batch is copied into contiguous transfer buffers whose length never
//! exceeds the transfer ceiling. With `item_len` elements per item the
//! controller fits `min(ceiling / item_len, batch_len)` items per chunk and
//! runs the chunks one after another, the last one possibly shorter. Chunks
//! are shrunk further when the companion buffer (outputs, for the forward
//! and input-gradient passes) would exceed the executor's own limit.
//!
//! # Locking
//!
//! Each operation kind has its own lock around its execution context, so two
//! `convolve` calls on one controller never interleave, while a `convolve`
//! and a `gradient` may run side by side.
//!
//! # Example
//!
//! ```rust
//! use briny_conv::controller::ConvolutionController;
//! use briny_conv::geometry::Padding;
//!
//! let controller = ConvolutionController::new(&[3, 3, 1], &[3, 3, 1], Padding::Same).unwrap();
//! let mut impulse = vec![0.0; 9];
//! impulse[4] = 1.0;
//! let filter: Vec<f64> = (1..=9).map(f64::from).collect();
//! let mut outputs = vec![vec![0.0; 9]];
//!
//! controller.convolve(&[impulse], &filter, &mut outputs).unwrap();
//! assert_eq!(outputs[0], filter);
//! ```

use core::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use briny::prelude::Validate;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::error::{BufferRole, ConvError, KernelError, Result};
use crate::geometry::{Geometry, Padding};
use crate::ops::dispatch::{current_executor, Executor};
use crate::pool::{Scratch, ScratchPool};

/// Default transfer ceiling, in elements per contiguous chunk buffer.
pub const MAX_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// Default upper bound on weight-gradient shards.
pub const MAX_PARALLELISM: usize = 16;

/// Tunables for a [`ConvolutionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Largest chunk buffer, in elements.
    pub max_buffer_len: usize,
    /// Upper bound on the number of weight-gradient shards.
    pub max_parallelism: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_buffer_len: MAX_BUFFER_SIZE,
            max_parallelism: MAX_PARALLELISM,
        }
    }
}

impl ControllerConfig {
    /// Sets the transfer ceiling.
    #[must_use]
    pub const fn with_max_buffer_len(mut self, max_buffer_len: usize) -> Self {
        self.max_buffer_len = max_buffer_len;
        self
    }

    /// Sets the shard bound for the weight gradient.
    #[must_use]
    pub const fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }
}

/// How a batch is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    batch_len: usize,
    items_per_chunk: usize,
}

impl ChunkPlan {
    /// Plans `batch_len` items of `item_len` elements under `max_buffer_len`.
    ///
    /// An empty batch yields an empty plan.
    ///
    /// # Errors
    ///
    /// [`ConvError::Capacity`] if a single item does not fit.
    pub fn new(batch_len: usize, item_len: usize, max_buffer_len: usize) -> Result<Self> {
        if batch_len == 0 {
            return Ok(Self {
                batch_len,
                items_per_chunk: 0,
            });
        }
        let fit = max_buffer_len.checked_div(item_len).unwrap_or(0);
        if fit == 0 {
            return Err(ConvError::Capacity {
                item_len,
                max_buffer_len,
            });
        }
        Ok(Self {
            batch_len,
            items_per_chunk: fit.min(batch_len),
        })
    }

    /// Shrinks the plan so a companion buffer of `item_len` elements per item
    /// stays within `max_buffer_len`.
    ///
    /// # Errors
    ///
    /// [`ConvError::Capacity`] if a single companion item does not fit.
    pub fn bounded_by(self, item_len: usize, max_buffer_len: usize) -> Result<Self> {
        let limit = Self::new(self.batch_len, item_len, max_buffer_len)?;
        Ok(Self {
            batch_len: self.batch_len,
            items_per_chunk: self.items_per_chunk.min(limit.items_per_chunk),
        })
    }

    /// Items in every chunk but possibly the last.
    #[must_use]
    pub const fn items_per_chunk(&self) -> usize {
        self.items_per_chunk
    }

    /// Number of chunks.
    #[must_use]
    pub const fn chunk_count(&self) -> usize {
        match self.items_per_chunk {
            0 => 0,
            n => self.batch_len.div_ceil(n),
        }
    }

    /// Batch ranges, in order.
    pub fn chunks(&self) -> impl Iterator<Item = Range<usize>> + '_ {
        (0..self.chunk_count()).map(move |c| {
            let start = c * self.items_per_chunk;
            start..(start + self.items_per_chunk).min(self.batch_len)
        })
    }
}

/// The three kernel kinds, each with its own lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelKind {
    /// Forward convolution.
    Convolve,
    /// Input gradient.
    Backprop,
    /// Weight gradient.
    Gradient,
}

/// Counters kept inside each kernel's locked context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Completed calls.
    pub calls: u64,
    /// Chunks dispatched.
    pub chunks: u64,
    /// Batch items processed.
    pub items: u64,
}

#[derive(Debug, Default)]
struct KernelContext {
    stats: KernelStats,
}

impl KernelContext {
    fn record_chunk(&mut self, items: usize) {
        self.stats.chunks += 1;
        self.stats.items += items as u64;
    }
}

/// Batched convolution engine for one geometry.
pub struct ConvolutionController {
    geometry: Geometry,
    config: ControllerConfig,
    executor: Arc<dyn Executor>,
    pool: Arc<ScratchPool>,
    convolve_ctx: Mutex<KernelContext>,
    backprop_ctx: Mutex<KernelContext>,
    gradient_ctx: Mutex<KernelContext>,
}

impl core::fmt::Debug for ConvolutionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConvolutionController")
            .field("geometry", &self.geometry)
            .field("config", &self.config)
            .field("executor", &self.executor.name())
            .finish_non_exhaustive()
    }
}

impl core::fmt::Display for ConvolutionController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.geometry, f)
    }
}

fn lock(ctx: &Mutex<KernelContext>) -> MutexGuard<'_, KernelContext> {
    ctx.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Reuses the buffer in `slot` if it already has `len` elements, otherwise
/// swaps in a fresh lease (returning the old one to the pool).
fn lease<'s, 'p>(pool: &'p ScratchPool, slot: &'s mut Option<Scratch<'p>>, len: usize) -> &'s mut Scratch<'p> {
    if slot.as_ref().is_none_or(|s| s.len() != len) {
        *slot = Some(pool.obtain(len));
    }
    slot.get_or_insert_with(|| pool.obtain(len))
}

fn check_batch(inputs: usize, outputs: usize) -> Result<()> {
    if inputs != outputs {
        return Err(ConvError::BatchMismatch { inputs, outputs });
    }
    Ok(())
}

fn check_lengths(role: BufferRole, lens: impl Iterator<Item = usize>, expected: usize) -> Result<()> {
    for (index, got) in lens.enumerate() {
        if got != expected {
            return Err(ConvError::LengthMismatch {
                role,
                index,
                expected,
                got,
            });
        }
    }
    Ok(())
}

impl ConvolutionController {
    /// Resolves the geometry and binds the executor for the global backend.
    ///
    /// # Errors
    ///
    /// Any configuration error from [`Geometry::new`].
    pub fn new(input: &[usize], filter: &[usize], padding: Padding) -> Result<Self> {
        Self::with_config(input, filter, padding, ControllerConfig::default())
    }

    /// Like [`new`](Self::new), with explicit tunables.
    ///
    /// # Errors
    ///
    /// Any configuration error from [`Geometry::new`].
    pub fn with_config(input: &[usize], filter: &[usize], padding: Padding, config: ControllerConfig) -> Result<Self> {
        Self::from_geometry(Geometry::new(input, filter, padding)?, config)
    }

    /// Builds a controller around an already resolved geometry.
    ///
    /// # Errors
    ///
    /// [`ConvError::InconsistentGeometry`] if `geometry` does not match what
    /// [`Geometry::new`] derives from its input, filter and padding.
    pub fn from_geometry(geometry: Geometry, config: ControllerConfig) -> Result<Self> {
        geometry
            .validate()
            .map_err(|_| ConvError::InconsistentGeometry(geometry.to_string()))?;

        let executor: Arc<dyn Executor> = Arc::new(current_executor());
        debug!(%geometry, executor = executor.name(), "resolved convolution geometry");

        Ok(Self {
            geometry,
            config,
            executor,
            pool: ScratchPool::global(),
            convolve_ctx: Mutex::default(),
            backprop_ctx: Mutex::default(),
            gradient_ctx: Mutex::default(),
        })
    }

    /// Replaces the executor.
    #[must_use]
    pub fn with_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replaces the scratch pool.
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ScratchPool>) -> Self {
        self.pool = pool;
        self
    }

    /// The resolved geometry.
    #[must_use]
    pub const fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Output dimensions `[x, y, band]`.
    #[must_use]
    pub const fn output_dims(&self) -> [usize; 3] {
        self.geometry.output
    }

    /// The padding mode.
    #[must_use]
    pub const fn padding(&self) -> Padding {
        self.geometry.padding
    }

    /// Name of the bound executor.
    #[must_use]
    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    /// Effective transfer ceiling: the smaller of the configured and the
    /// executor's limit.
    #[must_use]
    pub fn max_buffer_len(&self) -> usize {
        self.config.max_buffer_len.min(self.executor.max_buffer_len())
    }

    /// Counters for one kernel kind.
    #[must_use]
    pub fn stats(&self, kind: KernelKind) -> KernelStats {
        lock(self.context(kind)).stats
    }

    const fn context(&self, kind: KernelKind) -> &Mutex<KernelContext> {
        match kind {
            KernelKind::Convolve => &self.convolve_ctx,
            KernelKind::Backprop => &self.backprop_ctx,
            KernelKind::Gradient => &self.gradient_ctx,
        }
    }

    fn fail(&self, source: KernelError) -> ConvError {
        ConvError::Execution {
            geometry: self.geometry.to_string(),
            source,
        }
    }

    fn check_filter(&self, len: usize) -> Result<()> {
        check_lengths(BufferRole::Filter, core::iter::once(len), self.geometry.filter_len())
    }

    /// Forward pass: fills every `outputs[n]` from `inputs[n]` and `filter`.
    ///
    /// # Errors
    ///
    /// - configuration errors for mismatched batch or buffer lengths
    /// - [`ConvError::Capacity`] if one input item exceeds the transfer ceiling,
    ///   or one output item exceeds the executor's buffer limit
    /// - [`ConvError::Execution`] if the executor fails on a chunk
    pub fn convolve<I, O>(&self, inputs: &[I], filter: &[f64], outputs: &mut [O]) -> Result<()>
    where
        I: AsRef<[f64]>,
        O: AsMut<[f64]>,
    {
        let g = &self.geometry;
        let (in_len, out_len) = (g.input_len(), g.output_len());
        check_batch(inputs.len(), outputs.len())?;
        self.check_filter(filter.len())?;
        check_lengths(BufferRole::Input, inputs.iter().map(|x| x.as_ref().len()), in_len)?;
        check_lengths(BufferRole::Output, outputs.iter_mut().map(|x| x.as_mut().len()), out_len)?;

        let plan = ChunkPlan::new(inputs.len(), in_len, self.max_buffer_len())?
            .bounded_by(out_len, self.executor.max_buffer_len())?;
        let mut ctx = lock(&self.convolve_ctx);
        debug!(geometry = %g, batch = inputs.len(), chunks = plan.chunk_count(), "convolve");

        let mut input_buf = None;
        let mut output_buf = None;
        for range in plan.chunks() {
            let items = range.len();
            let input_buf = lease(&self.pool, &mut input_buf, in_len * items);
            let output_buf = lease(&self.pool, &mut output_buf, out_len * items);

            for (dst, src) in input_buf.chunks_exact_mut(in_len).zip(&inputs[range.clone()]) {
                dst.copy_from_slice(src.as_ref());
            }
            trace!(chunk = ?range, "dispatching convolve");
            self.executor
                .convolve(g, input_buf, filter, output_buf)
                .map_err(|e| self.fail(e))?;
            for (src, dst) in output_buf.chunks_exact(out_len).zip(&mut outputs[range]) {
                dst.as_mut().copy_from_slice(src);
            }
            ctx.record_chunk(items);
        }
        ctx.stats.calls += 1;
        Ok(())
    }

    /// Input-gradient pass: fills every `input_grads[n]` from `output_errors[n]`
    /// and `filter`.
    ///
    /// # Errors
    ///
    /// - configuration errors for mismatched batch or buffer lengths
    /// - [`ConvError::Capacity`] if one input item exceeds the transfer ceiling,
    ///   or one output item exceeds the executor's buffer limit
    /// - [`ConvError::Execution`] if the executor fails on a chunk
    pub fn backprop<I, O>(&self, input_grads: &mut [I], filter: &[f64], output_errors: &[O]) -> Result<()>
    where
        I: AsMut<[f64]>,
        O: AsRef<[f64]>,
    {
        let g = &self.geometry;
        let (in_len, out_len) = (g.input_len(), g.output_len());
        check_batch(input_grads.len(), output_errors.len())?;
        self.check_filter(filter.len())?;
        check_lengths(BufferRole::Input, input_grads.iter_mut().map(|x| x.as_mut().len()), in_len)?;
        check_lengths(BufferRole::Output, output_errors.iter().map(|x| x.as_ref().len()), out_len)?;

        let plan = ChunkPlan::new(input_grads.len(), in_len, self.max_buffer_len())?
            .bounded_by(out_len, self.executor.max_buffer_len())?;
        let mut ctx = lock(&self.backprop_ctx);
        debug!(geometry = %g, batch = input_grads.len(), chunks = plan.chunk_count(), "backprop");

        let mut input_buf = None;
        let mut output_buf = None;
        for range in plan.chunks() {
            let items = range.len();
            let input_buf = lease(&self.pool, &mut input_buf, in_len * items);
            let output_buf = lease(&self.pool, &mut output_buf, out_len * items);

            for (dst, src) in output_buf.chunks_exact_mut(out_len).zip(&output_errors[range.clone()]) {
                dst.copy_from_slice(src.as_ref());
            }
            trace!(chunk = ?range, "dispatching backprop");
            self.executor
                .backprop(g, input_buf, filter, output_buf)
                .map_err(|e| self.fail(e))?;
            for (src, dst) in input_buf.chunks_exact(in_len).zip(&mut input_grads[range]) {
                dst.as_mut().copy_from_slice(src);
            }
            ctx.record_chunk(items);
        }
        ctx.stats.calls += 1;
        Ok(())
    }

    /// Weight-gradient pass: adds the filter gradient of every
    /// `(inputs[n], output_errors[n])` pair into `weight_grad`.
    ///
    /// `weight_grad` is accumulated into, never overwritten, so a batch may be
    /// fed in several calls.
    ///
    /// Partial sums are grouped per chunk, so splitting the same batch into
    /// different chunks (or calls) changes the floating-point summation order.
    /// The result then agrees only to within rounding, not bit for bit.
    ///
    /// # Errors
    ///
    /// - configuration errors for mismatched batch or buffer lengths
    /// - [`ConvError::Capacity`] if one item (input or output, whichever is
    ///   larger) exceeds the transfer ceiling, or the partial sums exceed the
    ///   executor's buffer limit
    /// - [`ConvError::Execution`] if the executor fails on a chunk
    pub fn gradient<I, O>(&self, inputs: &[I], weight_grad: &mut [f64], output_errors: &[O]) -> Result<()>
    where
        I: AsRef<[f64]>,
        O: AsRef<[f64]>,
    {
        let g = &self.geometry;
        let (in_len, out_len, weights) = (g.input_len(), g.output_len(), g.filter_len());
        check_batch(inputs.len(), output_errors.len())?;
        self.check_filter(weight_grad.len())?;
        check_lengths(BufferRole::Input, inputs.iter().map(|x| x.as_ref().len()), in_len)?;
        check_lengths(BufferRole::Output, output_errors.iter().map(|x| x.as_ref().len()), out_len)?;

        let plan = ChunkPlan::new(inputs.len(), in_len.max(out_len), self.max_buffer_len())?;
        let shards = self.config.max_parallelism.min(in_len).max(1);
        if weights.saturating_mul(shards) > self.executor.max_buffer_len() {
            return Err(ConvError::Capacity {
                item_len: weights.saturating_mul(shards),
                max_buffer_len: self.executor.max_buffer_len(),
            });
        }
        let mut ctx = lock(&self.gradient_ctx);
        debug!(geometry = %g, batch = inputs.len(), chunks = plan.chunk_count(), shards, "gradient");

        let mut input_buf = None;
        let mut output_buf = None;
        let mut partials = self.pool.obtain(weights * shards);
        for range in plan.chunks() {
            let items = range.len();
            let input_buf = lease(&self.pool, &mut input_buf, in_len * items);
            let output_buf = lease(&self.pool, &mut output_buf, out_len * items);

            for (dst, src) in input_buf.chunks_exact_mut(in_len).zip(&inputs[range.clone()]) {
                dst.copy_from_slice(src.as_ref());
            }
            for (dst, src) in output_buf.chunks_exact_mut(out_len).zip(&output_errors[range.clone()]) {
                dst.copy_from_slice(src.as_ref());
            }
            trace!(chunk = ?range, "dispatching gradient");
            self.executor
                .gradient(g, input_buf, &mut partials, output_buf)
                .map_err(|e| self.fail(e))?;

            let sums = &*partials;
            weight_grad.par_iter_mut().enumerate().for_each(|(k, w)| {
                *w += sums.iter().skip(k).step_by(weights).sum::<f64>();
            });
            ctx.record_chunk(items);
        }
        ctx.stats.calls += 1;
        Ok(())
    }
}
