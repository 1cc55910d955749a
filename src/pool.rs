//! Size-keyed pool of reusable `f64` scratch buffers.
//!
//! Chunk buffers are large and a training loop asks for the same handful of
//! sizes over and over. [`ScratchPool`] keeps released buffers on a free list
//! per exact length so the next chunk of that size reuses the allocation.
//!
//! Buffers are leased as [`Scratch`] guards and go back to the pool when the
//! guard drops, on both the success and the error path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Buffers retained per length before extra releases are simply freed.
pub const DEFAULT_MAX_PER_SIZE: usize = 4;

lazy_static::lazy_static! {
    static ref GLOBAL_POOL: Arc<ScratchPool> = Arc::new(ScratchPool::new(DEFAULT_MAX_PER_SIZE));
}

/// Thread-safe free list of `f64` buffers keyed by length.
#[derive(Debug)]
pub struct ScratchPool {
    free: Mutex<HashMap<usize, Vec<Vec<f64>>>>,
    max_per_size: usize,
}

impl ScratchPool {
    /// Creates an empty pool keeping at most `max_per_size` buffers per length.
    #[must_use]
    pub fn new(max_per_size: usize) -> Self {
        Self {
            free: Mutex::new(HashMap::new()),
            max_per_size,
        }
    }

    /// The process-wide pool shared by controllers that do not bring their own.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_POOL)
    }

    /// Leases a zeroed buffer of exactly `len` elements.
    pub fn obtain(&self, len: usize) -> Scratch<'_> {
        let reused = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&len)
            .and_then(Vec::pop);

        let data = match reused {
            Some(mut data) => {
                data.fill(0.0);
                data
            }
            None => vec![0.0; len],
        };
        Scratch { pool: self, data }
    }

    /// Returns a buffer to its free list, or drops it if the list is full.
    pub fn recycle(&self, data: Vec<f64>) {
        if data.is_empty() {
            return;
        }
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        let list = free.entry(data.len()).or_default();
        if list.len() < self.max_per_size {
            list.push(data);
        }
    }

    /// Number of idle buffers of length `len`.
    #[must_use]
    pub fn idle(&self, len: usize) -> usize {
        self.free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&len)
            .map_or(0, Vec::len)
    }

    /// Frees every idle buffer.
    pub fn clear(&self) {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for ScratchPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PER_SIZE)
    }
}

/// A leased buffer; returns itself to its pool on drop.
#[derive(Debug)]
pub struct Scratch<'a> {
    pool: &'a ScratchPool,
    data: Vec<f64>,
}

impl core::ops::Deref for Scratch<'_> {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.data
    }
}

impl core::ops::DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        self.pool.recycle(core::mem::take(&mut self.data));
    }
}
