//! Backend selection module.
//!
//! This module defines the available computation backends for the
//! convolution kernels and provides functions to set and get the current
//! backend.
//!
//! # Supported Backends
//!
//! - `Cpu`: Pure Rust backend using `rayon` (default).
//! - `Wgpu`: GPU compute shaders using `wgpu` (requires the `wgpu` feature).
//!
//! The backend is stored globally using an `AtomicU8`. Controllers built with
//! [`ConvolutionController::new`](crate::controller::ConvolutionController::new)
//! resolve their executor from it once, at construction.

use core::convert::TryFrom;
use core::sync::atomic::{AtomicU8, Ordering};

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Backend {
    /// Pure CPU-based backend (default).
    #[default]
    Cpu = 0,
    /// GPU-accelerated backend using `wgpu`.
    Wgpu,
}

impl TryFrom<u8> for Backend {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            _ => Err(()),
        }
    }
}

static GLOBAL_DEFAULT_BACKEND: AtomicU8 = AtomicU8::new(Backend::Cpu as u8);

/// Sets the active backend for controllers created afterwards.
///
/// # Example
///
/// ```
/// use briny_conv::backend::{get_backend, set_backend, Backend};
/// set_backend(Backend::Cpu);
/// assert_eq!(get_backend(), Backend::Cpu);
/// ```
pub fn set_backend(b: Backend) {
    GLOBAL_DEFAULT_BACKEND.store(b as u8, Ordering::Release);
}

/// Returns the currently active computation backend.
///
/// If the stored value is invalid, defaults to [`Backend::Cpu`].
pub fn get_backend() -> Backend {
    Backend::try_from(GLOBAL_DEFAULT_BACKEND.load(Ordering::Acquire)).unwrap_or_default()
}
