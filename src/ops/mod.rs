//! # Kernel Execution Layer
//!
//! This module holds the convolution kernels and the seam that lets the
//! controller run them on different compute backends.
//!
//! ## Submodules
//!
//! - [`dispatch`]: the [`Executor`](dispatch::Executor) trait and runtime backend selection
//! - [`cpu`]: multi-threaded reference kernels (default fallback backend)
//! - [`wgpu`] *(opt-in)*: WGSL compute shader pipelines using `wgpu`
//!
//! ## Backend Selection
//!
//! Controllers pick their executor from the global [`Backend`](crate::backend::Backend)
//! when they are built:
//!
//! ```rust
//! use briny_conv::backend::{set_backend, Backend};
//! use briny_conv::ops::dispatch::current_executor;
//!
//! set_backend(Backend::Cpu);
//! assert_eq!(current_executor().name(), "cpu");
//! ```
//!
//! ## Extending the Backend
//!
//! A new backend implements [`Executor`](dispatch::Executor) over whole chunks
//! and gets an arm in [`dispatch::executor_for`].
//!
//! ## Feature Flags
//!
//! - `wgpu`: Enables the `wgpu` (WebGPU) backend

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;
