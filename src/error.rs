//! Error types for geometry resolution, chunk planning and kernel execution.
//!
//! Failures fall into three groups:
//!
//! - **Configuration**: malformed dimension triples, non-positive output sizes,
//!   and buffers whose lengths disagree with the resolved geometry.
//! - **Capacity**: a single batch item does not fit in the transfer ceiling.
//! - **Execution**: anything an [`Executor`](crate::ops::dispatch::Executor)
//!   reports while running a chunk. The controller wraps these with its
//!   geometry so the failing configuration is visible in the message.
//!
//! None of these are retried; a failed call leaves its output buffers in an
//! unspecified state.

use thiserror::Error;

use crate::geometry::Padding;

/// Result alias used throughout the crate.
pub type Result<T, E = ConvError> = core::result::Result<T, E>;

/// Which side of a convolution a buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferRole {
    /// An input tensor (or the input gradient being produced).
    Input,
    /// The flat filter or its gradient accumulator.
    Filter,
    /// An output tensor (or the output error being consumed).
    Output,
}

impl core::fmt::Display for BufferRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Input => f.write_str("input"),
            Self::Filter => f.write_str("filter"),
            Self::Output => f.write_str("output"),
        }
    }
}

/// Component-level failure raised by the convolution engine.
#[derive(Debug, Error)]
pub enum ConvError {
    /// A dimension triple is not exactly three positive entries.
    #[error("invalid {role} dimensions {dims:?}: expected 3 positive entries")]
    InvalidDims {
        /// The triple's role.
        role: BufferRole,
        /// The offending dimensions.
        dims: Vec<usize>,
    },

    /// An output axis resolved to zero or a negative size.
    #[error("output axis {axis} resolves to {size} for input {input:?} and filter {filter:?}")]
    NonPositiveOutput {
        /// Axis index (0 = x, 1 = y, 2 = band).
        axis: usize,
        /// The resolved (non-positive) size.
        size: i64,
        /// Input dimensions.
        input: [usize; 3],
        /// Filter dimensions.
        filter: [usize; 3],
    },

    /// The padding or a flat buffer length does not fit the index range.
    #[error("padding {padding:?} with input {input:?} and filter {filter:?} overflows the index range")]
    Overflow {
        /// Input dimensions.
        input: [usize; 3],
        /// Filter dimensions.
        filter: [usize; 3],
        /// Requested padding.
        padding: Padding,
    },

    /// The filter's band extent is not a multiple of the input band count.
    #[error("filter bands {filter_bands} are not a multiple of input bands {input_bands}")]
    BandMismatch {
        /// `filter[2]`.
        filter_bands: usize,
        /// `input[2]`.
        input_bands: usize,
    },

    /// A hand-built geometry disagrees with the one its triples resolve to.
    #[error("inconsistent geometry {0}")]
    InconsistentGeometry(String),

    /// A tensor's data does not fill its shape exactly.
    #[error("shape {shape:?} is incompatible with {len} data elements")]
    TensorShape {
        /// The requested shape.
        shape: Vec<usize>,
        /// Number of data elements supplied.
        len: usize,
    },

    /// A batch mixes tensors of different shapes.
    #[error("tensor {index} has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        /// Position in the batch.
        index: usize,
        /// Shape of the first tensor.
        expected: Vec<usize>,
        /// Shape of the offending tensor.
        got: Vec<usize>,
    },

    /// Input and output batches have different lengths.
    #[error("batch length mismatch: {inputs} inputs vs {outputs} outputs")]
    BatchMismatch {
        /// Number of input items.
        inputs: usize,
        /// Number of output items.
        outputs: usize,
    },

    /// A flat buffer's length does not match the resolved geometry.
    #[error("{role} buffer {index} has length {got}, expected {expected}")]
    LengthMismatch {
        /// Which buffer kind.
        role: BufferRole,
        /// Position in the batch (0 for the filter).
        index: usize,
        /// Length required by the geometry.
        expected: usize,
        /// Length supplied.
        got: usize,
    },

    /// Centred ("simple") filters need odd spatial extents.
    #[error("simple filters must have odd width and height, got {width}x{height}")]
    OddKernelRequired {
        /// Filter width.
        width: usize,
        /// Filter height.
        height: usize,
    },

    /// One batch item alone exceeds the transfer ceiling.
    #[error("requested buffer of {item_len} elements per item is over the max of {max_buffer_len}")]
    Capacity {
        /// Per-item element count used for chunk sizing.
        item_len: usize,
        /// The effective transfer ceiling.
        max_buffer_len: usize,
    },

    /// A chunk failed while transferring or computing.
    #[error("error applying {geometry}: {source}")]
    Execution {
        /// `Display` of the controller's geometry.
        geometry: String,
        /// The executor-level cause.
        #[source]
        source: KernelError,
    },
}

/// Failure reported by an executor while running one chunk.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A chunk buffer has a length the kernel cannot work with.
    #[error("{what} buffer has length {got}, expected {expected}")]
    BufferLength {
        /// Buffer name.
        what: &'static str,
        /// Expected length.
        expected: usize,
        /// Supplied length.
        got: usize,
    },

    /// The chunk is too large for the device's index space.
    #[error("{len} invocations exceed the device index range")]
    TooLarge {
        /// Number of work items requested.
        len: usize,
    },

    /// A device-level failure (adapter, device, mapping, polling).
    #[error("device failure: {0}")]
    Device(String),
}
