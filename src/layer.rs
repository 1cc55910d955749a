//! A trainable convolution layer over batches of 3-band tensors.
//!
//! [`ConvolutionLayer`] owns a kernel tensor `[width, height, input_bands *
//! output_bands]` together with its gradient, and runs every pass through a
//! [`ConvolutionController`] built for the incoming input shape. Controllers
//! are cached per input shape, so repeated batches of the same size reuse
//! their scratch buffers.
//!
//! ```rust
//! use briny_conv::layer::ConvolutionLayer;
//! use briny_conv::tensors::Tensor;
//!
//! let mut layer = ConvolutionLayer::new(3, 3, 1, 1, true).unwrap();
//! layer.set_weights(|| 1.0);
//!
//! let input = Tensor::new(vec![4, 4, 1], vec![1.0; 16]).unwrap();
//! let out = layer.forward(&[input]).unwrap();
//! assert_eq!(out[0].shape, vec![4, 4, 1]);
//! assert_eq!(out[0].get(&[1, 1, 0]), Some(&9.0));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::controller::{ControllerConfig, ConvolutionController};
use crate::error::{BufferRole, ConvError, Result};
use crate::geometry::{decompose, Padding};
use crate::tensors::{sgd, Tensor, WithGrad};

/// Convolution layer with a trainable kernel.
#[derive(Debug)]
pub struct ConvolutionLayer {
    kernel: WithGrad<Tensor<f64>>,
    padding: Padding,
    frozen: bool,
    config: ControllerConfig,
    controllers: Mutex<HashMap<Vec<usize>, Arc<ConvolutionController>>>,
}

/// Checks that every tensor in `batch` has the shape of the first one.
fn common_shape(batch: &[Tensor<f64>]) -> Result<Option<&[usize]>> {
    let Some(first) = batch.first() else {
        return Ok(None);
    };
    for (index, t) in batch.iter().enumerate().skip(1) {
        if t.shape != first.shape {
            return Err(ConvError::ShapeMismatch {
                index,
                expected: first.shape.clone(),
                got: t.shape.clone(),
            });
        }
    }
    Ok(Some(&first.shape))
}

impl ConvolutionLayer {
    /// Creates a layer with a zero kernel of `width x height` taps mapping
    /// `input_bands` to `output_bands`.
    ///
    /// A `simple` layer centres the kernel and keeps the input's spatial
    /// size, which needs odd `width` and `height`. Otherwise the kernel is
    /// applied without padding and the output shrinks by `width - 1` and
    /// `height - 1`.
    ///
    /// # Errors
    ///
    /// - [`ConvError::InvalidDims`] if any extent is zero
    /// - [`ConvError::OddKernelRequired`] for an even `simple` kernel
    pub fn new(width: usize, height: usize, input_bands: usize, output_bands: usize, simple: bool) -> Result<Self> {
        let dims = [width, height, input_bands * output_bands];
        if dims.contains(&0) {
            return Err(ConvError::InvalidDims {
                role: BufferRole::Filter,
                dims: vec![width, height, input_bands, output_bands],
            });
        }
        if simple && (width % 2 == 0 || height % 2 == 0) {
            return Err(ConvError::OddKernelRequired { width, height });
        }
        let padding = if simple {
            Padding::Same
        } else {
            Padding::Explicit { x: 0, y: 0 }
        };

        Ok(Self {
            kernel: WithGrad::new(Tensor::zeros(dims.to_vec())),
            padding,
            frozen: false,
            config: ControllerConfig::default(),
            controllers: Mutex::default(),
        })
    }

    /// Overrides the padding mode.
    #[must_use]
    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self.clear_controllers();
        self
    }

    /// Overrides the controller tunables.
    #[must_use]
    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self.clear_controllers();
        self
    }

    fn clear_controllers(&mut self) {
        self.controllers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The kernel weights.
    #[must_use]
    pub const fn kernel(&self) -> &Tensor<f64> {
        &self.kernel.value
    }

    /// The accumulated kernel gradient.
    #[must_use]
    pub const fn kernel_grad(&self) -> &Tensor<f64> {
        &self.kernel.grad
    }

    /// The padding mode.
    #[must_use]
    pub const fn padding(&self) -> Padding {
        self.padding
    }

    /// Fills the kernel from a generator, in flat order.
    pub fn set_weights(&mut self, mut f: impl FnMut() -> f64) -> &mut Self {
        self.kernel.value.data.iter_mut().for_each(|w| *w = f());
        self
    }

    /// Fills the kernel from a function of the tap coordinate `[x, y, band]`.
    pub fn set_weights_by_coord(&mut self, mut f: impl FnMut([usize; 3]) -> f64) -> &mut Self {
        let dims = [
            self.kernel.value.shape[0],
            self.kernel.value.shape[1],
            self.kernel.value.shape[2],
        ];
        for (k, w) in self.kernel.value.data.iter_mut().enumerate() {
            let (x, y, b, _) = decompose(k, &dims);
            *w = f([x, y, b]);
        }
        self
    }

    /// Stops [`backward`](Self::backward) from accumulating kernel gradients.
    pub fn freeze(&mut self) -> &mut Self {
        self.frozen = true;
        self
    }

    /// Re-enables kernel gradient accumulation.
    pub fn unfreeze(&mut self) -> &mut Self {
        self.frozen = false;
        self
    }

    /// Whether the kernel is frozen.
    #[must_use]
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The controller for inputs of shape `input`, built on first use.
    ///
    /// # Errors
    ///
    /// Any geometry error for this input shape.
    pub fn controller(&self, input: &[usize]) -> Result<Arc<ConvolutionController>> {
        let mut controllers = self.controllers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = controllers.get(input) {
            return Ok(Arc::clone(c));
        }
        let c = Arc::new(ConvolutionController::with_config(
            input,
            &self.kernel.value.shape,
            self.padding,
            self.config,
        )?);
        debug!(geometry = %c, "built layer controller");
        controllers.insert(input.to_vec(), Arc::clone(&c));
        Ok(c)
    }

    /// Output shape for inputs of shape `input`.
    ///
    /// # Errors
    ///
    /// Any geometry error for this input shape.
    pub fn output_dims(&self, input: &[usize]) -> Result<[usize; 3]> {
        Ok(self.controller(input)?.output_dims())
    }

    /// Convolves every tensor in `batch` with the kernel.
    ///
    /// # Errors
    ///
    /// [`ConvError::ShapeMismatch`] if the batch mixes shapes, or any
    /// controller error.
    pub fn forward(&self, batch: &[Tensor<f64>]) -> Result<Vec<Tensor<f64>>> {
        let Some(shape) = common_shape(batch)? else {
            return Ok(Vec::new());
        };
        let controller = self.controller(shape)?;
        let out_dims = controller.output_dims().to_vec();
        let mut outputs = vec![Tensor::zeros(out_dims); batch.len()];
        controller.convolve(batch, &self.kernel.value.data, &mut outputs)?;
        Ok(outputs)
    }

    /// Backward pass for a batch previously fed to [`forward`](Self::forward).
    ///
    /// Unless the layer is frozen, the kernel gradient of the batch is added
    /// into [`kernel_grad`](Self::kernel_grad). Returns the input gradient
    /// for every item.
    ///
    /// # Errors
    ///
    /// - [`ConvError::BatchMismatch`] if the batches differ in length
    /// - [`ConvError::ShapeMismatch`] if either batch mixes shapes, or the
    ///   errors are not shaped like this layer's output
    /// - any controller error
    pub fn backward(&mut self, inputs: &[Tensor<f64>], errors: &[Tensor<f64>]) -> Result<Vec<Tensor<f64>>> {
        if inputs.len() != errors.len() {
            return Err(ConvError::BatchMismatch {
                inputs: inputs.len(),
                outputs: errors.len(),
            });
        }
        let Some(shape) = common_shape(inputs)? else {
            return Ok(Vec::new());
        };
        let controller = self.controller(shape)?;
        let expected = controller.output_dims();
        if let Some(got) = common_shape(errors)?.filter(|got| *got != expected) {
            return Err(ConvError::ShapeMismatch {
                index: 0,
                expected: expected.to_vec(),
                got: got.to_vec(),
            });
        }

        if !self.frozen {
            controller.gradient(inputs, &mut self.kernel.grad.data, errors)?;
        }

        let mut input_grads = vec![Tensor::zeros(shape.to_vec()); inputs.len()];
        controller.backprop(&mut input_grads, &self.kernel.value.data, errors)?;
        Ok(input_grads)
    }

    /// Applies `kernel -= lr * grad` and clears the gradient.
    pub fn sgd(&mut self, lr: f64) {
        sgd(&mut self.kernel, lr);
    }
}
