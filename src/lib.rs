//! briny_conv: the forward engine of a 2-D convolution layer.
//!
//! Turns a `(batch, channels, height, width)` feature map and an
//! `(out_channels, in_channels, kernel_h, kernel_w)` filter bank into an
//! output feature map, either on the host (im2col + parallel GEMM) or on an
//! accelerator (direct in-kernel indexing), with numerically equivalent
//! results on both paths.
//!
//! # Features
//!
//! - Valid-padding convolution with independent vertical and horizontal strides.
//! - Pluggable execution: `Host`, `Accelerator` or `Auto` per call, per layer
//!   or process-wide.
//! - Scoped scratch buffers: every allocation is released on every exit path,
//!   with optional exact-size pooling.
//! - Recoverable errors for out-of-memory and device failures; cooperative
//!   cancellation and deadlines.
//!
//! # Modules
//!
//! - [`layer`]: the [`ConvLayer`] facade.
//! - [`config`]: option map and validated layer configuration.
//! - [`backend`]: execution policy and cost model.
//! - [`shape`]: input validation and derived geometry.
//! - [`ops`]: im2col, host GEMM, accelerator backends and dispatch.
//! - [`memory`]: leases, pools and allocation accounting.
//! - [`tensors`]: the tensor type consumed and produced by the layer.
//!
//! # Example
//!
//! ```rust
//! use briny_conv::{ConvLayer, HyperParams, tensors::Tensor};
//!
//! let params: HyperParams = "stride=1".parse()?;
//! let mut layer = ConvLayer::setup(&params)?;
//! layer.set_weights(Tensor::filled(vec![1, 1, 3, 3], 1.0));
//!
//! let input = Tensor::new(vec![1, 1, 5, 5], (0..25).map(|v| v as f32).collect());
//! let output = layer.forward(&input)?;
//! assert_eq!(output.shape, vec![1, 1, 3, 3]);
//! assert_eq!(output.data[0], 54.0);
//! # Ok::<(), briny_conv::ConvError>(())
//! ```

pub mod approx;
pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod layer;
pub mod memory;
pub mod ops;
pub mod shape;
pub mod tensors;

pub use backend::{CostModel, ExecPath, ExecPolicy};
pub use cancel::CancelToken;
pub use config::{ConvConfig, HyperParams, Param};
pub use error::{ConvError, Result};
pub use layer::{ConvLayer, ExecOptions, ExecReport};
pub use ops::emulated::EmulatedAccelerator;
