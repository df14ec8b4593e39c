//! The convolution layer.
//!
//! A [`ConvLayer`] owns its validated [`ConvConfig`], the bound filter bank,
//! the backends it can dispatch to and the [`MemoryManager`] that accounts
//! for every scratch buffer. One call of [`ConvLayer::execute`] runs:
//!
//! ```text
//! check input → select backend → run (host or accelerator) → assemble output → check output
//! ```
//!
//! Scratch buffers are leases; they are released on every exit path before
//! `execute` returns. The output tensor is written once, only on success.

use crate::backend::{ExecPath, ExecPolicy, default_policy};
use crate::cancel::{CancelToken, Interrupt};
use crate::config::{ConvConfig, HyperParams};
use crate::error::{ConvError, Result};
use crate::memory::MemoryManager;
use crate::ops::cpu::HostBackend;
use crate::ops::device::{Accelerator, AcceleratorBackend};
use crate::ops::dispatch::{ConvBackend, ConvCall, select_backend};
use crate::shape::ConvGeometry;
use crate::tensors::Tensor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Span, debug, field, instrument};

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Overrides the layer's policy for this call.
    pub policy: Option<ExecPolicy>,
    pub cancel: Option<CancelToken>,
    /// Checked before each sample and before device synchronization.
    pub deadline: Option<Instant>,
}

impl ExecOptions {
    #[must_use]
    pub fn with_policy(policy: ExecPolicy) -> Self {
        Self {
            policy: Some(policy),
            ..Self::default()
        }
    }
}

/// What a successful call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecReport {
    pub path: ExecPath,
    /// Name of the backend that ran the call.
    pub backend: &'static str,
    pub batch: usize,
    /// Wall time of the whole call, validation included.
    pub elapsed: Duration,
    pub transform_elapsed: Duration,
    pub multiply_elapsed: Duration,
}

/// A forward-only 2-D convolution layer with valid padding and no bias.
pub struct ConvLayer {
    config: ConvConfig,
    weight: Option<Arc<Tensor<f32>>>,
    host: HostBackend,
    accelerator: Option<Arc<dyn ConvBackend>>,
    memory: MemoryManager,
}

impl ConvLayer {
    /// Type identifier under which a network loader registers this layer.
    pub const TYPE_NAME: &'static str = "Conv";
    pub const INPUT_SLOTS: usize = 1;
    pub const OUTPUT_SLOTS: usize = 1;
    pub const PARAM_SLOTS: usize = 1;

    /// Configures a layer from its option map.
    ///
    /// # Errors
    /// [`ConvError::Config`]; nothing is partially configured.
    pub fn setup(params: &HyperParams) -> Result<Self> {
        ConvConfig::from_params(params).map(Self::from_config)
    }

    #[must_use]
    pub fn from_config(config: ConvConfig) -> Self {
        let memory = if config.pooling {
            MemoryManager::pooled()
        } else {
            MemoryManager::new()
        };
        Self {
            config,
            weight: None,
            host: HostBackend,
            accelerator: None,
            memory,
        }
    }

    /// Binds the filter bank, `(out_channels, in_channels, kernel_h, kernel_w)`.
    pub fn set_weights(&mut self, weight: impl Into<Arc<Tensor<f32>>>) {
        self.weight = Some(weight.into());
    }

    /// Attaches an accelerator backend.
    #[must_use]
    pub fn with_accelerator(mut self, backend: Arc<dyn ConvBackend>) -> Self {
        self.accelerator = Some(backend);
        self
    }

    /// Attaches `device`, pooling its buffers if the layer is configured to.
    #[must_use]
    pub fn with_device<A: Accelerator + 'static>(self, device: A) -> Self {
        let backend = if self.config.pooling {
            AcceleratorBackend::pooled(device)
        } else {
            AcceleratorBackend::new(device)
        };
        self.with_accelerator(Arc::new(backend))
    }

    #[must_use]
    pub const fn config(&self) -> &ConvConfig {
        &self.config
    }

    #[must_use]
    pub const fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    #[must_use]
    pub fn weights(&self) -> Option<&Tensor<f32>> {
        self.weight.as_deref()
    }

    fn bound_weight(&self) -> Result<&Tensor<f32>> {
        self.weight
            .as_deref()
            .ok_or_else(|| ConvError::ShapeMismatch("no filter bank bound".into()))
    }

    /// Validates the bound tensors and derives the call geometry.
    ///
    /// # Errors
    /// [`ConvError::ShapeMismatch`] unless exactly one input and a filter
    /// bank are bound and their shapes combine under the layer's strides.
    pub fn check_input(&self, inputs: &[&Tensor<f32>]) -> Result<ConvGeometry> {
        let [input] = inputs else {
            return Err(ConvError::ShapeMismatch(format!(
                "expected {} input tensor, got {}",
                Self::INPUT_SLOTS,
                inputs.len()
            )));
        };
        let weight = self.bound_weight()?;
        ConvGeometry::from_shapes(input, weight, self.config.stride_h, self.config.stride_w)
    }

    /// Resolves the policy for one call: call options, then the layer's
    /// configuration, then the process-wide default.
    fn policy(&self, opts: &ExecOptions) -> ExecPolicy {
        opts.policy
            .or(self.config.policy)
            .unwrap_or_else(default_policy)
    }

    /// Convolves `inputs[0]` with the bound filter bank into `output`.
    ///
    /// On error `output` is left untouched and every scratch buffer has
    /// been released.
    ///
    /// # Errors
    /// Any [`ConvError`]; see its variants.
    #[instrument(
        skip_all,
        fields(layer = ConvLayer::TYPE_NAME, batch = field::Empty, path = field::Empty)
    )]
    pub fn execute(
        &self,
        inputs: &[&Tensor<f32>],
        output: &mut Tensor<f32>,
        opts: &ExecOptions,
    ) -> Result<ExecReport> {
        let start = Instant::now();
        let geom = self.check_input(inputs)?;
        let weight = self.bound_weight()?;
        debug!(shape = ?inputs[0].shape, "input blob");

        let backend = select_backend(
            self.policy(opts),
            &self.config.cost,
            &geom,
            &self.host,
            self.accelerator.as_deref(),
        );
        let span = Span::current();
        span.record("batch", geom.batch);
        span.record("path", field::display(backend.path()));

        let interrupt = Interrupt {
            token: opts.cancel.clone(),
            deadline: opts.deadline,
        };
        let mut dense = self.memory.alloc_host(geom.batch * geom.output_len())?;
        let call = ConvCall {
            geom: &geom,
            input: inputs[0].data(),
            weights: weight.data(),
            memory: &self.memory,
            interrupt: &interrupt,
        };
        let times = backend.run(&call, &mut dense)?;

        // Assembled aside so a failed check leaves `output` untouched.
        let [num, channels, height, width] = geom.output_dims();
        let mut assembled = Tensor::empty();
        assembled.copy_data(num, channels, height, width, &dense)?;
        drop(dense);
        geom.check_output(&assembled)?;
        *output = assembled;

        let report = ExecReport {
            path: backend.path(),
            backend: backend.name(),
            batch: geom.batch,
            elapsed: start.elapsed(),
            transform_elapsed: times.transform,
            multiply_elapsed: times.multiply,
        };
        debug!(shape = ?output.shape, "output blob");
        debug!(
            backend = report.backend,
            transform_ms = report.transform_elapsed.as_secs_f64() * 1e3,
            multiply_ms = report.multiply_elapsed.as_secs_f64() * 1e3,
            elapsed_ms = report.elapsed.as_secs_f64() * 1e3,
            "convolution finished"
        );
        Ok(report)
    }

    /// Convolves `input` with default options and returns a fresh tensor.
    ///
    /// # Errors
    /// As [`execute`](Self::execute).
    pub fn forward(&self, input: &Tensor<f32>) -> Result<Tensor<f32>> {
        let mut output = Tensor::empty();
        self.execute(&[input], &mut output, &ExecOptions::default())?;
        Ok(output)
    }
}
