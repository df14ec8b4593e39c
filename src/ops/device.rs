//! Accelerator execution path.
//!
//! An [`Accelerator`] is a co-processor with its own memory. The engine
//! never hands it host pointers: inputs are copied in, the convolution runs
//! with in-kernel indexing (no im2col matrix is built), and the result is
//! copied back after an explicit synchronization.
//!
//! Every device operation reports its own failure; nothing is assumed to
//! have succeeded.

use super::dispatch::{ConvBackend, ConvCall, PhaseTimes};
use crate::backend::ExecPath;
use crate::error::Result;
use crate::memory::{BufferPool, MemoryDomain};
use crate::shape::ConvGeometry;
use std::time::Instant;
use tracing::trace;

/// The operations the engine needs from a device.
///
/// Buffers are released by dropping them.
pub trait Accelerator: Send + Sync {
    /// A device allocation of `f32` elements.
    type Buffer: Send;

    fn name(&self) -> &'static str;

    /// Whether the device can currently accept work.
    fn is_available(&self) -> bool {
        true
    }

    /// Allocates `len` elements of device memory.
    ///
    /// # Errors
    /// [`ConvError::OutOfMemory`](crate::ConvError::OutOfMemory) or
    /// [`ConvError::Device`](crate::ConvError::Device).
    fn alloc(&self, len: usize) -> Result<Self::Buffer>;

    /// Copies `src` into `dst`; lengths must match.
    ///
    /// # Errors
    /// [`ConvError::Device`](crate::ConvError::Device).
    fn upload(&self, dst: &mut Self::Buffer, src: &[f32]) -> Result<()>;

    /// Enqueues the convolution of one sample. The result is not readable
    /// until [`synchronize`](Self::synchronize) returns.
    ///
    /// `output` is laid out `(out_channels, out_h, out_w)`.
    ///
    /// # Errors
    /// [`ConvError::Device`](crate::ConvError::Device) if the launch is rejected.
    fn launch_conv(
        &self,
        geom: &ConvGeometry,
        input: &Self::Buffer,
        weights: &Self::Buffer,
        output: &mut Self::Buffer,
    ) -> Result<()>;

    /// Blocks until all enqueued work has finished.
    ///
    /// # Errors
    /// [`ConvError::Device`](crate::ConvError::Device).
    fn synchronize(&self) -> Result<()>;

    /// Copies `src` back into host memory; lengths must match.
    ///
    /// # Errors
    /// [`ConvError::Device`](crate::ConvError::Device).
    fn download(&self, src: &Self::Buffer, dst: &mut [f32]) -> Result<()>;
}

/// Runs convolutions on an [`Accelerator`].
pub struct AcceleratorBackend<A: Accelerator> {
    device: A,
    pool: Option<BufferPool<A::Buffer>>,
}

impl<A: Accelerator> AcceleratorBackend<A> {
    /// Allocates fresh device buffers for every call.
    pub const fn new(device: A) -> Self {
        Self { device, pool: None }
    }

    /// Recycles device buffers across calls, keyed by exact size.
    pub fn pooled(device: A) -> Self {
        Self {
            device,
            pool: Some(BufferPool::new(MemoryDomain::Device)),
        }
    }

    pub const fn device(&self) -> &A {
        &self.device
    }

    pub const fn pool(&self) -> Option<&BufferPool<A::Buffer>> {
        self.pool.as_ref()
    }
}

impl<A: Accelerator> ConvBackend for AcceleratorBackend<A> {
    fn name(&self) -> &'static str {
        self.device.name()
    }

    fn path(&self) -> ExecPath {
        ExecPath::Accelerator
    }

    fn is_available(&self) -> bool {
        self.device.is_available()
    }

    fn run(&self, call: &ConvCall<'_>, out: &mut [f32]) -> Result<PhaseTimes> {
        let g = call.geom;
        let dev = &self.device;
        let pool = self.pool.as_ref();

        let mut d_input = call.memory.alloc_device(g.input_len(), pool, |n| dev.alloc(n))?;
        let mut d_output = call.memory.alloc_device(g.output_len(), pool, |n| dev.alloc(n))?;
        let mut d_weights = call.memory.alloc_device(g.weight_len(), pool, |n| dev.alloc(n))?;

        let mut times = PhaseTimes::default();
        let start = Instant::now();
        dev.upload(d_weights.get_mut(), call.weights)?;
        times.transform += start.elapsed();

        for (n, (sample, dst)) in call
            .input
            .chunks_exact(g.input_len())
            .zip(out.chunks_exact_mut(g.output_len()))
            .enumerate()
        {
            call.interrupt.check()?;

            let start = Instant::now();
            dev.upload(d_input.get_mut(), sample)?;
            times.transform += start.elapsed();

            let start = Instant::now();
            dev.launch_conv(g, d_input.get(), d_weights.get(), d_output.get_mut())?;
            call.interrupt.check()?;
            dev.synchronize()?;
            dev.download(d_output.get(), dst)?;
            dev.synchronize()?;
            times.multiply += start.elapsed();

            trace!(sample = n, device = dev.name(), "sample convolved");
        }
        Ok(times)
    }
}
