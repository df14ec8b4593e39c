//! An [`Accelerator`] that lives in host memory.
//!
//! It runs the same direct indexing as the `conv2d.wgsl` kernel, enforces
//! the launch → synchronize → download ordering, and can be told to fail
//! any device operation. It stands in for real hardware wherever the
//! accelerator path has to be exercised without a GPU.

use super::device::Accelerator;
use crate::cancel::CancelToken;
use crate::error::{ConvError, Result};
use crate::memory::MemoryDomain;
use crate::shape::ConvGeometry;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Device operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceOp {
    Alloc = 1,
    Upload,
    Launch,
    Synchronize,
    Download,
}

impl DeviceOp {
    const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Alloc),
            2 => Some(Self::Upload),
            3 => Some(Self::Launch),
            4 => Some(Self::Synchronize),
            5 => Some(Self::Download),
            _ => None,
        }
    }
}

/// Device memory of the emulated accelerator.
#[derive(Debug)]
pub struct EmulatedBuffer {
    data: Vec<f32>,
    /// Launch sequence number that last wrote this buffer.
    written_by: u64,
    live: Arc<AtomicUsize>,
}

impl Drop for EmulatedBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Host-memory accelerator with fault injection.
#[derive(Debug)]
pub struct EmulatedAccelerator {
    available: AtomicBool,
    fail_on: AtomicU8,
    live: Arc<AtomicUsize>,
    launched: AtomicU64,
    synced: AtomicU64,
    launches: AtomicUsize,
    syncs: AtomicUsize,
    /// Cancelled by every successful launch.
    cancel_on_launch: Mutex<Option<CancelToken>>,
}

impl Default for EmulatedAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedAccelerator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            fail_on: AtomicU8::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            launched: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            launches: AtomicUsize::new(0),
            syncs: AtomicUsize::new(0),
            cancel_on_launch: Mutex::new(None),
        }
    }

    /// Makes every later `op` fail until [`clear_failure`](Self::clear_failure).
    pub fn fail_on(&self, op: DeviceOp) {
        self.fail_on.store(op as u8, Ordering::SeqCst);
    }

    pub fn clear_failure(&self) {
        self.fail_on.store(0, Ordering::SeqCst);
    }

    /// Cancels `token` as soon as a kernel has been launched, i.e. while
    /// the caller is about to wait on the device.
    pub fn cancel_after_launch(&self, token: CancelToken) {
        *self
            .cancel_on_launch
            .lock()
            .expect("emulated device mutex poisoned") = Some(token);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Device buffers currently allocated.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Kernels launched so far.
    #[must_use]
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Successful synchronizations so far.
    #[must_use]
    pub fn synchronizations(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    fn injected(&self, op: DeviceOp) -> bool {
        DeviceOp::from_raw(self.fail_on.load(Ordering::SeqCst)) == Some(op)
    }

    fn fault(&self, op: DeviceOp) -> Result<()> {
        if self.injected(op) {
            return Err(ConvError::Device(format!("injected {op:?} failure")));
        }
        Ok(())
    }
}

impl Accelerator for EmulatedAccelerator {
    type Buffer = EmulatedBuffer;

    fn name(&self) -> &'static str {
        "emulated"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn alloc(&self, len: usize) -> Result<EmulatedBuffer> {
        let oom = || ConvError::OutOfMemory {
            domain: MemoryDomain::Device,
            elements: len,
        };
        if self.injected(DeviceOp::Alloc) {
            return Err(oom());
        }
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| oom())?;
        data.resize(len, 0.0);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(EmulatedBuffer {
            data,
            written_by: 0,
            live: Arc::clone(&self.live),
        })
    }

    fn upload(&self, dst: &mut EmulatedBuffer, src: &[f32]) -> Result<()> {
        self.fault(DeviceOp::Upload)?;
        if dst.data.len() != src.len() {
            return Err(ConvError::Device(format!(
                "upload of {} elements into a {}-element buffer",
                src.len(),
                dst.data.len()
            )));
        }
        dst.data.copy_from_slice(src);
        dst.written_by = 0;
        Ok(())
    }

    fn launch_conv(
        &self,
        g: &ConvGeometry,
        input: &EmulatedBuffer,
        weights: &EmulatedBuffer,
        output: &mut EmulatedBuffer,
    ) -> Result<()> {
        self.fault(DeviceOp::Launch)?;
        if input.data.len() != g.input_len()
            || weights.data.len() != g.weight_len()
            || output.data.len() != g.output_len()
        {
            return Err(ConvError::Device("launch with mis-sized buffers".into()));
        }

        let src = &input.data;
        let filters = &weights.data;
        let positions = g.positions();
        let kernel_size = g.kernel_size();
        for (idx, dst) in output.data.iter_mut().enumerate() {
            let (oc, p) = (idx / positions, idx % positions);
            let (oh, ow) = (p / g.out_w, p % g.out_w);
            let mut acc = 0.0f32;
            let mut widx = oc * kernel_size;
            for c in 0..g.in_channels {
                for kh in 0..g.kernel_h {
                    let row = (c * g.in_h + oh * g.stride_h + kh) * g.in_w + ow * g.stride_w;
                    for kw in 0..g.kernel_w {
                        acc += src[row + kw] * filters[widx];
                        widx += 1;
                    }
                }
            }
            *dst = acc;
        }

        output.written_by = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
        self.launches.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self
            .cancel_on_launch
            .lock()
            .expect("emulated device mutex poisoned")
            .as_ref()
        {
            token.cancel();
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        self.fault(DeviceOp::Synchronize)?;
        self.synced
            .fetch_max(self.launched.load(Ordering::SeqCst), Ordering::SeqCst);
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn download(&self, src: &EmulatedBuffer, dst: &mut [f32]) -> Result<()> {
        self.fault(DeviceOp::Download)?;
        if src.written_by > self.synced.load(Ordering::SeqCst) {
            return Err(ConvError::Device(
                "download of a buffer with unsynchronized writes".into(),
            ));
        }
        if src.data.len() != dst.len() {
            return Err(ConvError::Device(format!(
                "download of a {}-element buffer into {} elements",
                src.data.len(),
                dst.len()
            )));
        }
        dst.copy_from_slice(&src.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    fn geom() -> ConvGeometry {
        ConvGeometry::from_shapes(
            &Tensor::filled(vec![1, 1, 3, 3], 0.0),
            &Tensor::filled(vec![1, 1, 2, 2], 0.0),
            1,
            1,
        )
        .unwrap()
    }

    #[test]
    fn buffers_are_counted_until_dropped() {
        let dev = EmulatedAccelerator::new();
        let a = dev.alloc(4).unwrap();
        let b = dev.alloc(4).unwrap();
        assert_eq!(dev.live_buffers(), 2);
        drop(a);
        drop(b);
        assert_eq!(dev.live_buffers(), 0);
    }

    #[test]
    fn download_requires_synchronize() {
        let dev = EmulatedAccelerator::new();
        let g = geom();
        let mut input = dev.alloc(g.input_len()).unwrap();
        let mut weights = dev.alloc(g.weight_len()).unwrap();
        let mut output = dev.alloc(g.output_len()).unwrap();
        dev.upload(&mut input, &(0..9).map(|v| v as f32).collect::<Vec<_>>())
            .unwrap();
        dev.upload(&mut weights, &[1.0; 4]).unwrap();
        dev.launch_conv(&g, &input, &weights, &mut output).unwrap();

        let mut host = [0.0; 4];
        assert!(dev.download(&output, &mut host).is_err());
        dev.synchronize().unwrap();
        dev.download(&output, &mut host).unwrap();
        assert_eq!(host, [8.0, 12.0, 20.0, 24.0]);
    }

    #[test]
    fn injected_failures_surface_as_device_errors() {
        let dev = EmulatedAccelerator::new();
        dev.fail_on(DeviceOp::Synchronize);
        assert!(matches!(dev.synchronize(), Err(ConvError::Device(_))));
        dev.fail_on(DeviceOp::Alloc);
        assert!(matches!(dev.alloc(1), Err(ConvError::OutOfMemory { .. })));
        dev.clear_failure();
        assert!(dev.synchronize().is_ok());
    }
}
