//! Operation Dispatch Layer
//!
//! Host and accelerator execution are two implementations of one
//! [`ConvBackend`] capability. A call picks one of them with
//! [`select_backend`] and hands it a [`ConvCall`]; the backend allocates
//! its scratch through the call's [`MemoryManager`] and writes the dense,
//! out-channel-major result of every sample.
//!
//! # Design Highlights
//! - **Pluggable**: any [`Accelerator`](super::device::Accelerator) becomes a backend
//! - **Explicit**: an unavailable accelerator falls back to the host at
//!   selection time; a failing one surfaces its error, it is never retried
//! - **Equivalent**: both paths compute the same linear convolution

use crate::backend::{CostModel, ExecPath, ExecPolicy, select_path};
use crate::cancel::Interrupt;
use crate::error::Result;
use crate::memory::MemoryManager;
use crate::shape::ConvGeometry;
use std::time::Duration;
use tracing::warn;

/// Everything a backend needs to run one call.
pub struct ConvCall<'a> {
    pub geom: &'a ConvGeometry,
    /// All samples, `batch * geom.input_len()` elements.
    pub input: &'a [f32],
    /// The filter bank, `geom.weight_len()` elements.
    pub weights: &'a [f32],
    pub memory: &'a MemoryManager,
    pub interrupt: &'a Interrupt,
}

/// Time spent in each phase of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimes {
    /// Host im2col, or host-to-device input transfer.
    pub transform: Duration,
    /// The multiply, including device synchronization and readback.
    pub multiply: Duration,
}

/// One way of executing a convolution.
pub trait ConvBackend: Send + Sync {
    /// Short identifier used in logs and reports.
    fn name(&self) -> &'static str;

    fn path(&self) -> ExecPath;

    /// Whether the backend can run right now.
    fn is_available(&self) -> bool {
        true
    }

    /// Convolves every sample of `call.input` into `out`.
    ///
    /// `out` holds `batch * geom.output_len()` elements; sample `n` is written
    /// to `out[n * output_len..]` as `(out_channels, out_h, out_w)`.
    ///
    /// # Errors
    /// Allocation, device and interruption failures. Every buffer the
    /// backend acquired is released before it returns.
    fn run(&self, call: &ConvCall<'_>, out: &mut [f32]) -> Result<PhaseTimes>;
}

/// Resolves `policy` against the available backends.
pub fn select_backend<'a>(
    policy: ExecPolicy,
    cost: &CostModel,
    geom: &ConvGeometry,
    host: &'a dyn ConvBackend,
    accelerator: Option<&'a dyn ConvBackend>,
) -> &'a dyn ConvBackend {
    let available = accelerator.filter(|a| a.is_available());
    match (select_path(policy, cost, geom.macs(), available.is_some()), available) {
        (ExecPath::Accelerator, Some(accel)) => accel,
        _ => {
            if policy == ExecPolicy::Accelerator {
                warn!(
                    requested = ?policy,
                    "no accelerator available, falling back to host"
                );
            }
            host
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensors::Tensor;

    struct Fake(ExecPath, bool);

    impl ConvBackend for Fake {
        fn name(&self) -> &'static str {
            match self.0 {
                ExecPath::Host => "fake-host",
                ExecPath::Accelerator => "fake-accel",
            }
        }

        fn path(&self) -> ExecPath {
            self.0
        }

        fn is_available(&self) -> bool {
            self.1
        }

        fn run(&self, _: &ConvCall<'_>, _: &mut [f32]) -> Result<PhaseTimes> {
            Ok(PhaseTimes::default())
        }
    }

    fn geom() -> ConvGeometry {
        ConvGeometry::from_shapes(
            &Tensor::filled(vec![1, 1, 4, 4], 0.0),
            &Tensor::filled(vec![1, 1, 3, 3], 0.0),
            1,
            1,
        )
        .unwrap()
    }

    #[test]
    fn picks_accelerator_when_requested_and_available() {
        let host = Fake(ExecPath::Host, true);
        let accel = Fake(ExecPath::Accelerator, true);
        let chosen = select_backend(
            ExecPolicy::Accelerator,
            &CostModel::default(),
            &geom(),
            &host,
            Some(&accel),
        );
        assert_eq!(chosen.name(), "fake-accel");
    }

    #[test]
    fn unavailable_accelerator_falls_back() {
        let host = Fake(ExecPath::Host, true);
        let accel = Fake(ExecPath::Accelerator, false);
        let chosen = select_backend(
            ExecPolicy::Accelerator,
            &CostModel::default(),
            &geom(),
            &host,
            Some(&accel),
        );
        assert_eq!(chosen.path(), ExecPath::Host);

        let chosen = select_backend(ExecPolicy::Auto, &CostModel { min_macs: 0 }, &geom(), &host, None);
        assert_eq!(chosen.path(), ExecPath::Host);
    }
}
