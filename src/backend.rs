//! Execution path selection.
//!
//! A convolution runs either on the host (im2col + matrix multiply) or on an
//! accelerator (direct in-kernel indexing in device memory). Which one is
//! used is decided per call from an [`ExecPolicy`]:
//!
//! - `Host`: always the host path.
//! - `Accelerator`: the accelerator path whenever one is available.
//! - `Auto`: the accelerator path when one is available *and* the call is
//!   large enough to amortise the transfers, per a [`CostModel`].
//!
//! The process-wide default policy is stored in an `AtomicU8`, enabling fast
//! switching at runtime. Layers and individual calls may override it.
//!
//! Both paths produce numerically equivalent output, so the choice only
//! affects speed.

use crate::error::ConvError;
use core::fmt;
use core::str::FromStr;
use core::sync::atomic::{AtomicU8, Ordering};

/// How a layer chooses between the host and accelerator paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExecPolicy {
    /// Always run on the host.
    #[default]
    Host = 0,
    /// Run on the accelerator if one is available.
    Accelerator,
    /// Let the cost model decide.
    Auto,
}

impl TryFrom<u8> for ExecPolicy {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Host),
            1 => Ok(Self::Accelerator),
            2 => Ok(Self::Auto),
            _ => Err(()),
        }
    }
}

impl FromStr for ExecPolicy {
    type Err = ConvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" | "cpu" => Ok(Self::Host),
            "accelerator" | "gpu" | "wgpu" => Ok(Self::Accelerator),
            "auto" => Ok(Self::Auto),
            other => Err(ConvError::config(
                "backend",
                format!("unknown policy `{other}` (expected host, accelerator or auto)"),
            )),
        }
    }
}

/// The path a single call actually takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecPath {
    Host,
    Accelerator,
}

impl fmt::Display for ExecPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Accelerator => f.write_str("accelerator"),
        }
    }
}

/// Work threshold used by [`ExecPolicy::Auto`].
///
/// A call's work is its multiply-accumulate count per sample:
/// `out_positions * kernel_size * out_channels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostModel {
    /// Smallest MAC count for which the accelerator is preferred.
    pub min_macs: usize,
}

impl CostModel {
    /// Roughly where upload + readback stop dominating a single small layer.
    pub const DEFAULT_MIN_MACS: usize = 1 << 22;

    #[must_use]
    pub const fn prefers_accelerator(&self, macs: usize) -> bool {
        macs >= self.min_macs
    }
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            min_macs: Self::DEFAULT_MIN_MACS,
        }
    }
}

/// Resolves a policy to a concrete path.
#[must_use]
pub const fn select_path(
    policy: ExecPolicy,
    cost: &CostModel,
    macs: usize,
    accelerator_available: bool,
) -> ExecPath {
    match policy {
        ExecPolicy::Host => ExecPath::Host,
        ExecPolicy::Accelerator if accelerator_available => ExecPath::Accelerator,
        ExecPolicy::Auto if accelerator_available && cost.prefers_accelerator(macs) => {
            ExecPath::Accelerator
        }
        _ => ExecPath::Host,
    }
}

/// Internal global state for the default policy.
///
/// The policy is only expected to change rarely, not in the middle of
/// concurrent compute.
static GLOBAL_DEFAULT_POLICY: AtomicU8 = AtomicU8::new(ExecPolicy::Host as u8);

/// Sets the policy used by layers that do not configure their own.
///
/// # Example
///
/// ```
/// use briny_conv::backend::{set_default_policy, ExecPolicy};
/// set_default_policy(ExecPolicy::Auto);
/// # set_default_policy(ExecPolicy::Host);
/// ```
pub fn set_default_policy(p: ExecPolicy) {
    GLOBAL_DEFAULT_POLICY.store(p as u8, Ordering::Release);
}

/// Returns the process-wide default policy.
///
/// If the stored value is invalid, defaults to [`ExecPolicy::Host`].
#[must_use]
pub fn default_policy() -> ExecPolicy {
    ExecPolicy::try_from(GLOBAL_DEFAULT_POLICY.load(Ordering::Acquire)).unwrap_or_default()
}
