//! Error taxonomy for the convolution engine.
//!
//! Every failure is surfaced to the immediate caller; nothing is retried
//! internally. The caller (usually a network-graph executor) decides
//! whether to retry the call, skip the layer or abort the pipeline.

use crate::memory::MemoryDomain;

/// Errors produced while configuring or executing a convolution layer.
#[derive(Debug, thiserror::Error)]
pub enum ConvError {
    /// A configuration option is missing or has an invalid value.
    #[error("invalid configuration for `{key}`: {reason}")]
    Config {
        /// The option that was rejected.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The bound input, filter bank and strides cannot be combined.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// The output tensor disagrees with the shape derived from the inputs.
    ///
    /// This is an internal bug, not a caller error.
    #[error("output shape {got:?} does not match expected {expected:?}")]
    OutputShape {
        /// `(batch, channels, height, width)` computed from the inputs.
        expected: [usize; 4],
        /// Shape actually reported by the output tensor.
        got: Vec<usize>,
    },

    /// A host or device allocation could not be satisfied.
    #[error("out of {domain} memory allocating {elements} f32 elements")]
    OutOfMemory {
        /// Memory domain of the failed allocation.
        domain: MemoryDomain,
        /// Requested element count.
        elements: usize,
    },

    /// An accelerator launch, copy or synchronization failed.
    #[error("accelerator error: {0}")]
    Device(String),

    /// The call was cancelled through its [`CancelToken`](crate::cancel::CancelToken).
    #[error("convolution cancelled")]
    Cancelled,

    /// The call's deadline passed before the device work was committed.
    #[error("convolution deadline exceeded")]
    DeadlineExceeded,
}

impl ConvError {
    pub(crate) fn config(key: &str, reason: impl Into<String>) -> Self {
        Self::Config {
            key: key.to_owned(),
            reason: reason.into(),
        }
    }

    /// Whether a caller may reasonably retry the same call.
    ///
    /// Configuration, shape and internal errors will fail again with the
    /// same inputs; resource and device failures might not.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OutOfMemory { .. } | Self::Device(_) | Self::Cancelled | Self::DeadlineExceeded
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, ConvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(
            ConvError::OutOfMemory {
                domain: MemoryDomain::Device,
                elements: 16
            }
            .is_recoverable()
        );
        assert!(ConvError::Device("lost".into()).is_recoverable());
        assert!(!ConvError::ShapeMismatch("x".into()).is_recoverable());
        assert!(!ConvError::config("stride", "missing").is_recoverable());
    }

    #[test]
    fn messages_name_the_problem() {
        let err = ConvError::config("stride", "missing");
        assert_eq!(err.to_string(), "invalid configuration for `stride`: missing");

        let err = ConvError::OutOfMemory {
            domain: MemoryDomain::Host,
            elements: 9,
        };
        assert_eq!(err.to_string(), "out of host memory allocating 9 f32 elements");
    }
}
