//! Cooperative cancellation for in-flight convolution calls.
//!
//! A call checks its [`Interrupt`] before every sample and right before it
//! commits to a (potentially slow) device synchronization. A tripped check
//! returns an error; the call's leases are dropped on the way out.

use crate::error::{ConvError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// A cloneable flag that asks running calls to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Cancellation token and deadline of one call.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    pub token: Option<CancelToken>,
    pub deadline: Option<Instant>,
}

impl Interrupt {
    /// Never trips.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            token: None,
            deadline: None,
        }
    }

    /// # Errors
    /// [`ConvError::Cancelled`] or [`ConvError::DeadlineExceeded`].
    pub fn check(&self) -> Result<()> {
        if self.token.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(ConvError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ConvError::DeadlineExceeded);
        }
        Ok(())
    }
}
