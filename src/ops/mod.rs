//! # Convolution Execution Layer
//!
//! The forward computation of a convolution layer, split by where it runs.
//!
//! ## Submodules
//!
//! - [`im2col`]: unfolds receptive fields into a dense matrix
//! - [`cpu`]: host GEMM and the im2col + multiply backend
//! - [`device`]: the [`Accelerator`](device::Accelerator) trait and the backend driving it
//! - [`emulated`]: a host-memory accelerator with fault injection
//! - [`wgpu`] *(opt-in)*: WGSL compute kernel on the default GPU adapter
//! - [`dispatch`]: the [`ConvBackend`](dispatch::ConvBackend) seam and backend selection
//!
//! ## Backend Selection
//!
//! An [`ExecPolicy`](crate::backend::ExecPolicy) resolves to one backend per
//! call. `Auto` prefers the accelerator once the multiply-accumulate count
//! reaches the [`CostModel`](crate::backend::CostModel) threshold. A
//! missing or unavailable accelerator falls back to the host with a warning.
//!
//! ## Feature Flags
//!
//! - `wgpu`: enables the WebGPU accelerator

pub mod cpu;
pub mod device;
pub mod dispatch;
pub mod emulated;
pub mod im2col;
#[cfg(feature = "wgpu")]
pub mod wgpu;
