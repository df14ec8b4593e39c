//! Shape validation and the derived convolution geometry.
//!
//! [`ConvGeometry::from_shapes`] is the single place where input, filter bank
//! and strides are checked against each other. Nothing is allocated or
//! computed for a call until it has succeeded.

use crate::error::{ConvError, Result};
use crate::tensors::{Tensor, checked_numel};

/// Everything the engines need to know about one call, derived from the
/// validated shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub out_h: usize,
    pub out_w: usize,
}

/// `⌊(input − kernel) / stride⌋ + 1`, or `None` if the kernel does not fit.
#[must_use]
pub const fn output_extent(input: usize, kernel: usize, stride: usize) -> Option<usize> {
    if kernel == 0 || stride == 0 || input < kernel {
        return None;
    }
    Some((input - kernel) / stride + 1)
}

impl ConvGeometry {
    /// Validates `input` against `weight` and derives the output geometry.
    ///
    /// # Errors
    /// [`ConvError::ShapeMismatch`] if either tensor is not 4-D, its data
    /// length disagrees with its shape, a dimension is zero, the channel
    /// counts differ, or the kernel is larger than the input.
    pub fn from_shapes(
        input: &Tensor<f32>,
        weight: &Tensor<f32>,
        stride_h: usize,
        stride_w: usize,
    ) -> Result<Self> {
        let [batch, in_channels, in_h, in_w] = dims4("input", input)?;
        let [out_channels, w_channels, kernel_h, kernel_w] = dims4("filter bank", weight)?;

        if in_channels != w_channels {
            return Err(ConvError::ShapeMismatch(format!(
                "input has {in_channels} channels but the filter bank expects {w_channels}"
            )));
        }
        if stride_h == 0 || stride_w == 0 {
            return Err(ConvError::ShapeMismatch(format!(
                "stride ({stride_h}, {stride_w}) must be at least 1"
            )));
        }
        let (Some(out_h), Some(out_w)) = (
            output_extent(in_h, kernel_h, stride_h),
            output_extent(in_w, kernel_w, stride_w),
        ) else {
            return Err(ConvError::ShapeMismatch(format!(
                "kernel {kernel_h}x{kernel_w} does not fit input {in_h}x{in_w}"
            )));
        };
        // Every derived length is bounded by one of these two products.
        let positions = out_h * out_w;
        let work = [out_channels, positions, in_channels, kernel_h, kernel_w];
        if checked_numel(&work).is_none()
            || checked_numel(&[batch, out_channels, positions]).is_none()
        {
            return Err(ConvError::ShapeMismatch(format!(
                "output of {out_channels} channels over {out_h}x{out_w} positions overflows"
            )));
        }

        Ok(Self {
            batch,
            in_channels,
            in_h,
            in_w,
            out_channels,
            kernel_h,
            kernel_w,
            stride_h,
            stride_w,
            out_h,
            out_w,
        })
    }

    /// Values combined into one output element: `in_channels * kernel_h * kernel_w`.
    #[must_use]
    pub const fn kernel_size(&self) -> usize {
        self.in_channels * self.kernel_h * self.kernel_w
    }

    /// Output spatial positions per channel.
    #[must_use]
    pub const fn positions(&self) -> usize {
        self.out_h * self.out_w
    }

    /// Elements in one input sample.
    #[must_use]
    pub const fn input_len(&self) -> usize {
        self.in_channels * self.in_h * self.in_w
    }

    /// Elements in one output sample.
    #[must_use]
    pub const fn output_len(&self) -> usize {
        self.out_channels * self.positions()
    }

    /// Elements in the filter bank.
    #[must_use]
    pub const fn weight_len(&self) -> usize {
        self.out_channels * self.kernel_size()
    }

    /// Elements in the im2col matrix of one sample.
    #[must_use]
    pub const fn im2col_len(&self) -> usize {
        self.positions() * self.kernel_size()
    }

    /// Multiply-accumulates per sample.
    #[must_use]
    pub const fn macs(&self) -> usize {
        self.output_len() * self.kernel_size()
    }

    /// The output tensor shape `(batch, out_channels, out_h, out_w)`.
    #[must_use]
    pub const fn output_dims(&self) -> [usize; 4] {
        [self.batch, self.out_channels, self.out_h, self.out_w]
    }

    /// Confirms the assembled output carries the shape derived from the inputs.
    ///
    /// # Errors
    /// [`ConvError::OutputShape`]; a failure here is an engine bug.
    pub fn check_output(&self, output: &Tensor<f32>) -> Result<()> {
        let expected = self.output_dims();
        if output.shape != expected || checked_numel(&expected) != Some(output.data.len()) {
            return Err(ConvError::OutputShape {
                expected,
                got: output.shape.clone(),
            });
        }
        Ok(())
    }
}

fn dims4(what: &str, t: &Tensor<f32>) -> Result<[usize; 4]> {
    let dims = t.dims4().ok_or_else(|| {
        ConvError::ShapeMismatch(format!("{what} must be 4-D, got shape {:?}", t.shape))
    })?;
    if dims.contains(&0) {
        return Err(ConvError::ShapeMismatch(format!(
            "{what} has an empty dimension: {dims:?}"
        )));
    }
    let Some(len) = checked_numel(&dims) else {
        return Err(ConvError::ShapeMismatch(format!(
            "{what} shape {dims:?} overflows the addressable element count"
        )));
    };
    if t.data.len() != len {
        return Err(ConvError::ShapeMismatch(format!(
            "{what} holds {} elements but shape {dims:?} needs {len}",
            t.data.len()
        )));
    }
    Ok(dims)
}
