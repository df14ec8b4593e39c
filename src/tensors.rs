//! Core tensor data structure consumed and produced by the convolution layer.
//!
//! # Layout
//!
//! Feature maps and filter banks are both 4-dimensional, row-major, with the
//! channel axis outermost inside one sample:
//!
//! - feature map: `(batch, channels, height, width)`
//! - filter bank: `(out_channels, in_channels, kernel_height, kernel_width)`
//!
//! All values of one channel are contiguous before the next channel begins.
//!
//! ## Example
//!
//! ```rust
//! use briny_conv::tensors::Tensor;
//! let t = Tensor::new(vec![1, 2, 1, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
//! assert_eq!(t.channels(), 2);
//! assert_eq!(t.width(), 3);
//! ```

use crate::error::{ConvError, Result};

/// Number of elements a shape describes, or `None` if it overflows `usize`.
#[must_use]
pub fn checked_numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Represents an N-dimensional tensor with a shape and flat row-major data.
///
/// - `shape` defines the structure, e.g. `[1, 3, 5, 5]` for one 3-channel 5×5 map.
/// - `data` holds the flattened content in row-major order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a new tensor with the given shape and flat data.
    ///
    /// # Panics
    /// Panics if the number of elements in `data` does not match the shape product.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            checked_numel(&shape),
            Some(data.len()),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// An empty rank-0 tensor with no data, used as an unwritten output slot.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            shape: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// The shape as `(batch, channels, height, width)` if this is a 4-D tensor.
    #[must_use]
    pub fn dims4(&self) -> Option<[usize; 4]> {
        <[usize; 4]>::try_from(self.shape.as_slice()).ok()
    }

    fn axis(&self, i: usize) -> usize {
        self.shape.get(i).copied().unwrap_or(0)
    }

    /// Leading dimension: batch for feature maps, output channels for filter banks.
    #[must_use]
    pub fn num(&self) -> usize {
        self.axis(0)
    }

    /// Channel dimension (input channels for filter banks).
    #[must_use]
    pub fn channels(&self) -> usize {
        self.axis(1)
    }

    /// Height dimension.
    #[must_use]
    pub fn height(&self) -> usize {
        self.axis(2)
    }

    /// Width dimension.
    #[must_use]
    pub fn width(&self) -> usize {
        self.axis(3)
    }

    /// Flat read-only view of the data.
    #[must_use]
    pub fn data(&self) -> &[T] {
        &self.data
    }
}

impl<T: Copy> Tensor<T> {
    /// A tensor of the given shape filled with `value`.
    ///
    /// # Panics
    /// Panics if the shape product overflows `usize`.
    pub fn filled(shape: impl Into<Vec<usize>>, value: T) -> Self {
        let shape = shape.into();
        let len = checked_numel(&shape).expect("tensor shape overflows usize");
        Self {
            shape,
            data: vec![value; len],
        }
    }

    /// Replaces contents and shape in one step from a flat buffer.
    ///
    /// Nothing is modified when `src` does not hold exactly
    /// `num * channels * height * width` elements.
    ///
    /// # Errors
    /// [`ConvError::ShapeMismatch`] on a length mismatch.
    pub fn copy_data(
        &mut self,
        num: usize,
        channels: usize,
        height: usize,
        width: usize,
        src: &[T],
    ) -> Result<()> {
        if checked_numel(&[num, channels, height, width]) != Some(src.len()) {
            return Err(ConvError::ShapeMismatch(format!(
                "cannot store {} elements as ({num}, {channels}, {height}, {width})",
                src.len()
            )));
        }
        self.data.clear();
        self.data.extend_from_slice(src);
        self.shape = vec![num, channels, height, width];
        Ok(())
    }
}

/// Defines a tensor from nested literal arrays.
///
/// Supports arbitrary dimensionality as long as sublists are uniform in shape.
///
/// # Example
/// ```
/// use briny_conv::tensor;
/// let t = tensor!([[[[1.0f32, 2.0], [3.0, 4.0]]]]);
/// assert_eq!(t.shape, vec![1, 1, 2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = &children[0].shape;
        assert!(children.iter().all(|c| c.shape == *first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}
