//! Receptive-field unfolding for the host path.
//!
//! Each output position `(oh, ow)` becomes one row of `kernel_size` values.
//! Within a row the columns are ordered channel, then kernel row, then
//! kernel column, which is exactly the flattened layout of one output
//! channel of the filter bank. The multiply relies on that match.
//!
//! Rows are filled in parallel on the rayon pool rather than in one
//! sequential loop. Each row reads only the input and its own position, so
//! the matrix does not depend on scheduling; the calling thread returns only
//! once every row is written.

use crate::shape::ConvGeometry;
use rayon::prelude::*;

/// Unfolds one input sample into `out`, a `positions × kernel_size` matrix.
///
/// Pure: the result depends only on `input` and the geometry, and every
/// element of `out` is overwritten.
///
/// # Panics
/// If `input` or `out` do not have the lengths `geom` implies.
pub fn im2col(input: &[f32], geom: &ConvGeometry, out: &mut [f32]) {
    assert_eq!(input.len(), geom.input_len(), "im2col input length");
    assert_eq!(out.len(), geom.im2col_len(), "im2col output length");

    let ConvGeometry {
        in_channels,
        in_h,
        in_w,
        kernel_h,
        kernel_w,
        stride_h,
        stride_w,
        out_w,
        ..
    } = *geom;

    out.par_chunks_mut(geom.kernel_size())
        .enumerate()
        .for_each(|(p, row)| {
            let sh = (p / out_w) * stride_h;
            let sw = (p % out_w) * stride_w;
            let mut dst = row.chunks_exact_mut(kernel_w);
            for sc in 0..in_channels {
                let mut src_off = (sc * in_h + sh) * in_w + sw;
                for _ in 0..kernel_h {
                    if let Some(run) = dst.next() {
                        run.copy_from_slice(&input[src_off..src_off + kernel_w]);
                    }
                    src_off += in_w;
                }
            }
        });
}

/// Allocating variant of [`im2col`].
#[must_use]
pub fn im2col_vec(input: &[f32], geom: &ConvGeometry) -> Vec<f32> {
    let mut out = vec![0.0; geom.im2col_len()];
    im2col(input, geom, &mut out);
    out
}
