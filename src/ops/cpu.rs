//! Parallel CPU backend
//!
//! The host path unfolds each input sample with [`im2col`](super::im2col::im2col)
//! and multiplies the filter bank against the unfolded matrix:
//!
//! ```text
//! out (oc × P) = W (oc × K) · Mᵀ (K × P)
//! ```
//!
//! where `P` is the number of output positions and `K` the kernel size.
//! `M` is stored `P × K`, so the multiply reads it through the transpose
//! flag instead of materialising `Mᵀ`, and every output element is a dot
//! product of two contiguous rows.
//!
//! ## Features
//!
//! - Parallel row computation using [`rayon`](https://docs.rs/rayon). The host
//!   loops are not sequential, but each output element is one dot product
//!   evaluated by a single task in a fixed order, so results are
//!   bit-identical from run to run and the call still blocks until done
//! - Four-lane accumulation in the inner dot product
//! - Output rows are written in `(out_channels, out_h, out_w)` order, which
//!   is the layout of one output sample

use super::dispatch::{ConvBackend, ConvCall, PhaseTimes};
use super::im2col::im2col;
use crate::backend::ExecPath;
use crate::error::Result;
use rayon::prelude::*;
use std::time::Instant;

/// Dimensions of `C (m × n) = op(A) (m × k) · op(B) (k × n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatDims {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut acc = [0.0f32; 4];
    let a4 = a.chunks_exact(4);
    let b4 = b.chunks_exact(4);
    let (a_tail, b_tail) = (a4.remainder(), b4.remainder());
    for (x, y) in a4.zip(b4) {
        acc[0] += x[0] * y[0];
        acc[1] += x[1] * y[1];
        acc[2] += x[2] * y[2];
        acc[3] += x[3] * y[3];
    }
    let mut sum = (acc[0] + acc[1]) + (acc[2] + acc[3]);
    for (x, y) in a_tail.iter().zip(b_tail) {
        sum += x * y;
    }
    sum
}

/// Dense matrix multiply `C = op(A) · op(B)`.
///
/// - `trans_a`: `A` is stored `k × m` instead of `m × k`.
/// - `trans_b`: `B` is stored `n × k` instead of `k × n`.
///
/// Every element of `c` is overwritten.
///
/// # Panics
/// If a slice is shorter than `dims` requires.
pub fn matmul(a: &[f32], b: &[f32], c: &mut [f32], dims: MatDims, trans_a: bool, trans_b: bool) {
    let MatDims { m, n, k } = dims;
    assert_eq!(a.len(), m * k, "matmul: A has wrong length");
    assert_eq!(b.len(), k * n, "matmul: B has wrong length");
    assert_eq!(c.len(), m * n, "matmul: C has wrong length");
    if m == 0 || n == 0 {
        return;
    }

    c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_at = |l: usize| if trans_a { a[l * m + i] } else { a[i * k + l] };

        match (trans_a, trans_b) {
            (false, true) => {
                let a_row = &a[i * k..(i + 1) * k];
                for (j, out) in row.iter_mut().enumerate() {
                    *out = dot(a_row, &b[j * k..(j + 1) * k]);
                }
            }
            (true, true) => {
                for (j, out) in row.iter_mut().enumerate() {
                    let b_row = &b[j * k..(j + 1) * k];
                    *out = (0..k).map(|l| a_at(l) * b_row[l]).sum();
                }
            }
            (_, false) => {
                row.fill(0.0);
                for l in 0..k {
                    let av = a_at(l);
                    for (out, &bv) in row.iter_mut().zip(&b[l * n..(l + 1) * n]) {
                        *out += av * bv;
                    }
                }
            }
        }
    });
}

/// im2col + dense multiply on the calling machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostBackend;

impl ConvBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn path(&self) -> ExecPath {
        ExecPath::Host
    }

    fn run(&self, call: &ConvCall<'_>, out: &mut [f32]) -> Result<PhaseTimes> {
        let g = call.geom;
        let mut mat = call.memory.alloc_host(g.im2col_len())?;
        let dims = MatDims {
            m: g.out_channels,
            n: g.positions(),
            k: g.kernel_size(),
        };

        let mut times = PhaseTimes::default();
        for (sample, dst) in call
            .input
            .chunks_exact(g.input_len())
            .zip(out.chunks_exact_mut(g.output_len()))
        {
            call.interrupt.check()?;

            let start = Instant::now();
            im2col(sample, g, &mut mat);
            times.transform += start.elapsed();

            let start = Instant::now();
            matmul(call.weights, &mat, dst, dims, false, true);
            times.multiply += start.elapsed();
        }
        Ok(times)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
        let mut out = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                out[i * n + j] = (0..k).map(|x| a[i * k + x] * b[x * n + j]).sum();
            }
        }
        out
    }

    fn transpose(data: &[f32], rows: usize, cols: usize) -> Vec<f32> {
        let mut out = vec![0.0; data.len()];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = data[r * cols + c];
            }
        }
        out
    }

    #[test]
    fn matmul_forward_values() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0]; // 2x3
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0]; // 3x2
        let mut c = [0.0; 4];
        matmul(&a, &b, &mut c, MatDims { m: 2, n: 2, k: 3 }, false, false);
        let expected = [
            1.0 * 7.0 + 2.0 * 9.0 + 3.0 * 11.0,
            1.0 * 8.0 + 2.0 * 10.0 + 3.0 * 12.0,
            4.0 * 7.0 + 5.0 * 9.0 + 6.0 * 11.0,
            4.0 * 8.0 + 5.0 * 10.0 + 6.0 * 12.0,
        ];
        assert_eq!(c, expected);
    }

    #[test]
    fn transpose_flags_agree_with_naive() {
        let (m, k, n) = (5, 7, 6);
        let a: Vec<f32> = (0..m * k).map(|v| (v % 11) as f32 - 5.0).collect();
        let b: Vec<f32> = (0..k * n).map(|v| (v % 7) as f32 * 0.5).collect();
        let expected = naive(&a, &b, m, k, n);
        let a_t = transpose(&a, m, k);
        let b_t = transpose(&b, k, n);
        let dims = MatDims { m, n, k };

        for (ta, tb) in [(false, false), (false, true), (true, false), (true, true)] {
            let a_in = if ta { &a_t } else { &a };
            let b_in = if tb { &b_t } else { &b };
            let mut c = vec![f32::NAN; m * n];
            matmul(a_in, b_in, &mut c, dims, ta, tb);
            assert_eq!(c, expected, "trans_a={ta} trans_b={tb}");
        }
    }

    #[test]
    fn parallel_multiply_is_bitwise_repeatable() {
        let (m, k, n) = (33, 129, 70);
        let a: Vec<f32> = (0..m * k).map(|v| ((v * 37 % 101) as f32).sin()).collect();
        let b: Vec<f32> = (0..n * k).map(|v| ((v * 13 % 97) as f32).cos()).collect();
        let dims = MatDims { m, n, k };

        let mut first = vec![0.0; m * n];
        matmul(&a, &b, &mut first, dims, false, true);
        for _ in 0..8 {
            let mut again = vec![f32::NAN; m * n];
            matmul(&a, &b, &mut again, dims, false, true);
            assert!(first.iter().zip(&again).all(|(x, y)| x.to_bits() == y.to_bits()));
        }
    }

    #[test]
    fn dot_handles_tails() {
        let a: Vec<f32> = (1..=7).map(|v| v as f32).collect();
        assert_eq!(dot(&a, &a), 140.0);
        assert_eq!(dot(&[], &[]), 0.0);
    }
}
