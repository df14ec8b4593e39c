//! Utilities to approximate equality of floating point values.
//!
//! Host and accelerator paths sum in different orders, so their results
//! agree only up to rounding. Comparisons here scale the tolerance by the
//! magnitude of the values involved.

/// The max relative error accepted on `f32`s.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// The expected relative error between two `f32` summation orders.
pub const F32_AVG_ERROR: f32 = 1e-4;

/// The best expected relative error on `f32`s.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// The approximated equality enumerated.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Very strong epsilon.
    Precise = 0,

    /// Good epsilon.
    Partial = 1,

    /// Acceptable epsilon
    Relative = 2,

    /// No relative equality.
    Scarce = 3,
}

/// Checks the relative distance based off epsilon.
pub trait RelativeEq<Rhs: ?Sized> {
    /// Enumerates the equality of `self`
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

/// `|a - b| / max(1, |a|, |b|)`.
#[must_use]
pub fn relative_error(a: f32, b: f32) -> f32 {
    if a == b {
        return 0.0;
    }
    (a - b).abs() / a.abs().max(b.abs()).max(1.0)
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        let dif = relative_error(*self, *rhs);

        if dif < F32_MIN_ERROR {
            ApproxEquality::Precise
        } else if dif < F32_AVG_ERROR {
            ApproxEquality::Partial
        } else if dif < F32_MAX_ERROR {
            ApproxEquality::Relative
        } else {
            ApproxEquality::Scarce
        }
    }
}

impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    /// The worst rating over all pairs; `Scarce` if the lengths differ.
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut eq = ApproxEquality::Precise;
        for (t_val, u_val) in self.iter().zip(rhs) {
            eq = eq.max(t_val.approx_eq(u_val));
            if eq == ApproxEquality::Scarce {
                break;
            }
        }
        eq
    }
}

/// Whether every pair of elements is within `rel_tol` relative error.
///
/// Slices of different lengths never compare equal.
#[must_use]
pub fn approx_eq_slice(a: &[f32], b: &[f32], rel_tol: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(&x, &y)| relative_error(x, y) <= rel_tol)
}

/// Index and relative error of the worst pair, if any.
#[must_use]
pub fn max_relative_error(a: &[f32], b: &[f32]) -> Option<(usize, f32)> {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| relative_error(x, y))
        .enumerate()
        .max_by(|l, r| l.1.total_cmp(&r.1))
}

/// Approximates equality based off the relative difference, accepting
/// the rounding drift of a reordered `f32` sum.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) <= ApproxEquality::Partial
}
