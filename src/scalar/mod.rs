use std::fmt::Display;
use std::ops::{Mul, MulAssign};

use nalgebra::{ClosedAddAssign, ClosedDivAssign, ClosedMulAssign, ClosedSubAssign, ComplexField};
use num_traits::{Pow, Signed};

/// The floating point type used throughout the integrator.
///
/// `f64` is the reference implementation; the bound set is what the Nordsieck
/// engine, the weighted norms, and the dense factorization actually require.
pub trait Scalar:
    nalgebra::Scalar
    + ComplexField<RealField = Self>
    + From<f64>
    + Display
    + Copy
    + ClosedAddAssign
    + ClosedSubAssign
    + ClosedMulAssign
    + ClosedDivAssign
    + Signed
    + PartialOrd
    + Pow<Self, Output = Self>
    + Pow<i32, Output = Self>
{
    const EPSILON: Self;
    const INFINITY: Self;

    /// Lossy conversion used only for diagnostics (error values, log fields).
    fn as_f64(self) -> f64;
}

pub type IndexType = usize;

impl Scalar for f64 {
    const EPSILON: Self = f64::EPSILON;
    const INFINITY: Self = f64::INFINITY;

    fn as_f64(self) -> f64 {
        self
    }
}

/// A scalar multiplier, kept as a distinct type so that `v *= scale(c)` reads
/// as a vector operation rather than a component access.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Scale<E: Scalar>(pub E);

impl<E: Scalar> Scale<E> {
    #[inline]
    pub fn value(self) -> E {
        self.0
    }
}

#[inline]
pub fn scale<E: Scalar>(value: E) -> Scale<E> {
    Scale(value)
}

impl<E: Scalar> Mul<Scale<E>> for Scale<E> {
    type Output = Scale<E>;

    #[inline]
    fn mul(self, rhs: Scale<E>) -> Self::Output {
        Scale(self.0 * rhs.0)
    }
}

impl<E: Scalar> MulAssign<Scale<E>> for Scale<E> {
    #[inline]
    fn mul_assign(&mut self, rhs: Scale<E>) {
        self.0 *= rhs.0;
    }
}

#[test]
fn test_scale() {
    assert_eq!(scale(2.0) * scale(3.0), scale(6.0));
}
