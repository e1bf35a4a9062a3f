//! Scalar types supported by the factorization.
//!
//! The solver is polymorphic over the four conventional field types: real and
//! complex, single and double precision. [`Scalar`] bundles the arithmetic the
//! numeric kernels need together with the projection onto the real field and a
//! conjugation operation, so that the same kernel source handles the
//! `LDL^T`/`LDL^H` pair through a [`Conj`] flag.

use bytemuck::Pod;
use core::fmt::Debug;
use core::iter::Sum;
use core::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};
use num_complex::Complex;
use num_traits::Float;

/// Single precision complex type.
#[allow(non_camel_case_types)]
pub type c32 = Complex<f32>;
/// Double precision complex type.
#[allow(non_camel_case_types)]
pub type c64 = Complex<f64>;

/// Element of one of the four supported scalar fields.
pub trait Scalar:
    Copy
    + Clone
    + Debug
    + PartialEq
    + Send
    + Sync
    + Pod
    + 'static
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + MulAssign
    + DivAssign
    + Sum
{
    /// The real field this scalar projects onto (`Self` for real types).
    type Real: Scalar<Real = Self::Real> + Float + PartialOrd;

    fn zero() -> Self;
    fn one() -> Self;

    /// Builds a scalar from its real part, with zero imaginary part.
    fn from_real(re: Self::Real) -> Self;
    /// Builds a scalar from an `f64` real value (used for stencil constants).
    fn from_f64(v: f64) -> Self;

    /// Real part.
    fn real(self) -> Self::Real;
    /// Complex conjugate; the identity for real types.
    fn conj(self) -> Self;
    /// Modulus.
    fn abs(self) -> Self::Real;

    #[inline]
    fn is_zero(self) -> bool {
        self == Self::zero()
    }
}

impl Scalar for f32 {
    type Real = f32;

    #[inline]
    fn zero() -> Self {
        0.0
    }
    #[inline]
    fn one() -> Self {
        1.0
    }
    #[inline]
    fn from_real(re: f32) -> Self {
        re
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    #[inline]
    fn real(self) -> f32 {
        self
    }
    #[inline]
    fn conj(self) -> Self {
        self
    }
    #[inline]
    fn abs(self) -> f32 {
        f32::abs(self)
    }
}

impl Scalar for f64 {
    type Real = f64;

    #[inline]
    fn zero() -> Self {
        0.0
    }
    #[inline]
    fn one() -> Self {
        1.0
    }
    #[inline]
    fn from_real(re: f64) -> Self {
        re
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        v
    }
    #[inline]
    fn real(self) -> f64 {
        self
    }
    #[inline]
    fn conj(self) -> Self {
        self
    }
    #[inline]
    fn abs(self) -> f64 {
        f64::abs(self)
    }
}

impl Scalar for c32 {
    type Real = f32;

    #[inline]
    fn zero() -> Self {
        Complex::new(0.0, 0.0)
    }
    #[inline]
    fn one() -> Self {
        Complex::new(1.0, 0.0)
    }
    #[inline]
    fn from_real(re: f32) -> Self {
        Complex::new(re, 0.0)
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        Complex::new(v as f32, 0.0)
    }
    #[inline]
    fn real(self) -> f32 {
        self.re
    }
    #[inline]
    fn conj(self) -> Self {
        Complex::new(self.re, -self.im)
    }
    #[inline]
    fn abs(self) -> f32 {
        num_complex::Complex::norm(self)
    }
}

impl Scalar for c64 {
    type Real = f64;

    #[inline]
    fn zero() -> Self {
        Complex::new(0.0, 0.0)
    }
    #[inline]
    fn one() -> Self {
        Complex::new(1.0, 0.0)
    }
    #[inline]
    fn from_real(re: f64) -> Self {
        Complex::new(re, 0.0)
    }
    #[inline]
    fn from_f64(v: f64) -> Self {
        Complex::new(v, 0.0)
    }
    #[inline]
    fn real(self) -> f64 {
        self.re
    }
    #[inline]
    fn conj(self) -> Self {
        Complex::new(self.re, -self.im)
    }
    #[inline]
    fn abs(self) -> f64 {
        num_complex::Complex::norm(self)
    }
}

/// Whether an operation applies the conjugate of its operand.
///
/// `Conj::No` selects the transpose family (`LDL^T`), `Conj::Yes` the adjoint
/// family (`LDL^H`). For real scalars the two coincide.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Conj {
    No,
    Yes,
}

impl Conj {
    #[inline]
    pub fn apply<S: Scalar>(self, v: S) -> S {
        match self {
            Conj::No => v,
            Conj::Yes => v.conj(),
        }
    }
}

/// Whether a triangular operand has an implicit unit diagonal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Diag {
    Unit,
    NonUnit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conj_is_identity_on_reals() {
        assert_eq!(Conj::Yes.apply(3.5f64), 3.5);
        assert_eq!(Conj::Yes.apply(c64::new(1.0, 2.0)), c64::new(1.0, -2.0));
        assert_eq!(Conj::No.apply(c64::new(1.0, 2.0)), c64::new(1.0, 2.0));
    }

    #[test]
    fn from_real_projects_back() {
        let v = c32::from_real(2.5);
        assert_eq!(v.real(), 2.5);
        assert_eq!(v.abs(), 2.5);
    }
}
