//! The `Scalar` trait unifies the four scalar types the engine is generic
//! over: `f32`, `f64`, `Complex<f32>` and `Complex<f64>`.
//!
//! Real types double as their own `Real` associated type, so precision
//! thresholds and norms can be computed inside generic code without leaving
//! the trait system.

use std::fmt::{Debug, Display};
use std::io::{self, Read, Write};
use std::iter::Sum;
use std::ops::Neg;

use ndarray::LinalgScalar;
use num_complex::Complex;
use num_traits::{Float, NumAssign, One};
use rand::distributions::uniform::SampleUniform;
use rand::Rng;

/// Scalar element of a matrix.
pub trait Scalar:
    LinalgScalar
    + NumAssign
    + Neg<Output = Self>
    + Sum
    + PartialEq
    + Debug
    + Display
    + Send
    + Sync
    + 'static
{
    /// The associated real type (`f32` or `f64`).
    type Real: Scalar<Real = Self::Real> + Float + SampleUniform + PartialOrd;

    /// Whether the type carries an imaginary part.
    const COMPLEX: bool;

    /// Embeds a real value.
    fn from_real(r: Self::Real) -> Self;

    /// Lossy conversion from `f64`, for thresholds and test fixtures.
    fn of_f64(x: f64) -> Self;

    /// The real part.
    fn re(self) -> Self::Real;

    /// The real part, as `f64`. Used for logging.
    fn re_f64(self) -> f64;

    /// The complex conjugate (identity for real types).
    fn conj(self) -> Self;

    /// The modulus `|x|`.
    fn modulus(self) -> Self::Real;

    /// The squared modulus `|x|^2`, cheaper than `modulus`.
    fn modulus_sqr(self) -> Self::Real;

    /// Principal square root. For real types the caller guarantees a
    /// non-negative argument.
    fn csqrt(self) -> Self;

    /// Scales by a real factor.
    fn mul_real(self, r: Self::Real) -> Self;

    /// Divides by a real factor.
    fn div_real(self, r: Self::Real) -> Self {
        self.mul_real(Self::Real::one() / r)
    }

    /// Machine epsilon of the associated real type.
    fn eps() -> Self::Real {
        <Self::Real as Float>::epsilon()
    }

    fn neg_one() -> Self {
        -Self::one()
    }

    /// Whether every component is finite.
    fn is_finite_scalar(self) -> bool;

    /// Uniform sample in `[-1, 1]` per component.
    fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self;

    /// Writes the raw native-endian bytes of the scalar.
    fn write_raw<W: Write>(self, w: &mut W) -> io::Result<()>;

    /// Reads a scalar written by `write_raw`.
    fn read_raw<R: Read>(r: &mut R) -> io::Result<Self>;
}

/// A real threshold from an `f64` literal, in the real type of `T`.
pub fn real_of<T: Scalar>(x: f64) -> T::Real {
    <T::Real as Scalar>::of_f64(x)
}

macro_rules! impl_real_scalar {
    ($t:ty, $bytes:expr) => {
        impl Scalar for $t {
            type Real = $t;

            const COMPLEX: bool = false;

            fn from_real(r: $t) -> Self {
                r
            }

            fn of_f64(x: f64) -> Self {
                x as $t
            }

            fn re(self) -> $t {
                self
            }

            fn re_f64(self) -> f64 {
                self as f64
            }

            fn conj(self) -> Self {
                self
            }

            fn modulus(self) -> $t {
                self.abs()
            }

            fn modulus_sqr(self) -> $t {
                self * self
            }

            fn csqrt(self) -> Self {
                self.sqrt()
            }

            fn mul_real(self, r: $t) -> Self {
                self * r
            }

            fn is_finite_scalar(self) -> bool {
                self.is_finite()
            }

            fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
                rng.gen_range(-1.0..1.0)
            }

            fn write_raw<W: Write>(self, w: &mut W) -> io::Result<()> {
                w.write_all(&self.to_ne_bytes())
            }

            fn read_raw<R: Read>(r: &mut R) -> io::Result<Self> {
                let mut buf = [0_u8; $bytes];
                r.read_exact(&mut buf)?;
                Ok(<$t>::from_ne_bytes(buf))
            }
        }
    };
}

impl_real_scalar!(f32, 4);
impl_real_scalar!(f64, 8);

macro_rules! impl_complex_scalar {
    ($t:ty) => {
        impl Scalar for Complex<$t> {
            type Real = $t;

            const COMPLEX: bool = true;

            fn from_real(r: $t) -> Self {
                Complex::new(r, 0.0)
            }

            fn of_f64(x: f64) -> Self {
                Complex::new(x as $t, 0.0)
            }

            fn re(self) -> $t {
                self.re
            }

            fn re_f64(self) -> f64 {
                self.re as f64
            }

            fn conj(self) -> Self {
                Complex::new(self.re, -self.im)
            }

            fn modulus(self) -> $t {
                self.norm()
            }

            fn modulus_sqr(self) -> $t {
                self.norm_sqr()
            }

            fn csqrt(self) -> Self {
                Complex::sqrt(self)
            }

            fn mul_real(self, r: $t) -> Self {
                Complex::new(self.re * r, self.im * r)
            }

            fn is_finite_scalar(self) -> bool {
                self.re.is_finite() && self.im.is_finite()
            }

            fn sample<R: Rng + ?Sized>(rng: &mut R) -> Self {
                Complex::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0))
            }

            fn write_raw<W: Write>(self, w: &mut W) -> io::Result<()> {
                w.write_all(&self.re.to_ne_bytes())?;
                w.write_all(&self.im.to_ne_bytes())
            }

            fn read_raw<R: Read>(r: &mut R) -> io::Result<Self> {
                let re = <$t as Scalar>::read_raw(r)?;
                let im = <$t as Scalar>::read_raw(r)?;
                Ok(Complex::new(re, im))
            }
        }
    };
}

impl_complex_scalar!(f32);
impl_complex_scalar!(f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_roundtrip_and_identities() {
        let x = -3.5_f64;
        assert_eq!(x.conj(), x);
        assert_eq!(x.modulus(), 3.5);
        assert_eq!(x.modulus_sqr(), 12.25);
        assert_eq!(f64::neg_one(), -1.0);

        let mut buf = Vec::new();
        x.write_raw(&mut buf).unwrap();
        let y = f64::read_raw(&mut buf.as_slice()).unwrap();
        assert_eq!(x.to_bits(), y.to_bits());
    }

    #[test]
    fn complex_conjugate_and_modulus() {
        let z = Complex::new(3.0_f64, -4.0);
        assert_eq!(z.conj(), Complex::new(3.0, 4.0));
        assert_eq!(z.modulus(), 5.0);
        assert_eq!(z.modulus_sqr(), 25.0);
        assert!((z.csqrt() * z.csqrt() - z).modulus() < 1e-12);
    }

    #[test]
    fn thresholds_stay_in_the_real_type() {
        let tol: f32 = real_of::<Complex<f32>>(1e-3);
        assert!((tol - 1e-3).abs() < 1e-9);
    }
}
