//! SIMD site vectors and the lane shuffles used across communication planes.
//!
//! A site vector holds `N` lanes, one per sub-lattice copy folded into the
//! vector. Lane `i` maps to per-dimension lane coordinates lexicographically
//! (dimension 0 fastest), so the dimension with permute type `t` toggles lane
//! bit `N >> (t + 1)`.

use std::fmt::Debug;

use bytemuck::{Pod, Zeroable};
use num_complex::{Complex32, Complex64};

/// Plain array of lanes. Layout is exactly `[T; N]`.
#[derive(Clone, Copy, Debug, PartialEq)]
#[repr(transparent)]
pub struct SimdVector<T, const N: usize>(pub [T; N]);

// SAFETY: repr(transparent) over [T; N], which is Zeroable/Pod whenever T is.
unsafe impl<T: Zeroable, const N: usize> Zeroable for SimdVector<T, N> {}
unsafe impl<T: Pod, const N: usize> Pod for SimdVector<T, N> {}

pub type VRealF<const N: usize> = SimdVector<f32, N>;
pub type VRealD<const N: usize> = SimdVector<f64, N>;
pub type VComplexF<const N: usize> = SimdVector<Complex32, N>;
pub type VComplexD<const N: usize> = SimdVector<Complex64, N>;

impl<T: Copy, const N: usize> SimdVector<T, N> {
    pub fn splat(value: T) -> Self {
        Self([value; N])
    }

    pub fn lanes(&self) -> &[T; N] {
        &self.0
    }
}

/// Lane mask swapped by a permute or exchange of type `ptype`.
pub fn lane_mask(nsimd: usize, ptype: usize) -> usize {
    nsimd >> (ptype + 1)
}

/// A site object built from `NSIMD` lanes of a scalar type.
pub trait SimdSite: Pod + Send + Sync {
    type Scalar: Pod + Send + Sync + PartialEq + Debug;

    const NSIMD: usize;

    fn lane(&self, lane: usize) -> Self::Scalar;

    fn set_lane(&mut self, lane: usize, value: Self::Scalar);

    /// Swap lane blocks of type `ptype`: lane `i` takes lane `i ^ mask`.
    fn permute(&self, ptype: usize) -> Self {
        let msk = lane_mask(Self::NSIMD, ptype);
        let mut out = *self;
        for i in 0..Self::NSIMD {
            out.set_lane(i, self.lane(i ^ msk));
        }
        out
    }

    /// Interleave two vectors at lane granularity `N >> (ptype + 1)`.
    ///
    /// `out1` collects the low halves of both inputs and `out2` the high
    /// halves. Applying it twice restores the inputs.
    fn exchange(out1: &mut Self, out2: &mut Self, in1: &Self, in2: &Self, ptype: usize) {
        let msk = lane_mask(Self::NSIMD, ptype);
        for i in 0..Self::NSIMD {
            if i & msk == 0 {
                out1.set_lane(i, in1.lane(i));
                out2.set_lane(i, in1.lane(i | msk));
            } else {
                out1.set_lane(i, in2.lane(i & !msk));
                out2.set_lane(i, in2.lane(i));
            }
        }
    }
}

impl<T, const N: usize> SimdSite for SimdVector<T, N>
where
    T: Pod + Send + Sync + PartialEq + Debug,
{
    type Scalar = T;

    const NSIMD: usize = N;

    fn lane(&self, lane: usize) -> T {
        self.0[lane]
    }

    fn set_lane(&mut self, lane: usize, value: T) {
        self.0[lane] = value;
    }
}

/// Lossy conversion to a half-width wire representation and back.
pub trait Narrow: Pod + Send + Sync {
    type Narrowed: Pod + Send + Sync;

    fn narrow(&self) -> Self::Narrowed;

    fn widen(narrowed: &Self::Narrowed) -> Self;
}

impl Narrow for f64 {
    type Narrowed = f32;

    fn narrow(&self) -> f32 {
        *self as f32
    }

    fn widen(narrowed: &f32) -> f64 {
        f64::from(*narrowed)
    }
}

impl Narrow for Complex64 {
    type Narrowed = Complex32;

    fn narrow(&self) -> Complex32 {
        Complex32::new(self.re as f32, self.im as f32)
    }

    fn widen(narrowed: &Complex32) -> Complex64 {
        Complex64::new(f64::from(narrowed.re), f64::from(narrowed.im))
    }
}

impl<T: Narrow, const N: usize> Narrow for SimdVector<T, N> {
    type Narrowed = SimdVector<T::Narrowed, N>;

    fn narrow(&self) -> Self::Narrowed {
        SimdVector(std::array::from_fn(|i| self.0[i].narrow()))
    }

    fn widen(narrowed: &Self::Narrowed) -> Self {
        SimdVector(std::array::from_fn(|i| T::widen(&narrowed.0[i])))
    }
}
