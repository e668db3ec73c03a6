//! Compression hooks applied on the way into and out of the communication buffers.
//!
//! A compressor turns source sites `V` into wire objects `Wire` while gathering
//! faces; the matching decompressor turns wire objects into halo objects `H`
//! that the neighbor table points at. Across a SIMD-split axis the gather
//! produces two half buffers (`compress_exchange`) and the merge interleaves
//! them back (`Decompressor::exchange`).

use std::marker::PhantomData;

use bytemuck::Pod;

use crate::simd::{Narrow, SimdSite};

pub trait Compressor<V>: Sync {
    type Wire: Pod + Send + Sync;

    /// Called once per stencil point before its faces are gathered.
    fn point(&mut self, _point: usize) {}

    /// Bytes one wire object occupies in flight.
    fn comm_datum_size(&self) -> usize {
        std::mem::size_of::<Self::Wire>()
    }

    fn compress(&self, dest: &mut Self::Wire, src: &V);

    /// Split sites `in_k` and `in_m` into a low-lane and a high-lane wire object.
    fn compress_exchange(
        &self,
        out0: &mut Self::Wire,
        out1: &mut Self::Wire,
        in_k: &V,
        in_m: &V,
        ptype: usize,
    );

    /// Whether received wire data needs a `decompress` pass into the halo.
    fn decompression_step(&self) -> bool {
        false
    }
}

pub trait Decompressor<W, H>: Sync {
    /// Inverse of `compress_exchange`: rebuild two halo sites from two halves.
    fn exchange(&self, out_lo: &mut H, out_hi: &mut H, in0: &W, in1: &W, ptype: usize);

    fn decompress(&self, dest: &mut H, src: &W);
}

/// Identity compressor: wire and halo objects are the site type itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleCompressor;

impl<V: SimdSite> Compressor<V> for SimpleCompressor {
    type Wire = V;

    fn compress(&self, dest: &mut V, src: &V) {
        *dest = *src;
    }

    fn compress_exchange(&self, out0: &mut V, out1: &mut V, in_k: &V, in_m: &V, ptype: usize) {
        V::exchange(out0, out1, in_k, in_m, ptype);
    }
}

impl<V: SimdSite> Decompressor<V, V> for SimpleCompressor {
    fn exchange(&self, out_lo: &mut V, out_hi: &mut V, in0: &V, in1: &V, ptype: usize) {
        V::exchange(out_lo, out_hi, in0, in1, ptype);
    }

    fn decompress(&self, dest: &mut V, src: &V) {
        *dest = *src;
    }
}

/// Sends half-width lanes and widens them back into full-precision halo sites.
#[derive(Debug, Clone, Copy)]
pub struct ReducedPrecisionCompressor<V> {
    _site: PhantomData<fn() -> V>,
}

impl<V> Default for ReducedPrecisionCompressor<V> {
    fn default() -> Self {
        Self { _site: PhantomData }
    }
}

impl<V> ReducedPrecisionCompressor<V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<V: SimdSite + Narrow> Compressor<V> for ReducedPrecisionCompressor<V> {
    type Wire = V::Narrowed;

    fn compress(&self, dest: &mut V::Narrowed, src: &V) {
        *dest = src.narrow();
    }

    fn compress_exchange(
        &self,
        out0: &mut V::Narrowed,
        out1: &mut V::Narrowed,
        in_k: &V,
        in_m: &V,
        ptype: usize,
    ) {
        let (mut lo, mut hi) = (*in_k, *in_m);
        V::exchange(&mut lo, &mut hi, in_k, in_m, ptype);
        *out0 = lo.narrow();
        *out1 = hi.narrow();
    }

    fn decompression_step(&self) -> bool {
        true
    }
}

impl<V: SimdSite + Narrow> Decompressor<V::Narrowed, V> for ReducedPrecisionCompressor<V> {
    fn exchange(&self, out_lo: &mut V, out_hi: &mut V, in0: &V::Narrowed, in1: &V::Narrowed, ptype: usize) {
        V::exchange(out_lo, out_hi, &V::widen(in0), &V::widen(in1), ptype);
    }

    fn decompress(&self, dest: &mut V, src: &V::Narrowed) {
        *dest = V::widen(src);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simd::{SimdVector, VRealD, VRealF};

    #[test]
    fn simple_exchange_round_trips() {
        let c = SimpleCompressor;
        let k = SimdVector([1.0, 2.0]);
        let m = SimdVector([3.0, 4.0]);
        let (mut o0, mut o1) = (VRealD::<2>::splat(0.0), VRealD::<2>::splat(0.0));
        c.compress_exchange(&mut o0, &mut o1, &k, &m, 0);
        assert_eq!(o0.0, [1.0, 3.0]);
        assert_eq!(o1.0, [2.0, 4.0]);
        let (mut a, mut b) = (VRealD::<2>::splat(0.0), VRealD::<2>::splat(0.0));
        Decompressor::exchange(&c, &mut a, &mut b, &o0, &o1, 0);
        assert_eq!((a, b), (k, m));
    }

    #[test]
    fn reduced_precision_halves_the_wire() {
        let c = ReducedPrecisionCompressor::<VRealD<2>>::new();
        assert_eq!(Compressor::<VRealD<2>>::comm_datum_size(&c), 8);
        assert!(Compressor::<VRealD<2>>::decompression_step(&c));

        let src = SimdVector([0.1f64, -7.25]);
        let mut wire = VRealF::<2>::splat(0.0);
        c.compress(&mut wire, &src);
        let mut back = VRealD::<2>::splat(0.0);
        c.decompress(&mut back, &wire);
        assert_eq!(back.0[1], -7.25);
        approx::assert_abs_diff_eq!(back.0[0], 0.1, epsilon = 1e-7);
    }

    #[test]
    fn reduced_precision_exchange_matches_simple() {
        let c = ReducedPrecisionCompressor::<VRealD<2>>::new();
        let k = SimdVector([1.5, 2.5]);
        let m = SimdVector([3.5, 4.5]);
        let (mut w0, mut w1) = (VRealF::<2>::splat(0.0), VRealF::<2>::splat(0.0));
        c.compress_exchange(&mut w0, &mut w1, &k, &m, 0);
        let (mut a, mut b) = (VRealD::<2>::splat(0.0), VRealD::<2>::splat(0.0));
        Decompressor::exchange(&c, &mut a, &mut b, &w0, &w1, 0);
        assert_eq!((a, b), (k, m));
    }
}
