//! Merge and decompression descriptors and the phases that apply them.

use bytemuck::Pod;
use rayon::prelude::*;

use super::compressor::Decompressor;
use super::entry::{Location, UnifiedBuffers};
use super::CartesianStencil;
use crate::error::Result;

/// Interleave two half faces of a SIMD-split plane into `buffer_size` halo sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Merge {
    pub dest: Location,
    pub halves: [Location; 2],
    pub buffer_size: usize,
    pub ptype: usize,
}

/// Expand `buffer_size` received wire objects into halo sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decompress {
    pub dest: Location,
    pub src: Location,
    pub buffer_size: usize,
}

impl<V, H> CartesianStencil<V, H>
where
    V: Pod + Send + Sync,
    H: Pod + Send + Sync,
{
    /// Merge the faces that never crossed the transport.
    pub(crate) fn comms_merge_shm<W, D>(&mut self, decompress: &D) -> Result<()>
    where
        W: Pod + Send + Sync,
        D: Decompressor<W, H>,
    {
        self.transport.stencil_barrier()?;
        merge_family::<W, H, D>(&mut self.buffers, &self.plan.mergers_shm, decompress)
    }

    /// Apply duplicate copies, then every remaining merge.
    pub(crate) fn comms_merge<W, D>(&mut self, decompress: &D) -> Result<()>
    where
        W: Pod + Send + Sync,
        D: Decompressor<W, H>,
    {
        self.comms_copy()?;
        merge_family::<W, H, D>(&mut self.buffers, &self.plan.mergers, decompress)
    }

    /// Expand every received compressed face into the halo.
    pub(crate) fn comms_decompress<W, D>(&mut self, decompress: &D) -> Result<()>
    where
        W: Pod + Send + Sync,
        D: Decompressor<W, H>,
    {
        decompress_family::<W, H, D>(&mut self.buffers, &self.plan.decompressions, decompress)
    }
}

fn merge_family<W, H, D>(buffers: &mut UnifiedBuffers, mergers: &[Merge], d: &D) -> Result<()>
where
    W: Pod + Send + Sync,
    H: Pod + Send + Sync,
    D: Decompressor<W, H>,
{
    for m in mergers {
        let half = m.buffer_size / 2;
        let (dest, others) = buffers.split_mut(m.dest.buf);
        let lo = others.get(m.halves[0].buf)?.typed::<W>(m.halves[0].byte_offset, half)?;
        let hi = others.get(m.halves[1].buf)?.typed::<W>(m.halves[1].byte_offset, half)?;
        let out = dest.typed_mut::<H>(m.dest.byte_offset, 2 * half)?;
        let ptype = m.ptype;
        out.par_chunks_exact_mut(2)
            .zip(lo.par_iter().zip(hi.par_iter()))
            .for_each(|(pair, (a, b))| {
                let (first, second) = pair.split_at_mut(1);
                d.exchange(&mut first[0], &mut second[0], a, b, ptype);
            });
    }
    Ok(())
}

fn decompress_family<W, H, D>(
    buffers: &mut UnifiedBuffers,
    decompressions: &[Decompress],
    d: &D,
) -> Result<()>
where
    W: Pod + Send + Sync,
    H: Pod + Send + Sync,
    D: Decompressor<W, H>,
{
    for dc in decompressions {
        let (dest, others) = buffers.split_mut(dc.dest.buf);
        let src = others.get(dc.src.buf)?.typed::<W>(dc.src.byte_offset, dc.buffer_size)?;
        let out = dest.typed_mut::<H>(dc.dest.byte_offset, dc.buffer_size)?;
        out.par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(o, s)| d.decompress(o, s));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simd::{SimdVector, VRealD, VRealF};
    use crate::stencil::compressor::{ReducedPrecisionCompressor, SimpleCompressor};
    use crate::stencil::entry::BufferId;

    #[test]
    fn merge_interleaves_halves() {
        let mut bufs = UnifiedBuffers::new(4 * 16);
        bufs.get_mut(BufferId::SimdSend(0))
            .typed_mut::<VRealD<2>>(0, 2)
            .unwrap()
            .copy_from_slice(&[SimdVector([0.0, 10.0]), SimdVector([2.0, 12.0])]);
        bufs.get_mut(BufferId::SimdRecv(1))
            .typed_mut::<VRealD<2>>(0, 2)
            .unwrap()
            .copy_from_slice(&[SimdVector([1.0, 11.0]), SimdVector([3.0, 13.0])]);

        let m = Merge {
            dest: Location::new(BufferId::Recv, 0),
            halves: [
                Location::new(BufferId::SimdSend(0), 0),
                Location::new(BufferId::SimdRecv(1), 0),
            ],
            buffer_size: 4,
            ptype: 0,
        };
        merge_family::<VRealD<2>, VRealD<2>, _>(&mut bufs, &[m], &SimpleCompressor).unwrap();

        let out = bufs.get(BufferId::Recv).typed::<VRealD<2>>(0, 4).unwrap();
        assert_eq!(out[0].0, [0.0, 1.0]);
        assert_eq!(out[1].0, [10.0, 11.0]);
        assert_eq!(out[2].0, [2.0, 3.0]);
        assert_eq!(out[3].0, [12.0, 13.0]);
    }

    #[test]
    fn decompress_widens_into_the_halo() {
        let mut bufs = UnifiedBuffers::new(3 * 16);
        bufs.get_mut(BufferId::SimdRecv(0))
            .typed_mut::<VRealF<2>>(0, 3)
            .unwrap()
            .copy_from_slice(&[
                SimdVector([0.5, 1.5]),
                SimdVector([2.5, 3.5]),
                SimdVector([-1.0, 0.25]),
            ]);
        let dc = Decompress {
            dest: Location::new(BufferId::Recv, 16),
            src: Location::new(BufferId::SimdRecv(0), 8),
            buffer_size: 2,
        };
        let c = ReducedPrecisionCompressor::<VRealD<2>>::new();
        decompress_family::<VRealF<2>, VRealD<2>, _>(&mut bufs, &[dc], &c).unwrap();

        let out = bufs.get(BufferId::Recv).typed::<VRealD<2>>(0, 3).unwrap();
        assert_eq!(out[0].0, [0.0, 0.0]);
        assert_eq!(out[1].0, [2.5, 3.5]);
        assert_eq!(out[2].0, [-1.0, 0.25]);
    }

    #[test]
    fn merge_out_of_range_is_an_error() {
        let mut bufs = UnifiedBuffers::new(32);
        let m = Merge {
            dest: Location::new(BufferId::Recv, 16),
            halves: [
                Location::new(BufferId::SimdSend(0), 0),
                Location::new(BufferId::SimdSend(1), 0),
            ],
            buffer_size: 2,
            ptype: 0,
        };
        let r = merge_family::<VRealD<2>, VRealD<2>, _>(&mut bufs, &[m], &SimpleCompressor);
        assert!(r.is_err());
    }
}
