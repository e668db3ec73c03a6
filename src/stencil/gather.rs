//! Face gathering: compress every off-node plane into the send buffers and
//! schedule the packets, copies, merges and decompressions that deliver it.

use std::mem::{align_of, size_of};
use std::sync::Arc;

use bytemuck::Pod;
use rayon::prelude::*;

use super::compressor::Compressor;
use super::entry::{BufferId, Location};
use super::merge::{Decompress, Merge};
use super::schedule::{Packet, TransferKey};
use super::table::{gather_plane_table_compute, shift_of};
use super::CartesianStencil;
use crate::error::{HaloError, Result};
use crate::field::Lattice;
use crate::grid::Parity;

impl<V, H> CartesianStencil<V, H>
where
    V: Pod + Send + Sync,
    H: Pod + Send + Sync,
{
    /// Gather every communicating face of `source` for the coming exchange.
    pub(crate) fn halo_gather<C>(&mut self, source: &Lattice<V>, compress: &mut C) -> Result<()>
    where
        C: Compressor<V>,
    {
        self.transport.stencil_barrier()?;
        self.check_source(source)?;
        check_compressor::<V, H, C>(compress)?;

        if !self.faces.computed {
            self.faces.tables.clear();
        }
        self.comm_offset = 0;
        let mut face_idx = 0;
        for point in 0..self.points.len() {
            compress.point(point);
            self.halo_gather_dir(source, &*compress, point, &mut face_idx)?;
        }
        self.faces.computed = true;

        if self.comm_offset != self.table.unified_buffer_size {
            return Err(HaloError::Capacity {
                gathered: self.comm_offset,
                expected: self.table.unified_buffer_size,
            });
        }
        Ok(())
    }

    fn halo_gather_dir<C>(
        &mut self,
        source: &Lattice<V>,
        compress: &C,
        point: usize,
        face_idx: &mut usize,
    ) -> Result<()>
    where
        C: Compressor<V>,
    {
        let grid = Arc::clone(&self.grid);
        let p = self.points[point];
        let dim = p.direction;
        if grid.processors()[dim] <= 1 {
            return Ok(());
        }
        let splice_dim = grid.simd_layout()[dim] > 1;
        let shift = shift_of(grid.as_ref(), dim, p.displacement);
        let cb = self.checkerboard;
        let sshift = [
            grid.checkerboard_shift_for_cb(cb, dim, shift, Parity::Even),
            grid.checkerboard_shift_for_cb(cb, dim, shift, Parity::Odd),
        ];

        if sshift[0] == sshift[1] {
            if splice_dim {
                self.gather_simd(source, compress, point, sshift[0], face_idx)
            } else {
                self.gather(source, compress, point, sshift[0], 0x3, face_idx)
            }
        } else if splice_dim {
            Err(HaloError::Topology(format!(
                "point {} splits SIMD lanes with a parity-dependent shift",
                point
            )))
        } else {
            self.gather(source, compress, point, sshift[0], 0x1, face_idx)?;
            self.gather(source, compress, point, sshift[1], 0x2, face_idx)
        }
    }

    fn ensure_face(&mut self, dim: usize, cbmask: u8, face_idx: usize) {
        if !self.faces.computed && self.faces.tables.len() == face_idx {
            let table = gather_plane_table_compute(self.grid.as_ref(), dim, cbmask);
            self.faces.tables.push(table);
        }
    }

    /// Planes along a non-SIMD axis: one packet per off-node plane.
    fn gather<C>(
        &mut self,
        source: &Lattice<V>,
        compress: &C,
        point: usize,
        sshift: usize,
        cbmask: u8,
        face_idx: &mut usize,
    ) -> Result<()>
    where
        C: Compressor<V>,
    {
        let grid = Arc::clone(&self.grid);
        let dim = self.points[point].direction;
        let rd = grid.rdimensions()[dim];
        let pd = grid.processors()[dim];
        let buffer_size = grid.slice_nblock(dim) * grid.slice_block(dim);
        let words = if cbmask == 0x3 { buffer_size } else { buffer_size >> 1 };
        let bytes = words * compress.comm_datum_size();
        let wire = size_of::<C::Wire>();
        let comms_send = self.table.comms_send[point];
        let comms_recv = self.table.comms_recv[point];
        let decompress = compress.decompression_step();
        let recv_buf = if decompress { BufferId::SimdRecv(0) } else { BufferId::Recv };

        for x in 0..rd {
            let sx = (x + sshift) % rd;
            let comm_proc = ((x + sshift) / rd) % pd;
            if comm_proc == 0 {
                continue;
            }
            let so = sx * grid.ostride(dim);
            let off = self.comm_offset;
            let (xmit_to, recv_from) = grid.shifted_ranks(dim, comm_proc);

            self.ensure_face(dim, cbmask, *face_idx);
            if comms_send {
                let out = self
                    .buffers
                    .get_mut(BufferId::Send)
                    .typed_mut::<C::Wire>(off * wire, words)?;
                gather_plane_simple_table(
                    &self.faces.tables[*face_idx],
                    source.as_slice(),
                    so,
                    out,
                    compress,
                );
            }

            let send = Location::new(BufferId::Send, off * wire);
            let recv = Location::new(recv_buf, off * wire);
            let key = TransferKey {
                direction: dim,
                orthog_plane: sx,
                dest_proc: comm_proc,
                bytes,
                lane: 0,
                half: 0,
                cb: cbmask,
            };
            if !self.plan.check_for_duplicate(key, recv) {
                self.plan.add_packet(Packet {
                    send,
                    recv,
                    to_rank: xmit_to,
                    do_send: comms_send,
                    from_rank: recv_from,
                    do_recv: comms_recv,
                    bytes,
                });
            }
            if decompress && comms_recv {
                self.plan.decompressions.push(Decompress {
                    dest: Location::new(BufferId::Recv, off * size_of::<H>()),
                    src: recv,
                    buffer_size: words,
                });
            }

            self.comm_offset += words;
            *face_idx += 1;
        }
        Ok(())
    }

    /// Planes along a SIMD-split axis: each lane half travels separately and
    /// is merged back into whole vectors after communication.
    fn gather_simd<C>(
        &mut self,
        source: &Lattice<V>,
        compress: &C,
        point: usize,
        sshift: usize,
        face_idx: &mut usize,
    ) -> Result<()>
    where
        C: Compressor<V>,
    {
        let grid = Arc::clone(&self.grid);
        let dim = self.points[point].direction;
        let gd = grid.gdimensions()[dim];
        let ld = grid.ldimensions()[dim];
        let rd = grid.rdimensions()[dim];
        let pd = grid.processors()[dim];
        let buffer_size = grid.slice_nblock(dim) * grid.slice_block(dim);
        let half = buffer_size / 2;
        let bytes = half * compress.comm_datum_size();
        let ptype = grid.permute_type(dim);
        let wire = size_of::<C::Wire>();
        let comms_send = self.table.comms_send[point];
        let comms_recv = self.table.comms_recv[point];

        for x in 0..rd {
            if (x + sshift) % gd < rd {
                continue;
            }
            let sx = (x + sshift) % rd;
            let so = sx * grid.ostride(dim);
            let off = self.comm_offset;

            // the merge reads local halves from the send buffers even when
            // the send leg is cut
            self.ensure_face(dim, 0x3, *face_idx);
            let (lo, hi) = self.buffers.simd_send_mut();
            let out0 = lo.typed_mut::<C::Wire>(off * wire, half)?;
            let out1 = hi.typed_mut::<C::Wire>(off * wire, half)?;
            gather_plane_exchange_table(
                &self.faces.tables[*face_idx],
                source.as_slice(),
                so,
                out0,
                out1,
                ptype,
                compress,
            );
            *face_idx += 1;

            let mut halves = [Location::new(BufferId::SimdSend(0), off * wire); 2];
            for (i, slot) in halves.iter_mut().enumerate() {
                let nbr = rd * i + x + sshift;
                let nbr_proc = (nbr / ld) % pd;
                let nbr_ic = (nbr % ld) / rd;
                let rp = Location::new(BufferId::SimdRecv(i as u8), off * wire);
                let sp = Location::new(BufferId::SimdSend(nbr_ic as u8), off * wire);

                if nbr_proc == 0 {
                    *slot = sp;
                    continue;
                }
                *slot = rp;
                let (xmit_to, recv_from) = grid.shifted_ranks(dim, nbr_proc);
                let key = TransferKey {
                    direction: dim,
                    orthog_plane: sx,
                    dest_proc: nbr_proc,
                    bytes,
                    lane: i,
                    half: nbr_ic,
                    cb: 0x3,
                };
                if !self.plan.check_for_duplicate(key, rp) {
                    self.plan.add_packet(Packet {
                        send: sp,
                        recv: rp,
                        to_rank: xmit_to,
                        do_send: comms_send,
                        from_rank: recv_from,
                        do_recv: comms_recv,
                        bytes,
                    });
                }
            }

            self.plan.add_merge(Merge {
                dest: Location::new(BufferId::Recv, off * size_of::<H>()),
                halves,
                buffer_size,
                ptype,
            });
            self.comm_offset += buffer_size;
        }
        Ok(())
    }
}

/// Wire objects must fit the halo slots they are staged in.
fn check_compressor<V, H, C: Compressor<V>>(compress: &C) -> Result<()> {
    let wire = size_of::<C::Wire>();
    let halo = size_of::<H>();
    if compress.comm_datum_size() != wire {
        return Err(HaloError::Compressor(format!(
            "comm datum of {} bytes for a {} byte wire type",
            compress.comm_datum_size(),
            wire
        )));
    }
    if wire > halo || align_of::<C::Wire>() > 8 {
        return Err(HaloError::Compressor(format!(
            "wire type of {} bytes does not fit a {} byte halo slot",
            wire, halo
        )));
    }
    if !compress.decompression_step() && wire != halo {
        return Err(HaloError::Compressor(format!(
            "wire type of {} bytes lands in a {} byte halo without decompression",
            wire, halo
        )));
    }
    Ok(())
}

/// Compress the plane starting at outer site `so` into `buffer`.
///
/// Face tables list buffer slots in ascending order, so slot `i` is `table[i]`.
pub(crate) fn gather_plane_simple_table<V, C>(
    table: &[(usize, usize)],
    rhs: &[V],
    so: usize,
    buffer: &mut [C::Wire],
    compress: &C,
) where
    V: Sync,
    C: Compressor<V>,
{
    buffer
        .par_iter_mut()
        .zip(table.par_iter())
        .for_each(|(dest, &(_, site))| compress.compress(dest, &rhs[so + site]));
}

/// Compress consecutive site pairs of a plane into low and high lane halves.
pub(crate) fn gather_plane_exchange_table<V, C>(
    table: &[(usize, usize)],
    rhs: &[V],
    so: usize,
    out0: &mut [C::Wire],
    out1: &mut [C::Wire],
    ptype: usize,
    compress: &C,
) where
    V: Sync,
    C: Compressor<V>,
{
    out0.par_iter_mut()
        .zip(out1.par_iter_mut())
        .zip(table.par_chunks_exact(2))
        .for_each(|((o0, o1), pair)| {
            compress.compress_exchange(o0, o1, &rhs[so + pair[0].1], &rhs[so + pair[1].1], ptype);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CartesianGrid;
    use crate::simd::{SimdVector, VRealD, VRealF};
    use crate::stencil::compressor::{ReducedPrecisionCompressor, SimpleCompressor};

    #[test]
    fn face_slots_ascend() {
        let grid = CartesianGrid::red_black(&[8, 4], &[2, 1], &[1, 1], 0).unwrap();
        for mask in [0x1, 0x2, 0x3] {
            let t = gather_plane_table_compute(&grid, 0, mask);
            assert!(t.iter().enumerate().all(|(i, &(slot, _))| slot == i));
        }
    }

    #[test]
    fn simple_table_gathers_plane_sites() {
        let rhs: Vec<VRealD<1>> = (0..12).map(|i| SimdVector([i as f64])).collect();
        let table = vec![(0, 0), (1, 4), (2, 8)];
        let mut out = vec![VRealD::<1>::splat(-1.0); 3];
        gather_plane_simple_table(&table, &rhs, 3, &mut out, &SimpleCompressor);
        assert_eq!(out.iter().map(|v| v.0[0]).collect::<Vec<_>>(), vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn exchange_table_splits_lanes() {
        let rhs = vec![SimdVector([1.0, 2.0]), SimdVector([3.0, 4.0])];
        let table = vec![(0, 0), (1, 1)];
        let mut lo = vec![VRealD::<2>::splat(0.0)];
        let mut hi = vec![VRealD::<2>::splat(0.0)];
        gather_plane_exchange_table(&table, &rhs, 0, &mut lo, &mut hi, 0, &SimpleCompressor);
        assert_eq!(lo[0].0, [1.0, 3.0]);
        assert_eq!(hi[0].0, [2.0, 4.0]);
    }

    #[derive(Default)]
    struct Lying;

    impl Compressor<VRealD<1>> for Lying {
        type Wire = VRealF<1>;
        fn compress(&self, dest: &mut VRealF<1>, src: &VRealD<1>) {
            dest.0[0] = src.0[0] as f32;
        }
        fn compress_exchange(
            &self,
            _: &mut VRealF<1>,
            _: &mut VRealF<1>,
            _: &VRealD<1>,
            _: &VRealD<1>,
            _: usize,
        ) {
        }
    }

    #[test]
    fn compressor_checks() {
        assert!(check_compressor::<VRealD<2>, VRealD<2>, _>(&SimpleCompressor).is_ok());
        let reduced = ReducedPrecisionCompressor::<VRealD<2>>::new();
        assert!(check_compressor::<VRealD<2>, VRealD<2>, _>(&reduced).is_ok());
        // narrower wire without a decompression pass
        let r = check_compressor::<VRealD<1>, VRealD<1>, _>(&Lying);
        assert!(matches!(r, Err(HaloError::Compressor(_))));
        // wire wider than the halo
        let r = check_compressor::<VRealD<2>, VRealF<2>, _>(&SimpleCompressor);
        assert!(matches!(r, Err(HaloError::Compressor(_))));
    }
}
