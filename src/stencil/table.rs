//! Neighbor table construction.
//!
//! For every point the builder walks the planes orthogonal to the point's
//! direction. A plane whose neighbor plane is on this process is tabled as a
//! local copy (with a lane permute when the shift rotates SIMD lanes); a
//! plane whose neighbor lives on another process gets consecutive slots in
//! the unified receive buffer, in the same order the gather fills them.

use crate::config::StencilParams;
use crate::error::{HaloError, Result};
use crate::grid::{GridTopology, Parity};

use super::entry::{StencilEntry, STENCIL_MAX};

/// One `(direction, displacement)` leg of a stencil.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StencilPoint {
    pub direction: usize,
    pub displacement: isize,
}

/// Precomputed neighbor table and per-point communication metadata.
#[derive(Debug, Clone)]
pub(crate) struct SiteTable {
    pub npoints: usize,
    pub entries: Vec<StencilEntry>,
    pub unified_buffer_size: usize,
    pub comm_buf_size: Vec<usize>,
    pub permute_type: Vec<usize>,
    pub comms_send: Vec<bool>,
    pub comms_recv: Vec<bool>,
    pub same_node: Vec<bool>,
    pub surface_list: Vec<usize>,
}

struct Builder<'a> {
    grid: &'a dyn GridTopology,
    checkerboard: Parity,
    points: &'a [StencilPoint],
    table: SiteTable,
}

impl SiteTable {
    pub fn build(
        grid: &dyn GridTopology,
        checkerboard: Parity,
        points: &[StencilPoint],
        params: &StencilParams,
        site_bytes: usize,
        halo_bytes: usize,
    ) -> Result<SiteTable> {
        validate_points(grid, points)?;

        let npoints = points.len();
        let osites = grid.osites();
        let mut b = Builder {
            grid,
            checkerboard,
            points,
            table: SiteTable {
                npoints,
                entries: vec![StencilEntry::default(); npoints * osites],
                unified_buffer_size: 0,
                comm_buf_size: vec![0; npoints],
                permute_type: vec![0; npoints],
                comms_send: vec![false; npoints],
                comms_recv: vec![false; npoints],
                same_node: vec![true; npoints],
                surface_list: Vec::new(),
            },
        };

        b.dirichlet_block(params)?;

        for (point, p) in points.iter().enumerate() {
            let dim = p.direction;
            b.table.permute_type[point] = grid.permute_type(dim);

            let comm_dim = grid.processors()[dim] > 1;
            let splice_dim = grid.simd_layout()[dim] > 1 && comm_dim;
            let shift = shift_of(grid, dim, p.displacement);
            let sshift = [
                grid.checkerboard_shift_for_cb(checkerboard, dim, shift, Parity::Even),
                grid.checkerboard_shift_for_cb(checkerboard, dim, shift, Parity::Odd),
            ];
            let two_pass = sshift[0] != sshift[1];

            if splice_dim {
                validate_splice(grid, dim, two_pass)?;
            }

            let passes: &[u8] = if two_pass { &[0x1, 0x2] } else { &[0x3] };
            for &cbmask in passes {
                if comm_dim {
                    b.comms(point, dim, p.displacement, cbmask);
                } else {
                    b.local(point, dim, p.displacement, cbmask);
                }
            }
        }

        let mut table = b.table;
        byte_offsets(&mut table.entries, site_bytes, halo_bytes);
        for (point, p) in points.iter().enumerate() {
            table.same_node[point] = same_node(grid, p);
        }
        table.build_surface_list(1, osites);

        tracing::debug!(
            npoints,
            osites,
            unified_buffer_size = table.unified_buffer_size,
            checkerboard = ?checkerboard,
            "stencil table built"
        );
        Ok(table)
    }

    pub fn index(&self, point: usize, site: usize) -> usize {
        point + self.npoints * site
    }

    pub fn entry(&self, point: usize, site: usize) -> &StencilEntry {
        &self.entries[self.index(point, site)]
    }

    /// Collect sites (in units of `ls` inner sites) that read any off-node neighbor.
    pub fn build_surface_list(&mut self, ls: usize, vol: usize) {
        self.surface_list = (0..vol)
            .filter(|&site| {
                (0..self.npoints).any(|point| {
                    !self.entry(point, site * ls).is_local() && !self.same_node[point]
                })
            })
            .collect();
    }
}

/// Byte offsets of local entries index the field, of halo entries the receive buffer.
pub(crate) fn byte_offsets(entries: &mut [StencilEntry], site_bytes: usize, halo_bytes: usize) {
    for e in entries.iter_mut() {
        let size = if e.is_local() { site_bytes } else { halo_bytes };
        e.byte_offset = e.offset * size as u64;
    }
}

/// A point never leaves this node when its axis is not distributed or it does not move.
pub(crate) fn same_node(grid: &dyn GridTopology, p: &StencilPoint) -> bool {
    let comm_dim = grid.processors()[p.direction] > 1;
    !comm_dim || p.displacement == 0
}

/// Displacement mapped to a non-negative shift modulo the full extent.
pub(crate) fn shift_of(grid: &dyn GridTopology, dim: usize, displacement: isize) -> usize {
    let fd = grid.fdimensions()[dim] as isize;
    displacement.rem_euclid(fd) as usize
}

fn validate_points(grid: &dyn GridTopology, points: &[StencilPoint]) -> Result<()> {
    if points.len() > STENCIL_MAX {
        return Err(HaloError::Topology(format!(
            "{} points exceed the stencil limit of {}",
            points.len(),
            STENCIL_MAX
        )));
    }
    for p in points {
        if p.direction >= grid.nd() {
            return Err(HaloError::Topology(format!(
                "direction {} outside a {}-dimensional grid",
                p.direction,
                grid.nd()
            )));
        }
        let dim = p.direction;
        let rotate_dim = grid.simd_layout()[dim] > 2;
        let comm_dim = grid.processors()[dim] > 1;
        if rotate_dim && comm_dim {
            return Err(HaloError::Topology(format!(
                "dimension {} is both distributed and spread over {} SIMD lanes",
                dim,
                grid.simd_layout()[dim]
            )));
        }
    }
    Ok(())
}

fn validate_splice(grid: &dyn GridTopology, dim: usize, two_pass: bool) -> Result<()> {
    if two_pass {
        return Err(HaloError::Topology(format!(
            "SIMD-split communication along checkerboarded dimension {} needs a parity-dependent shift",
            dim
        )));
    }
    let buffer_size = grid.slice_nblock(dim) * grid.slice_block(dim);
    if buffer_size % 2 != 0 {
        return Err(HaloError::Topology(format!(
            "SIMD-split plane of {} sites along dimension {} cannot be halved",
            buffer_size, dim
        )));
    }
    Ok(())
}

impl Builder<'_> {
    fn dirichlet_block(&mut self, params: &StencilParams) -> Result<()> {
        let grid = self.grid;
        for (ii, p) in self.points.iter().enumerate() {
            let dim = p.direction;
            let fd = grid.fdimensions()[dim];
            let pd = grid.processors()[dim];
            let pc = grid.processor_coor()[dim];
            let ld = fd / pd;
            let comm_dim = pd > 1;
            let block = params.dirichlet_block(dim);

            self.table.comms_send[ii] = comm_dim;
            self.table.comms_recv[ii] = comm_dim;
            if block == 0 || !comm_dim {
                continue;
            }

            if fd % block != 0 || block % ld != 0 {
                return Err(HaloError::Topology(format!(
                    "Dirichlet block {} along dimension {} must divide {} and be a multiple of {}",
                    block, dim, fd, ld
                )));
            }
            if p.displacement.unsigned_abs() >= ld {
                return Err(HaloError::Topology(format!(
                    "displacement {} reaches past the local extent {} of a Dirichlet-blocked dimension",
                    p.displacement, ld
                )));
            }

            let upper_edge = (ld * (pc + 1)) % block == 0;
            let lower_edge = (ld * pc) % block == 0;
            if p.displacement > 0 {
                if upper_edge {
                    self.table.comms_recv[ii] = false;
                }
                if lower_edge {
                    self.table.comms_send[ii] = false;
                }
            } else {
                if upper_edge {
                    self.table.comms_send[ii] = false;
                }
                if lower_edge {
                    self.table.comms_recv[ii] = false;
                }
            }
        }
        Ok(())
    }

    fn local(&mut self, point: usize, dim: usize, shiftpm: isize, cbmask: u8) {
        let grid = self.grid;
        let rd = grid.rdimensions()[dim];
        let ly = grid.simd_layout()[dim];
        let shift = shift_of(grid, dim, shiftpm);
        let permute_dim = grid.permute_dim(dim);
        let cb = Parity::from_mask(cbmask);
        let sshift = grid.checkerboard_shift_for_cb(self.checkerboard, dim, shift, cb);

        for x in 0..rd {
            let sx = (x + sshift) % rd;
            let wrap = (shiftpm == -1 && sx > x) || (shiftpm == 1 && sx < x);

            let mut permute_slice = 0;
            if permute_dim {
                let wrap_lanes = (sshift / rd) % ly;
                let num = sshift % rd;
                permute_slice = if x < rd - num {
                    wrap_lanes
                } else {
                    (wrap_lanes + 1) % ly
                };
            }
            self.copy_plane(point, dim, x, sx, cbmask, permute_slice != 0, wrap);
        }
    }

    fn comms(&mut self, point: usize, dim: usize, shiftpm: isize, cbmask: u8) {
        let grid = self.grid;
        let comms_recv = self.table.comms_recv[point];
        let nsimd = grid.nsimd();
        let ld = grid.ldimensions()[dim];
        let rd = grid.rdimensions()[dim];
        let pd = grid.processors()[dim];
        let pc = grid.processor_coor()[dim];
        let simd_layout = grid.simd_layout()[dim];
        let shift = shift_of(grid, dim, shiftpm);

        let buffer_size = grid.slice_nblock(dim) * grid.slice_block(dim);
        self.table.comm_buf_size[point] = buffer_size;

        let cb = Parity::from_mask(cbmask);
        let sshift = grid.checkerboard_shift_for_cb(self.checkerboard, dim, shift, cb);
        let permute_type = grid.permute_type(dim);

        for x in 0..rd {
            let sx = (x + sshift) % rd;

            let offnode = if simd_layout > 1 {
                let inner_bit = nsimd >> (permute_type + 1);
                (0..nsimd).any(|lane| {
                    let ic = usize::from(lane & inner_bit != 0);
                    let nbr_coor = rd * ic + x + sshift;
                    (nbr_coor / ld) % pd != 0
                })
            } else {
                ((x + sshift) / rd) % pd != 0
            };

            let wrap = (shiftpm == -1 && sx > x && pc == 0)
                || (shiftpm == 1 && sx < x && pc == pd - 1);

            if !offnode {
                self.copy_plane(point, dim, x, sx, cbmask, false, wrap);
            } else if !comms_recv {
                // blocked receive: wrap inside this process' own domain
                self.copy_plane(point, dim, x, sx, cbmask, grid.permute_dim(dim), wrap);
            } else {
                let offset = self.table.unified_buffer_size;
                self.scatter_plane(point, dim, x, cbmask, offset, wrap);
            }

            if offnode {
                let words = if cbmask == 0x3 { buffer_size } else { buffer_size >> 1 };
                self.table.unified_buffer_size += words;
            }
        }
    }

    /// Sites of the plane whose block parity the pass mask selects.
    fn plane_sites(&self, dim: usize, cbmask: u8) -> Vec<usize> {
        let grid = self.grid;
        let block = grid.slice_block(dim);
        let stride = grid.slice_stride(dim);
        let checkerboarded = grid.checkerboarded(dim);
        (0..grid.slice_nblock(dim))
            .flat_map(|n| (0..block).map(move |b| n * stride + b))
            .filter(|&o| !checkerboarded || grid.checkerboard_from_oindex(o).mask() & cbmask != 0)
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_plane(
        &mut self,
        point: usize,
        dim: usize,
        lplane: usize,
        rplane: usize,
        cbmask: u8,
        permute: bool,
        wrap: bool,
    ) {
        let ostride = self.grid.ostride(dim);
        let ro = rplane * ostride;
        let lo = lplane * ostride;
        for o in self.plane_sites(dim, cbmask) {
            let idx = point + (lo + o) * self.table.npoints;
            self.table.entries[idx] = StencilEntry::local(ro + o, permute, wrap);
        }
    }

    fn scatter_plane(
        &mut self,
        point: usize,
        dim: usize,
        plane: usize,
        cbmask: u8,
        offset: usize,
        wrap: bool,
    ) {
        let so = plane * self.grid.ostride(dim);
        for (bo, o) in self.plane_sites(dim, cbmask).into_iter().enumerate() {
            let idx = point + (so + o) * self.table.npoints;
            self.table.entries[idx] = StencilEntry::halo(offset + bo, wrap);
        }
    }
}

/// Face table of a plane: `(buffer slot, plane-relative site)` pairs in gather order.
pub(crate) fn gather_plane_table_compute(
    grid: &dyn GridTopology,
    dim: usize,
    cbmask: u8,
) -> Vec<(usize, usize)> {
    let block = grid.slice_block(dim);
    let stride = grid.slice_stride(dim);
    let nblock = grid.slice_nblock(dim);

    if cbmask == 0x3 {
        return (0..nblock)
            .flat_map(|n| (0..block).map(move |b| (n * block + b, n * stride + b)))
            .collect();
    }
    let checkerboarded = grid.checkerboarded(dim);
    (0..nblock)
        .flat_map(|n| (0..block).map(move |b| n * stride + b))
        .filter(|&o| !checkerboarded || grid.checkerboard_from_oindex(o).mask() & cbmask != 0)
        .enumerate()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CartesianGrid;

    fn table(grid: &CartesianGrid, points: &[(usize, isize)], params: &StencilParams) -> SiteTable {
        let points: Vec<StencilPoint> = points
            .iter()
            .map(|&(direction, displacement)| StencilPoint {
                direction,
                displacement,
            })
            .collect();
        SiteTable::build(grid, Parity::Even, &points, params, 16, 8).unwrap()
    }

    #[test]
    fn local_shift_wraps_periodically() {
        let g = CartesianGrid::new(&[4], &[1], &[1], 0).unwrap();
        let t = table(&g, &[(0, 1), (0, -1)], &StencilParams::default());
        assert_eq!(t.unified_buffer_size, 0);
        for site in 0..4 {
            let up = t.entry(0, site);
            assert!(up.is_local());
            assert_eq!(up.offset(), (site + 1) % 4);
            assert_eq!(up.around_the_world(), site == 3);
            let down = t.entry(1, site);
            assert_eq!(down.offset(), (site + 3) % 4);
            assert_eq!(down.around_the_world(), site == 0);
        }
        assert!(t.surface_list.is_empty());
    }

    #[test]
    fn local_simd_shift_permutes_boundary_plane() {
        // ld = 8 over 2 lanes: rd = 4, the last plane rotates lanes
        let g = CartesianGrid::new(&[8], &[1], &[2], 0).unwrap();
        let t = table(&g, &[(0, 1)], &StencilParams::default());
        for x in 0..4 {
            let e = t.entry(0, x);
            assert!(e.is_local());
            assert_eq!(e.offset(), (x + 1) % 4);
            assert_eq!(e.permute(), x == 3);
        }
    }

    #[test]
    fn two_rank_boundary_plane_goes_to_buffer() {
        let g = CartesianGrid::new(&[8], &[2], &[1], 0).unwrap();
        let t = table(&g, &[(0, 1)], &StencilParams::default());
        assert_eq!(t.unified_buffer_size, 1);
        assert_eq!(t.comm_buf_size[0], 1);
        for x in 0..3 {
            assert!(t.entry(0, x).is_local());
        }
        let e = t.entry(0, 3);
        assert!(!e.is_local());
        assert_eq!(e.offset(), 0);
        assert!(!e.around_the_world());
        assert_eq!(t.entry(0, 2).byte_offset(), 3 * 16);
        assert_eq!(t.surface_list, vec![3]);
        assert!(!t.same_node[0]);
    }

    #[test]
    fn wrap_flag_only_on_boundary_process() {
        let g = CartesianGrid::new(&[8], &[2], &[1], 1).unwrap();
        let t = table(&g, &[(0, 1), (0, -1)], &StencilParams::default());
        assert!(t.entry(0, 3).around_the_world());
        assert!(!t.entry(1, 0).around_the_world());
        assert_eq!(t.unified_buffer_size, 2);
    }

    #[test]
    fn plane_slots_follow_slice_order() {
        // 4x4 over [1, 2]: dimension 1 faces hold 4 sites each
        let g = CartesianGrid::new(&[4, 4], &[1, 2], &[1, 1], 0).unwrap();
        let t = table(&g, &[(1, 1)], &StencilParams::default());
        assert_eq!(t.unified_buffer_size, 4);
        for x0 in 0..4 {
            let site = x0 + 4;
            let e = t.entry(0, site);
            assert!(!e.is_local());
            assert_eq!(e.offset(), x0);
        }
        let faces = gather_plane_table_compute(&g, 1, 0x3);
        assert_eq!(faces, vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn dirichlet_unblocked_matches_baseline() {
        let g = CartesianGrid::new(&[8, 4], &[2, 1], &[1, 1], 1).unwrap();
        let points = [(0, 1), (0, -1), (1, 1), (1, -1)];
        let base = table(&g, &points, &StencilParams::default());
        let zero = table(
            &g,
            &points,
            &StencilParams {
                dirichlet: vec![0, 0],
                ..StencilParams::default()
            },
        );
        assert_eq!(base.entries, zero.entries);
        assert_eq!(base.comms_send, zero.comms_send);
        assert_eq!(base.comms_recv, zero.comms_recv);
    }

    #[test]
    fn dirichlet_block_cuts_global_edge() {
        let params = StencilParams {
            dirichlet: vec![8],
            ..StencilParams::default()
        };
        let upper = CartesianGrid::new(&[8], &[2], &[1], 1).unwrap();
        let t = table(&upper, &[(0, 1), (0, -1)], &params);
        assert_eq!(t.comms_recv, vec![false, true]);
        assert_eq!(t.comms_send, vec![true, false]);
        // blocked receive is tabled as a local copy of the own lower plane
        let e = t.entry(0, 3);
        assert!(e.is_local());
        assert_eq!(e.offset(), 0);

        let lower = CartesianGrid::new(&[8], &[2], &[1], 0).unwrap();
        let t = table(&lower, &[(0, 1), (0, -1)], &params);
        assert_eq!(t.comms_recv, vec![true, false]);
        assert_eq!(t.comms_send, vec![false, true]);
    }

    #[test]
    fn dirichlet_block_equal_to_local_extent_cuts_every_leg() {
        let params = StencilParams {
            dirichlet: vec![4],
            ..StencilParams::default()
        };
        let g = CartesianGrid::new(&[8], &[2], &[1], 0).unwrap();
        let t = table(&g, &[(0, 1), (0, -1)], &params);
        assert_eq!(t.comms_recv, vec![false, false]);
        assert_eq!(t.comms_send, vec![false, false]);
        assert!(t.entries.iter().all(|e| e.is_local()));
    }

    #[test]
    fn rejects_bad_configurations() {
        let g = CartesianGrid::new(&[8], &[2], &[1], 0).unwrap();
        let pts = |v: &[(usize, isize)]| -> Vec<StencilPoint> {
            v.iter()
                .map(|&(direction, displacement)| StencilPoint {
                    direction,
                    displacement,
                })
                .collect()
        };
        let p = StencilParams::default();
        assert!(SiteTable::build(&g, Parity::Even, &pts(&[(1, 1)]), &p, 8, 8).is_err());
        assert!(SiteTable::build(&g, Parity::Even, &pts(&[(0, 1); 17]), &p, 8, 8).is_err());

        let blocked = |b: usize| StencilParams {
            dirichlet: vec![b],
            ..StencilParams::default()
        };
        assert!(SiteTable::build(&g, Parity::Even, &pts(&[(0, 1)]), &blocked(3), 8, 8).is_err());
        assert!(SiteTable::build(&g, Parity::Even, &pts(&[(0, 1)]), &blocked(2), 8, 8).is_err());
        assert!(SiteTable::build(&g, Parity::Even, &pts(&[(0, 4)]), &blocked(8), 8, 8).is_err());
    }

    #[test]
    fn red_black_two_pass_covers_every_site() {
        let g = CartesianGrid::red_black(&[8, 4], &[1, 1], &[1, 1], 0).unwrap();
        let t = table(&g, &[(0, 1), (0, -1)], &StencilParams::default());
        // gd[0] = 4: even-parity source, each output block parity takes its own shift
        for site in 0..g.osites() {
            let x = site % 4;
            let ocb = g.checkerboard_from_oindex(site);
            let up = t.entry(0, site);
            let down = t.entry(1, site);
            let up_shift = if ocb == Parity::Even { 1 } else { 0 };
            let down_shift = if ocb == Parity::Even { 0 } else { 3 };
            assert_eq!(up.offset() % 4, (x + up_shift) % 4);
            assert_eq!(down.offset() % 4, (x + down_shift) % 4);
            assert_eq!(up.offset() / 4, site / 4);
        }
    }
}
