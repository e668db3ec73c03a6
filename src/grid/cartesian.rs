//! Concrete Cartesian lattice decomposed over a process grid.

use super::{coor_from_index, GridTopology};
use crate::error::{HaloError, Result};

/// Full or red-black Cartesian lattice with a block decomposition over
/// processes and a per-axis SIMD lane split of 1 or 2.
#[derive(Debug, Clone)]
pub struct CartesianGrid {
    fdims: Vec<usize>,
    gdims: Vec<usize>,
    ldims: Vec<usize>,
    rdims: Vec<usize>,
    processors: Vec<usize>,
    processor_coor: Vec<usize>,
    simd: Vec<usize>,
    rank: usize,
    checker_dim: Option<usize>,
}

impl CartesianGrid {
    /// Full lattice of extent `fdims` split over `processors` with lane layout `simd`.
    pub fn new(fdims: &[usize], processors: &[usize], simd: &[usize], rank: usize) -> Result<Self> {
        Self::build(fdims, processors, simd, rank, None)
    }

    /// Red-black lattice: dimension 0 is halved and each field holds one parity.
    ///
    /// The parity of a site's orthogonal coordinates must be readable from its
    /// outer index, so every non-checkerboarded SIMD-reduced extent has to be even.
    pub fn red_black(
        fdims: &[usize],
        processors: &[usize],
        simd: &[usize],
        rank: usize,
    ) -> Result<Self> {
        Self::build(fdims, processors, simd, rank, Some(0))
    }

    fn build(
        fdims: &[usize],
        processors: &[usize],
        simd: &[usize],
        rank: usize,
        checker_dim: Option<usize>,
    ) -> Result<Self> {
        let nd = fdims.len();
        if nd == 0 {
            return Err(HaloError::Topology("lattice needs at least one dimension".into()));
        }
        if processors.len() != nd || simd.len() != nd {
            return Err(HaloError::Topology(format!(
                "dimension count mismatch: lattice {}, processors {}, simd {}",
                nd,
                processors.len(),
                simd.len()
            )));
        }
        if fdims.iter().chain(processors).any(|&e| e == 0) {
            return Err(HaloError::Topology("extents must be non-zero".into()));
        }
        if let Some(&bad) = simd.iter().find(|&&l| l != 1 && l != 2) {
            return Err(HaloError::Topology(format!(
                "SIMD lanes per dimension must be 1 or 2, got {}",
                bad
            )));
        }

        let mut gdims = fdims.to_vec();
        if let Some(cd) = checker_dim {
            if fdims[cd] % 2 != 0 {
                return Err(HaloError::Topology(format!(
                    "checkerboarded extent {} must be even",
                    fdims[cd]
                )));
            }
            gdims[cd] /= 2;
        }

        let mut ldims = Vec::with_capacity(nd);
        let mut rdims = Vec::with_capacity(nd);
        for d in 0..nd {
            if gdims[d] % processors[d] != 0 {
                return Err(HaloError::Topology(format!(
                    "dimension {}: extent {} does not divide over {} processes",
                    d, gdims[d], processors[d]
                )));
            }
            let ld = gdims[d] / processors[d];
            if ld % simd[d] != 0 {
                return Err(HaloError::Topology(format!(
                    "dimension {}: local extent {} does not divide over {} lanes",
                    d, ld, simd[d]
                )));
            }
            ldims.push(ld);
            rdims.push(ld / simd[d]);
        }

        if let Some(cd) = checker_dim {
            if let Some(d) = (0..nd).find(|&d| d != cd && rdims[d] % 2 != 0) {
                return Err(HaloError::Topology(format!(
                    "red-black dimension {}: reduced extent {} must be even",
                    d, rdims[d]
                )));
            }
        }

        let nranks: usize = processors.iter().product();
        if rank >= nranks {
            return Err(HaloError::Topology(format!(
                "rank {} outside a process grid of {}",
                rank, nranks
            )));
        }

        Ok(Self {
            fdims: fdims.to_vec(),
            gdims,
            ldims,
            rdims,
            processors: processors.to_vec(),
            processor_coor: coor_from_index(rank, processors),
            simd: simd.to_vec(),
            rank,
            checker_dim,
        })
    }
}

impl GridTopology for CartesianGrid {
    fn fdimensions(&self) -> &[usize] {
        &self.fdims
    }

    fn gdimensions(&self) -> &[usize] {
        &self.gdims
    }

    fn ldimensions(&self) -> &[usize] {
        &self.ldims
    }

    fn rdimensions(&self) -> &[usize] {
        &self.rdims
    }

    fn processors(&self) -> &[usize] {
        &self.processors
    }

    fn processor_coor(&self) -> &[usize] {
        &self.processor_coor
    }

    fn simd_layout(&self) -> &[usize] {
        &self.simd
    }

    fn this_rank(&self) -> usize {
        self.rank
    }

    fn checker_dim(&self) -> Option<usize> {
        self.checker_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Parity;

    #[test]
    fn full_grid_extents() {
        let g = CartesianGrid::new(&[8, 4], &[2, 1], &[1, 2], 1).unwrap();
        assert_eq!(g.ldimensions(), &[4, 4]);
        assert_eq!(g.rdimensions(), &[4, 2]);
        assert_eq!(g.processor_coor(), &[1, 0]);
        assert_eq!(g.osites(), 8);
        assert_eq!(g.nsimd(), 2);
        assert_eq!(g.slice_block(1), 4);
        assert_eq!(g.slice_stride(1), 8);
        assert_eq!(g.slice_nblock(1), 1);
        assert_eq!(g.slice_nblock(0), 2);
    }

    #[test]
    fn permute_type_counts_higher_split_dims() {
        let g = CartesianGrid::new(&[4, 4, 4], &[1, 1, 1], &[2, 1, 2], 0).unwrap();
        assert_eq!(g.permute_type(0), 1);
        assert_eq!(g.permute_type(1), 1);
        assert_eq!(g.permute_type(2), 0);
        assert!(g.permute_dim(0));
        assert!(!g.permute_dim(1));
    }

    #[test]
    fn shifted_ranks_wrap_periodically() {
        let g = CartesianGrid::new(&[12], &[3], &[1], 0).unwrap();
        assert_eq!(g.shifted_ranks(0, 1), (2, 1));
        let g = CartesianGrid::new(&[12], &[3], &[1], 2).unwrap();
        assert_eq!(g.shifted_ranks(0, 1), (1, 0));
        assert_eq!(g.shifted_ranks(0, 2), (0, 1));
    }

    #[test]
    fn global_coordinates_on_full_grid() {
        let g = CartesianGrid::new(&[8], &[2], &[2], 1).unwrap();
        // rd = 2: lane 1 of outer site 1 sits at local 3, global 7
        assert_eq!(g.global_coor(1, 1, Parity::Even), vec![7]);
        assert_eq!(g.global_coor(0, 0, Parity::Odd), vec![4]);
    }

    #[test]
    fn red_black_coordinates_have_requested_parity() {
        let g = CartesianGrid::red_black(&[8, 4], &[1, 2], &[1, 1], 1).unwrap();
        assert_eq!(g.gdimensions(), &[4, 4]);
        for parity in [Parity::Even, Parity::Odd] {
            for o in 0..g.osites() {
                let full = g.global_coor(o, 0, parity);
                assert_eq!(g.checkerboard(&full), parity);
                assert!(full[1] >= 2);
            }
        }
    }

    #[test]
    fn block_parity_matches_orthogonal_coordinates() {
        let g = CartesianGrid::red_black(&[4, 4, 4], &[1, 1, 1], &[1, 2, 1], 0).unwrap();
        for o in 0..g.osites() {
            for lane in 0..g.nsimd() {
                let full = g.global_coor(o, lane, Parity::Even);
                assert_eq!(g.checkerboard_from_oindex(o).bit(), (full[1] + full[2]) & 1);
            }
        }
    }

    #[test]
    fn checkerboard_shift_depends_on_block_parity() {
        let g = CartesianGrid::red_black(&[8, 2], &[1, 1], &[1, 1], 0).unwrap();
        assert_eq!(g.checkerboard_shift_for_cb(Parity::Even, 0, 1, Parity::Even), 1);
        assert_eq!(g.checkerboard_shift_for_cb(Parity::Even, 0, 1, Parity::Odd), 0);
        assert_eq!(g.checkerboard_shift_for_cb(Parity::Odd, 0, 7, Parity::Even), 3);
        assert_eq!(g.checkerboard_shift_for_cb(Parity::Odd, 0, 7, Parity::Odd), 4);
        assert_eq!(g.checkerboard_shift_for_cb(Parity::Odd, 1, 1, Parity::Odd), 1);
    }

    #[test]
    fn rejects_bad_decompositions() {
        assert!(CartesianGrid::new(&[6], &[4], &[1], 0).is_err());
        assert!(CartesianGrid::new(&[8], &[2], &[4], 0).is_err());
        assert!(CartesianGrid::new(&[8], &[2], &[1], 2).is_err());
        assert!(CartesianGrid::new(&[8, 8], &[2], &[1, 1], 0).is_err());
        assert!(CartesianGrid::red_black(&[6, 4], &[1, 1], &[1, 1], 0).is_err());
        assert!(CartesianGrid::red_black(&[8, 3], &[1, 1], &[1, 1], 0).is_err());
    }
}
