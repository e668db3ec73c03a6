//! Lattice geometry consumed by the stencil engine.
//!
//! The stencil never owns a decomposition of its own. Everything it needs to
//! know about the lattice (global, local and SIMD-reduced extents, process
//! coordinates, lane layout, checkerboarding) comes through [`GridTopology`].
//! Implementors provide the raw extents; index arithmetic shared by every
//! layout (strides, slices, parity-aware shifts, shifted ranks) is supplied
//! by the trait's provided methods.
//!
//! Ordering conventions: outer-site indices, SIMD lane indices and process
//! ranks are all lexicographic with dimension 0 running fastest.

pub mod cartesian;

pub use cartesian::CartesianGrid;

/// Checkerboard (parity) class of a site: coordinate sum even or odd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Parity {
    #[default]
    Even,
    Odd,
}

impl Parity {
    pub fn from_bit(bit: usize) -> Self {
        if bit & 1 == 0 {
            Parity::Even
        } else {
            Parity::Odd
        }
    }

    pub fn bit(self) -> usize {
        match self {
            Parity::Even => 0,
            Parity::Odd => 1,
        }
    }

    pub fn flip(self) -> Self {
        Parity::from_bit(self.bit() ^ 1)
    }

    /// Parity mask bit used by the two-pass table builders (0x1 even, 0x2 odd).
    pub fn mask(self) -> u8 {
        1 << self.bit()
    }

    /// Parity selected by a pass mask; the odd pass is 0x2, everything else even.
    pub fn from_mask(cbmask: u8) -> Self {
        if cbmask == 0x2 {
            Parity::Odd
        } else {
            Parity::Even
        }
    }
}

/// Coordinates of a lexicographic index (dimension 0 fastest).
pub fn coor_from_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coor = Vec::with_capacity(dims.len());
    for &d in dims {
        coor.push(index % d);
        index /= d;
    }
    coor
}

/// Lexicographic index of a coordinate (dimension 0 fastest).
pub fn index_from_coor(coor: &[usize], dims: &[usize]) -> usize {
    let mut index = 0;
    let mut stride = 1;
    for (&c, &d) in coor.iter().zip(dims) {
        index += c * stride;
        stride *= d;
    }
    index
}

/// Geometry of a distributed, SIMD-vectorized Cartesian lattice.
///
/// `fdimensions` is the full global lattice. `gdimensions` equals it except
/// along the checkerboarded dimension, where it is halved. `ldimensions` is
/// the per-process share of `gdimensions`, and `rdimensions` the per-process
/// extent after factoring out SIMD lanes (`ldimensions / simd_layout`).
pub trait GridTopology: Send + Sync {
    fn fdimensions(&self) -> &[usize];
    fn gdimensions(&self) -> &[usize];
    fn ldimensions(&self) -> &[usize];
    fn rdimensions(&self) -> &[usize];
    fn processors(&self) -> &[usize];
    fn processor_coor(&self) -> &[usize];
    fn simd_layout(&self) -> &[usize];
    fn this_rank(&self) -> usize;

    /// The checkerboarded dimension of a red-black lattice, if any.
    fn checker_dim(&self) -> Option<usize>;

    fn nd(&self) -> usize {
        self.fdimensions().len()
    }

    fn num_ranks(&self) -> usize {
        self.processors().iter().product()
    }

    fn nsimd(&self) -> usize {
        self.simd_layout().iter().product()
    }

    /// Number of outer (SIMD-vector) sites held by this process.
    fn osites(&self) -> usize {
        self.rdimensions().iter().product()
    }

    fn ostride(&self, dim: usize) -> usize {
        self.rdimensions()[..dim].iter().product()
    }

    fn slice_block(&self, dim: usize) -> usize {
        self.ostride(dim)
    }

    fn slice_stride(&self, dim: usize) -> usize {
        self.ostride(dim) * self.rdimensions()[dim]
    }

    fn slice_nblock(&self, dim: usize) -> usize {
        self.osites() / self.slice_stride(dim)
    }

    fn checkerboarded(&self, dim: usize) -> bool {
        self.checker_dim() == Some(dim)
    }

    /// Block parity of an outer site: parity of its coordinates orthogonal
    /// to the checkerboarded dimension. Always even on a full lattice.
    fn checkerboard_from_oindex(&self, oindex: usize) -> Parity {
        let Some(cb_dim) = self.checker_dim() else {
            return Parity::Even;
        };
        let ocoor = coor_from_index(oindex, self.rdimensions());
        let sum: usize = ocoor
            .iter()
            .enumerate()
            .filter(|&(d, _)| d != cb_dim)
            .map(|(_, &c)| c)
            .sum();
        Parity::from_bit(sum)
    }

    /// Shift in checkerboard-reduced units for a full-lattice `shift`.
    ///
    /// Along the checkerboarded dimension the reduced shift depends on
    /// whether the source parity and the destination block parity agree.
    fn checkerboard_shift_for_cb(
        &self,
        source_cb: Parity,
        dim: usize,
        shift: usize,
        ocb: Parity,
    ) -> usize {
        if !self.checkerboarded(dim) {
            return shift;
        }
        let shift = shift % self.fdimensions()[dim];
        if (source_cb.bit() + ocb.bit()) & 1 == 1 {
            shift / 2
        } else {
            (shift + 1) / 2
        }
    }

    /// Which SIMD lane bit a dimension occupies, counted from the top.
    ///
    /// The lane block swapped by a permute of this type is
    /// `nsimd >> (permute_type + 1)`.
    fn permute_type(&self, dim: usize) -> usize {
        self.simd_layout()[dim + 1..]
            .iter()
            .filter(|&&l| l > 1)
            .count()
    }

    fn permute_dim(&self, dim: usize) -> bool {
        self.simd_layout()[dim] > 1
    }

    fn rank_from_processor_coor(&self, coor: &[usize]) -> usize {
        index_from_coor(coor, self.processors())
    }

    /// Ranks `(xmit_to, recv_from)` for a process-grid shift along `dim`.
    ///
    /// Data for a neighbor `shift` processes up is received from that
    /// process, while our own planes go to the process `shift` below.
    fn shifted_ranks(&self, dim: usize, shift: usize) -> (usize, usize) {
        let pd = self.processors()[dim];
        let pc = self.processor_coor()[dim];
        let shift = shift % pd;

        let mut coor = self.processor_coor().to_vec();
        coor[dim] = (pc + pd - shift) % pd;
        let xmit_to = self.rank_from_processor_coor(&coor);
        coor[dim] = (pc + shift) % pd;
        let recv_from = self.rank_from_processor_coor(&coor);
        (xmit_to, recv_from)
    }

    fn ocoor_from_oindex(&self, oindex: usize) -> Vec<usize> {
        coor_from_index(oindex, self.rdimensions())
    }

    /// Per-dimension lane coordinate of a SIMD lane index.
    fn icoor_from_lane(&self, lane: usize) -> Vec<usize> {
        coor_from_index(lane, self.simd_layout())
    }

    /// Process-local coordinate (checkerboard-reduced units) of a lane of an outer site.
    fn local_coor(&self, oindex: usize, lane: usize) -> Vec<usize> {
        let ocoor = self.ocoor_from_oindex(oindex);
        let icoor = self.icoor_from_lane(lane);
        let rdims = self.rdimensions();
        (0..self.nd())
            .map(|d| ocoor[d] + rdims[d] * icoor[d])
            .collect()
    }

    /// Full-lattice global coordinate of a lane of an outer site on the given
    /// checkerboard. `parity` is ignored on a full lattice.
    fn global_coor(&self, oindex: usize, lane: usize, parity: Parity) -> Vec<usize> {
        let local = self.local_coor(oindex, lane);
        let ldims = self.ldimensions();
        let pcoor = self.processor_coor();
        let mut global: Vec<usize> = (0..self.nd())
            .map(|d| pcoor[d] * ldims[d] + local[d])
            .collect();

        if let Some(cb_dim) = self.checker_dim() {
            let others: usize = global
                .iter()
                .enumerate()
                .filter(|&(d, _)| d != cb_dim)
                .map(|(_, &c)| c)
                .sum();
            global[cb_dim] = 2 * global[cb_dim] + ((parity.bit() + others) & 1);
        }
        global
    }

    /// Parity of a full-lattice coordinate. Always even on a full lattice.
    fn checkerboard(&self, full_coor: &[usize]) -> Parity {
        if self.checker_dim().is_none() {
            return Parity::Even;
        }
        Parity::from_bit(full_coor.iter().sum())
    }
}
