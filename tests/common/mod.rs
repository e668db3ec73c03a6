//! Multi-rank harness shared by the integration tests.
//!
//! Every rank runs on its own thread over a `LocalTransport` universe and
//! fills its field with a function of the full-lattice coordinate, so any
//! neighbor can be checked against a direct evaluation.

#![allow(dead_code)]

use std::sync::Arc;

use gridhalo::comm::{LocalTransport, Transport};
use gridhalo::config::StencilParams;
use gridhalo::grid::index_from_coor;
use gridhalo::simd::VRealD;
use gridhalo::stencil::SimpleCompressor;
use gridhalo::{CartesianGrid, CartesianStencil, GridTopology, Lattice, Parity};

#[derive(Debug, Clone)]
pub struct Setup {
    pub dims: Vec<usize>,
    pub procs: Vec<usize>,
    pub simd: Vec<usize>,
    pub red_black: bool,
    pub points: Vec<(usize, isize)>,
    pub params: StencilParams,
}

pub struct Rank<const N: usize> {
    pub rank: usize,
    pub grid: Arc<dyn GridTopology>,
    pub stencil: CartesianStencil<VRealD<N>>,
    pub field: Lattice<VRealD<N>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Check {
    pub checked: usize,
    pub max_error: f64,
}

pub fn lexicographic(c: &[usize], dims: &[usize]) -> f64 {
    index_from_coor(c, dims) as f64
}

/// Run `f` once per rank, each on its own thread, and collect results in rank order.
pub fn on_ranks<T, F>(nranks: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalTransport) -> T + Sync,
{
    let transports = LocalTransport::universe(nranks);
    std::thread::scope(|s| {
        let f = &f;
        let handles: Vec<_> = transports
            .into_iter()
            .map(|t| s.spawn(move || f(t)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}

impl Setup {
    pub fn new(dims: &[usize], procs: &[usize], simd: &[usize]) -> Self {
        Self {
            dims: dims.to_vec(),
            procs: procs.to_vec(),
            simd: simd.to_vec(),
            red_black: false,
            points: Vec::new(),
            params: StencilParams::default(),
        }
    }

    pub fn points(mut self, points: &[(usize, isize)]) -> Self {
        self.points = points.to_vec();
        self
    }

    /// ±1 along every dimension.
    pub fn nearest_neighbor(mut self) -> Self {
        self.points = (0..self.dims.len())
            .flat_map(|d| [(d, 1), (d, -1)])
            .collect();
        self
    }

    pub fn red_black(mut self) -> Self {
        self.red_black = true;
        self
    }

    pub fn params(mut self, params: StencilParams) -> Self {
        self.params = params;
        self
    }

    pub fn nranks(&self) -> usize {
        self.procs.iter().product()
    }

    pub fn grid(&self, rank: usize) -> Arc<dyn GridTopology> {
        let grid = if self.red_black {
            CartesianGrid::red_black(&self.dims, &self.procs, &self.simd, rank)
        } else {
            CartesianGrid::new(&self.dims, &self.procs, &self.simd, rank)
        };
        Arc::new(grid.expect("grid"))
    }

    pub fn build<const N: usize>(&self, transport: LocalTransport) -> Rank<N> {
        let dims = self.dims.clone();
        self.build_with(transport, move |c| lexicographic(c, &dims))
    }

    pub fn build_with<const N: usize, F>(&self, transport: LocalTransport, value: F) -> Rank<N>
    where
        F: Fn(&[usize]) -> f64,
    {
        let rank = transport.rank();
        let grid = self.grid(rank);
        let comm: Arc<dyn Transport> = Arc::new(transport);
        let directions: Vec<usize> = self.points.iter().map(|p| p.0).collect();
        let displacements: Vec<isize> = self.points.iter().map(|p| p.1).collect();
        let stencil = CartesianStencil::new(
            Arc::clone(&grid),
            comm,
            self.points.len(),
            Parity::Even,
            &directions,
            &displacements,
            self.params.clone(),
        )
        .expect("stencil");
        let field = Lattice::from_fn(Arc::clone(&grid), Parity::Even, value).expect("field");
        Rank {
            rank,
            grid,
            stencil,
            field,
        }
    }

    /// Compare every neighbor against `value` at the shifted coordinate.
    ///
    /// Legs cut by a Dirichlet block carry no meaningful neighbor and are skipped.
    pub fn check<const N: usize, F>(&self, r: &Rank<N>, value: F) -> Check
    where
        F: Fn(&[usize]) -> f64,
    {
        let mut out = Check {
            checked: 0,
            max_error: 0.0,
        };
        let view = r.stencil.view();
        for site in 0..r.grid.osites() {
            for (point, &(d, disp)) in self.points.iter().enumerate() {
                let parity = if self.red_black && disp % 2 != 0 {
                    Parity::Odd
                } else {
                    Parity::Even
                };
                let got = view.neighbor(&r.field, site, point).expect("neighbor").resolve();
                for lane in 0..N {
                    let mut c = r.grid.global_coor(site, lane, parity);
                    let target = c[d] as isize + disp;
                    if self.cut(d, c[d], target) {
                        continue;
                    }
                    c[d] = target.rem_euclid(self.dims[d] as isize) as usize;
                    let err = (got.0[lane] - value(&c)).abs();
                    out.checked += 1;
                    out.max_error = out.max_error.max(err);
                }
            }
        }
        out
    }

    pub fn check_exact<const N: usize>(&self, r: &Rank<N>) -> Check {
        self.check(r, |c| lexicographic(c, &self.dims))
    }

    fn cut(&self, d: usize, from: usize, to: isize) -> bool {
        let block = self.params.dirichlet_block(d);
        if block == 0 {
            return false;
        }
        if to < 0 || to >= self.dims[d] as isize {
            return true;
        }
        from / block != to as usize / block
    }
}

impl<const N: usize> Rank<N> {
    pub fn exchange(&mut self) {
        self.stencil
            .halo_exchange(&self.field, &mut SimpleCompressor)
            .expect("halo exchange");
    }

    pub fn halo(&self) -> Vec<VRealD<N>> {
        self.stencil.view().halo().expect("halo").to_vec()
    }
}
