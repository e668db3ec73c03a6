//! Lattice fields: one site vector per outer site of a grid.

use std::sync::Arc;

use bytemuck::Pod;

use crate::error::{HaloError, Result};
use crate::grid::{GridTopology, Parity};
use crate::simd::SimdSite;

/// Field living on a grid, stored as `osites` SIMD site vectors.
///
/// On a red-black grid a field holds a single parity given by `checkerboard`.
pub struct Lattice<V> {
    grid: Arc<dyn GridTopology>,
    checkerboard: Parity,
    data: Vec<V>,
}

impl<V: Pod> Lattice<V> {
    /// Zero-initialized field.
    pub fn new(grid: Arc<dyn GridTopology>, checkerboard: Parity) -> Self {
        let data = vec![V::zeroed(); grid.osites()];
        Self {
            grid,
            checkerboard,
            data,
        }
    }

    pub fn grid(&self) -> &Arc<dyn GridTopology> {
        &self.grid
    }

    pub fn checkerboard(&self) -> Parity {
        self.checkerboard
    }

    pub fn as_slice(&self) -> &[V] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [V] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when `other` is the same grid object this field lives on.
    pub fn on_grid(&self, other: &Arc<dyn GridTopology>) -> bool {
        same_grid(&self.grid, other)
    }
}

impl<V: SimdSite> Lattice<V> {
    /// Field whose every lane is `f(full_coordinate)`.
    pub fn from_fn<F>(grid: Arc<dyn GridTopology>, checkerboard: Parity, f: F) -> Result<Self>
    where
        F: Fn(&[usize]) -> V::Scalar,
    {
        if V::NSIMD != grid.nsimd() {
            return Err(HaloError::Conformable(format!(
                "site type carries {} lanes, grid lays out {}",
                V::NSIMD,
                grid.nsimd()
            )));
        }
        let mut field = Self::new(grid, checkerboard);
        for o in 0..field.data.len() {
            for lane in 0..V::NSIMD {
                let coor = field.grid.global_coor(o, lane, checkerboard);
                field.data[o].set_lane(lane, f(&coor));
            }
        }
        Ok(field)
    }

    /// Scalar value at an (outer site, lane) pair.
    pub fn peek(&self, oindex: usize, lane: usize) -> V::Scalar {
        self.data[oindex].lane(lane)
    }
}

pub(crate) fn same_grid(a: &Arc<dyn GridTopology>, b: &Arc<dyn GridTopology>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::CartesianGrid;
    use crate::simd::VRealD;

    #[test]
    fn from_fn_fills_every_lane() {
        let grid: Arc<dyn GridTopology> =
            Arc::new(CartesianGrid::new(&[8, 2], &[1, 1], &[2, 1], 0).unwrap());
        let field: Lattice<VRealD<2>> =
            Lattice::from_fn(grid, Parity::Even, |c| (c[0] + 10 * c[1]) as f64).unwrap();
        assert_eq!(field.len(), 8);
        // rd = [4, 2]: outer site 5 is (1, 1), lanes at x = 1 and x = 5
        assert_eq!(field.peek(5, 0), 11.0);
        assert_eq!(field.peek(5, 1), 15.0);
    }

    #[test]
    fn from_fn_rejects_lane_mismatch() {
        let grid: Arc<dyn GridTopology> =
            Arc::new(CartesianGrid::new(&[8], &[1], &[2], 0).unwrap());
        let field = Lattice::<VRealD<1>>::from_fn(grid, Parity::Even, |c| c[0] as f64);
        assert!(matches!(field, Err(HaloError::Conformable(_))));
    }

    #[test]
    fn grid_identity_is_by_object() {
        let a: Arc<dyn GridTopology> = Arc::new(CartesianGrid::new(&[4], &[1], &[1], 0).unwrap());
        let b: Arc<dyn GridTopology> = Arc::new(CartesianGrid::new(&[4], &[1], &[1], 0).unwrap());
        let field = Lattice::<VRealD<1>>::new(a.clone(), Parity::Even);
        assert!(field.on_grid(&a));
        assert!(!field.on_grid(&b));
    }
}
