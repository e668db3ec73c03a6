//! Halo exchange for distributed, SIMD-vectorized Cartesian lattices.
//!
//! A [`stencil::CartesianStencil`] precomputes, for every outer site and
//! stencil point, where the neighbor lives: in the local field (possibly with
//! a SIMD lane permute) or in a halo buffer filled by communication with
//! neighboring ranks. Each exchange gathers faces through a [`stencil::Compressor`],
//! moves them through a [`comm::Transport`] and merges them back.

pub mod comm;
pub mod config;
pub mod error;
pub mod field;
pub mod grid;
pub mod simd;
pub mod stats;
pub mod stencil;

pub use error::{HaloError, Result};
pub use field::Lattice;
pub use grid::{CartesianGrid, GridTopology, Parity};
pub use stencil::CartesianStencil;
