//! Stencil tuning parameters and run configuration loaded from TOML.

use std::path::Path;

use serde_derive::Deserialize;

use crate::error::{HaloError, Result};

/// How the packets of one exchange are driven through the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CommPolicy {
    /// Begin every packet, then complete every packet.
    #[default]
    Concurrent,
    /// Blocking paired transfers spread over `comm_threads` workers.
    Sequential,
}

fn default_comm_threads() -> usize {
    1
}

/// Per-stencil parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StencilParams {
    /// Dirichlet block size per dimension, 0 (or absent) meaning unblocked.
    pub dirichlet: Vec<usize>,
    pub policy: CommPolicy,
    #[serde(default = "default_comm_threads")]
    pub comm_threads: usize,
}

impl Default for StencilParams {
    fn default() -> Self {
        Self {
            dirichlet: Vec::new(),
            policy: CommPolicy::default(),
            comm_threads: default_comm_threads(),
        }
    }
}

impl StencilParams {
    pub fn dirichlet_block(&self, dim: usize) -> usize {
        self.dirichlet.get(dim).copied().unwrap_or(0)
    }

    pub fn is_dirichlet(&self) -> bool {
        self.dirichlet.iter().any(|&b| b != 0)
    }
}

/// One stencil point as written in a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PointSpec {
    pub direction: usize,
    pub displacement: isize,
}

/// Everything the `gridhalo` binary needs for a verification run.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub dims: Vec<usize>,
    pub processors: Vec<usize>,
    pub simd: Vec<usize>,
    pub checkerboard: bool,
    /// Empty means a nearest-neighbor stencil (±1 along every dimension).
    pub points: Vec<PointSpec>,
    pub exchanges: usize,
    pub reduced_precision: bool,
    pub stencil: StencilParams,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            dims: vec![8, 8],
            processors: vec![2, 1],
            simd: vec![1, 1],
            checkerboard: false,
            points: Vec::new(),
            exchanges: 1,
            reduced_precision: false,
            stencil: StencilParams::default(),
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| HaloError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Configured points, or ±1 along every dimension when none are given.
    pub fn resolved_points(&self) -> Vec<PointSpec> {
        if !self.points.is_empty() {
            return self.points.clone();
        }
        (0..self.dims.len())
            .flat_map(|d| {
                [1, -1].map(|displacement| PointSpec {
                    direction: d,
                    displacement,
                })
            })
            .collect()
    }

    pub fn num_ranks(&self) -> usize {
        self.processors.iter().product()
    }
}
