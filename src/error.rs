use thiserror::Error;

use crate::grid::Parity;

#[derive(Debug, Error)]
pub enum HaloError {
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Checkerboard mismatch: stencil expects {expected:?}, field is {found:?}")]
    Checkerboard { expected: Parity, found: Parity },

    #[error("Grid mismatch: {0}")]
    Conformable(String),

    #[error("Capacity error: gathered {gathered} words into a unified buffer of {expected}")]
    Capacity { gathered: usize, expected: usize },

    #[error("Buffer error: {0}")]
    Buffer(String),

    #[error("View error: {0}")]
    View(String),

    #[error("Compressor error: {0}")]
    Compressor(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HaloError>;
