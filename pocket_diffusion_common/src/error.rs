use std::path::PathBuf;

use candle_core::DType;

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unexpected rank, expected {expected}, got shape {shape:?}")]
    UnexpectedRank { expected: usize, shape: Vec<usize> },

    #[error("unexpected shape, expected {expected:?}, got {got:?}")]
    UnexpectedShape { expected: Vec<usize>, got: Vec<usize> },

    #[error("unexpected dtype, expected {expected:?}, got {got:?}")]
    UnexpectedDType { expected: DType, got: DType },

    #[error("shape mismatch in {op}, lhs: {lhs:?}, rhs: {rhs:?}")]
    ShapeMismatchBinaryOp {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },

    #[error("module input `{0}` is missing")]
    MissingInput(&'static str),

    #[error("asset `{0}` is not present in the model bundle")]
    AssetNotFound(String),

    #[error("model file not found: {}", .0.display())]
    ModelFileNotFound(PathBuf),

    /// The runtime could not allocate the buffers for a module.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Any failure raised inside a module runtime.
    #[error("module runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    SafeTensor(#[from] safetensors::SafeTensorError),

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        Self::Msg(msg.to_string())
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
