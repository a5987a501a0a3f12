//! Error types for heap setup and growth.

use thiserror::Error;

/// Failures surfaced by [`Heap`](crate::Heap) and its providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeapError {
  #[error("out of memory: could not grow the heap by {requested} bytes")]
  OutOfMemory { requested: usize },

  #[error("heap provider returned {found:#x}, expected the heap end at {expected:#x}")]
  Discontiguous { expected: usize, found: usize },

  #[error("heap provider returned {address:#x}, which is not 8-byte aligned")]
  Misaligned { address: usize },

  #[error("heap is already initialized")]
  AlreadyInitialized,

  #[error("invalid configuration: {0}")]
  InvalidConfig(#[from] ConfigError),
}

/// Rejected [`HeapConfig`](crate::HeapConfig) values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("chunk size {0} must be a multiple of 8 and at least 32 bytes")]
  ChunkSize(usize),

  #[error("heap limit {limit} must be between {min} and {max}")]
  HeapLimit { limit: usize, min: usize, max: usize },

  #[error("{var} is not a decimal byte count")]
  NotANumber { var: &'static str },
}
