//! Heap tuning knobs.

use std::ffi::CStr;

use crate::{
  block::{ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, SENTINEL_BYTES},
  error::ConfigError,
};

/// Default growth quantum: one 4 KiB page.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 12;

const CHUNK_SIZE_VAR: &CStr = c"FFALLOC_CHUNK_SIZE";
const HEAP_LIMIT_VAR: &CStr = c"FFALLOC_HEAP_LIMIT";

/// Growth policy of a [`Heap`](crate::Heap).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
  /// Minimum number of bytes requested from the provider on each growth.
  pub chunk_size: usize,
  /// Total bytes the heap may obtain from its provider, sentinels included.
  pub heap_limit: usize,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      chunk_size: DEFAULT_CHUNK_SIZE,
      heap_limit: MAX_BLOCK_SIZE,
    }
  }
}

impl HeapConfig {
  pub fn with_chunk_size(
    mut self,
    chunk_size: usize,
  ) -> Self {
    self.chunk_size = chunk_size;
    self
  }

  pub fn with_heap_limit(
    mut self,
    heap_limit: usize,
  ) -> Self {
    self.heap_limit = heap_limit;
    self
  }

  /// Reads `FFALLOC_CHUNK_SIZE` and `FFALLOC_HEAP_LIMIT` on top of the
  /// defaults, then validates the result.
  ///
  /// Goes through `getenv(3)` directly so that it never allocates, which
  /// keeps it usable while bootstrapping an allocator.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Some(chunk_size) = getenv_usize(CHUNK_SIZE_VAR)? {
      config.chunk_size = chunk_size;
    }
    if let Some(heap_limit) = getenv_usize(HEAP_LIMIT_VAR)? {
      config.heap_limit = heap_limit;
    }

    config.validate()?;
    Ok(config)
  }

  /// Checks that the chunk size can describe a block and that the limit
  /// leaves room for the sentinels plus one chunk.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.chunk_size < MIN_BLOCK_SIZE || self.chunk_size % ALIGNMENT != 0 || self.chunk_size > MAX_BLOCK_SIZE {
      return Err(ConfigError::ChunkSize(self.chunk_size));
    }

    let min = SENTINEL_BYTES + self.chunk_size;
    if self.heap_limit < min || self.heap_limit > MAX_BLOCK_SIZE {
      return Err(ConfigError::HeapLimit {
        limit: self.heap_limit,
        min,
        max: MAX_BLOCK_SIZE,
      });
    }

    Ok(())
  }
}

/// Parses an environment variable as a decimal byte count.
fn getenv_usize(key: &'static CStr) -> Result<Option<usize>, ConfigError> {
  let var = key.to_str().unwrap_or("environment variable");
  let value = unsafe { libc::getenv(key.as_ptr()) };
  if value.is_null() {
    return Ok(None);
  }

  let bytes = unsafe { CStr::from_ptr(value) }.to_bytes();
  if bytes.is_empty() {
    return Err(ConfigError::NotANumber { var });
  }

  let mut result: usize = 0;
  for &byte in bytes {
    if !byte.is_ascii_digit() {
      return Err(ConfigError::NotANumber { var });
    }
    result = result
      .checked_mul(10)
      .and_then(|r| r.checked_add((byte - b'0') as usize))
      .ok_or(ConfigError::NotANumber { var })?;
  }

  Ok(Some(result))
}
