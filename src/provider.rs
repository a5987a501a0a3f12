//! Sources of raw heap memory.
//!
//! A provider hands out one contiguous address range in increments. The heap
//! never gives memory back, so providers only ever grow.
//!
//! ```text
//!   ┌──────────┬──────────┬──────────┬─────────────────────────┐
//!   │ grow #1  │ grow #2  │ grow #3  │      not yet handed out │
//!   └──────────┴──────────┴──────────┴─────────────────────────┘
//!   ▲                                ▲
//!   heap base                        provider break
//! ```

use std::ptr::{self, NonNull};

use libc::{c_void, intptr_t, sbrk};

use crate::{ALIGNMENT, error::HeapError};

/// Extends a contiguous memory range on request.
///
/// # Safety
///
/// Implementors must return memory that is valid for reads and writes of
/// `delta` bytes, not used by anything else, and that stays valid for the
/// lifetime of the provider. The first range must be aligned to
/// [`ALIGNMENT`](crate::ALIGNMENT). Each later range should start where the
/// previous one ended; the heap rejects a range that does not.
pub unsafe trait HeapProvider {
  /// Grows the range by `delta` bytes and returns the start of the new part.
  fn grow_heap(
    &mut self,
    delta: usize,
  ) -> Result<NonNull<u8>, HeapError>;
}

/// Grows the process data segment with `sbrk(2)`.
///
/// Only one heap per process should use this provider, and nothing else in
/// the process should move the program break while it does. A break moved
/// behind the heap's back shows up as [`HeapError::Discontiguous`]. The
/// range handed out by that failed growth is leaked, and the heap can no
/// longer grow: every later range also starts past its end. Allocations
/// that fit in already-free blocks keep working.
#[derive(Debug, Default)]
pub struct SbrkProvider {
  aligned: bool,
}

impl SbrkProvider {
  pub const fn new() -> Self {
    Self { aligned: false }
  }

  /// Current program break.
  pub fn program_break() -> *mut u8 {
    unsafe { sbrk(0) }.cast()
  }

  unsafe fn bump(delta: usize) -> Result<NonNull<u8>, HeapError> {
    let oom = HeapError::OutOfMemory { requested: delta };
    let increment = intptr_t::try_from(delta).map_err(|_| oom.clone())?;

    let address = unsafe { sbrk(increment) };
    if address == usize::MAX as *mut c_void {
      return Err(oom);
    }

    NonNull::new(address.cast()).ok_or(oom)
  }
}

unsafe impl HeapProvider for SbrkProvider {
  fn grow_heap(
    &mut self,
    delta: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    unsafe {
      if !self.aligned {
        let brk = Self::program_break() as usize;
        let padding = crate::align!(brk) - brk;
        if padding != 0 {
          Self::bump(padding)?;
        }
      }

      let start = Self::bump(delta)?;
      let address = start.as_ptr() as usize;
      if address % ALIGNMENT != 0 {
        // The break moved between the query and the bump.
        self.aligned = false;
        return Err(HeapError::Misaligned { address });
      }

      self.aligned = true;
      Ok(start)
    }
  }
}

/// Hands out a fixed-capacity anonymous mapping reserved up front.
///
/// The whole reservation is mapped once with `mmap(2)` and released on drop,
/// which makes this the provider of choice for bounded or short-lived heaps.
#[derive(Debug)]
pub struct MmapProvider {
  base: NonNull<u8>,
  capacity: usize,
  brk: usize,
}

impl MmapProvider {
  /// Reserves `capacity` bytes, rounded up to whole pages.
  pub fn new(capacity: usize) -> Result<Self, HeapError> {
    let page = page_size();
    let capacity = capacity
      .max(1)
      .checked_add(page - 1)
      .map(|rounded| rounded & !(page - 1))
      .ok_or(HeapError::OutOfMemory { requested: capacity })?;

    let address = unsafe {
      libc::mmap(
        ptr::null_mut(),
        capacity,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };

    if address == libc::MAP_FAILED {
      return Err(HeapError::OutOfMemory { requested: capacity });
    }

    let base = NonNull::new(address.cast()).ok_or(HeapError::OutOfMemory { requested: capacity })?;

    log::debug!("reserved {capacity} bytes at {base:p}");

    Ok(Self {
      base,
      capacity,
      brk: 0,
    })
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Bytes handed out so far.
  pub fn used(&self) -> usize {
    self.brk
  }
}

unsafe impl HeapProvider for MmapProvider {
  fn grow_heap(
    &mut self,
    delta: usize,
  ) -> Result<NonNull<u8>, HeapError> {
    if delta > self.capacity - self.brk {
      return Err(HeapError::OutOfMemory { requested: delta });
    }

    let start = unsafe { self.base.add(self.brk) };
    self.brk += delta;

    Ok(start)
  }
}

impl Drop for MmapProvider {
  fn drop(&mut self) {
    unsafe {
      libc::munmap(self.base.as_ptr().cast(), self.capacity);
    }
  }
}

fn page_size() -> usize {
  match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
    size if size > 0 => size as usize,
    _ => 4096,
  }
}
