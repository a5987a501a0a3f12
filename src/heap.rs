//! The allocator core: initialization, growth, first-fit placement and
//! coalescing over a single boundary-tagged heap.

use std::ptr::{self, NonNull};

use log::{debug, trace, warn};

use crate::{
  ALIGNMENT,
  block::{Block, FIRST_BLOCK, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD, PROLOGUE, Region, SENTINEL_BYTES},
  config::HeapConfig,
  error::HeapError,
  free_list::FreeList,
  provider::HeapProvider,
};

/// A first-fit, explicit free list allocator over memory from `P`.
///
/// The heap is single-threaded and non-reentrant: every operation takes
/// `&mut self`, and callers that share a heap across threads must provide
/// their own lock.
///
/// Pointers handed out stay valid until they are freed or the heap is
/// dropped. Dropping the heap drops its provider, which may release the
/// memory.
pub struct Heap<P: HeapProvider> {
  pub(crate) provider: P,
  pub(crate) config: HeapConfig,
  pub(crate) region: Region,
  pub(crate) free_list: FreeList,
}

/// One block as seen by a heap walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
  /// Payload offset from the heap base.
  pub offset: usize,
  /// Block size, tags included.
  pub size: usize,
  pub allocated: bool,
}

/// Snapshot of heap occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Bytes obtained from the provider.
  pub heap_bytes: usize,
  pub allocated_blocks: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

impl<P: HeapProvider> Heap<P> {
  /// Creates an uninitialized heap with the default configuration.
  pub fn new(provider: P) -> Self {
    Self {
      provider,
      config: HeapConfig::default(),
      region: Region::unmapped(),
      free_list: FreeList::new(),
    }
  }

  pub fn with_config(
    provider: P,
    config: HeapConfig,
  ) -> Result<Self, HeapError> {
    config.validate()?;

    Ok(Self {
      config,
      ..Self::new(provider)
    })
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn provider(&self) -> &P {
    &self.provider
  }

  pub fn is_initialized(&self) -> bool {
    self.region.is_mapped()
  }

  /// Lays down the prologue and epilogue sentinels and seeds the heap with
  /// one free chunk.
  ///
  /// ```text
  ///   ┌─────────┬───────────┬───────────┬────────────────────┬───────────┐
  ///   │ padding │ prologue  │ prologue  │  first free block  │ epilogue  │
  ///   │    0    │ hdr  8|1  │ ftr  8|1  │    (chunk size)    │ hdr  0|1  │
  ///   └─────────┴───────────┴───────────┴────────────────────┴───────────┘
  /// ```
  ///
  /// If the sentinels are written but the first chunk cannot be obtained,
  /// the heap stays initialized and later allocations retry the growth.
  pub fn initialize(&mut self) -> Result<(), HeapError> {
    if self.is_initialized() {
      return Err(HeapError::AlreadyInitialized);
    }

    let base = self.provider.grow_heap(SENTINEL_BYTES)?;
    debug_assert_eq!(base.as_ptr() as usize % ALIGNMENT, 0, "provider returned a misaligned heap");

    self.region = unsafe { Region::from_raw_parts(base, SENTINEL_BYTES) };
    self.region.set_tags(PROLOGUE, OVERHEAD, true);
    self.region.set_epilogue(FIRST_BLOCK);
    self.free_list = FreeList::new();

    debug!("heap initialized at {base:p}");

    self.extend_heap(self.config.chunk_size)?;
    Ok(())
  }

  /// Allocates `size` bytes aligned to 8.
  ///
  /// Returns `None` for a zero-size request, for a request no block can
  /// describe, and when the provider runs out of memory. Initializes the heap
  /// on first use.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Option<NonNull<u8>> {
    if size == 0 {
      return None;
    }

    let Some(asize) = adjusted_size(size) else {
      warn!("allocate({size}): larger than the largest block");
      return None;
    };

    if !self.is_initialized() {
      if let Err(err) = self.initialize() {
        warn!("allocate({size}): {err}");
        return None;
      }
    }

    let block = match self.free_list.first_fit(&self.region, asize) {
      Some(block) => block,
      None => match self.extend_heap(asize.max(self.config.chunk_size)) {
        Ok(block) => block,
        Err(err) => {
          warn!("allocate({size}): {err}");
          return None;
        }
      },
    };

    self.place(block, asize);

    let payload = self.region.payload(block);
    trace!("allocate({size}) -> {payload:p} ({} byte block)", self.region.size(block));
    Some(payload)
  }

  /// Releases a block. `None` is ignored.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by this heap and not freed since.
  pub unsafe fn free(
    &mut self,
    ptr: Option<NonNull<u8>>,
  ) {
    let Some(ptr) = ptr else {
      return;
    };

    let block = self.region.block_of(ptr);
    let size = self.region.size(block);
    debug_assert!(self.region.is_allocated(block), "double free of {ptr:p}");

    self.region.set_tags(block, size, false);
    self.coalesce(block);

    trace!("free({ptr:p}) ({size} byte block)");
  }

  /// Moves an allocation into a block of `size` bytes.
  ///
  /// A zero `size` frees `ptr` and returns `None`; a `None` pointer
  /// allocates. Otherwise the first `min(usable_size, size)` bytes are copied
  /// into a fresh block and the old one is freed. On failure the original
  /// allocation is left untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must have been returned by this heap and not freed since.
  pub unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    size: usize,
  ) -> Option<NonNull<u8>> {
    if size == 0 {
      unsafe { self.free(ptr) };
      return None;
    }

    let Some(old) = ptr else {
      return self.allocate(size);
    };

    let new = self.allocate(size)?;
    let copied = unsafe { self.usable_size(old) }.min(size);

    unsafe {
      ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), copied);
      self.free(Some(old));
    }

    trace!("resize({old:p}, {size}) -> {new:p}");
    Some(new)
  }

  /// Allocates `count * size` bytes with the whole payload zeroed.
  ///
  /// An overflowing product fails like an out-of-memory request.
  pub fn zeroed_allocate(
    &mut self,
    count: usize,
    size: usize,
  ) -> Option<NonNull<u8>> {
    let Some(bytes) = count.checked_mul(size) else {
      warn!("zeroed_allocate({count}, {size}): size overflows");
      return None;
    };

    let ptr = self.allocate(bytes)?;
    let usable = self.region.size(self.region.block_of(ptr)) - OVERHEAD;
    unsafe { ptr.as_ptr().write_bytes(0, usable) };

    Some(ptr)
  }

  /// Bytes the caller may use behind `ptr`, at least the requested size.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn usable_size(
    &self,
    ptr: NonNull<u8>,
  ) -> usize {
    self.region.size(self.region.block_of(ptr)) - OVERHEAD
  }

  /// Whether `ptr` points inside the memory obtained so far.
  pub fn contains(
    &self,
    ptr: *const u8,
  ) -> bool {
    self.region.contains(ptr)
  }

  /// Bytes obtained from the provider so far.
  pub fn heap_size(&self) -> usize {
    self.region.len()
  }

  /// Walks every block between the prologue and the epilogue in address
  /// order.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      region: &self.region,
      current: self.is_initialized().then_some(FIRST_BLOCK),
    }
  }

  pub fn free_list_len(&self) -> usize {
    self.free_list.iter(&self.region).count()
  }

  pub fn stats(&self) -> HeapStats {
    self.blocks().fold(
      HeapStats {
        heap_bytes: self.heap_size(),
        ..HeapStats::default()
      },
      |mut stats, block| {
        if block.allocated {
          stats.allocated_blocks += 1;
        } else {
          stats.free_blocks += 1;
          stats.free_bytes += block.size;
          stats.largest_free = stats.largest_free.max(block.size);
        }
        stats
      },
    )
  }

  /// Grows the heap by at least `bytes` and returns the resulting free
  /// block, merged with a free block that ended at the old epilogue.
  fn extend_heap(
    &mut self,
    bytes: usize,
  ) -> Result<Block, HeapError> {
    let size = crate::align!(bytes).max(MIN_BLOCK_SIZE);

    if size > self.config.heap_limit.saturating_sub(self.region.len()) {
      return Err(HeapError::OutOfMemory { requested: size });
    }

    let start = self.provider.grow_heap(size)?;
    let expected = self.region.end_addr();
    if start.as_ptr() as usize != expected {
      return Err(HeapError::Discontiguous {
        expected,
        found: start.as_ptr() as usize,
      });
    }

    // The new block's header lands on the old epilogue.
    let block = Block::new(self.region.len());
    unsafe { self.region.grow(size) };
    self.region.set_tags(block, size, false);
    self.region.set_epilogue(self.region.next_block(block));

    debug!("heap grew by {size} bytes to {}", self.region.len());

    Ok(self.coalesce(block))
  }

  /// Marks `asize` bytes of the free `block` allocated, splitting off the
  /// rest as a new free block when it is large enough to stand alone.
  fn place(
    &mut self,
    block: Block,
    asize: usize,
  ) {
    let size = self.region.size(block);
    self.free_list.remove(&mut self.region, block);

    if size - asize >= MIN_BLOCK_SIZE {
      self.region.set_tags(block, asize, true);

      let rest = self.region.next_block(block);
      self.region.set_tags(rest, size - asize, false);
      self.free_list.insert(&mut self.region, rest);
    } else {
      self.region.set_tags(block, size, true);
    }
  }

  /// Merges the free `block` with free physical neighbours and pushes the
  /// result on the free list.
  fn coalesce(
    &mut self,
    block: Block,
  ) -> Block {
    let prev = self.region.prev_block(block);
    let next = self.region.next_block(block);
    let prev_allocated = prev == block || self.region.prev_footer(block).allocated;
    let next_allocated = self.region.is_allocated(next);
    let mut size = self.region.size(block);

    let merged = match (prev_allocated, next_allocated) {
      (true, true) => block,
      (false, true) => {
        self.free_list.remove(&mut self.region, prev);
        size += self.region.size(prev);
        prev
      }
      (true, false) => {
        self.free_list.remove(&mut self.region, next);
        size += self.region.size(next);
        block
      }
      (false, false) => {
        self.free_list.remove(&mut self.region, prev);
        self.free_list.remove(&mut self.region, next);
        size += self.region.size(prev) + self.region.size(next);
        prev
      }
    };

    self.region.set_tags(merged, size, false);
    self.free_list.insert(&mut self.region, merged);
    merged
  }
}

/// Block size for a request of `size` bytes, or `None` when it cannot fit a
/// tag.
fn adjusted_size(size: usize) -> Option<usize> {
  if size > MAX_BLOCK_SIZE - OVERHEAD {
    return None;
  }

  Some((crate::align!(size) + OVERHEAD).max(MIN_BLOCK_SIZE))
}

/// Iterator returned by [`Heap::blocks`].
pub struct Blocks<'h> {
  region: &'h Region,
  current: Option<Block>,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let block = self.current?;
    if block.offset() >= self.region.len() {
      self.current = None;
      return None;
    }

    let tag = self.region.header(block);
    if tag.size == 0 {
      self.current = None;
      return None;
    }

    self.current = Some(self.region.next_block(block));
    Some(BlockInfo {
      offset: block.offset(),
      size: tag.size,
      allocated: tag.allocated,
    })
  }
}
