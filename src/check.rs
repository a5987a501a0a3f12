//! Heap consistency checking.
//!
//! The checker walks the heap in address order, then the free list in list
//! order, and cross-checks the two. It only reads: findings are returned and
//! logged, never repaired. Reads are bounds-checked against the heap so a
//! damaged tag ends the walk instead of faulting.

use std::collections::HashSet;

use log::{debug, warn};
use thiserror::Error;

use crate::{
  ALIGNMENT,
  block::{Block, DSIZE, FIRST_BLOCK, MIN_BLOCK_SIZE, OVERHEAD, PROLOGUE, Tag},
  heap::Heap,
  provider::HeapProvider,
};

/// A broken heap invariant. Offsets are payload offsets from the heap base.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
  #[error("prologue is damaged")]
  BadPrologue,

  #[error("epilogue at {offset} is damaged")]
  BadEpilogue { offset: usize },

  #[error("block {offset}: header {header_size}/{header_allocated} does not match footer {footer_size}/{footer_allocated}")]
  TagMismatch {
    offset: usize,
    header_size: usize,
    header_allocated: bool,
    footer_size: usize,
    footer_allocated: bool,
  },

  #[error("block {offset}: payload is not 8-byte aligned")]
  Misaligned { offset: usize },

  #[error("block {offset}: size {size} is below the minimum block size")]
  Undersized { offset: usize, size: usize },

  #[error("block {offset}: size {size} runs past the heap end at {heap_len}")]
  OutOfBounds {
    offset: usize,
    size: usize,
    heap_len: usize,
  },

  #[error("blocks {first} and {second} are adjacent and both free")]
  AdjacentFree { first: usize, second: usize },

  #[error("free block {offset} is not on the free list")]
  NotOnFreeList { offset: usize },

  #[error("free list entry {offset} is not a block of this heap")]
  StrayListEntry { offset: usize },

  #[error("free list entry {offset} is marked allocated")]
  AllocatedOnFreeList { offset: usize },

  #[error("free list entry {offset} links back to {found:?}, expected {expected:?}")]
  BrokenBackLink {
    offset: usize,
    expected: Option<usize>,
    found: Option<usize>,
  },

  #[error("free list loops back to {offset}")]
  FreeListCycle { offset: usize },
}

impl<P: HeapProvider> Heap<P> {
  /// Checks every heap invariant and returns what is broken.
  ///
  /// With `verbose`, each block is logged at debug level. An uninitialized
  /// heap has nothing to check.
  pub fn check_heap(
    &self,
    verbose: bool,
  ) -> Vec<Violation> {
    let mut violations = Vec::new();
    if !self.is_initialized() {
      return violations;
    }

    let blocks = self.check_blocks(verbose, &mut violations);
    self.check_free_list(&blocks, &mut violations);

    for violation in &violations {
      warn!("heap check: {violation}");
    }
    if verbose {
      debug!(
        "heap check: {} blocks, {} violations",
        blocks.all.len(),
        violations.len()
      );
    }

    violations
  }

  fn check_blocks(
    &self,
    verbose: bool,
    violations: &mut Vec<Violation>,
  ) -> Walked {
    let region = &self.region;
    let heap_len = region.len();
    let mut walked = Walked::default();

    let prologue = Tag {
      size: OVERHEAD,
      allocated: true,
    };
    if region.header(PROLOGUE) != prologue || region.prev_footer(FIRST_BLOCK) != prologue {
      violations.push(Violation::BadPrologue);
    }

    let mut block = FIRST_BLOCK;
    let mut prev_free: Option<usize> = None;

    loop {
      let offset = block.offset();
      if offset > heap_len {
        violations.push(Violation::BadEpilogue { offset });
        break;
      }

      let header = region.header(block);
      if header.size == 0 {
        if !header.allocated || offset != heap_len {
          violations.push(Violation::BadEpilogue { offset });
        }
        break;
      }

      if offset + header.size > heap_len {
        violations.push(Violation::OutOfBounds {
          offset,
          size: header.size,
          heap_len,
        });
        break;
      }

      let footer = region.footer(block);
      if verbose {
        debug!(
          "{offset:>10}: header [{}:{}] footer [{}:{}]",
          header.size,
          flag(header.allocated),
          footer.size,
          flag(footer.allocated)
        );
      }

      if header != footer {
        violations.push(Violation::TagMismatch {
          offset,
          header_size: header.size,
          header_allocated: header.allocated,
          footer_size: footer.size,
          footer_allocated: footer.allocated,
        });
      }
      if region.payload(block).as_ptr() as usize % ALIGNMENT != 0 {
        violations.push(Violation::Misaligned { offset });
      }
      if header.size < MIN_BLOCK_SIZE {
        violations.push(Violation::Undersized {
          offset,
          size: header.size,
        });
      }

      walked.all.insert(offset);
      if header.allocated {
        prev_free = None;
      } else {
        if let Some(first) = prev_free {
          violations.push(Violation::AdjacentFree { first, second: offset });
        }
        walked.free.push(offset);
        prev_free = Some(offset);
      }

      block = region.next_block(block);
    }

    walked
  }

  fn check_free_list(
    &self,
    walked: &Walked,
    violations: &mut Vec<Violation>,
  ) {
    let region = &self.region;
    let mut listed = HashSet::new();
    let mut expected_prev = None;
    let mut cursor = self.free_list.head();

    while let Some(block) = cursor {
      let offset = block.offset();

      if !listed.insert(offset) {
        violations.push(Violation::FreeListCycle { offset });
        break;
      }

      // Links must be readable before they can be followed.
      let readable = offset >= FIRST_BLOCK.offset() && offset % DSIZE == 0 && offset + 2 * DSIZE <= region.len();
      if !readable {
        violations.push(Violation::StrayListEntry { offset });
        break;
      }

      if !walked.all.contains(&offset) {
        violations.push(Violation::StrayListEntry { offset });
      } else if region.is_allocated(block) {
        violations.push(Violation::AllocatedOnFreeList { offset });
      }

      let found = region.prev_free(block).map(Block::offset);
      if found != expected_prev {
        violations.push(Violation::BrokenBackLink {
          offset,
          expected: expected_prev,
          found,
        });
      }

      expected_prev = Some(offset);
      cursor = region.next_free(block);
    }

    for &offset in &walked.free {
      if !listed.contains(&offset) {
        violations.push(Violation::NotOnFreeList { offset });
      }
    }
  }
}

#[derive(Default)]
struct Walked {
  all: HashSet<usize>,
  free: Vec<usize>,
}

fn flag(allocated: bool) -> char {
  if allocated { 'a' } else { 'f' }
}

#[cfg(test)]
mod tests {
  use std::ptr::NonNull;

  use super::*;
  use crate::{
    block::{Region, WSIZE},
    provider::MmapProvider,
  };

  fn heap() -> Heap<MmapProvider> {
    let mut heap = Heap::new(MmapProvider::new(1 << 20).unwrap());
    heap.initialize().unwrap();
    heap
  }

  fn block_of(
    heap: &Heap<MmapProvider>,
    ptr: NonNull<u8>,
  ) -> Block {
    heap.region.block_of(ptr)
  }

  fn write_header(
    region: &mut Region,
    block: Block,
    word: u32,
  ) {
    unsafe { region.payload(block).as_ptr().sub(WSIZE).cast::<u32>().write(word) }
  }

  #[test]
  fn test_uninitialized_heap_is_clean() {
    let heap = Heap::new(MmapProvider::new(4096).unwrap());
    assert!(heap.check_heap(true).is_empty());
  }

  #[test]
  fn test_fresh_and_busy_heaps_are_clean() {
    let mut heap = heap();
    assert!(heap.check_heap(true).is_empty());

    let ptrs: Vec<_> = (1..50).map(|i| heap.allocate(i * 7).unwrap()).collect();
    for ptr in ptrs.iter().step_by(2) {
      unsafe { heap.free(Some(*ptr)) };
    }
    assert_eq!(heap.check_heap(false), Vec::<Violation>::new());
  }

  #[test]
  fn test_detects_tag_mismatch() {
    let mut heap = heap();
    let ptr = heap.allocate(40).unwrap();
    let block = block_of(&heap, ptr);

    // Footer still says 48|1.
    write_header(&mut heap.region, block, 48);

    let violations = heap.check_heap(false);
    assert!(violations.contains(&Violation::TagMismatch {
      offset: block.offset(),
      header_size: 48,
      header_allocated: false,
      footer_size: 48,
      footer_allocated: true,
    }));
  }

  #[test]
  fn test_detects_adjacent_free_and_missing_entry() {
    let mut heap = heap();
    let a = heap.allocate(24).unwrap();
    let _b = heap.allocate(24).unwrap();
    let block = block_of(&heap, a);

    // Mark `a` free behind the allocator's back: its neighbour is allocated,
    // so only the free list check can notice.
    heap.region.set_tags(block, 32, false);
    let violations = heap.check_heap(false);
    assert_eq!(violations, vec![Violation::NotOnFreeList { offset: 16 }]);

    // Now free the remainder's left neighbour the same way.
    let b_block = heap.region.next_block(block);
    heap.region.set_tags(b_block, 32, false);
    let violations = heap.check_heap(false);
    assert!(violations.contains(&Violation::AdjacentFree { first: 16, second: 48 }));
    assert!(violations.contains(&Violation::AdjacentFree { first: 48, second: 80 }));
  }

  #[test]
  fn test_detects_allocated_list_entry() {
    let mut heap = heap();
    let a = heap.allocate(24).unwrap();
    let _b = heap.allocate(24).unwrap();
    unsafe { heap.free(Some(a)) };

    let block = block_of(&heap, a);
    heap.region.set_tags(block, 32, true);

    assert_eq!(
      heap.check_heap(false),
      vec![Violation::AllocatedOnFreeList { offset: 16 }]
    );
  }

  #[test]
  fn test_detects_broken_back_link() {
    let mut heap = heap();
    let a = heap.allocate(24).unwrap();
    let _b = heap.allocate(24).unwrap();
    let c = heap.allocate(24).unwrap();
    let _d = heap.allocate(24).unwrap();
    unsafe {
      heap.free(Some(a));
      heap.free(Some(c));
    }

    // List is c, a, remainder; point a's back link at itself.
    let a_block = block_of(&heap, a);
    heap.region.set_prev_free(a_block, Some(a_block));

    assert_eq!(
      heap.check_heap(false),
      vec![Violation::BrokenBackLink {
        offset: 16,
        expected: Some(80),
        found: Some(16),
      }]
    );
  }

  #[test]
  fn test_detects_cycle() {
    let mut heap = heap();
    let a = heap.allocate(24).unwrap();
    let _b = heap.allocate(24).unwrap();
    unsafe { heap.free(Some(a)) };

    let a_block = block_of(&heap, a);
    heap.region.set_next_free(a_block, Some(a_block));

    assert!(heap.check_heap(false).contains(&Violation::FreeListCycle { offset: 16 }));
  }

  #[test]
  fn test_detects_block_running_off_the_heap() {
    let mut heap = heap();
    let len = heap.heap_size();
    write_header(&mut heap.region, FIRST_BLOCK, (len as u32) & !0x7);

    assert!(matches!(
      heap.check_heap(false).first(),
      Some(Violation::OutOfBounds { offset: 16, .. })
    ));
  }

  #[test]
  fn test_detects_damaged_prologue() {
    let mut heap = heap();
    write_header(&mut heap.region, PROLOGUE, 0);
    assert!(heap.check_heap(false).contains(&Violation::BadPrologue));
  }
}
