//! Property tests: random allocate/free/resize sequences must keep every heap
//! invariant and every live allocation's contents intact.

use std::ptr::NonNull;

use ffalloc::{ALIGNMENT, Heap, MmapProvider, Violation};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
  Allocate(usize),
  Free(usize),
  Resize(usize, usize),
  ZeroedAllocate(usize, usize),
}

fn op() -> impl Strategy<Value = Op> {
  prop_oneof![
    4 => (1usize..2048).prop_map(Op::Allocate),
    3 => any::<usize>().prop_map(Op::Free),
    2 => (any::<usize>(), 0usize..4096).prop_map(|(i, n)| Op::Resize(i, n)),
    1 => (1usize..64, 1usize..64).prop_map(|(n, s)| Op::ZeroedAllocate(n, s)),
  ]
}

struct Live {
  ptr: NonNull<u8>,
  len: usize,
  byte: u8,
}

impl Live {
  fn intact(&self) -> bool {
    unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
      .iter()
      .all(|&b| b == self.byte)
  }
}

fn stamp(
  ptr: NonNull<u8>,
  len: usize,
  byte: u8,
) -> Live {
  unsafe { ptr.as_ptr().write_bytes(byte, len) };
  Live { ptr, len, byte }
}

proptest! {
  #![proptest_config(ProptestConfig::with_cases(64))]

  #[test]
  fn heap_invariants_hold(ops in prop::collection::vec(op(), 1..200)) {
    let mut heap = Heap::new(MmapProvider::new(1 << 24).unwrap());
    heap.initialize().unwrap();

    let mut live: Vec<Live> = Vec::new();
    let mut next_byte = 1u8;

    for op in ops {
      match op {
        Op::Allocate(size) => {
          let ptr = heap.allocate(size).unwrap();
          live.push(stamp(ptr, size, next_byte));
        }
        Op::Free(index) if !live.is_empty() => {
          let victim = live.swap_remove(index % live.len());
          unsafe { heap.free(Some(victim.ptr)) };
        }
        Op::Resize(index, size) if !live.is_empty() => {
          let old = live.swap_remove(index % live.len());
          let new = unsafe { heap.resize(Some(old.ptr), size) };

          match new {
            None => {
              prop_assert_eq!(size, 0);
            }
            Some(ptr) => {
              let kept = old.len.min(size);
              let prefix = Live { ptr, len: kept, byte: old.byte };
              prop_assert!(prefix.intact());
              live.push(stamp(ptr, size, next_byte));
            }
          }
        }
        Op::ZeroedAllocate(count, size) => {
          let ptr = heap.zeroed_allocate(count, size).unwrap();
          let zeroed = Live { ptr, len: count * size, byte: 0 };
          prop_assert!(zeroed.intact());
          live.push(stamp(ptr, count * size, next_byte));
        }
        _ => {}
      }
      next_byte = next_byte.wrapping_add(1).max(1);

      prop_assert_eq!(heap.check_heap(false), Vec::<Violation>::new());
    }

    for entry in &live {
      prop_assert_eq!(entry.ptr.as_ptr() as usize % ALIGNMENT, 0);
      prop_assert!(heap.contains(entry.ptr.as_ptr()));
      let last = unsafe { entry.ptr.as_ptr().add(entry.len - 1) };
      prop_assert!(heap.contains(last));
      prop_assert!(entry.intact());
    }

    for entry in live {
      unsafe { heap.free(Some(entry.ptr)) };
    }
    prop_assert_eq!(heap.stats().allocated_blocks, 0);
    prop_assert_eq!(heap.free_list_len(), 1);
  }

  #[test]
  fn free_bit_matches_free_list(sizes in prop::collection::vec(1usize..512, 1..64), mask in any::<u64>()) {
    let mut heap = Heap::new(MmapProvider::new(1 << 20).unwrap());
    heap.initialize().unwrap();

    let ptrs: Vec<_> = sizes.iter().map(|&size| heap.allocate(size).unwrap()).collect();
    for (i, ptr) in ptrs.iter().enumerate() {
      if mask & (1 << (i % 64)) != 0 {
        unsafe { heap.free(Some(*ptr)) };
      }
    }

    let stats = heap.stats();
    prop_assert_eq!(stats.free_blocks, heap.free_list_len());

    let mut prev_free = false;
    for block in heap.blocks() {
      prop_assert!(!(prev_free && !block.allocated), "adjacent free blocks at {}", block.offset);
      prev_free = !block.allocated;
    }
  }
}
