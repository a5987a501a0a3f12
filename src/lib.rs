//! # ffalloc - A First-Fit Boundary-Tag Allocator
//!
//! This crate provides a general-purpose `malloc`-style allocator built on
//! an **explicit free list** with **boundary tags**, managing one contiguous
//! heap that grows on demand through a pluggable provider (`sbrk(2)` or a
//! reserved `mmap(2)` region).
//!
//! ## Overview
//!
//! ```text
//!   Heap Layout:
//!
//!   ┌─────┬──────────┬────────┬────────┬────────┬────────┬──────────┐
//!   │ pad │ prologue │ alloc  │  free  │ alloc  │  free  │ epilogue │
//!   │     │   8|1    │  A1    │   F1   │  A2    │   F2   │   0|1    │
//!   └─────┴──────────┴────────┴───┬────┴────────┴───┬────┴──────────┘
//!                                 │       ▲         │
//!          free list head ───────►│       │         │
//!                                 └───────┼────────►│ (next-free)
//!                                         └─────────┘ (prev-free)
//!
//!   Every block carries its size and allocated bit at both ends,
//!   so neighbours in either direction are found in O(1).
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   ffalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Boundary-tag encoding and block navigation (internal)
//!   ├── free_list  - LIFO doubly-linked list of free blocks (internal)
//!   ├── heap       - Heap: allocate, free, resize, zeroed_allocate
//!   ├── check      - Heap consistency checker
//!   ├── provider   - HeapProvider trait, SbrkProvider, MmapProvider
//!   ├── config     - HeapConfig and its environment overrides
//!   └── error      - HeapError, ConfigError
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use ffalloc::{Heap, MmapProvider};
//!
//! let provider = MmapProvider::new(1 << 20).unwrap();
//! let mut heap = Heap::new(provider);
//! heap.initialize().unwrap();
//!
//! let ptr = heap.allocate(64).unwrap();
//! unsafe {
//!   ptr.as_ptr().write_bytes(0xAB, 64);
//!   let ptr = heap.resize(Some(ptr), 128).unwrap();
//!   assert_eq!(*ptr.as_ptr().add(63), 0xAB);
//!   heap.free(Some(ptr));
//! }
//!
//! assert!(heap.check_heap(false).is_empty());
//! ```
//!
//! ## How It Works
//!
//! An allocation request is padded to a multiple of 8, grown by the 8 bytes
//! of tags and raised to the 32-byte minimum block. The free list is then
//! scanned from its head and the **first** block large enough wins:
//!
//! ```text
//!   Place (split):
//!
//!   ┌────────────────────────── free block ───────────────────────────┐
//!   │                                                                 │
//!   ▼                                                                 ▼
//!   ┌────────────────────────┬────────────────────────────────────────┐
//!   │   allocated (asize)    │  free remainder, pushed on the list    │
//!   └────────────────────────┴────────────────────────────────────────┘
//!
//!   The remainder is only split off when it can hold a minimum block;
//!   otherwise the whole block is handed out.
//! ```
//!
//! When nothing fits, the heap grows by at least one chunk. Freed blocks and
//! freshly grown memory are merged with free physical neighbours straight
//! away, so two free blocks are never adjacent:
//!
//! ```text
//!   Coalesce:
//!
//!   prev   block   next            result
//!   alloc  FREE    alloc    →      unchanged
//!   free   FREE    alloc    →      [prev + block]
//!   alloc  FREE    free     →      [block + next]
//!   free   FREE    free     →      [prev + block + next]
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded only**: no synchronization, wrap a heap in a lock to share it
//! - **No shrinking**: memory is never returned to the provider
//! - **Copy-based resize**: `resize` always moves to a fresh block
//! - **4 GiB heap**: tags are 32-bit words
//! - **Unix-only**: requires `libc`
//!
//! ## Safety
//!
//! Freeing or resizing a pointer that did not come from the same heap, or
//! freeing one twice, is undefined behaviour. Those operations are `unsafe`
//! and the caller upholds that contract; it is not validated.

pub mod align;
mod block;
mod check;
mod config;
mod error;
mod free_list;
mod heap;
mod provider;

pub use block::{ALIGNMENT, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD};
pub use check::Violation;
pub use config::{DEFAULT_CHUNK_SIZE, HeapConfig};
pub use error::{ConfigError, HeapError};
pub use heap::{BlockInfo, Blocks, Heap, HeapStats};
pub use provider::{HeapProvider, MmapProvider, SbrkProvider};
