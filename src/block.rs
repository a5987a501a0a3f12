//! Boundary-tag block layout.
//!
//! ```text
//!   Allocated block:
//!   ┌────────┬──────────────────────────────────────────┬────────┐
//!   │ header │               payload                    │ footer │
//!   │ size|1 │                                          │ size|1 │
//!   └────────┴──────────────────────────────────────────┴────────┘
//!            ▲
//!            └── Block offset / pointer returned to the caller
//!
//!   Free block:
//!   ┌────────┬───────────┬───────────┬──────────────────┬────────┐
//!   │ header │ prev-free │ next-free │     unused       │ footer │
//!   │ size|0 │  8 bytes  │  8 bytes  │                  │ size|0 │
//!   └────────┴───────────┴───────────┴──────────────────┴────────┘
//! ```
//!
//! Tags are 4-byte words. The size stored in a tag covers header, payload and
//! footer, and is always a multiple of 8, leaving the low three bits for the
//! allocated flag.

use std::ptr::NonNull;

/// Tag word size in bytes.
pub const WSIZE: usize = 4;

/// Double word size in bytes.
pub const DSIZE: usize = 8;

/// Alignment of every payload handed out.
pub const ALIGNMENT: usize = DSIZE;

/// Bytes of every block taken by its header and footer.
pub const OVERHEAD: usize = 2 * WSIZE;

/// Header, two free-list links and footer, rounded to the alignment.
pub const MIN_BLOCK_SIZE: usize = 4 * DSIZE;

/// Largest size a 4-byte tag can describe.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX & SIZE_MASK) as usize;

/// Padding word, prologue header and footer, epilogue header.
pub(crate) const SENTINEL_BYTES: usize = 4 * WSIZE;

/// The prologue is an allocated block with an empty payload.
pub(crate) const PROLOGUE: Block = Block(DSIZE);

/// Payload offset of the first block after the prologue.
pub(crate) const FIRST_BLOCK: Block = Block(SENTINEL_BYTES);

const ALLOC_BIT: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

// Offset 0 is the padding word, so it can never be a payload offset.
const NO_LINK: u64 = 0;

/// A block, named by the offset of its payload from the heap base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct Block(usize);

impl Block {
  pub(crate) const fn new(offset: usize) -> Self {
    Self(offset)
  }

  pub(crate) const fn offset(self) -> usize {
    self.0
  }

  const fn header(self) -> usize {
    self.0 - WSIZE
  }

  const fn prev_footer(self) -> usize {
    self.0 - DSIZE
  }

  const fn prev_link(self) -> usize {
    self.0
  }

  const fn next_link(self) -> usize {
    self.0 + DSIZE
  }
}

/// Decoded contents of a header or footer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Tag {
  pub size: usize,
  pub allocated: bool,
}

impl Tag {
  pub(crate) const fn unpack(word: u32) -> Self {
    Self {
      size: (word & SIZE_MASK) as usize,
      allocated: word & ALLOC_BIT != 0,
    }
  }
}

/// Packs a size and an allocated flag into a tag word.
pub(crate) fn pack(
  size: usize,
  allocated: bool,
) -> u32 {
  debug_assert!(size <= MAX_BLOCK_SIZE, "block size {size} does not fit a tag");
  debug_assert_eq!(size % ALIGNMENT, 0, "block size {size} is not aligned");
  size as u32 | allocated as u32
}

/// The managed byte range: a base address plus the number of bytes obtained
/// from the provider so far.
///
/// Every offset handed to the accessors must lie inside `0..len`; this is
/// only checked in debug builds.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
  base: NonNull<u8>,
  len: usize,
}

impl Region {
  pub(crate) const fn unmapped() -> Self {
    Self {
      base: NonNull::dangling(),
      len: 0,
    }
  }

  /// # Safety
  ///
  /// `base` must be aligned to [`ALIGNMENT`] and valid for reads and writes
  /// of `len` bytes for as long as the region is used.
  pub(crate) const unsafe fn from_raw_parts(
    base: NonNull<u8>,
    len: usize,
  ) -> Self {
    Self { base, len }
  }

  pub(crate) fn is_mapped(&self) -> bool {
    self.len != 0
  }

  pub(crate) fn len(&self) -> usize {
    self.len
  }

  /// Address one past the last managed byte.
  pub(crate) fn end_addr(&self) -> usize {
    self.base.as_ptr() as usize + self.len
  }

  /// # Safety
  ///
  /// The `bytes` following the current end must be valid for reads and
  /// writes.
  pub(crate) unsafe fn grow(
    &mut self,
    bytes: usize,
  ) {
    self.len += bytes;
  }

  pub(crate) fn contains(
    &self,
    ptr: *const u8,
  ) -> bool {
    let addr = ptr as usize;
    let lo = self.base.as_ptr() as usize;
    self.is_mapped() && addr >= lo && addr < self.end_addr()
  }

  pub(crate) fn payload(
    &self,
    block: Block,
  ) -> NonNull<u8> {
    debug_assert!(block.offset() < self.len);
    unsafe { self.base.add(block.offset()) }
  }

  pub(crate) fn block_of(
    &self,
    payload: NonNull<u8>,
  ) -> Block {
    debug_assert!(self.contains(payload.as_ptr()), "pointer outside of the heap");
    Block(payload.as_ptr() as usize - self.base.as_ptr() as usize)
  }

  fn word(
    &self,
    at: usize,
  ) -> u32 {
    debug_assert!(at + WSIZE <= self.len, "tag read at {at} past heap end {}", self.len);
    unsafe { self.base.as_ptr().add(at).cast::<u32>().read() }
  }

  fn set_word(
    &mut self,
    at: usize,
    value: u32,
  ) {
    debug_assert!(at + WSIZE <= self.len, "tag write at {at} past heap end {}", self.len);
    unsafe { self.base.as_ptr().add(at).cast::<u32>().write(value) }
  }

  pub(crate) fn header(
    &self,
    block: Block,
  ) -> Tag {
    Tag::unpack(self.word(block.header()))
  }

  pub(crate) fn footer_offset(
    &self,
    block: Block,
  ) -> usize {
    block.offset() + self.size(block) - DSIZE
  }

  pub(crate) fn footer(
    &self,
    block: Block,
  ) -> Tag {
    Tag::unpack(self.word(self.footer_offset(block)))
  }

  pub(crate) fn size(
    &self,
    block: Block,
  ) -> usize {
    self.header(block).size
  }

  pub(crate) fn is_allocated(
    &self,
    block: Block,
  ) -> bool {
    self.header(block).allocated
  }

  /// Writes matching header and footer tags for `block`.
  pub(crate) fn set_tags(
    &mut self,
    block: Block,
    size: usize,
    allocated: bool,
  ) {
    let word = pack(size, allocated);
    self.set_word(block.header(), word);
    self.set_word(block.offset() + size - DSIZE, word);
    debug_assert_eq!(self.header(block), self.footer(block));
  }

  /// Writes the zero-size allocated header that terminates the heap.
  pub(crate) fn set_epilogue(
    &mut self,
    block: Block,
  ) {
    self.set_word(block.header(), pack(0, true));
  }

  pub(crate) fn next_block(
    &self,
    block: Block,
  ) -> Block {
    Block(block.offset() + self.size(block))
  }

  /// Tag found in the footer of the physically previous block.
  pub(crate) fn prev_footer(
    &self,
    block: Block,
  ) -> Tag {
    Tag::unpack(self.word(block.prev_footer()))
  }

  pub(crate) fn prev_block(
    &self,
    block: Block,
  ) -> Block {
    Block(block.offset() - self.prev_footer(block).size)
  }

  fn link(
    &self,
    at: usize,
  ) -> Option<Block> {
    debug_assert!(at + DSIZE <= self.len);
    let raw = unsafe { self.base.as_ptr().add(at).cast::<u64>().read() };
    (raw != NO_LINK).then_some(Block(raw as usize))
  }

  fn set_link(
    &mut self,
    at: usize,
    to: Option<Block>,
  ) {
    debug_assert!(at + DSIZE <= self.len);
    let raw = to.map_or(NO_LINK, |block| block.offset() as u64);
    unsafe { self.base.as_ptr().add(at).cast::<u64>().write(raw) }
  }

  pub(crate) fn prev_free(
    &self,
    block: Block,
  ) -> Option<Block> {
    self.link(block.prev_link())
  }

  pub(crate) fn next_free(
    &self,
    block: Block,
  ) -> Option<Block> {
    self.link(block.next_link())
  }

  pub(crate) fn set_prev_free(
    &mut self,
    block: Block,
    to: Option<Block>,
  ) {
    self.set_link(block.prev_link(), to)
  }

  pub(crate) fn set_next_free(
    &mut self,
    block: Block,
    to: Option<Block>,
  ) {
    self.set_link(block.next_link(), to)
  }
}
