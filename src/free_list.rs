//! Explicit free list threaded through the payloads of free blocks.
//!
//! The list is unordered: blocks are pushed at the head as they are freed or
//! created, so a scan visits the most recently released memory first. Links
//! are payload offsets; a missing link ends the list.

use crate::block::{Block, Region};

#[derive(Debug, Default)]
pub(crate) struct FreeList {
  head: Option<Block>,
}

impl FreeList {
  pub(crate) const fn new() -> Self {
    Self { head: None }
  }

  pub(crate) fn head(&self) -> Option<Block> {
    self.head
  }

  /// Pushes `block` at the head of the list.
  pub(crate) fn insert(
    &mut self,
    region: &mut Region,
    block: Block,
  ) {
    region.set_prev_free(block, None);
    region.set_next_free(block, self.head);

    if let Some(head) = self.head {
      region.set_prev_free(head, Some(block));
    }

    self.head = Some(block);
  }

  /// Unlinks `block`, which must currently be on the list.
  pub(crate) fn remove(
    &mut self,
    region: &mut Region,
    block: Block,
  ) {
    let prev = region.prev_free(block);
    let next = region.next_free(block);

    match prev {
      Some(prev) => region.set_next_free(prev, next),
      None => {
        debug_assert_eq!(self.head, Some(block), "unlinked block has no predecessor");
        self.head = next;
      }
    }

    if let Some(next) = next {
      region.set_prev_free(next, prev);
    }
  }

  pub(crate) fn iter<'r>(
    &self,
    region: &'r Region,
  ) -> Iter<'r> {
    Iter {
      region,
      current: self.head,
    }
  }

  /// Returns the first block in list order that holds at least `size` bytes.
  pub(crate) fn first_fit(
    &self,
    region: &Region,
    size: usize,
  ) -> Option<Block> {
    self.iter(region).find(|&block| region.size(block) >= size)
  }
}

pub(crate) struct Iter<'r> {
  region: &'r Region,
  current: Option<Block>,
}

impl Iterator for Iter<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.current?;
    self.current = self.region.next_free(block);
    Some(block)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::tests::Scratch;

  fn free_block(
    region: &mut Region,
    offset: usize,
    size: usize,
  ) -> Block {
    let block = Block::new(offset);
    region.set_tags(block, size, false);
    block
  }

  fn collect(
    list: &FreeList,
    region: &Region,
  ) -> Vec<usize> {
    list.iter(region).map(Block::offset).collect()
  }

  #[test]
  fn test_insert_is_lifo() {
    let mut scratch = Scratch::new(512);
    let mut region = scratch.region();
    let mut list = FreeList::new();

    let a = free_block(&mut region, 16, 32);
    let b = free_block(&mut region, 48, 64);
    let c = free_block(&mut region, 112, 32);

    list.insert(&mut region, a);
    list.insert(&mut region, b);
    list.insert(&mut region, c);

    assert_eq!(collect(&list, &region), vec![112, 48, 16]);
    assert_eq!(region.prev_free(c), None);
    assert_eq!(region.prev_free(b), Some(c));
    assert_eq!(region.prev_free(a), Some(b));
  }

  #[test]
  fn test_remove_head_middle_tail() {
    let mut scratch = Scratch::new(512);
    let mut region = scratch.region();
    let mut list = FreeList::new();

    let a = free_block(&mut region, 16, 32);
    let b = free_block(&mut region, 48, 64);
    let c = free_block(&mut region, 112, 32);
    let d = free_block(&mut region, 144, 32);
    for block in [a, b, c, d] {
      list.insert(&mut region, block);
    }

    list.remove(&mut region, b);
    assert_eq!(collect(&list, &region), vec![144, 112, 16]);
    assert_eq!(region.prev_free(a), Some(c));

    list.remove(&mut region, d);
    assert_eq!(list.head(), Some(c));
    assert_eq!(region.prev_free(c), None);

    list.remove(&mut region, a);
    assert_eq!(collect(&list, &region), vec![112]);
    assert_eq!(region.next_free(c), None);
  }

  #[test]
  fn test_remove_only_element_empties_list() {
    let mut scratch = Scratch::new(128);
    let mut region = scratch.region();
    let mut list = FreeList::new();

    let a = free_block(&mut region, 16, 32);
    list.insert(&mut region, a);
    list.remove(&mut region, a);

    assert_eq!(list.head(), None);
    assert_eq!(list.iter(&region).count(), 0);
    assert_eq!(list.first_fit(&region, 8), None);
  }

  #[test]
  fn test_first_fit_takes_first_large_enough() {
    let mut scratch = Scratch::new(512);
    let mut region = scratch.region();
    let mut list = FreeList::new();

    let big = free_block(&mut region, 16, 128);
    let small = free_block(&mut region, 144, 32);
    let medium = free_block(&mut region, 176, 64);
    for block in [big, small, medium] {
      list.insert(&mut region, block);
    }

    // List order is medium, small, big.
    assert_eq!(list.first_fit(&region, 32), Some(medium));
    assert_eq!(list.first_fit(&region, 72), Some(big));
    assert_eq!(list.first_fit(&region, 256), None);
  }
}
