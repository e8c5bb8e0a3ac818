//! Intrusive free list over block headers
//!
//! The list itself only keeps the head offset and a length; the `prev`/`next`
//! links live in the headers of the member blocks inside the region.

#[cfg(feature = "log")]
use log::error;

use super::buddy_block::{BlockHeader, BlockState};
use crate::region::Region;

/// Doubly-linked free list of blocks of a single order
///
/// `head == None` is the empty state.
#[derive(Debug, Clone, Copy)]
pub struct FreeList {
    head: Option<usize>,
    len: usize,
}

impl FreeList {
    /// Create a new empty free list
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Check if the list is empty
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Get the length of the list
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Offset of the first block, if any
    pub const fn head(&self) -> Option<usize> {
        self.head
    }

    /// Link the block at `offset` in front of the list.
    ///
    /// The block's header is rewritten as `Available` with the given order.
    pub fn push_front(&mut self, region: &mut Region, offset: usize, order: usize) {
        if let Some(old_head) = self.head {
            let mut head = region.header(old_head);
            head.prev = Some(offset);
            region.set_header(old_head, head);
        }

        region.set_header(
            offset,
            BlockHeader {
                state: BlockState::Available,
                order,
                prev: None,
                next: self.head,
            },
        );

        self.head = Some(offset);
        self.len += 1;
    }

    /// Unlink and return the first block
    pub fn pop_front(&mut self, region: &mut Region) -> Option<usize> {
        let head = self.head?;
        self.remove(region, head);
        Some(head)
    }

    /// Unlink the block at `offset`, which must be a member of this list.
    ///
    /// The unlinked header keeps its state and order; only its links are cleared.
    pub fn remove(&mut self, region: &mut Region, offset: usize) {
        let mut header = region.header(offset);

        match header.prev {
            Some(prev) => {
                let mut prev_header = region.header(prev);
                prev_header.next = header.next;
                region.set_header(prev, prev_header);
            }
            None => {
                if self.head != Some(offset) {
                    error!(
                        "buddy pool: block {:#x} has no predecessor but is not the list head",
                        offset
                    );
                }
                self.head = header.next;
            }
        }

        if let Some(next) = header.next {
            let mut next_header = region.header(next);
            next_header.prev = header.prev;
            region.set_header(next, next_header);
        }

        header.prev = None;
        header.next = None;
        region.set_header(offset, header);
        self.len -= 1;
    }

    /// Get iterator over member offsets, head first
    pub fn iter<'a>(&self, region: &'a Region) -> FreeListIter<'a> {
        FreeListIter {
            region,
            current: self.head,
            remaining: self.len,
        }
    }

    /// Forget all members without touching their headers
    pub fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator for FreeList
pub struct FreeListIter<'a> {
    region: &'a Region,
    current: Option<usize>,
    remaining: usize,
}

impl Iterator for FreeListIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        // Bounded by the recorded length so a corrupted link cannot cycle forever.
        if self.remaining == 0 {
            return None;
        }
        let offset = self.current?;
        self.current = self.region.header(offset).next;
        self.remaining -= 1;
        Some(offset)
    }
}
