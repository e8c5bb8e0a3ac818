//! Free-list table and the core buddy algorithm
//!
//! A [`BuddySet`] owns one [`FreeList`] per order and implements block
//! splitting and coalescing. Block headers live in the [`Region`] passed to
//! every call.

use crate::region::Region;
use crate::{is_aligned, AllocError, AllocResult, MAX_ORDER, SMALLEST_ORDER};

#[cfg(feature = "log")]
use log::{debug, error, trace, warn};

use super::{
    buddy_block::{buddy_offset, BlockHeader, BlockInfo, BlockState},
    free_list::{FreeList, FreeListIter},
};

/// Free lists for every order of a single pool
pub struct BuddySet {
    max_order: usize,
    /// Free lists for each order
    free_lists: [FreeList; MAX_ORDER],
}

impl BuddySet {
    /// Create a buddy set for a pool of `2^max_order` bytes (must call init())
    pub const fn new(max_order: usize) -> Self {
        assert!(max_order < MAX_ORDER);
        Self {
            max_order,
            free_lists: [const { FreeList::new() }; MAX_ORDER],
        }
    }

    pub const fn max_order(&self) -> usize {
        self.max_order
    }

    /// Total bytes covered by the set
    pub const fn total_bytes(&self) -> usize {
        1 << self.max_order
    }

    /// Reset every list and make the whole region one free block
    pub fn init(&mut self, region: &mut Region) {
        assert_eq!(
            region.len(),
            self.total_bytes(),
            "region length does not match order {}",
            self.max_order
        );

        for list in &mut self.free_lists {
            list.clear();
        }

        self.free_lists[self.max_order].push_front(region, 0, self.max_order);
    }

    /// Whether a block of `order` could start at `offset` in this set
    pub fn is_block_boundary(&self, offset: usize, order: usize) -> bool {
        (SMALLEST_ORDER..=self.max_order).contains(&order)
            && offset < self.total_bytes()
            && is_aligned(offset, 1 << order)
    }

    /// Reserve a block of exactly `order`, splitting a larger one if needed.
    ///
    /// Returns the block's offset. On failure the lists are left untouched.
    pub fn alloc_block(&mut self, region: &mut Region, order: usize) -> AllocResult<usize> {
        if order > self.max_order {
            debug!(
                "buddy pool: required order {} exceeds max order {}",
                order, self.max_order
            );
            return Err(AllocError::NoMemory);
        }

        let Some(mut current) = (order..=self.max_order).find(|&i| !self.free_lists[i].is_empty())
        else {
            debug!("buddy pool: no free block at or above order {}", order);
            return Err(AllocError::NoMemory);
        };

        let offset = self.free_lists[current]
            .pop_front(region)
            .ok_or(AllocError::NoMemory)?;

        // Split down to the required order, keeping the lower half
        while current > order {
            current -= 1;
            let upper = offset + (1 << current);
            self.free_lists[current].push_front(region, upper, current);
            trace!(
                "buddy pool: split {:#x} into order {} halves, freed {:#x}",
                offset,
                current,
                upper
            );
        }

        region.set_header(offset, BlockHeader::new(BlockState::Reserved, order));
        Ok(offset)
    }

    /// Return the reserved block at `offset`, merging it with free buddies.
    ///
    /// Offsets that do not name a reserved block are logged and ignored.
    pub fn dealloc_block(&mut self, region: &mut Region, offset: usize) {
        if offset >= self.total_bytes() || !is_aligned(offset, 1 << SMALLEST_ORDER) {
            error!(
                "buddy pool: {:#x} is not a block boundary of a {:#x}-byte pool",
                offset,
                self.total_bytes()
            );
            return;
        }

        let header = region.header(offset);
        if header.state != BlockState::Reserved {
            warn!(
                "buddy pool: double free or foreign block at {:#x} (state {:?})",
                offset, header.state
            );
            return;
        }
        if !self.is_block_boundary(offset, header.order) {
            error!(
                "buddy pool: corrupted header at {:#x}: order {}",
                offset, header.order
            );
            return;
        }

        let mut offset = offset;
        let mut order = header.order;

        while order < self.max_order {
            let buddy = buddy_offset(offset, order);
            let buddy_header = region.header(buddy);
            if buddy_header.state != BlockState::Available || buddy_header.order != order {
                break;
            }

            self.free_lists[order].remove(region, buddy);
            let upper = offset.max(buddy);
            region.set_header(upper, BlockHeader::new(BlockState::Unused, order));
            offset = offset.min(buddy);
            order += 1;
            trace!("buddy pool: merged into order {} block at {:#x}", order, offset);
        }

        self.free_lists[order].push_front(region, offset, order);
    }

    /// Get the number of free blocks of a specific order
    pub fn free_block_count(&self, order: usize) -> usize {
        if order <= self.max_order {
            self.free_lists[order].len()
        } else {
            0
        }
    }

    /// Get free block offsets of a specific order as an iterator
    pub fn free_blocks<'a>(&self, region: &'a Region, order: usize) -> FreeListIter<'a> {
        if order <= self.max_order {
            self.free_lists[order].iter(region)
        } else {
            FreeList::new().iter(region)
        }
    }

    /// Bytes currently on free lists
    pub fn free_bytes(&self) -> usize {
        (0..=self.max_order)
            .map(|order| self.free_lists[order].len() << order)
            .sum()
    }

    /// Walk every block of the region in address order
    pub fn blocks<'a>(&self, region: &'a Region) -> BlockIter<'a> {
        BlockIter {
            region,
            offset: 0,
            end: self.total_bytes(),
        }
    }

    /// Get statistics for this set
    #[cfg(feature = "tracking")]
    pub fn get_stats(&self) -> super::stats::BuddyStats {
        let mut stats = super::stats::BuddyStats::new();
        stats.total_bytes = self.total_bytes();

        for order in 0..=self.max_order {
            stats.free_blocks_by_order[order] = self.free_lists[order].len();
        }

        stats.free_bytes = self.free_bytes();
        stats.used_bytes = stats.total_bytes.saturating_sub(stats.free_bytes);
        stats
    }
}

/// Iterator over all blocks of a region, lowest offset first
pub struct BlockIter<'a> {
    region: &'a Region,
    offset: usize,
    end: usize,
}

impl Iterator for BlockIter<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        let header = self.region.header(self.offset);
        if header.order < SMALLEST_ORDER || header.order >= usize::BITS as usize {
            error!(
                "buddy pool: block walk stopped at {:#x}: bad order {}",
                self.offset, header.order
            );
            self.offset = self.end;
            return None;
        }

        let info = BlockInfo {
            offset: self.offset,
            order: header.order,
            state: header.state,
        };
        self.offset = self.offset.saturating_add(info.size());
        Some(info)
    }
}
