//! Buddy pool over a single mapped region
//!
//! Owns the backing [`Region`] and the [`BuddySet`] that carves it up, and
//! exposes the pointer-based allocate/free/realloc surface.

use core::alloc::Layout;
use core::ptr::{self, NonNull};

use crate::region::{environment_failure, Region};
use crate::{
    is_aligned, AllocError, AllocResult, ByteAllocator, DEFAULT_ORDER, MAX_ORDER, MIN_ORDER,
    SMALLEST_ORDER,
};

#[cfg(feature = "log")]
use log::{debug, info, warn};

use super::{
    buddy_block::{order_for, BlockInfo, BlockState, HEADER_SIZE, PAYLOAD_ALIGN},
    buddy_set::{BlockIter, BuddySet},
    free_list::FreeListIter,
};

#[cfg(feature = "tracking")]
use super::stats::{BuddyStats, MemoryStatsReporter};

/// Pool order for a size hint: [`DEFAULT_ORDER`] for 0, otherwise the order
/// that holds `size_hint`, clamped to `[MIN_ORDER, MAX_ORDER - 1]`.
pub const fn pool_order(size_hint: usize) -> usize {
    let order = if size_hint == 0 {
        DEFAULT_ORDER
    } else {
        order_for(size_hint)
    };
    if order < MIN_ORDER {
        MIN_ORDER
    } else if order >= MAX_ORDER {
        MAX_ORDER - 1
    } else {
        order
    }
}

/// Fixed-capacity buddy allocator
///
/// The backing region is mapped once in [`BuddyPool::new`] and released once
/// in [`BuddyPool::destroy`] (or on drop). Every block carries a
/// [`HEADER_SIZE`]-byte header; callers get the address just past it.
pub struct BuddyPool {
    region: Region,
    set: BuddySet,
}

impl BuddyPool {
    /// Map a pool large enough for `size_hint` bytes.
    ///
    /// Terminates the process if the region cannot be mapped.
    pub fn new(size_hint: usize) -> Self {
        let order = pool_order(size_hint);
        let mut region = match Region::map(1 << order) {
            Ok(region) => region,
            Err(e) => environment_failure("mapping pool region", e),
        };

        let mut set = BuddySet::new(order);
        set.init(&mut region);

        info!(
            "buddy pool: created pool of {:#x} bytes (order {}) at {:#x}",
            region.len(),
            order,
            region.base().as_ptr() as usize
        );

        Self { region, set }
    }

    /// Release the backing region.
    ///
    /// Terminates the process if the region cannot be unmapped.
    pub fn destroy(self) {
        let Self { region, set: _set } = self;
        info!(
            "buddy pool: destroying pool of {:#x} bytes (order {})",
            region.len(),
            _set.max_order()
        );
        if let Err(e) = region.unmap() {
            environment_failure("releasing pool region", e);
        }
    }

    /// Order of the whole pool
    pub fn max_order(&self) -> usize {
        self.set.max_order()
    }

    /// Start of the backing region
    pub fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    /// Whether `ptr` points into this pool's region
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.region.offset_of(ptr.as_ptr() as usize).is_some()
    }

    /// The block whose payload starts at `ptr`.
    ///
    /// `None` unless `ptr` sits just past a header whose order places a block
    /// of that size at that offset.
    pub fn block_of(&self, ptr: NonNull<u8>) -> Option<BlockInfo> {
        self.block_at(self.header_offset(ptr)?)
    }

    fn block_at(&self, offset: usize) -> Option<BlockInfo> {
        if !self.set.is_block_boundary(offset, SMALLEST_ORDER) {
            return None;
        }
        let header = self.region.header(offset);
        if !self.set.is_block_boundary(offset, header.order) {
            return None;
        }
        Some(BlockInfo {
            offset,
            order: header.order,
            state: header.state,
        })
    }

    /// Offset of the buddy of the block starting at `offset`, using the order
    /// currently recorded in its header.
    ///
    /// `None` if no block of a splittable order starts at `offset`.
    pub fn buddy_of(&self, offset: usize) -> Option<usize> {
        self.block_at(offset)
            .filter(|block| block.order < self.max_order())
            .map(|block| super::buddy_block::buddy_offset(offset, block.order))
    }

    fn header_offset(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.region
            .offset_of(ptr.as_ptr() as usize)?
            .checked_sub(HEADER_SIZE)
            .filter(|&offset| is_aligned(offset, 1 << SMALLEST_ORDER))
    }

    /// Allocate at least `size` usable bytes.
    ///
    /// The block holding them is a power of two in size and aligned to that
    /// size relative to [`BuddyPool::base`].
    pub fn allocate(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let order = match size.checked_add(HEADER_SIZE) {
            Some(total) => order_for(total),
            None => {
                debug!("buddy pool: request of {} bytes overflows", size);
                return Err(AllocError::NoMemory);
            }
        };

        match self.set.alloc_block(&mut self.region, order) {
            Ok(offset) => Ok(self.region.ptr_at(offset + HEADER_SIZE)),
            Err(e) => {
                debug!(
                    "buddy pool: allocation failure: {} bytes (order {}), {} bytes free",
                    size,
                    order,
                    self.set.free_bytes()
                );
                #[cfg(feature = "tracking")]
                MemoryStatsReporter::print_alloc_failure_stats(&self.get_stats(), size, order);
                Err(e)
            }
        }
    }

    /// Return a block to the pool, coalescing it with free buddies.
    ///
    /// Pointers outside the pool and blocks that are not currently reserved
    /// are logged and ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`BuddyPool::allocate`] or
    /// [`BuddyPool::realloc`] on this pool and not freed since. The caller must
    /// not use the memory afterwards.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
        match self.header_offset(ptr) {
            Some(offset) => self.set.dealloc_block(&mut self.region, offset),
            None => {
                warn!(
                    "buddy pool: free of {:#x}: not a block payload in this pool",
                    ptr.as_ptr() as usize
                );
            }
        }
    }

    /// Resize an allocation.
    ///
    /// - `None` allocates `size` bytes.
    /// - `size == 0` frees `ptr` and returns `None`.
    /// - If the current block already holds `size` bytes, `ptr` is returned
    ///   unchanged; blocks are never shrunk.
    /// - Otherwise the payload moves to a new block. If that allocation fails,
    ///   `ptr` stays valid and untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`BuddyPool::free`] for a `Some` pointer.
    pub unsafe fn realloc(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
    ) -> AllocResult<Option<NonNull<u8>>> {
        let Some(old) = ptr else {
            return self.allocate(size).map(Some);
        };

        if size == 0 {
            // Safety: forwarded caller contract.
            unsafe { self.free(old) };
            return Ok(None);
        }

        let Some(block) = self
            .block_of(old)
            .filter(|block| block.state == BlockState::Reserved)
        else {
            warn!(
                "buddy pool: realloc of {:#x}: not a live allocation",
                old.as_ptr() as usize
            );
            return Err(AllocError::InvalidParam);
        };

        let needed = size.checked_add(HEADER_SIZE).map(order_for);
        if needed.is_some_and(|order| order <= block.order) {
            return Ok(Some(old));
        }

        let new = self.allocate(size)?;
        let copy = (block.size() - HEADER_SIZE).min(size);
        // Safety: both payloads are live, distinct blocks of this pool and at
        // least `copy` bytes long.
        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), copy);
            self.free(old);
        }
        Ok(Some(new))
    }

    /// Usable bytes behind a live allocation
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.block_of(ptr)
            .filter(|block| block.state == BlockState::Reserved)
            .map(|block| block.size() - HEADER_SIZE)
    }

    /// Get the number of free blocks of a specific order
    pub fn free_block_count(&self, order: usize) -> usize {
        self.set.free_block_count(order)
    }

    /// Get free block offsets of a specific order, in list order
    pub fn free_blocks(&self, order: usize) -> FreeListIter<'_> {
        self.set.free_blocks(&self.region, order)
    }

    /// Walk every block of the pool in address order
    pub fn blocks(&self) -> BlockIter<'_> {
        self.set.blocks(&self.region)
    }

    #[cfg(feature = "tracking")]
    pub fn get_stats(&self) -> BuddyStats {
        self.set.get_stats()
    }

    /// Print the pool layout and free block distribution
    pub fn print_pool_info(&self) {
        info!("========== Buddy Pool Info ==========");
        info!(
            "Address range: [{:#x}, {:#x})",
            self.region.base().as_ptr() as usize,
            self.region.base().as_ptr() as usize + self.region.len()
        );
        info!("Max order: {}", self.max_order());
        info!(
            "Free: {:#x} of {:#x} bytes",
            self.set.free_bytes(),
            self.set.total_bytes()
        );
        info!("Free blocks distribution:");

        for order in 0..=self.max_order() {
            let block_count = self.set.free_block_count(order);
            if block_count > 0 {
                let _block_size = 1usize << order;
                info!(
                    "  Order {}: {} blocks (size {} bytes each, total {:#x})",
                    order,
                    block_count,
                    _block_size,
                    block_count * _block_size
                );
            }
        }
        info!("=====================================");
    }
}

impl ByteAllocator for BuddyPool {
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>> {
        if layout.align() > PAYLOAD_ALIGN {
            debug!(
                "buddy pool: alignment {} exceeds payload alignment {}",
                layout.align(),
                PAYLOAD_ALIGN
            );
            return Err(AllocError::InvalidParam);
        }
        self.allocate(layout.size())
    }

    unsafe fn dealloc(&mut self, pos: NonNull<u8>, _layout: Layout) {
        // Safety: forwarded caller contract.
        unsafe { self.free(pos) };
    }

    fn total_bytes(&self) -> usize {
        self.set.total_bytes()
    }

    fn used_bytes(&self) -> usize {
        self.set.total_bytes() - self.set.free_bytes()
    }

    fn available_bytes(&self) -> usize {
        self.set.free_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reserved_plus_free(pool: &BuddyPool) -> usize {
        let reserved: usize = pool
            .blocks()
            .filter(|block| block.state == BlockState::Reserved)
            .map(|block| block.size())
            .sum();
        let free: usize = (0..=pool.max_order())
            .map(|order| pool.free_block_count(order) << order)
            .sum();
        reserved + free
    }

    #[test]
    fn test_pool_order_clamps() {
        assert_eq!(pool_order(0), DEFAULT_ORDER);
        assert_eq!(pool_order(1), MIN_ORDER);
        assert_eq!(pool_order(1 << MIN_ORDER), MIN_ORDER);
        assert_eq!(pool_order((1 << MIN_ORDER) + 1), MIN_ORDER + 1);
        assert_eq!(pool_order(usize::MAX), MAX_ORDER - 1);
    }

    #[test]
    fn test_new_pool_is_one_free_block() {
        let pool = BuddyPool::new(1 << MIN_ORDER);
        assert_eq!(pool.max_order(), MIN_ORDER);
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
        assert_eq!(pool.available_bytes(), 1 << MIN_ORDER);
        assert_eq!(pool.used_bytes(), 0);
        pool.destroy();
    }

    #[test]
    fn test_allocate_returns_payload_after_header() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let ptr = pool.allocate(100).unwrap();

        let block = pool.block_of(ptr).unwrap();
        assert_eq!(block.offset, 0);
        assert_eq!(block.order, order_for(100 + HEADER_SIZE));
        assert_eq!(block.state, BlockState::Reserved);
        assert_eq!(
            ptr.as_ptr() as usize,
            pool.base().as_ptr() as usize + HEADER_SIZE
        );
        assert!(pool.usable_size(ptr).unwrap() >= 100);

        unsafe { pool.free(ptr) };
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_allocate_zero_bytes() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let ptr = pool.allocate(0).unwrap();
        assert_eq!(pool.block_of(ptr).unwrap().order, SMALLEST_ORDER);
        unsafe { pool.free(ptr) };
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_allocate_overflowing_size() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        assert_eq!(pool.allocate(usize::MAX), Err(AllocError::NoMemory));
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_buddy_of_follows_header_order() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let a = pool.allocate(1000).unwrap();
        let b = pool.allocate(1000).unwrap();
        let a_off = pool.block_of(a).unwrap().offset;
        let b_off = pool.block_of(b).unwrap().offset;

        assert_eq!(pool.buddy_of(a_off), Some(b_off));
        assert_eq!(pool.buddy_of(b_off), Some(a_off));
        assert_eq!(pool.buddy_of(a_off + 8), None);
        assert_eq!(pool.buddy_of(1 << MIN_ORDER), None);

        unsafe {
            pool.free(a);
            pool.free(b);
        }
    }

    #[test]
    fn test_total_size_invariant_holds() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let total = 1usize << MIN_ORDER;
        let mut live = Vec::new();

        for (i, size) in [10, 300, 5000, 70, 1 << 16, 2000, 33, 900].iter().enumerate() {
            live.push(pool.allocate(*size).unwrap());
            assert_eq!(reserved_plus_free(&pool), total);
            if i % 3 == 2 {
                let ptr = live.remove(0);
                unsafe { pool.free(ptr) };
                assert_eq!(reserved_plus_free(&pool), total);
            }
        }

        for ptr in live.drain(..).rev() {
            unsafe { pool.free(ptr) };
            assert_eq!(reserved_plus_free(&pool), total);
        }
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_free_foreign_pointer_is_ignored() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let ptr = pool.allocate(64).unwrap();

        let mut outside = 0u64;
        unsafe { pool.free(NonNull::from(&mut outside).cast()) };
        unsafe { pool.free(pool.base()) };

        assert_eq!(pool.usable_size(ptr), Some((1 << 7) - HEADER_SIZE));
        unsafe { pool.free(ptr) };
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_interior_pointer_with_forged_header() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let ptr = pool.allocate(200).unwrap();
        let block = pool.block_of(ptr).unwrap();

        // Caller data shaped like a reserved header with an impossible order
        let forged = block.offset + (1 << SMALLEST_ORDER);
        unsafe {
            let header = pool.base().as_ptr().add(forged);
            header.write(BlockState::Reserved as u8);
            header.add(1).write(200);
        }
        let interior = NonNull::new(unsafe { pool.base().as_ptr().add(forged + HEADER_SIZE) })
            .unwrap();

        assert_eq!(pool.block_of(interior), None);
        assert_eq!(pool.usable_size(interior), None);
        assert_eq!(pool.buddy_of(forged), None);
        assert_eq!(
            unsafe { pool.realloc(Some(interior), 1 << 12) },
            Err(AllocError::InvalidParam)
        );

        // A plausible order that does not fit the offset is rejected too
        unsafe { pool.base().as_ptr().add(forged + 1).write(12) };
        assert_eq!(pool.usable_size(interior), None);

        unsafe { pool.free(interior) };
        assert_eq!(pool.usable_size(ptr), Some(block.size() - HEADER_SIZE));
        unsafe { pool.free(ptr) };
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_realloc_none_allocates() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let ptr = unsafe { pool.realloc(None, 128) }.unwrap().unwrap();
        assert!(pool.usable_size(ptr).unwrap() >= 128);
        unsafe { pool.free(ptr) };
    }

    #[test]
    fn test_realloc_zero_frees() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let ptr = pool.allocate(128).unwrap();
        assert_eq!(unsafe { pool.realloc(Some(ptr), 0) }, Ok(None));
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_realloc_failure_keeps_old_block() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let ptr = pool.allocate(1 << (MIN_ORDER - 1)).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0x5a, 16) };

        assert_eq!(
            unsafe { pool.realloc(Some(ptr), 1 << MIN_ORDER) },
            Err(AllocError::NoMemory)
        );
        assert_eq!(pool.block_of(ptr).unwrap().state, BlockState::Reserved);
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 16) };
        assert!(bytes.iter().all(|&b| b == 0x5a));

        unsafe { pool.free(ptr) };
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_realloc_freed_pointer_is_invalid() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let ptr = pool.allocate(100).unwrap();
        unsafe { pool.free(ptr) };

        assert_eq!(
            unsafe { pool.realloc(Some(ptr), 1000) },
            Err(AllocError::InvalidParam)
        );
        assert_eq!(pool.free_block_count(MIN_ORDER), 1);
    }

    #[test]
    fn test_byte_allocator_surface() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let layout = Layout::from_size_align(200, 8).unwrap();

        let ptr = pool.alloc(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % PAYLOAD_ALIGN, 0);
        assert_eq!(pool.used_bytes(), 1 << order_for(200 + HEADER_SIZE));
        assert_eq!(pool.total_bytes(), pool.used_bytes() + pool.available_bytes());

        let over_aligned = Layout::from_size_align(64, PAYLOAD_ALIGN * 2).unwrap();
        assert_eq!(pool.alloc(over_aligned), Err(AllocError::InvalidParam));

        unsafe { pool.dealloc(ptr, layout) };
        assert_eq!(pool.used_bytes(), 0);
    }

    #[test]
    #[cfg(feature = "tracking")]
    fn test_stats_follow_allocations() {
        let mut pool = BuddyPool::new(1 << MIN_ORDER);
        let stats = pool.get_stats();
        assert_eq!(stats.total_bytes, 1 << MIN_ORDER);
        assert_eq!(stats.free_bytes, 1 << MIN_ORDER);
        assert_eq!(stats.free_blocks_by_order[MIN_ORDER], 1);

        let ptr = pool.allocate(10).unwrap();
        let stats = pool.get_stats();
        assert_eq!(stats.used_bytes, 1 << SMALLEST_ORDER);
        assert_eq!(stats.free_blocks_by_order[MIN_ORDER], 0);
        assert_eq!(stats.largest_free_block(), 1 << (MIN_ORDER - 1));

        unsafe { pool.free(ptr) };
        assert_eq!(pool.get_stats().used_bytes, 0);
    }
}
