//! Buddy Pool Allocator
//!
//! A fixed-capacity memory pool built on the buddy system, featuring:
//! - One contiguous region mapped once from the OS and released once
//! - Power-of-two size classes ("orders") with one free list per order
//! - Block splitting on allocation and buddy coalescing on free
//! - Optional per-order statistics (`tracking` feature)
//!
//! The pool is single-owner: every mutating operation takes `&mut self`.

use core::alloc::Layout;
use core::ptr::NonNull;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Smallest block order ever handed out (64-byte blocks).
pub const SMALLEST_ORDER: usize = 6;

/// Smallest pool order (1 MiB pool).
pub const MIN_ORDER: usize = 20;

/// Exclusive upper bound on the pool order; also the free-list table size.
pub const MAX_ORDER: usize = 48;

/// Pool order used when no size hint is given (1 GiB pool).
pub const DEFAULT_ORDER: usize = 30;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size` or alignment.
    InvalidParam,
    /// No block of the required order is available.
    NoMemory,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Byte-granularity allocator.
pub trait ByteAllocator {
    /// Allocate memory with the given size (in bytes) and alignment.
    fn alloc(&mut self, layout: Layout) -> AllocResult<NonNull<u8>>;

    /// Deallocate memory at the given position, size, and alignment.
    ///
    /// # Safety
    ///
    /// `pos` must have been returned by [`ByteAllocator::alloc`] on this
    /// allocator and must not have been deallocated since.
    unsafe fn dealloc(&mut self, pos: NonNull<u8>, layout: Layout);

    /// Returns total memory size in bytes.
    fn total_bytes(&self) -> usize;

    /// Returns allocated memory size in bytes.
    fn used_bytes(&self) -> usize;

    /// Returns available memory size in bytes.
    fn available_bytes(&self) -> usize;
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod region;
pub use region::{Region, RegionError};

pub mod buddy;
#[cfg(feature = "tracking")]
pub use buddy::BuddyStats;
pub use buddy::{
    buddy_offset, order_for, BlockInfo, BlockState, BuddyPool, HEADER_SIZE, PAYLOAD_ALIGN,
};
