//! Buddy pool module
//!
//! This module provides the buddy system implementation with:
//! - Order arithmetic and in-region block headers
//! - Intrusive per-order free lists
//! - Splitting on allocation and coalescing on free
//! - Optional statistics (`tracking` feature)

pub mod buddy_block;
pub mod buddy_pool;
pub mod buddy_set;
pub mod free_list;
#[cfg(feature = "tracking")]
pub mod stats;

pub use buddy_block::{
    buddy_offset, order_for, BlockHeader, BlockInfo, BlockState, HEADER_SIZE, PAYLOAD_ALIGN,
};
pub use buddy_pool::{pool_order, BuddyPool};
pub use buddy_set::{BlockIter, BuddySet};
pub use free_list::{FreeList, FreeListIter};
#[cfg(feature = "tracking")]
pub use stats::{BuddyStats, MemoryStatsReporter};
