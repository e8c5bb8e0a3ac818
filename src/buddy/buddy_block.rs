//! Buddy block metadata
//!
//! Every block in the pool, free or reserved, starts with a [`BlockHeader`].
//! This module also holds the pure order and buddy arithmetic.

use core::mem::{align_of, size_of};

use crate::SMALLEST_ORDER;

/// Link value stored in a header for "no neighbour".
const NIL: usize = usize::MAX;

/// In-region header layout.
///
/// Only integer fields, so any byte pattern read back from the region is a
/// valid value.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawHeader {
    state: u8,
    order: u8,
    _reserved: [u8; 6],
    prev: usize,
    next: usize,
}

/// Bytes reserved at the start of every block.
pub const HEADER_SIZE: usize = size_of::<RawHeader>();

/// Alignment guaranteed for every payload pointer.
pub const PAYLOAD_ALIGN: usize = align_of::<RawHeader>();

/// Block state as recorded in its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockState {
    /// Not the start of a live block (absorbed by a merge, or never written).
    Unused = 0,
    /// On a free list.
    Available = 1,
    /// Handed out to a caller.
    Reserved = 2,
}

impl BlockState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => BlockState::Available,
            2 => BlockState::Reserved,
            _ => BlockState::Unused,
        }
    }
}

/// Decoded block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub state: BlockState,
    pub order: usize,
    /// Previous free block of the same order (offset), while on a free list.
    pub prev: Option<usize>,
    /// Next free block of the same order (offset), while on a free list.
    pub next: Option<usize>,
}

impl BlockHeader {
    /// Unlinked header with the given state and order.
    pub const fn new(state: BlockState, order: usize) -> Self {
        Self {
            state,
            order,
            prev: None,
            next: None,
        }
    }

    /// Size of the block in bytes, header included.
    pub const fn block_size(&self) -> usize {
        1 << self.order
    }

    pub(crate) const fn from_raw(raw: RawHeader) -> Self {
        Self {
            state: BlockState::from_raw(raw.state),
            order: raw.order as usize,
            prev: if raw.prev == NIL { None } else { Some(raw.prev) },
            next: if raw.next == NIL { None } else { Some(raw.next) },
        }
    }

    pub(crate) const fn into_raw(self) -> RawHeader {
        RawHeader {
            state: self.state as u8,
            order: self.order as u8,
            _reserved: [0; 6],
            prev: match self.prev {
                Some(p) => p,
                None => NIL,
            },
            next: match self.next {
                Some(n) => n,
                None => NIL,
            },
        }
    }
}

/// One block of the pool as seen by [`BuddyPool::blocks`](super::BuddyPool::blocks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub offset: usize,
    pub order: usize,
    pub state: BlockState,
}

impl BlockInfo {
    pub const fn size(&self) -> usize {
        1 << self.order
    }
}

/// Smallest order `k` with `2^k >= bytes`, never below [`SMALLEST_ORDER`].
///
/// Byte counts too large for any `usize` power of two map to `usize::BITS`,
/// which exceeds every pool order.
pub const fn order_for(bytes: usize) -> usize {
    let order = match bytes.checked_next_power_of_two() {
        Some(size) => size.trailing_zeros() as usize,
        None => usize::BITS as usize,
    };
    if order < SMALLEST_ORDER {
        SMALLEST_ORDER
    } else {
        order
    }
}

/// Offset of the buddy of the order-`order` block at `offset`.
///
/// For a block at offset O with order k, its buddy is at O ^ 2^k.
pub const fn buddy_offset(offset: usize, order: usize) -> usize {
    offset ^ (1 << order)
}
