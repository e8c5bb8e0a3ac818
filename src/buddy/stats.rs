//! Statistics and debugging for the buddy pool
//!
//! Provides per-order statistics and failure reporting.

use crate::MAX_ORDER;

/// Buddy pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuddyStats {
    pub total_bytes: usize,
    pub free_bytes: usize,
    pub used_bytes: usize,
    pub free_blocks_by_order: [usize; MAX_ORDER],
}

impl Default for BuddyStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyStats {
    pub const fn new() -> Self {
        Self {
            total_bytes: 0,
            free_bytes: 0,
            used_bytes: 0,
            free_blocks_by_order: [0; MAX_ORDER],
        }
    }

    /// Size of the largest free block, or 0 if the pool is exhausted
    pub fn largest_free_block(&self) -> usize {
        self.free_blocks_by_order
            .iter()
            .rposition(|&count| count > 0)
            .map_or(0, |order| 1 << order)
    }
}

/// Detailed memory statistics reporter
pub struct MemoryStatsReporter;

impl MemoryStatsReporter {
    /// Print detailed allocation failure statistics
    #[allow(unused_variables)]
    pub fn print_alloc_failure_stats(stats: &BuddyStats, request_bytes: usize, request_order: usize) {
        #[cfg(feature = "log")]
        use log::error;
        error!("========================================");
        error!(
            "Request: {} bytes (order {}, block {} bytes)",
            request_bytes,
            request_order,
            1usize.checked_shl(request_order as u32).unwrap_or(0)
        );
        error!("Pool state:");
        error!("  Total: {} KB", stats.total_bytes / 1024);
        error!("  Free: {} KB", stats.free_bytes / 1024);
        error!("  Used: {} KB", stats.used_bytes / 1024);
        error!("  Largest free block: {} bytes", stats.largest_free_block());
        error!("  Free blocks by order:");

        for order in (0..MAX_ORDER).rev() {
            let count = stats.free_blocks_by_order[order];
            if count > 0 {
                let block_size = 1usize << order;
                error!(
                    "    Order {}: {} blocks ({} bytes each, {} bytes total)",
                    order,
                    count,
                    block_size,
                    count * block_size
                );
            }
        }
        error!("========================================");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_largest_free_block() {
        let mut stats = BuddyStats::new();
        assert_eq!(stats.largest_free_block(), 0);

        stats.free_blocks_by_order[7] = 3;
        stats.free_blocks_by_order[12] = 1;
        assert_eq!(stats.largest_free_block(), 1 << 12);
    }
}
