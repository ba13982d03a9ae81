use thiserror::Error;

/// Error types for buddy page allocator operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuddyError {
    /// Requested order is not representable by this allocator's `max_order`.
    #[error("invalid page order {order} (max order: {max_order})")]
    InvalidOrder {
        /// The order that was requested.
        order: u32,
        /// The configured maximum order (exclusive upper bound).
        max_order: u32,
    },
    /// No zone (existing or grown) could satisfy the request.
    #[error("out of memory")]
    OutOfMemory,
    /// Growth was needed but `MAX_BUDDY_ZONES` was already reached.
    #[error("zone cap reached (max: {max_zones})")]
    ZoneCapReached {
        /// The configured maximum number of zones.
        max_zones: usize,
    },
}
