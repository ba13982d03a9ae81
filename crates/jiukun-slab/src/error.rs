use thiserror::Error;

/// Errors returned by [`crate::SlabCache`] operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// `destroy_cache` was called while objects were still outstanding.
    #[error("cache {name} has {count} outstanding objects")]
    ObjectsOutstanding {
        /// Cache name.
        name: String,
        /// Number of objects not yet freed.
        count: usize,
    },
    /// Growth was needed but the cache forbids it, or the backing buddy
    /// allocator is exhausted.
    #[error("cache {name} is out of memory")]
    OutOfMemory {
        /// Cache name.
        name: String,
    },
    /// `obj_size` passed to `SlabCache::create` is zero or larger than
    /// `MAX_OBJECT_SIZE`.
    #[error("invalid object size {size} for cache {name}")]
    InvalidObjectSize {
        /// Cache name.
        name: String,
        /// The rejected size.
        size: usize,
    },
}

/// Errors returned by the general-size allocator (`alloc_memory`/`free_memory`).
#[derive(Debug, Error)]
pub enum AllocError {
    /// Requested size exceeds `MAX_MEMORY_SIZE`.
    #[error("requested size {size} exceeds max memory size {max}")]
    TooLarge {
        /// The requested size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },
    /// The backing bucket cache could not satisfy the request.
    #[error("general allocator out of memory for size {size}")]
    OutOfMemory {
        /// The requested size.
        size: usize,
    },
}
