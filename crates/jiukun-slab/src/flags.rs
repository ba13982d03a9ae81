use bitflags::bitflags;

bitflags! {
    /// Flags passed to `SlabCache::create`, mirroring
    /// `jf_jiukun_cache_create_flag_t`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SlabFlags: u32 {
        /// Perform expensive double-free/overflow checks on every free.
        const DEBUG_FREE = 1 << 0;
        /// Never release this cache's empty slabs during a reap sweep.
        const NO_REAP = 1 << 1;
        /// Never grow: allocation fails once existing slabs are full.
        const NO_GROW = 1 << 2;
        /// Track pages as reclaimable accounting (observability only).
        const RECLAIM_ACCOUNT = 1 << 3;
        /// Zero every object's memory before handing it out.
        const ZERO = 1 << 4;
        /// Allow the allocator to block and retry (via jiukun-buddy's
        /// reap-and-backoff loop) rather than fail immediately.
        const WAIT = 1 << 5;
    }
}
