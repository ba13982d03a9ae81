//! Debug-only invariant checks for the slab cache, active only in debug
//! builds — mirrors `jiukun-buddy`'s `invariants.rs` idiom.

macro_rules! debug_assert_slab_accounting {
    ($num_free:expr, $num_objs:expr) => {
        debug_assert!(
            $num_free <= $num_objs,
            "slab free count {} exceeds object count {}",
            $num_free,
            $num_objs
        )
    };
}

macro_rules! debug_assert_no_double_free {
    ($released:expr, $addr:expr) => {
        debug_assert!($released, "double free of object at address {:#x}", $addr)
    };
}

pub(crate) use debug_assert_no_double_free;
pub(crate) use debug_assert_slab_accounting;
