//! Debug-only invariant checks for the reactor chain, ported from the
//! teacher's `invariants.rs` idiom (active only under `debug_assertions`,
//! zero cost in release).

/// INV-CHAIN-01: disconnect is always the last callback observed for a
/// given asocket (`spec.md §4.C`: "Disconnect is always the last callback
/// observed for a given asocket; further calls using that handle are
/// undefined").
macro_rules! debug_assert_no_callback_after_disconnect {
    ($already_disconnected:expr) => {
        debug_assert!(
            !$already_disconnected,
            "callback delivered on an asocket after its on_disconnect fired"
        )
    };
}

pub(crate) use debug_assert_no_callback_after_disconnect;
