//! Buddy page allocator backing the jiukun slab cache.
//!
//! A `Buddy` owns a set of zones, each a flat pool of `2^max_order` pages.
//! Allocation picks the best-fitting zone, splitting a larger free run down
//! to the requested order; freeing walks back up, coalescing with the
//! buddy (`index XOR (1 << order)`) at every level while it stays free.
//! Mirrors `jiukun/buddy.c` from the original daemon, with zones grown
//! lazily up to `MAX_BUDDY_ZONES` instead of being fully pre-sized upfront.

mod error;
mod invariants;
mod page;
mod zone;

pub use error::BuddyError;
pub use page::{PageHandle, PAGE_SIZE};

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use zone::Zone;

/// Hard cap on the number of zones a single `Buddy` may grow to.
pub const MAX_BUDDY_ZONES: usize = 20;

/// Backoff ceiling between retries when a caller is willing to wait.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Construction parameters for [`Buddy::new`].
#[derive(Debug, Clone, Copy)]
pub struct BuddyParams {
    /// Each zone covers `2^max_order` pages; the largest single allocation
    /// representable without growing a fresh zone is also `max_order`.
    pub max_order: u32,
    /// When `true`, exhaustion never grows a new zone — the allocator is a
    /// fixed-size pool bounded by whatever zones existed at construction.
    pub no_grow: bool,
}

/// Per-call allocation options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllocOptions {
    /// When `true`, return `OutOfMemory` immediately on exhaustion instead
    /// of reaping and retrying with backoff.
    pub no_wait: bool,
}

type ReapCallback = Box<dyn Fn() + Send>;

struct BuddyInner {
    zones: Vec<Zone>,
    reap: Option<ReapCallback>,
}

/// A buddy page allocator: one mutex guarding a growable set of zones.
///
/// Matches the original's single `ijb_smLock` serializing all zone free-list
/// mutations (`spec.md §5`): allocation and free both take the same lock for
/// their full duration, so no zone is ever observed mid-split or mid-merge.
pub struct Buddy {
    max_order: u32,
    no_grow: bool,
    inner: Mutex<BuddyInner>,
}

impl Buddy {
    #[must_use]
    pub fn new(params: BuddyParams) -> Self {
        let first_zone = Zone::new(0, params.max_order);
        Self {
            max_order: params.max_order,
            no_grow: params.no_grow,
            inner: Mutex::new(BuddyInner {
                zones: vec![first_zone],
                reap: None,
            }),
        }
    }

    /// Register a callback invoked between backoff retries on exhaustion.
    ///
    /// `jiukun-slab` wires its cache reap sweep here at construction time,
    /// so a stalled allocation gets a chance to reclaim empty slabs before
    /// the allocator gives up or grows a fresh zone.
    pub fn set_reap_callback(&self, callback: ReapCallback) {
        self.inner.lock().unwrap().reap = Some(callback);
    }

    /// Allocate a contiguous run of `2^order` pages.
    pub fn alloc_pages(
        &self,
        order: u32,
        opts: AllocOptions,
    ) -> Result<PageHandle, BuddyError> {
        if order > self.max_order {
            return Err(BuddyError::InvalidOrder {
                order,
                max_order: self.max_order,
            });
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(handle) = Self::try_alloc_in_zones(&mut inner.zones, order) {
                    return Ok(handle);
                }

                if !self.no_grow && inner.zones.len() < MAX_BUDDY_ZONES {
                    let zone_id = inner.zones.len();
                    tracing::debug!(zone_id, max_order = self.max_order, "growing buddy zone");
                    let mut zone = Zone::new(zone_id, self.max_order);
                    let handle = zone
                        .alloc(order)
                        .map(|ptr| PageHandle::new(zone_id, 0, order, ptr));
                    inner.zones.push(zone);
                    if let Some(ptr) = handle {
                        return Ok(ptr);
                    }
                }
            }

            if opts.no_wait {
                tracing::debug!(order, "buddy allocator exhausted, no_wait set");
                return Err(BuddyError::OutOfMemory);
            }

            tracing::debug!(order, ?backoff, "buddy allocator exhausted, reaping and retrying");
            self.call_reap();

            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn call_reap(&self) {
        // Extract a raw pointer-free call by temporarily taking the
        // callback out, so the reap closure may itself call back into
        // `alloc_pages`/`free_pages` without deadlocking on `self.inner`.
        let callback = self.inner.lock().unwrap().reap.take();
        if let Some(callback) = &callback {
            callback();
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.reap.is_none() {
            inner.reap = callback;
        }
    }

    fn try_alloc_in_zones(zones: &mut [Zone], order: u32) -> Option<PageHandle> {
        // Best-fit across zones: prefer the zone with the least free pages
        // that can still satisfy the request, minimizing fragmentation of
        // larger zones.
        let zone_idx = zones
            .iter()
            .enumerate()
            .filter(|(_, z)| z.free_pages() >= (1usize << order))
            .min_by_key(|(_, z)| z.free_pages())
            .map(|(idx, _)| idx)?;

        let zone = &mut zones[zone_idx];
        let ptr = zone.alloc(order)?;
        let index = zone.index_of(ptr).expect("pointer from own zone");
        Some(PageHandle::new(zone.id(), index, order, ptr))
    }

    /// Return a previously allocated run to its owning zone, coalescing
    /// with its buddy at every level while possible.
    pub fn free_pages(&self, handle: PageHandle) {
        let mut inner = self.inner.lock().unwrap();
        let zone = inner
            .zones
            .iter_mut()
            .find(|z| z.id() == handle.zone_id)
            .expect("page handle belongs to a live zone");
        zone.free(handle.page_index, handle.order());
    }

    /// Total pages currently free across all zones.
    #[must_use]
    pub fn free_pages_count(&self) -> usize {
        self.inner.lock().unwrap().zones.iter().map(Zone::free_pages).sum()
    }

    /// Number of zones currently allocated (1 at construction, up to
    /// `MAX_BUDDY_ZONES`).
    #[must_use]
    pub fn zone_count(&self) -> usize {
        self.inner.lock().unwrap().zones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_wait() -> AllocOptions {
        AllocOptions { no_wait: true }
    }

    #[test]
    fn s1_buddy_exhaustion() {
        let buddy = Buddy::new(BuddyParams {
            max_order: 4,
            no_grow: true,
        });

        let mut handles = Vec::new();
        for _ in 0..16 {
            handles.push(buddy.alloc_pages(0, no_wait()).expect("page available"));
        }

        let err = buddy.alloc_pages(0, no_wait()).unwrap_err();
        assert_eq!(err, BuddyError::OutOfMemory);

        for handle in handles {
            buddy.free_pages(handle);
        }
        assert_eq!(buddy.free_pages_count(), 16);
    }

    #[test]
    fn s2_coalesce_on_free() {
        let buddy = Buddy::new(BuddyParams {
            max_order: 4,
            no_grow: true,
        });

        let a = buddy.alloc_pages(0, no_wait()).unwrap();
        let b = buddy.alloc_pages(0, no_wait()).unwrap();

        buddy.free_pages(a);
        buddy.free_pages(b);

        // Both order-0 buddies freed: the whole zone should have coalesced
        // back to a single order-4 run, i.e. all 16 pages free and the next
        // alloc at max order should succeed from the same zone.
        assert_eq!(buddy.free_pages_count(), 16);
        let whole = buddy.alloc_pages(4, no_wait()).expect("fully coalesced zone");
        buddy.free_pages(whole);
    }

    #[test]
    fn invalid_order_rejected() {
        let buddy = Buddy::new(BuddyParams {
            max_order: 2,
            no_grow: true,
        });
        let err = buddy.alloc_pages(3, no_wait()).unwrap_err();
        assert_eq!(
            err,
            BuddyError::InvalidOrder {
                order: 3,
                max_order: 2
            }
        );
    }

    #[test]
    fn growth_allocates_new_zone_when_permitted() {
        let buddy = Buddy::new(BuddyParams {
            max_order: 2,
            no_grow: false,
        });

        let mut handles = Vec::new();
        for _ in 0..4 {
            handles.push(buddy.alloc_pages(0, no_wait()).unwrap());
        }
        assert_eq!(buddy.zone_count(), 1);

        // First zone (4 pages) is now full; this should grow a second zone.
        let extra = buddy.alloc_pages(0, no_wait()).unwrap();
        assert_eq!(buddy.zone_count(), 2);

        handles.push(extra);
        for handle in handles {
            buddy.free_pages(handle);
        }
    }

    #[test]
    fn reap_callback_invoked_on_exhaustion() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let buddy = Buddy::new(BuddyParams {
            max_order: 1,
            no_grow: true,
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        buddy.set_reap_callback(Box::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        let a = buddy.alloc_pages(0, no_wait()).unwrap();
        let b = buddy.alloc_pages(0, no_wait()).unwrap();
        assert_eq!(buddy.alloc_pages(0, no_wait()).unwrap_err(), BuddyError::OutOfMemory);

        buddy.free_pages(a);
        buddy.free_pages(b);
    }
}
