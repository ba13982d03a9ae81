//! Monotonic deadline list (`spec.md §4.C`): a chain object holding a
//! sorted list of `(expiry, callback, data, destroy)` items.
//!
//! Expiry is always measured against [`Instant`], never wall-clock time,
//! so a clock step can never fire an item early (`spec.md`: "wall-clock
//! adjustments must not fire items early").

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use mio::Registry;

use crate::ChainObject;

/// Opaque key returned by [`Utimer::schedule`], used for early removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerKey(u64);

type Callback = Box<dyn FnMut()>;
type Destroy = Box<dyn FnOnce()>;

struct Item {
    key: TimerKey,
    expiry: Instant,
    callback: Callback,
    destroy: Option<Destroy>,
}

/// A cloneable handle other chain objects use to schedule deadlines on the
/// same `Utimer` without the reactor granting them mutable access to it.
#[derive(Clone)]
pub struct UtimerHandle {
    inner: Rc<RefCell<Inner>>,
}

struct Inner {
    items: Vec<Item>,
    next_key: u64,
}

impl UtimerHandle {
    /// Schedule `callback` to fire once, `after` from now. `destroy` runs
    /// once the item is removed, whether by firing or by explicit cancel.
    pub fn schedule(
        &self,
        after: Duration,
        callback: impl FnMut() + 'static,
        destroy: impl FnOnce() + 'static,
    ) -> TimerKey {
        let mut inner = self.inner.borrow_mut();
        let key = TimerKey(inner.next_key);
        inner.next_key += 1;
        let item = Item {
            key,
            expiry: Instant::now() + after,
            callback: Box::new(callback),
            destroy: Some(Box::new(destroy)),
        };
        let pos = inner
            .items
            .binary_search_by(|existing| existing.expiry.cmp(&item.expiry))
            .unwrap_or_else(|p| p);
        inner.items.insert(pos, item);
        key
    }

    /// Cancel a pending item, invoking its destroy hook. No-op if the item
    /// already fired or was already cancelled.
    pub fn cancel(&self, key: TimerKey) {
        let mut inner = self.inner.borrow_mut();
        if let Some(pos) = inner.items.iter().position(|i| i.key == key) {
            let mut item = inner.items.remove(pos);
            if let Some(destroy) = item.destroy.take() {
                destroy();
            }
        }
    }
}

/// The chain object: owns the item list, computes block-time contribution
/// in `pre_select`, and fires expired items in `post_select`.
pub struct Utimer {
    inner: Rc<RefCell<Inner>>,
}

impl Utimer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                items: Vec::new(),
                next_key: 0,
            })),
        }
    }

    #[must_use]
    pub fn handle(&self) -> UtimerHandle {
        UtimerHandle {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Default for Utimer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainObject for Utimer {
    fn register(&mut self, _registry: &Registry) -> std::io::Result<()> {
        Ok(())
    }

    fn pre_select(&mut self) -> Option<Duration> {
        let inner = self.inner.borrow();
        let head = inner.items.first()?;
        let now = Instant::now();
        Some(head.expiry.saturating_duration_since(now))
    }

    fn post_select(&mut self, _events: &mio::Events) -> std::io::Result<()> {
        let now = Instant::now();
        loop {
            let due = {
                let inner = self.inner.borrow();
                matches!(inner.items.first(), Some(item) if item.expiry <= now)
            };
            if !due {
                break;
            }
            let mut item = self.inner.borrow_mut().items.remove(0);
            (item.callback)();
            if let Some(destroy) = item.destroy.take() {
                destroy();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[test]
    fn s3_fire_order() {
        let mut utimer = Utimer::new();
        let handle = utimer.handle();
        let fired = Arc::new(Mutex::new(Vec::new()));

        let f2 = Arc::clone(&fired);
        handle.schedule(Duration::from_millis(60), move || f2.lock().unwrap().push(2), || {});
        let f1 = Arc::clone(&fired);
        handle.schedule(Duration::from_millis(20), move || f1.lock().unwrap().push(1), || {});
        let f3 = Arc::clone(&fired);
        handle.schedule(Duration::from_millis(100), move || f3.lock().unwrap().push(3), || {});

        thread::sleep(Duration::from_millis(150));
        // Drive post_select until every item has fired.
        for _ in 0..3 {
            utimer.post_select(&mio::Events::with_capacity(1)).unwrap();
        }

        assert_eq!(*fired.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn cancel_runs_destroy_without_firing_callback() {
        let utimer = Utimer::new();
        let handle = utimer.handle();
        let fired = Rc::new(RefCell::new(false));
        let destroyed = Rc::new(RefCell::new(false));

        let f = Rc::clone(&fired);
        let d = Rc::clone(&destroyed);
        let key = handle.schedule(
            Duration::from_secs(10),
            move || *f.borrow_mut() = true,
            move || *d.borrow_mut() = true,
        );
        handle.cancel(key);

        assert!(!*fired.borrow());
        assert!(*destroyed.borrow());
    }
}
