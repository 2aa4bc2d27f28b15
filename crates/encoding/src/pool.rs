//! Thread-safe pools of recycleable buffers.
//!
//! Raw audio chunks come from a bounded pool so that memory stays bounded and
//! a slow encoder shows up as backpressure at the capture site. Output
//! records and video frames come from unbounded pools so that nothing already
//! captured is ever dropped for lack of a buffer.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::trace;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

pub struct Pool<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    id: u64,
    max_size: Option<usize>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    state: Mutex<State<T>>,
}

struct State<T> {
    free: Vec<T>,
    live: usize,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Pool<T> {
    /// A pool that never holds more than `max_size` items, live and recycled
    /// combined. Once the cap is reached, [`Pool::acquire`] returns `None`
    /// until a lease is recycled.
    pub fn bounded(max_size: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::new(Some(max_size), factory)
    }

    /// A pool that always satisfies [`Pool::acquire`], constructing a new
    /// item whenever the free list is empty.
    pub fn unbounded(factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::new(None, factory)
    }

    fn new(max_size: Option<usize>, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                max_size,
                factory: Box::new(factory),
                state: Mutex::new(State {
                    free: Vec::new(),
                    live: 0,
                }),
            }),
        }
    }

    /// Returns a recycled item if one is free, otherwise constructs a new one
    /// while the cap allows it. Never blocks; `None` means the caller should
    /// drop this cycle of work (or retry later).
    pub fn acquire(&self) -> Option<Lease<T>> {
        let mut state = self.shared.state.lock().unwrap();

        let value = match state.free.pop() {
            Some(value) => {
                trace!(pool = self.shared.id, "reusing recycled item");
                value
            }
            None => {
                if let Some(max) = self.shared.max_size
                    && state.live >= max
                {
                    trace!(pool = self.shared.id, live = state.live, "pool exhausted");
                    return None;
                }
                trace!(pool = self.shared.id, "creating new item");
                (self.shared.factory)()
            }
        };
        state.live += 1;

        Some(Lease {
            shared: Arc::clone(&self.shared),
            value: Some(value),
        })
    }

    /// Returns a lease to this pool. Equivalent to dropping it; kept as an
    /// explicit operation so call sites can assert the lease actually belongs
    /// here (checked in debug builds).
    pub fn release(&self, lease: Lease<T>) {
        debug_assert_eq!(
            lease.shared.id, self.shared.id,
            "lease released to a pool it was not acquired from"
        );
        drop(lease);
    }

    /// Count of leases currently held by consumers.
    pub fn live(&self) -> usize {
        self.shared.state.lock().unwrap().live
    }

    /// Count of items sitting on the free list.
    pub fn recycled(&self) -> usize {
        self.shared.state.lock().unwrap().free.len()
    }

    /// Drops all recycled items. Live leases are unaffected and still recycle
    /// into the pool when dropped.
    pub fn clear(&self) {
        self.shared.state.lock().unwrap().free.clear();
    }
}

/// An owning handle to a pooled item. Recycles itself when dropped.
pub struct Lease<T> {
    shared: Arc<Shared<T>>,
    value: Option<T>,
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("lease accessed after recycle")
    }
}

impl<T> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("lease accessed after recycle")
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let mut state = self.shared.state.lock().unwrap();
            debug_assert!(state.live > 0, "pool live count underflow");
            state.live = state.live.saturating_sub(1);
            state.free.push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn bounded_pool_refuses_to_exceed_its_cap() {
        let pool = Pool::bounded(2, Vec::<u8>::new);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        assert_eq!(pool.live(), 2);

        drop(a);
        assert!(pool.acquire().is_some());
        drop(b);
    }

    #[test]
    fn acquire_release_cycles_never_exceed_the_bound() {
        let bound = 3;
        let pool = Pool::bounded(bound, || [0u8; 16]);

        for _ in 0..bound + 1 {
            let lease = pool.acquire().unwrap();
            assert!(pool.live() <= bound);
            pool.release(lease);
        }
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn recycled_items_are_reused_before_the_factory_runs() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = Pool::unbounded(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::<u8>::new()
        });

        let first = pool.acquire().unwrap();
        drop(first);
        let _second = pool.acquire().unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.recycled(), 0);
    }

    #[test]
    fn leases_keep_their_contents_across_recycling() {
        let pool = Pool::unbounded(Vec::<u8>::new);

        let mut lease = pool.acquire().unwrap();
        lease.extend_from_slice(b"payload");
        drop(lease);

        let lease = pool.acquire().unwrap();
        assert_eq!(&lease[..], b"payload");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not acquired from")]
    fn releasing_to_a_foreign_pool_is_detected() {
        let ours = Pool::bounded(1, Vec::<u8>::new);
        let theirs = Pool::bounded(1, Vec::<u8>::new);

        let lease = ours.acquire().unwrap();
        theirs.release(lease);
    }
}
