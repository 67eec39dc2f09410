//! Lock-free bounded SPSC queue for inter-thread command passing.
//!
//! The receiver thread consumes [`ReceiverCommand`]s from one of these and the
//! conductor consumes image-creation requests from another. Both sides are
//! wait-free: a full queue hands the item back instead of blocking.
//!
//! ```
//! use rivulet::sync::spsc;
//!
//! let (tx, rx) = spsc::channel::<u32, 16>();
//! tx.push(7).unwrap();
//! assert_eq!(rx.pop(), Some(7));
//! ```
//!
//! [`ReceiverCommand`]: crate::runtime::ReceiverCommand

use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Keeps the producer and consumer indices on separate cache lines.
#[repr(align(64))]
struct CachePadded<T>(T);

struct Ring<T, const N: usize> {
    /// Next slot to write. Written by the producer only.
    head: CachePadded<AtomicUsize>,
    /// Next slot to read. Written by the consumer only.
    tail: CachePadded<AtomicUsize>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: a slot is touched by the producer before `head` is published and by
// the consumer after it observes that store (Release/Acquire), never both.
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}
// SAFETY: see above; the indices are atomics.
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

impl<T, const N: usize> Ring<T, N> {
    fn new() -> Self {
        Self {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicUsize::new(0)),
            slots: (0..N)
                .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
                .collect(),
        }
    }

    #[inline]
    const fn slot(index: usize) -> usize {
        index % N
    }
}

impl<T, const N: usize> Drop for Ring<T, N> {
    fn drop(&mut self) {
        let head = *self.head.0.get_mut();
        let mut tail = *self.tail.0.get_mut();
        while tail != head {
            // SAFETY: slots in [tail, head) were written and never read.
            unsafe { self.slots[Self::slot(tail)].get_mut().assume_init_drop() };
            tail = tail.wrapping_add(1);
        }
    }
}

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    const OK: () = assert!(N > 0, "Queue capacity must be greater than 0");
}

/// Write end. `Send` but not `Sync`: exactly one thread pushes.
pub struct Producer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    cached_tail: Cell<usize>,
}

/// Read end. `Send` but not `Sync`: exactly one thread pops.
pub struct Consumer<T: Send, const N: usize> {
    ring: Arc<Ring<T, N>>,
    cached_head: Cell<usize>,
}

/// Creates a queue holding at most `N` items.
///
/// Fails to compile if `N == 0`.
#[must_use]
pub fn channel<T: Send, const N: usize>() -> (Producer<T, N>, Consumer<T, N>) {
    let () = CapacityCheck::<N>::OK;

    let ring = Arc::new(Ring::new());
    (
        Producer {
            ring: Arc::clone(&ring),
            cached_tail: Cell::new(0),
        },
        Consumer {
            ring,
            cached_head: Cell::new(0),
        },
    )
}

impl<T: Send, const N: usize> Producer<T, N> {
    /// Pushes an item without blocking.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);

        if head.wrapping_sub(self.cached_tail.get()) >= N {
            self.cached_tail.set(ring.tail.0.load(Ordering::Acquire));
            if head.wrapping_sub(self.cached_tail.get()) >= N {
                return Err(item);
            }
        }

        // SAFETY: head - tail < N, so the consumer is not reading this slot,
        // and we are the only producer.
        unsafe { (*ring.slots[Ring::<T, N>::slot(head)].get()).write(item) };
        ring.head.0.store(head.wrapping_add(1), Ordering::Release);
        Ok(())
    }
}

impl<T: Send, const N: usize> Consumer<T, N> {
    /// Pops the oldest item, or `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let ring = &*self.ring;
        let tail = ring.tail.0.load(Ordering::Relaxed);

        if tail == self.cached_head.get() {
            self.cached_head.set(ring.head.0.load(Ordering::Acquire));
            if tail == self.cached_head.get() {
                return None;
            }
        }

        // SAFETY: tail != head, so the producer has published this slot and
        // will not touch it until we advance tail.
        let item = unsafe { (*ring.slots[Ring::<T, N>::slot(tail)].get()).assume_init_read() };
        ring.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}
