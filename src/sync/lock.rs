//! FIFO serialization primitive
//!
//! `SerialLock` grants exclusive access to a value in arrival order. Access
//! is only possible through a `Ticket`, which releases the lock when dropped.

use std::ops::{Deref, DerefMut};
use tokio::sync::{Mutex, MutexGuard};

/// Strict-FIFO mutual exclusion around `T`.
///
/// Not reentrant: acquiring again while the same task holds a ticket never
/// resolves.
#[derive(Debug, Default)]
pub struct SerialLock<T> {
    inner: Mutex<T>,
}

/// Proof of holding a `SerialLock`; release happens exactly once on drop
#[derive(Debug)]
pub struct Ticket<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> SerialLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Wait until every earlier caller has released, then take the lock
    pub async fn acquire(&self) -> Ticket<'_, T> {
        // tokio's Mutex queues waiters fairly, in the order they arrived
        Ticket {
            guard: self.inner.lock().await,
        }
    }

    /// Take the lock only if nobody holds it or is waiting for it
    pub fn try_acquire(&self) -> Option<Ticket<'_, T>> {
        self.inner.try_lock().ok().map(|guard| Ticket { guard })
    }
}

impl<T> Deref for Ticket<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Ticket<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
