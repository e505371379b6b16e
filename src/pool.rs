//! Bounded pool of reusable instances.
//!
//! Connections borrow an [`ExchangePair`](crate::exchange::ExchangePair) and a packet buffer
//! for their whole lifetime and hand them back when they close, so steady-state traffic
//! allocates nothing per exchange.
//!
//! The pool favours availability over strict bounding: when every pooled instance is out,
//! [`ObjectPool::lease`] hands out a transient instance that is never pooled. Instances only
//! leave and re-enter the pool through the [`Lease`] guard, which returns each one exactly
//! once, when it is dropped.
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

/// Instances that can be restored to their freshly constructed state.
pub trait Recycle {
    fn recycle(&mut self);
}

impl Recycle for Vec<u8> {
    fn recycle(&mut self) {
        self.clear();
    }
}

struct PoolState<T> {
    idle: Vec<T>,
    outstanding: usize,
}

pub struct ObjectPool<T> {
    state: Mutex<PoolState<T>>,
    max: usize,
}

impl<T: Recycle + Default> ObjectPool<T> {
    pub fn new(max: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: Vec::with_capacity(max),
                outstanding: 0,
            }),
            max,
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn idle(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Takes an idle instance, or builds one while fewer than `max` exist.
    ///
    /// `None` means the pool is exhausted and the caller should build its own.
    fn acquire(&self) -> Option<T> {
        let mut state = self.lock();
        if let Some(instance) = state.idle.pop() {
            state.outstanding += 1;
            trace!("reusing pooled instance ({} idle)", state.idle.len());
            return Some(instance);
        }
        if state.outstanding < self.max {
            state.outstanding += 1;
            debug!(
                "pool below capacity: creating instance {}/{}",
                state.outstanding, self.max
            );
            return Some(T::default());
        }
        None
    }

    /// Recycles an instance obtained from [`acquire`](Self::acquire) and keeps it for reuse,
    /// or drops it when the pool already holds `max` instances.
    fn release(&self, mut instance: T) {
        instance.recycle();
        let mut state = self.lock();
        let Some(outstanding) = state.outstanding.checked_sub(1) else {
            debug!("nothing is out: discarding foreign instance");
            return;
        };
        state.outstanding = outstanding;
        if state.idle.len() + state.outstanding < self.max {
            state.idle.push(instance);
        } else {
            debug!("pool is full: discarding returned instance");
        }
    }

    /// Borrows an instance for the lifetime of the returned guard.
    pub fn lease(self: &Arc<Self>) -> Lease<T> {
        match self.acquire() {
            Some(instance) => Lease {
                instance: Some(instance),
                pool: Some(Arc::clone(self)),
            },
            None => {
                debug!("pool exhausted: using a transient instance");
                Lease {
                    instance: Some(T::default()),
                    pool: None,
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An instance borrowed from an [`ObjectPool`]; returned to it on drop.
pub struct Lease<T: Recycle + Default> {
    instance: Option<T>,
    pool: Option<Arc<ObjectPool<T>>>,
}

impl<T: Recycle + Default> Lease<T> {
    /// True when the instance belongs to the pool rather than being transient.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }
}

impl<T: Recycle + Default> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the instance out.
        self.instance.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle + Default> DerefMut for Lease<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.instance.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Recycle + Default> Drop for Lease<T> {
    fn drop(&mut self) {
        if let (Some(instance), Some(pool)) = (self.instance.take(), self.pool.take()) {
            pool.release(instance);
        }
    }
}
