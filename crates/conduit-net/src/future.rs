//! Single-shot completion futures.
//!
//! A [`KeyProcessor`](crate::processor::KeyProcessor) exposes its lifecycle
//! through these rather than an async `Future`: spec.md's "futures" are
//! settle-once signals observed by blocking wait (application threads) or by
//! callback (a reactor thread completing one on behalf of another). No
//! executor is involved, matching the teacher's own preference for plain
//! `std::sync` primitives over an async runtime (`ParkWakeup` in
//! `conduit-comm` is the same shape).

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

enum Slot<T> {
    Pending(Vec<Box<dyn FnOnce(&T) + Send>>),
    Ready(T),
}

struct Inner<T> {
    slot: Mutex<Slot<T>>,
    condvar: Condvar,
}

/// A value settled at most once, observable by any number of waiters.
pub struct Completion<T: Clone + Send + 'static> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone + Send + 'static> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { slot: Mutex::new(Slot::Pending(Vec::new())), condvar: Condvar::new() }) }
    }

    /// Settles the value. A second call is a no-op: spec.md §5 requires
    /// `close()` idempotence and the same holds for every other completion
    /// future in this crate.
    pub fn complete(&self, value: T) {
        let mut guard = self.inner.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if matches!(*guard, Slot::Ready(_)) {
            return;
        }
        let Slot::Pending(waiters) = std::mem::replace(&mut *guard, Slot::Ready(value.clone())) else {
            unreachable!()
        };
        drop(guard);
        for waiter in waiters {
            waiter(&value);
        }
        self.inner.condvar.notify_all();
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(*self.inner.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner), Slot::Ready(_))
    }

    /// Blocks the calling thread until the value is settled.
    #[must_use]
    pub fn wait(&self) -> T {
        let mut guard = self.inner.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            match &*guard {
                Slot::Ready(value) => return value.clone(),
                Slot::Pending(_) => {
                    guard = self.inner.condvar.wait(guard).unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            }
        }
    }

    /// As `wait`, but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let guard = self.inner.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let (guard, _) = self
            .inner
            .condvar
            .wait_timeout_while(guard, timeout, |slot| matches!(slot, Slot::Pending(_)))
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &*guard {
            Slot::Ready(value) => Some(value.clone()),
            Slot::Pending(_) => None,
        }
    }

    /// Registers a callback to run once the value settles (immediately, on
    /// the calling thread, if it already has). Used by the reactor to chain
    /// one completion off another without spawning a thread to wait.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(&T) + Send + 'static,
    {
        let mut guard = self.inner.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &mut *guard {
            Slot::Ready(value) => {
                let value = value.clone();
                drop(guard);
                f(&value);
            }
            Slot::Pending(waiters) => waiters.push(Box::new(f)),
        }
    }
}

/// Outcome carried by every close-path and connect-path completion: success,
/// or a [`ChannelError`](conduit_comm::ChannelError) that every waiter
/// observes identically (the error is itself `Clone`, see spec.md §7).
pub type Outcome = Result<(), conduit_comm::ChannelError>;

pub type CompletionFuture = Completion<Outcome>;

/// Joins several [`CompletionFuture`]s into one: ready only once every
/// constituent has settled, with the first failure (in registration order)
/// winning if more than one fails. Models `getConnectionFuture()` (joins
/// connect-read + connect-write) and `getCloseFuture()` (joins close-read +
/// close-write + shutdown) from spec.md §4.5.
pub fn merge(parts: Vec<CompletionFuture>) -> CompletionFuture {
    let merged = CompletionFuture::new();
    let remaining = Arc::new(Mutex::new(parts.len()));
    let first_error = Arc::new(Mutex::new(None));
    if parts.is_empty() {
        merged.complete(Ok(()));
        return merged;
    }
    for part in parts {
        let merged = merged.clone();
        let remaining = remaining.clone();
        let first_error = first_error.clone();
        part.on_complete(move |outcome| {
            if let Err(err) = outcome {
                let mut slot = first_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if slot.is_none() {
                    *slot = Some(err.clone());
                }
            }
            let mut left = remaining.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *left -= 1;
            if *left == 0 {
                let outcome = match first_error.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                merged.complete(outcome);
            }
        });
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_blocks_until_complete() {
        let fut = CompletionFuture::new();
        let waiter = fut.clone();
        let handle = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(20));
        fut.complete(Ok(()));
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn second_complete_is_ignored() {
        let fut = CompletionFuture::new();
        fut.complete(Ok(()));
        fut.complete(Err(conduit_comm::ChannelError::Closed));
        assert!(fut.wait().is_ok());
    }

    #[test]
    fn merge_waits_for_all_and_surfaces_first_error() {
        let a = CompletionFuture::new();
        let b = CompletionFuture::new();
        let joined = merge(vec![a.clone(), b.clone()]);
        assert!(!joined.is_complete());
        a.complete(Ok(()));
        assert!(!joined.is_complete());
        b.complete(Err(conduit_comm::ChannelError::NotConnected));
        assert!(joined.wait().is_err());
    }

    #[test]
    fn merge_of_empty_is_immediately_ready() {
        let joined = merge(vec![]);
        assert!(joined.is_complete());
    }
}
