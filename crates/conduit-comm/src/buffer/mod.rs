pub mod blocking;
pub mod ring;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub use blocking::{BlockingConsumer, BlockingProducer, blocking_buffer};
pub use ring::{RingConsumer, RingProducer, ring_buffer};

use crate::attachment::Attachment;
use crate::error::BufferError;
use crate::payload::Payload;

/// The operational contract shared by both handoff-buffer variants (ring and
/// lock+condition). A given concrete type always plays exactly one of the
/// producer or consumer role for the lifetime of the buffer; which role is
/// active changes what `acquire`/`release` mean but not their signatures.
pub trait HandoffBuffer: Send {
    /// Claims up to `n` slots. Returns the highest sequence now held by the
    /// caller. Blocks until at least one slot is available or the buffer
    /// closes, in which case it fails with [`BufferError::Closed`].
    fn acquire(&mut self, n: u64) -> Result<u64, BufferError>;

    /// Claims a single slot; shorthand for `acquire(1)`.
    #[inline]
    fn acquire_one(&mut self) -> Result<u64, BufferError> {
        self.acquire(1)
    }

    /// Non-blocking variant of `acquire`: claims up to `n` slots if any are
    /// immediately available, otherwise returns `Ok(None)` without parking.
    ///
    /// Reactor threads must use this instead of `acquire`: they block only
    /// in `select()` (spec.md §5), so they can never afford to park inside
    /// a handoff buffer, even briefly.
    fn try_acquire(&mut self, n: u64) -> Result<Option<u64>, BufferError>;

    /// Borrows the payload at `seq`.
    ///
    /// # Safety
    /// `seq` must currently be held by the caller (returned by a prior
    /// `acquire` and not yet passed to `release`). Slots are mutated by
    /// exactly one party at a time, enforced by sequence ownership rather
    /// than the type system.
    unsafe fn payload(&self, seq: u64) -> &mut Payload;

    fn attach(&self, seq: u64, attachment: Attachment);
    fn attachment(&self, seq: u64) -> Attachment;

    /// Publishes `seq` (producer role) or frees it (consumer role).
    fn release(&mut self, seq: u64);

    /// Approximate number of slots immediately available to the caller's
    /// role (free slots for a producer, published slots for a consumer).
    fn remaining(&self) -> u64;

    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// Type-erased producer handle stashed inside an [`Attachment::Echo`] so a
/// read-path frame can be answered without the handler knowing whether the
/// output buffer behind it is a ring or a lock+condition variant.
pub trait EchoTarget: Send + Sync {
    fn acquire(&self) -> Result<u64, BufferError>;
    /// # Safety
    /// `seq` must have just been returned by `acquire` on this target and
    /// not yet released.
    unsafe fn payload(&self, seq: u64) -> &mut Payload;
    fn release(&self, seq: u64);
}

/// Invoked whenever a handoff buffer would otherwise park a waiting thread.
/// The default implementation parks on a condition variable; a selector
/// reactor installs one that re-arms `OP_WRITE` on a registered key instead,
/// so a producer filling the output buffer kicks the reactor directly
/// rather than waiting for it to notice on its own.
pub trait Wakeup: Send + Sync {
    fn wake(&self);
}

/// Blocks the calling thread until `wake()` is called elsewhere, or until
/// `close()` is observed. This is the default wakeup strategy used when no
/// reactor-side rearm hook has been installed.
pub struct ParkWakeup {
    parked: std::sync::Mutex<()>,
    condvar: std::sync::Condvar,
    closed: AtomicBool,
}

impl Default for ParkWakeup {
    fn default() -> Self {
        Self { parked: std::sync::Mutex::new(()), condvar: std::sync::Condvar::new(), closed: AtomicBool::new(false) }
    }
}

impl ParkWakeup {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Parks until `wake()` fires, the buffer closes, or `deadline` elapses;
    /// returns `false` if it timed out without either.
    pub fn park_timeout(&self, deadline: std::time::Duration) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        let guard = self.parked.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let (_guard, timeout) = self
            .condvar
            .wait_timeout(guard, deadline)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !timeout.timed_out() || self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.wake();
    }
}

impl Wakeup for ParkWakeup {
    fn wake(&self) {
        let _guard = self.parked.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.condvar.notify_all();
    }
}
