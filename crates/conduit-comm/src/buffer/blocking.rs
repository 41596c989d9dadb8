use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::attachment::Attachment;
use crate::buffer::{HandoffBuffer, Wakeup};
use crate::error::BufferError;
use crate::payload::Payload;

struct Slot {
    payload: UnsafeCell<Payload>,
    attachment: UnsafeCell<Attachment>,
}

unsafe impl Sync for Slot {}

struct State {
    /// Next sequence reserved for a claiming producer; bumped by
    /// `acquire`/`try_acquire`, before the slot's payload has been written.
    claimed: u64,
    /// Highest sequence published so far: the producer has finished
    /// writing it and called `release`. Consumers gate on this, never on
    /// `claimed`.
    produced: u64,
    /// Next sequence available for the consumer to claim.
    consumed: u64,
}

struct BlockingInner {
    mask: u64,
    capacity: u64,
    slots: Box<[Slot]>,
    state: Mutex<State>,
    not_full: Condvar,
    not_empty: Condvar,
    /// Independent interrupt channels so `close` can unblock a `put` waiter
    /// and a `take` waiter with distinct "interrupted by close" outcomes.
    interrupt_put: AtomicBool,
    interrupt_take: AtomicBool,
    /// Installed by a reactor in place of `not_empty`: when set, `release`
    /// calls this instead of notifying the condvar, since the "consumer" is
    /// a selector thread blocked in `select()`, not parked here.
    rearm_hook: Mutex<Option<Arc<dyn Wakeup>>>,
}

impl BlockingInner {
    fn wake_consumer(&self) {
        let hook = self.rearm_hook.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match hook.as_ref() {
            Some(wakeup) => wakeup.wake(),
            None => {
                self.not_empty.notify_all();
            }
        }
    }

    fn close(&self) {
        self.interrupt_put.store(true, Ordering::Release);
        self.interrupt_take.store(true, Ordering::Release);
        self.not_full.notify_all();
        self.wake_consumer();
    }

    fn is_closed(&self) -> bool {
        self.interrupt_put.load(Ordering::Acquire) && self.interrupt_take.load(Ordering::Acquire)
    }
}

pub struct BlockingProducer {
    inner: Arc<BlockingInner>,
}

pub struct BlockingConsumer {
    inner: Arc<BlockingInner>,
}

/// Constructs a lock+condition-variable handoff buffer. Capacity must still
/// be a power of two, matching the ring variant's slot-hashing scheme even
/// though this variant never needs the mask for correctness beyond indexing.
pub fn blocking_buffer(capacity: u64, payload_capacity: usize) -> (BlockingProducer, BlockingConsumer) {
    assert!(capacity.is_power_of_two(), "handoff buffer capacity must be a power of two");
    let slots = (0..capacity)
        .map(|_| Slot {
            payload: UnsafeCell::new(Payload::with_capacity(payload_capacity)),
            attachment: UnsafeCell::new(Attachment::None),
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let inner = Arc::new(BlockingInner {
        mask: capacity - 1,
        capacity,
        slots,
        state: Mutex::new(State { claimed: 0, produced: 0, consumed: 0 }),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
        interrupt_put: AtomicBool::new(false),
        interrupt_take: AtomicBool::new(false),
        rearm_hook: Mutex::new(None),
    });
    (BlockingProducer { inner: inner.clone() }, BlockingConsumer { inner })
}

impl BlockingProducer {
    /// Installs a custom wakeup strategy invoked on `release`, in place of
    /// the default condvar notify. A reactor uses this to rearm `OP_WRITE`
    /// directly instead of waking a consumer thread that doesn't exist.
    pub fn set_wakeup(&self, wakeup: Arc<dyn Wakeup>) {
        *self.inner.rearm_hook.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(wakeup);
    }
}

impl HandoffBuffer for BlockingProducer {
    fn acquire(&mut self, n: u64) -> Result<u64, BufferError> {
        if n == 0 || n > self.inner.capacity {
            return Err(BufferError::ExceedsCapacity { requested: n, capacity: self.inner.capacity });
        }
        let mut guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if self.inner.interrupt_put.load(Ordering::Acquire) {
                return Err(BufferError::Closed);
            }
            let outstanding = guard.claimed - guard.consumed;
            let free = self.inner.capacity - outstanding;
            if free > 0 {
                let claim = free.min(n);
                let highest = guard.claimed + claim - 1;
                guard.claimed += claim;
                return Ok(highest);
            }
            guard = self
                .inner
                .not_full
                .wait_timeout(guard, std::time::Duration::from_millis(5))
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    unsafe fn payload(&self, seq: u64) -> &mut Payload {
        let idx = (seq & self.inner.mask) as usize;
        unsafe { &mut *self.inner.slots[idx].payload.get() }
    }

    fn attach(&self, seq: u64, attachment: Attachment) {
        let idx = (seq & self.inner.mask) as usize;
        unsafe { *self.inner.slots[idx].attachment.get() = attachment };
    }

    fn attachment(&self, seq: u64) -> Attachment {
        let idx = (seq & self.inner.mask) as usize;
        unsafe { (*self.inner.slots[idx].attachment.get()).clone() }
    }

    fn release(&mut self, seq: u64) {
        // Publication happens here, not in `acquire`: only now has the
        // caller finished writing the slot, so only now may the consumer's
        // `produced - consumed` gate admit it.
        let mut guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.produced = seq + 1;
        drop(guard);
        self.inner.wake_consumer();
    }

    fn remaining(&self) -> u64 {
        let guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        self.inner.capacity - (guard.claimed - guard.consumed)
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn try_acquire(&mut self, n: u64) -> Result<Option<u64>, BufferError> {
        if n == 0 || n > self.inner.capacity {
            return Err(BufferError::ExceedsCapacity { requested: n, capacity: self.inner.capacity });
        }
        let mut guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if self.inner.interrupt_put.load(Ordering::Acquire) {
            return Err(BufferError::Closed);
        }
        let outstanding = guard.claimed - guard.consumed;
        let free = self.inner.capacity - outstanding;
        if free == 0 {
            return Ok(None);
        }
        let claim = free.min(n);
        let highest = guard.claimed + claim - 1;
        guard.claimed += claim;
        Ok(Some(highest))
    }
}

impl HandoffBuffer for BlockingConsumer {
    fn acquire(&mut self, n: u64) -> Result<u64, BufferError> {
        if n == 0 || n > self.inner.capacity {
            return Err(BufferError::ExceedsCapacity { requested: n, capacity: self.inner.capacity });
        }
        let mut guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            let available = guard.produced - guard.consumed;
            if available > 0 {
                let claim = available.min(n);
                let highest = guard.consumed + claim - 1;
                return Ok(highest);
            }
            if self.inner.interrupt_take.load(Ordering::Acquire) {
                return Err(BufferError::Closed);
            }
            guard = self
                .inner
                .not_empty
                .wait_timeout(guard, std::time::Duration::from_millis(5))
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    unsafe fn payload(&self, seq: u64) -> &mut Payload {
        let idx = (seq & self.inner.mask) as usize;
        unsafe { &mut *self.inner.slots[idx].payload.get() }
    }

    fn attach(&self, seq: u64, attachment: Attachment) {
        let idx = (seq & self.inner.mask) as usize;
        unsafe { *self.inner.slots[idx].attachment.get() = attachment };
    }

    fn attachment(&self, seq: u64) -> Attachment {
        let idx = (seq & self.inner.mask) as usize;
        unsafe { (*self.inner.slots[idx].attachment.get()).clone() }
    }

    fn release(&mut self, seq: u64) {
        let mut guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.consumed = seq + 1;
        drop(guard);
        self.inner.not_full.notify_all();
    }

    fn remaining(&self) -> u64 {
        let guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.produced - guard.consumed
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn try_acquire(&mut self, n: u64) -> Result<Option<u64>, BufferError> {
        if n == 0 || n > self.inner.capacity {
            return Err(BufferError::ExceedsCapacity { requested: n, capacity: self.inner.capacity });
        }
        let guard = self.inner.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let available = guard.produced - guard.consumed;
        if available == 0 {
            return if self.inner.interrupt_take.load(Ordering::Acquire) {
                Err(BufferError::Closed)
            } else {
                Ok(None)
            };
        }
        let claim = available.min(n);
        Ok(Some(guard.consumed + claim - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_consume_round_trip() {
        let (mut producer, mut consumer) = blocking_buffer(4, 32);
        for i in 0u8..50 {
            let seq = producer.acquire(1).unwrap();
            unsafe { producer.payload(seq).extend_from_slice(&[i]) };
            producer.release(seq);

            let seq = consumer.acquire(1).unwrap();
            assert_eq!(unsafe { consumer.payload(seq).as_slice()[0] }, i);
            consumer.release(seq);
        }
    }

    #[test]
    fn consumer_does_not_see_a_slot_before_release() {
        let (mut producer, mut consumer) = blocking_buffer(4, 32);
        let seq = producer.acquire(1).unwrap();
        unsafe { producer.payload(seq).extend_from_slice(&[7]) };
        assert_eq!(consumer.try_acquire(1).unwrap(), None);

        producer.release(seq);
        let seq = consumer.try_acquire(1).unwrap().unwrap();
        assert_eq!(unsafe { consumer.payload(seq).as_slice()[0] }, 7);
    }

    #[test]
    fn release_wakes_a_blocked_consumer() {
        let (mut producer, mut consumer) = blocking_buffer(2, 8);
        let consumer_thread = std::thread::spawn(move || consumer.acquire(1).unwrap());

        std::thread::sleep(std::time::Duration::from_millis(20));
        let seq = producer.acquire(1).unwrap();
        unsafe { producer.payload(seq).extend_from_slice(&[9]) };
        producer.release(seq);

        assert_eq!(consumer_thread.join().unwrap(), 0);
    }

    #[test]
    fn close_interrupts_put_and_take_independently() {
        let (mut producer, mut consumer) = blocking_buffer(2, 8);
        let a = producer.acquire(1).unwrap();
        producer.release(a);
        let b = producer.acquire(1).unwrap();
        producer.release(b);

        producer.close();
        assert_eq!(producer.acquire(1), Err(BufferError::Closed));

        let seq = consumer.acquire(1).unwrap();
        consumer.release(seq);
        let seq = consumer.acquire(1).unwrap();
        consumer.release(seq);
        assert_eq!(consumer.acquire(1), Err(BufferError::Closed));
    }
}
