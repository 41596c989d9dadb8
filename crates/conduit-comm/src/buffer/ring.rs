use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use crate::attachment::Attachment;
use crate::buffer::{EchoTarget, HandoffBuffer, ParkWakeup, Wakeup};
use crate::error::BufferError;
use crate::payload::Payload;

struct Slot {
    payload: std::cell::UnsafeCell<Payload>,
    attachment: std::cell::UnsafeCell<Attachment>,
}

// Slots are shared across producer/consumer handles; exclusivity for a
// given slot is enforced by sequence ownership, not by the borrow checker.
unsafe impl Sync for Slot {}

struct RingInner {
    mask: u64,
    capacity: u64,
    slots: Box<[Slot]>,
    /// Generation published at each ring position; `-1` means the position
    /// has never been published in its current wrap.
    published: Box<[AtomicI64]>,
    /// Next sequence to hand out to a claiming producer.
    claim: AtomicU64,
    /// Highest sequence freed by the consumer; gates producer claims.
    consumer_cursor: AtomicU64,
    closed: AtomicBool,
    /// Parks producers waiting for the consumer to free room.
    space_available: Arc<ParkWakeup>,
    /// Parked on by a blocking consumer's `acquire`. Always woken by
    /// `release`, unless a custom hook below has taken over that duty.
    data_ready: Arc<ParkWakeup>,
    /// Installed by a reactor in place of `data_ready`: when set, `release`
    /// calls this instead of (short-circuits) the park/notify wait, since
    /// the "consumer" is a selector thread blocked in `select()`, not here.
    rearm_hook: std::sync::Mutex<Option<Arc<dyn Wakeup>>>,
}

impl RingInner {
    fn wake_consumer(&self) {
        let hook = self.rearm_hook.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match hook.as_ref() {
            Some(wakeup) => wakeup.wake(),
            None => self.data_ready.wake(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space_available.close();
        self.data_ready.close();
        self.wake_consumer();
    }
}

/// A producer handle over a power-of-two ring buffer. Cheaply cloneable: in
/// the normal single-producer case only one clone exists, but shared-input
/// fan-in hands out one clone per upstream processor, all claiming
/// sequences from the same monotone counter.
#[derive(Clone)]
pub struct RingProducer {
    inner: Arc<RingInner>,
}

/// The single consumer handle over a ring buffer. Not `Clone`: the ring's
/// lock-free fast path assumes exactly one reader.
pub struct RingConsumer {
    inner: Arc<RingInner>,
    cursor: u64,
}

/// Constructs a ring-variant handoff buffer. `capacity` must be a power of
/// two; payloads are preallocated to `payload_capacity` bytes each.
pub fn ring_buffer(capacity: u64, payload_capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity.is_power_of_two(), "ring buffer capacity must be a power of two");
    let slots = (0..capacity)
        .map(|_| Slot {
            payload: std::cell::UnsafeCell::new(Payload::with_capacity(payload_capacity)),
            attachment: std::cell::UnsafeCell::new(Attachment::None),
        })
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let published = (0..capacity).map(|_| AtomicI64::new(-1)).collect::<Vec<_>>().into_boxed_slice();
    let inner = Arc::new(RingInner {
        mask: capacity - 1,
        capacity,
        slots,
        published,
        claim: AtomicU64::new(0),
        consumer_cursor: AtomicU64::new(u64::MAX), // nothing freed yet; wraps so `+1` below is 0
        closed: AtomicBool::new(false),
        space_available: ParkWakeup::new(),
        data_ready: ParkWakeup::new(),
        rearm_hook: std::sync::Mutex::new(None),
    });
    (RingProducer { inner: inner.clone() }, RingConsumer { inner, cursor: 0 })
}

impl RingProducer {
    /// Installs a custom wakeup strategy invoked on `release`, in place of
    /// the default park/notify. A reactor uses this to rearm `OP_WRITE`
    /// directly instead of waking a consumer thread that doesn't exist.
    pub fn set_wakeup(&self, wakeup: Arc<dyn Wakeup>) {
        *self.inner.rearm_hook.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(wakeup);
    }
}

impl HandoffBuffer for RingProducer {
    fn acquire(&mut self, n: u64) -> Result<u64, BufferError> {
        if n == 0 || n > self.inner.capacity {
            return Err(BufferError::ExceedsCapacity { requested: n, capacity: self.inner.capacity });
        }
        let highest = self.inner.claim.fetch_add(n, Ordering::Relaxed) + n - 1;
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(BufferError::Closed);
            }
            let freed = self.inner.consumer_cursor.load(Ordering::Acquire);
            // consumer_cursor starts at u64::MAX ("nothing freed"); wrapping
            // add gives the correct gate of `capacity` free slots up front.
            if highest <= freed.wrapping_add(self.inner.capacity) {
                break;
            }
            self.inner.space_available.park_timeout(Duration::from_millis(5));
        }
        Ok(highest)
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
        let idx = (seq & self.inner.mask) as usize;
        self.inner.published[idx].store(seq as i64, Ordering::Release);
        self.inner.wake_consumer();
    }

    fn try_acquire(&mut self, n: u64) -> Result<Option<u64>, BufferError> {
        if n == 0 || n > self.inner.capacity {
            return Err(BufferError::ExceedsCapacity { requested: n, capacity: self.inner.capacity });
        }
        // CAS-based claim rather than `acquire`'s fetch_add: a failed claim
        // here must not advance the sequence counter, since the caller
        // walks away instead of waiting for room (multiple producer clones
        // race this loop safely in shared-input fan-in mode).
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(BufferError::Closed);
            }
            let current = self.inner.claim.load(Ordering::Relaxed);
            let highest = current + n - 1;
            let freed = self.inner.consumer_cursor.load(Ordering::Acquire);
            if highest > freed.wrapping_add(self.inner.capacity) {
                return Ok(None);
            }
            if self.inner.claim.compare_exchange_weak(current, current + n, Ordering::Relaxed, Ordering::Relaxed).is_ok() {
                return Ok(Some(highest));
            }
        }
    }

    fn remaining(&self) -> u64 {
        let freed = self.inner.consumer_cursor.load(Ordering::Acquire);
        let claimed = self.inner.claim.load(Ordering::Relaxed);
        self.inner.capacity.saturating_sub(claimed.wrapping_sub(freed.wrapping_add(1)))
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl EchoTarget for RingProducer {
    fn acquire(&self) -> Result<u64, BufferError> {
        let mut this = RingProducer { inner: self.inner.clone() };
        HandoffBuffer::acquire(&mut this, 1)
    }

    unsafe fn payload(&self, seq: u64) -> &mut Payload {
        unsafe { HandoffBuffer::payload(self, seq) }
    }

    fn release(&self, seq: u64) {
        let mut this = RingProducer { inner: self.inner.clone() };
        HandoffBuffer::release(&mut this, seq);
    }
}

impl RingConsumer {
    /// Highest contiguous sequence published starting at `self.cursor`,
    /// relative to `self.cursor` (0 means nothing new is ready).
    fn contiguous_available(&self) -> u64 {
        let mut count = 0u64;
        loop {
            if count >= self.inner.capacity {
                break;
            }
            let seq = self.cursor + count;
            let idx = (seq & self.inner.mask) as usize;
            if self.inner.published[idx].load(Ordering::Acquire) == seq as i64 {
                count += 1;
            } else {
                break;
            }
        }
        count
    }
}

impl HandoffBuffer for RingConsumer {
    fn acquire(&mut self, n: u64) -> Result<u64, BufferError> {
        if n == 0 || n > self.inner.capacity {
            return Err(BufferError::ExceedsCapacity { requested: n, capacity: self.inner.capacity });
        }
        loop {
            let available = self.contiguous_available();
            if available > 0 {
                return Ok(self.cursor + available.min(n) - 1);
            }
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(BufferError::Closed);
            }
            self.inner.data_ready.park_timeout(Duration::from_millis(5));
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
        self.cursor = seq + 1;
        self.inner.consumer_cursor.store(seq, Ordering::Release);
        self.inner.space_available.wake();
    }

    fn remaining(&self) -> u64 {
        self.contiguous_available()
    }

    fn try_acquire(&mut self, n: u64) -> Result<Option<u64>, BufferError> {
        if n == 0 || n > self.inner.capacity {
            return Err(BufferError::ExceedsCapacity { requested: n, capacity: self.inner.capacity });
        }
        let available = self.contiguous_available();
        if available == 0 {
            return if self.inner.closed.load(Ordering::Acquire) {
                Err(BufferError::Closed)
            } else {
                Ok(None)
            };
        }
        Ok(Some(self.cursor + available.min(n) - 1))
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produce_consume_round_trip() {
        let (mut producer, mut consumer) = ring_buffer(8, 64);
        for i in 0u8..100 {
            let seq = producer.acquire(1).unwrap();
            unsafe { producer.payload(seq).extend_from_slice(&[i]) };
            producer.release(seq);

            let seq = consumer.acquire(1).unwrap();
            let got = unsafe { consumer.payload(seq).as_slice()[0] };
            assert_eq!(got, i);
            consumer.release(seq);
        }
    }

    #[test]
    fn producer_blocks_until_consumer_frees_room() {
        let (mut producer, mut consumer) = ring_buffer(4, 8);
        for _ in 0..4 {
            let seq = producer.acquire(1).unwrap();
            producer.release(seq);
        }
        assert_eq!(producer.remaining(), 0);

        let consumer_thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            for _ in 0..4 {
                let seq = consumer.acquire(1).unwrap();
                consumer.release(seq);
            }
        });

        let seq = producer.acquire(1).unwrap();
        producer.release(seq);
        consumer_thread.join().unwrap();
    }

    #[test]
    fn close_unblocks_waiters() {
        let (mut producer, _consumer) = ring_buffer(2, 8);
        let a = producer.acquire(1).unwrap();
        producer.release(a);
        let b = producer.acquire(1).unwrap();
        producer.release(b);

        let mut blocked = producer.clone();
        let handle = std::thread::spawn(move || blocked.acquire(1));
        std::thread::sleep(Duration::from_millis(20));
        producer.close();
        assert_eq!(handle.join().unwrap(), Err(BufferError::Closed));
    }
}
