use std::sync::Arc;

use crate::attachment::Attachment;
use crate::buffer::{
    BlockingConsumer, BlockingProducer, HandoffBuffer, RingConsumer, RingProducer, Wakeup, blocking_buffer,
    ring_buffer,
};
use crate::error::BufferError;
use crate::payload::Payload;

/// Either handoff-buffer variant, behind the single operational contract
/// both implement. Lets [`BufferProvider`] be built from a runtime config
/// choice (`useRingBuffer`) instead of a compile-time generic parameter.
pub enum Producer {
    Ring(RingProducer),
    Blocking(BlockingProducer),
}

pub enum Consumer {
    Ring(RingConsumer),
    Blocking(BlockingConsumer),
}

macro_rules! dispatch {
    ($self:expr, $variant:ident, $method:ident $(, $arg:expr)*) => {
        match $self {
            $variant::Ring(inner) => inner.$method($($arg),*),
            $variant::Blocking(inner) => inner.$method($($arg),*),
        }
    };
}

impl HandoffBuffer for Producer {
    fn acquire(&mut self, n: u64) -> Result<u64, BufferError> {
        dispatch!(self, Producer, acquire, n)
    }

    fn try_acquire(&mut self, n: u64) -> Result<Option<u64>, BufferError> {
        dispatch!(self, Producer, try_acquire, n)
    }

    unsafe fn payload(&self, seq: u64) -> &mut Payload {
        match self {
            Producer::Ring(inner) => unsafe { inner.payload(seq) },
            Producer::Blocking(inner) => unsafe { inner.payload(seq) },
        }
    }

    fn attach(&self, seq: u64, attachment: Attachment) {
        dispatch!(self, Producer, attach, seq, attachment);
    }

    fn attachment(&self, seq: u64) -> Attachment {
        dispatch!(self, Producer, attachment, seq)
    }

    fn release(&mut self, seq: u64) {
        dispatch!(self, Producer, release, seq);
    }

    fn remaining(&self) -> u64 {
        dispatch!(self, Producer, remaining)
    }

    fn close(&self) {
        dispatch!(self, Producer, close)
    }

    fn is_closed(&self) -> bool {
        dispatch!(self, Producer, is_closed)
    }
}

impl Producer {
    /// Installs a reactor rearm hook in place of either variant's default
    /// park/notify wakeup (see [`crate::buffer::Wakeup`]): `release` calls
    /// this instead of waking a consumer thread that, for a reactor-driven
    /// buffer, doesn't exist.
    pub fn install_rearm(&self, wakeup: Arc<dyn Wakeup>) {
        match self {
            Producer::Ring(inner) => inner.set_wakeup(wakeup),
            Producer::Blocking(inner) => inner.set_wakeup(wakeup),
        }
    }
}

impl HandoffBuffer for Consumer {
    fn acquire(&mut self, n: u64) -> Result<u64, BufferError> {
        dispatch!(self, Consumer, acquire, n)
    }

    fn try_acquire(&mut self, n: u64) -> Result<Option<u64>, BufferError> {
        dispatch!(self, Consumer, try_acquire, n)
    }

    unsafe fn payload(&self, seq: u64) -> &mut Payload {
        match self {
            Consumer::Ring(inner) => unsafe { inner.payload(seq) },
            Consumer::Blocking(inner) => unsafe { inner.payload(seq) },
        }
    }

    fn attach(&self, seq: u64, attachment: Attachment) {
        dispatch!(self, Consumer, attach, seq, attachment);
    }

    fn attachment(&self, seq: u64) -> Attachment {
        dispatch!(self, Consumer, attachment, seq)
    }

    fn release(&mut self, seq: u64) {
        dispatch!(self, Consumer, release, seq);
    }

    fn remaining(&self) -> u64 {
        dispatch!(self, Consumer, remaining)
    }

    fn close(&self) {
        dispatch!(self, Consumer, close)
    }

    fn is_closed(&self) -> bool {
        dispatch!(self, Consumer, is_closed)
    }
}

/// Configuration governing how a [`BufferProvider`] builds its two rings.
#[derive(Clone, Copy, Debug)]
pub struct BufferProviderConfig {
    pub capacity: u64,
    pub payload_capacity: usize,
    pub use_ring_buffer: bool,
    pub single_input_buffer: bool,
}

impl Default for BufferProviderConfig {
    fn default() -> Self {
        Self { capacity: 1024, payload_capacity: 0xFFFF, use_ring_buffer: false, single_input_buffer: false }
    }
}

fn make_pair(capacity: u64, payload_capacity: usize, use_ring_buffer: bool) -> (Producer, Consumer) {
    if use_ring_buffer {
        let (p, c) = ring_buffer(capacity, payload_capacity);
        (Producer::Ring(p), Consumer::Ring(c))
    } else {
        let (p, c) = blocking_buffer(capacity, payload_capacity);
        (Producer::Blocking(p), Consumer::Blocking(c))
    }
}

/// Pairs two handoff buffers into the bidirectional transport a processor
/// needs: the application writes into `app_out`, which the processor reads
/// from as `chn_in`; the processor publishes decoded frames into `chn_out`,
/// which the application reads from as `app_in`.
pub struct BufferProvider {
    pub app_out: Producer,
    pub chn_in: Consumer,
    pub chn_out: Producer,
    /// `None` in shared-input mode: the matching consumer lives once per
    /// [`SharedInputGroup`], not once per connection.
    pub app_in: Option<Consumer>,
}

impl BufferProvider {
    /// Own-input mode: a dedicated `chnOut`/`appIn` ring per connection.
    pub fn own_input(config: &BufferProviderConfig) -> Self {
        let (app_out, chn_in) = make_pair(config.capacity, config.payload_capacity, config.use_ring_buffer);
        let (chn_out, app_in) = make_pair(config.capacity, config.payload_capacity, config.use_ring_buffer);
        Self { app_out, chn_in, chn_out, app_in: Some(app_in) }
    }

    /// Shared-input mode: `chn_out` is a producer over a [`SharedInputGroup`]'s
    /// externally supplied consumer, fanning many connections' read paths
    /// into one application-side queue.
    pub fn shared_input(config: &BufferProviderConfig, chn_out: RingProducer) -> Self {
        let (app_out, chn_in) = make_pair(config.capacity, config.payload_capacity, config.use_ring_buffer);
        Self { app_out, chn_in, chn_out: Producer::Ring(chn_out), app_in: None }
    }

    pub fn close(&self) {
        self.app_out.close();
        self.chn_in.close();
        self.chn_out.close();
        if let Some(app_in) = &self.app_in {
            app_in.close();
        }
    }
}

/// Owns the one shared `appIn` ring behind a group of fan-in connections.
///
/// The shared consumer is always backed by the ring variant: the ring's
/// producer claim is a plain atomic `fetch_add`, so handing out clones to
/// many connections is sound without extra locking. The lock+condition
/// variant is deliberately not offered here even when `useRingBuffer` is
/// false elsewhere in the same config — capacity is still validated as a
/// power of two, but the fan-in path always wins the variant choice.
pub struct SharedInputGroup {
    producer_template: RingProducer,
    pub app_in: RingConsumer,
}

impl SharedInputGroup {
    #[must_use]
    pub fn new(capacity: u64, payload_capacity: usize) -> Self {
        let (producer_template, app_in) = ring_buffer(capacity, payload_capacity);
        Self { producer_template, app_in }
    }

    /// Vends a new producer handle for one more fan-in connection.
    #[must_use]
    pub fn new_producer(&self) -> RingProducer {
        self.producer_template.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_input_pairs_are_independent() {
        let config = BufferProviderConfig { capacity: 4, payload_capacity: 16, ..Default::default() };
        let mut provider = BufferProvider::own_input(&config);

        let seq = provider.app_out.acquire(1).unwrap();
        unsafe { provider.app_out.payload(seq).extend_from_slice(b"hi") };
        provider.app_out.release(seq);

        let seq = provider.chn_in.acquire(1).unwrap();
        assert_eq!(unsafe { provider.chn_in.payload(seq).as_slice() }, b"hi");
        provider.chn_in.release(seq);

        assert!(provider.app_in.is_some());
    }

    #[test]
    fn shared_input_fans_in_many_producers() {
        let group = SharedInputGroup::new(64, 16);
        let config = BufferProviderConfig { capacity: 4, payload_capacity: 16, use_ring_buffer: true, single_input_buffer: true };

        let mut providers: Vec<_> =
            (0..4).map(|_| BufferProvider::shared_input(&config, group.new_producer())).collect();

        for (i, provider) in providers.iter_mut().enumerate() {
            let seq = provider.chn_out.acquire(1).unwrap();
            unsafe { provider.chn_out.payload(seq).extend_from_slice(&[i as u8]) };
            provider.chn_out.release(seq);
        }

        let mut app_in = group.app_in;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let seq = app_in.acquire(1).unwrap();
            seen.insert(unsafe { app_in.payload(seq).as_slice()[0] });
            app_in.release(seq);
        }
        assert_eq!(seen, (0u8..4).collect());
    }
}
