/// Runtime knobs recognised by the core (spec.md §6). Mirrors the teacher's
/// plain-struct-plus-manual-`Default` style (`ConnectionManager::default()`
/// in the pre-transform `flux-network/src/tcp/connector.rs`) rather than a
/// builder-macro crate: the teacher never reaches for one.
#[derive(Clone, Copy, Debug)]
pub struct NetworkConfig {
    /// Slots per handoff buffer. Must be a power of two and `>= 1`.
    pub buffer_capacity: u64,
    /// Target bytes for the processor's send scratch buffer.
    pub send_buffer_size: usize,
    /// Target bytes for the processor's receive scratch buffer.
    pub receive_buffer_size: usize,
    /// Scratch buffers use OS-pinned memory. Advisory on this translation:
    /// `Vec<u8>` is always heap-allocated, but the flag is threaded through
    /// so a future allocator swap (e.g. `memmap2`'s locked pages) has a
    /// single place to key off.
    pub use_direct_buffer: bool,
    /// Ring variant vs. lock+condition variant for the handoff buffers.
    pub use_ring_buffer: bool,
    /// Shared-input provider for fan-in (spec.md §3 `BufferProvider`).
    pub single_input_buffer: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 256,
            send_buffer_size: 0xFFFF,
            receive_buffer_size: 0xFFFF,
            use_direct_buffer: false,
            use_ring_buffer: false,
            single_input_buffer: false,
        }
    }
}

impl NetworkConfig {
    /// Rounds `size` up to the next power of two and raises it to at least
    /// `frame_length`, per spec.md §6 ("Scratch sizes are rounded up...").
    #[must_use]
    pub fn scratch_capacity(size: usize, frame_length: usize) -> usize {
        size.max(frame_length).next_power_of_two()
    }

    #[must_use]
    pub fn buffer_provider_config(&self, payload_capacity: usize) -> conduit_comm::BufferProviderConfig {
        conduit_comm::BufferProviderConfig {
            capacity: self.buffer_capacity,
            payload_capacity,
            // SPEC_FULL.md §2: `use_ring_buffer` always wins over
            // `single_input_buffer` requesting the lock+condition variant
            // (spec.md §9's "ring wins" open question, resolved explicitly).
            use_ring_buffer: self.use_ring_buffer || self.single_input_buffer,
            single_input_buffer: self.single_input_buffer,
        }
    }
}

/// Governs how many reactors a [`crate::reactor::SelectorPool`] runs and how
/// a newly registered channel picks one.
#[derive(Clone, Copy, Debug)]
pub struct ReactorPoolConfig {
    pub num_reactors: usize,
}

impl Default for ReactorPoolConfig {
    fn default() -> Self {
        Self { num_reactors: 1 }
    }
}
