use std::sync::{Arc, Mutex};
use std::collections::HashSet;

use conduit_utils::safe_panic;
use mio::Token;
use mio::event::Event;

/// Driven by the ACCEPT role's thread on an acceptable key (spec.md §4.4).
pub trait Acceptor: Send + Sync {
    fn accept_ready(&self);
}

/// Outcome of a WRITE-role dispatch (spec.md §4.3's "if it returns negative,
/// close the processor" plus "disable OP_WRITE on the write key").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// More to write; leave `OP_WRITE` armed.
    Continue,
    /// `chnIn.remaining() == 0`: deregister `OP_WRITE` until the next
    /// `wakeupWriter()` rearms it.
    Disable,
    /// Fatal error or local shutdown complete; tear the key down.
    Close,
}

/// Driven by the READ/WRITE role threads. One instance per connection,
/// shared between its read-role and write-role registrations.
///
/// `on_readable`/`on_connectable` return `false` when the processor observed
/// that its connection must close (a negative read count, a fatal I/O
/// error, an invalid-encoding codec failure); the owning [`SelectorThread`]
/// reacts by tearing the processor down (spec.md §4.3 "if read returns a
/// negative count, close the processor").
pub trait ReactorProcessor: Send + Sync {
    /// `OP_READ` fired. UDP and TCP/TLS implement this; there is no generic
    /// default because every processor variant must handle readability.
    fn on_readable(&self) -> bool;

    /// `OP_WRITE` fired.
    fn on_writable(&self) -> WriteOutcome;

    /// `OP_CONNECT` fired (outbound TCP/TLS only). UDP processors reject
    /// this per spec.md §4.5.3; the default panics as a bug since only the
    /// READ thread ever calls it, and only for connecting channels.
    fn on_connectable(&self) -> bool {
        safe_panic!("bug: on_connectable called on a processor that never registers for OP_CONNECT");
        false
    }

    /// Called by the owning selector thread immediately after it has torn
    /// down this processor's key(s) on its own initiative — a negative
    /// read, a fatal I/O error, an invalid-encoding codec failure, or a
    /// failed outbound connect (spec.md §7) — as opposed to a `close()`
    /// the application asked for. Implementations run the same teardown
    /// `close()` does (buffer provider shutdown, cancelling the *other*
    /// key, completing the close future) but with no user-supplied task,
    /// guarded so it only ever runs once regardless of which side (read or
    /// write) noticed first.
    fn on_closed_by_reactor(&self) {}
}

pub(crate) enum Registration {
    Acceptor(Arc<dyn Acceptor>),
    Processor(Arc<dyn ReactorProcessor>),
}

/// Handle a registered [`ReactorProcessor`] keeps to rearm its own
/// `OP_WRITE` interest without ever touching `interestOps` itself (spec.md
/// §4.3 "Write rearm"). Implements [`conduit_comm::Wakeup`] so it can be
/// installed directly as a handoff buffer's wakeup hook.
#[derive(Clone)]
pub struct WriteRearm {
    pub(crate) token: Token,
    pub(crate) rearm_set: Arc<Mutex<HashSet<Token>>>,
    pub(crate) waker: Arc<mio::Waker>,
}

impl WriteRearm {
    pub fn request(&self) {
        self.rearm_set.lock().unwrap_or_else(std::sync::PoisonError::into_inner).insert(self.token);
        let _ = self.waker.wake();
    }
}

impl conduit_comm::Wakeup for WriteRearm {
    fn wake(&self) {
        self.request();
    }
}

pub(crate) fn is_close_signal(ev: &Event) -> bool {
    ev.is_read_closed() || ev.is_write_closed() || ev.is_error()
}
