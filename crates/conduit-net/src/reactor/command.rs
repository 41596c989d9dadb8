use std::sync::Arc;

use mio::Token;
use mio::net::{TcpListener, TcpStream, UdpSocket};

use crate::future::CompletionFuture;
use crate::reactor::registration::{Acceptor, ReactorProcessor};

/// A readiness source a command hands to a selector thread for
/// registration. Each variant is a concrete `mio` type the thread's own
/// `Poll` registry can register directly.
pub(crate) enum IoSource {
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    UdpSocket(UdpSocket),
}

/// One I/O operation, run exclusively on its owning selector thread (spec.md
/// §4.3). Closures are avoided in favour of a closed enum: commands here
/// never need to capture thread-local state beyond what the variant already
/// carries, and an enum keeps `SelectorThread::drain_commands` exhaustive
/// and panic-free instead of trusting arbitrary boxed closures not to block.
pub(crate) enum Command {
    /// ACCEPT role only: register a listening socket for `OP_ACCEPT`.
    Bind { source: IoSource, token: Token, acceptor: Arc<dyn Acceptor>, bound: CompletionFuture },
    /// READ or WRITE role: register a connected/bound socket for this
    /// thread's role interest (`register(channel, processor)` in spec.md
    /// §4.3's command list).
    Register { source: IoSource, token: Token, processor: Arc<dyn ReactorProcessor>, completion: CompletionFuture },
    /// READ role only: register an in-flight outbound TCP connect for
    /// `OP_CONNECT` (spec.md §4.5 `registered(thread, key, OP_CONNECT)`).
    RegisterConnecting {
        source: IoSource,
        token: Token,
        processor: Arc<dyn ReactorProcessor>,
        completion: CompletionFuture,
    },
    /// Cancel a single key and run an optional close task on the owning
    /// thread, then settle `completion`.
    Cancel { token: Token, completion: CompletionFuture, task: Option<Box<dyn FnOnce() + Send>> },
    /// Close every processor/acceptor still attached to this thread's
    /// selector, then the selector itself.
    Close { completion: CompletionFuture },
}
