//! Per-connection processor infrastructure shared by the TCP, TLS, and UDP
//! state machines (spec.md §4.5).

pub(crate) mod tcp;
pub(crate) mod tls;
pub(crate) mod udp;

use std::io;
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use conduit_comm::{Attachment, HandoffBuffer, Producer, Wakeup};
use mio::Token;

use crate::future::{self, CompletionFuture};
use crate::reactor::Reactor;

/// Duplicates the kernel socket behind `stream` so the reactor can register
/// one handle purely for readiness notification while the processor keeps
/// its own handle for the actual `read`/`write` syscalls — the read-role and
/// write-role keys share a single connection, but each needs an
/// independently registerable `mio` source (spec.md §3).
///
/// # Safety
/// `from_raw_fd` on the borrowed descriptor would normally double-close it
/// on drop; `mem::forget` below stops that since `stream` keeps owning the
/// original fd. Only the dup'd descriptor returned by `try_clone` is a new,
/// independently-owned fd.
pub(crate) fn duplicate_tcp_stream(stream: &mio::net::TcpStream) -> io::Result<mio::net::TcpStream> {
    let borrowed = unsafe { socket2::Socket::from_raw_fd(stream.as_raw_fd()) };
    let cloned = borrowed.try_clone();
    std::mem::forget(borrowed);
    let cloned = cloned?;
    cloned.set_nonblocking(true)?;
    Ok(mio::net::TcpStream::from_std(cloned.into()))
}

/// As [`duplicate_tcp_stream`], for the UDP processor's read-role/write-role
/// socket split.
pub(crate) fn duplicate_udp_socket(socket: &mio::net::UdpSocket) -> io::Result<mio::net::UdpSocket> {
    let borrowed = unsafe { socket2::Socket::from_raw_fd(socket.as_raw_fd()) };
    let cloned = borrowed.try_clone();
    std::mem::forget(borrowed);
    let cloned = cloned?;
    cloned.set_nonblocking(true)?;
    Ok(mio::net::UdpSocket::from_std(cloned.into()))
}

/// As [`duplicate_tcp_stream`], for the acceptor's own bookkeeping handle
/// kept alongside the registered listener (spec.md §4.4 "Close": the user
/// close task typically closes the underlying socket, which must still be
/// owned by the acceptor after the registered clone has been handed to the
/// ACCEPT thread).
pub(crate) fn duplicate_tcp_listener(listener: &mio::net::TcpListener) -> io::Result<mio::net::TcpListener> {
    let borrowed = unsafe { socket2::Socket::from_raw_fd(listener.as_raw_fd()) };
    let cloned = borrowed.try_clone();
    std::mem::forget(borrowed);
    let cloned = cloned?;
    cloned.set_nonblocking(true)?;
    Ok(mio::net::TcpListener::from_std(cloned.into()))
}

/// Installs the reactor's write-rearm hook on `app_out` (spec.md §4.3
/// "Write rearm"): releasing a slot into the app→channel ring OR's
/// `OP_WRITE` back into the write key's interest set directly, instead of
/// waking a consumer thread that doesn't exist. `token` need not be
/// registered yet — [`Reactor::write_rearm`] only needs the write role's
/// queue/waker, and a rearm request against an unregistered token is a
/// harmless no-op until registration completes.
pub(crate) fn install_write_rearm(app_out: &Producer, reactor: &Reactor, token: Token) {
    app_out.install_rearm(Arc::new(reactor.write_rearm(token)) as Arc<dyn Wakeup>);
}

/// The five single-shot futures every processor exposes, plus the two
/// merged signals callers actually observe (spec.md §4.5).
pub(crate) struct ProcessorFutures {
    pub(crate) connect_read: CompletionFuture,
    pub(crate) connect_write: CompletionFuture,
    pub(crate) close_read: CompletionFuture,
    pub(crate) close_write: CompletionFuture,
    pub(crate) shutdown: CompletionFuture,
    /// `getConnectionFuture()`: ready once both registrations complete.
    pub(crate) connection: CompletionFuture,
    /// `getCloseFuture()`: ready once shutdown and both cancellations
    /// complete.
    pub(crate) close: CompletionFuture,
}

impl ProcessorFutures {
    pub(crate) fn new() -> Self {
        let connect_read = CompletionFuture::new();
        let connect_write = CompletionFuture::new();
        let close_read = CompletionFuture::new();
        let close_write = CompletionFuture::new();
        let shutdown = CompletionFuture::new();
        let connection = future::merge(vec![connect_read.clone(), connect_write.clone()]);
        let close = future::merge(vec![close_read.clone(), close_write.clone(), shutdown.clone()]);
        Self { connect_read, connect_write, close_read, close_write, shutdown, connection, close }
    }
}

/// Bookkeeping common to every processor variant: the reactor it is
/// registered on, its two selection keys, and its lifecycle futures.
///
/// UDP never has a write key distinct from its read key in the "connect"
/// sense (it registers both on construction, never through `OP_CONNECT`),
/// but it still stores both so the shutdown path is uniform.
pub(crate) struct ProcessorHandles {
    pub(crate) reactor: Arc<Reactor>,
    pub(crate) read_key: Mutex<Option<Token>>,
    pub(crate) write_key: Mutex<Option<Token>>,
    pub(crate) futures: ProcessorFutures,
    /// Guards the teardown sequence so it runs exactly once whichever path
    /// triggers it first: an explicit `close()` call, or the reactor
    /// noticing the connection died on its own (spec.md §7 "peer closed" /
    /// "local I/O error") and calling
    /// [`ReactorProcessor::on_closed_by_reactor`](crate::reactor::ReactorProcessor).
    shutdown_started: AtomicBool,
}

impl ProcessorHandles {
    pub(crate) fn new(reactor: Arc<Reactor>) -> Self {
        Self {
            reactor,
            read_key: Mutex::new(None),
            write_key: Mutex::new(None),
            futures: ProcessorFutures::new(),
            shutdown_started: AtomicBool::new(false),
        }
    }

    /// Returns `true` to the first caller only; every later caller (from
    /// either the read or write side, or a racing explicit `close()`) gets
    /// `false` and must not repeat the teardown.
    pub(crate) fn begin_shutdown(&self) -> bool {
        !self.shutdown_started.swap(true, Ordering::AcqRel)
    }

    /// Stores the token allocated for this connection's read-role
    /// registration. Stored optimistically before the `Register`/
    /// `RegisterConnecting` command is even submitted: the token is our own
    /// allocation (spec.md §4.3's command only needs a value to key its
    /// registration table by), not something the selector assigns, so
    /// there is nothing to race. If registration goes on to fail,
    /// `cancel_read` on an unknown token is simply a no-op.
    pub(crate) fn set_read_key(&self, token: Token) {
        *self.read_key.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    pub(crate) fn set_write_key(&self, token: Token) {
        *self.write_key.lock().unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    /// Spec.md §7 "registration failure": the selector closed before this
    /// processor's key could be installed. Both connect futures resolve
    /// with the cause and the processor never reaches read/write.
    pub(crate) fn registration_failed(&self, err: conduit_comm::ChannelError) {
        self.futures.connect_read.complete(Err(err.clone()));
        self.futures.connect_write.complete(Err(err));
    }

    /// Common half of `close()` (spec.md §4.5 step 3): cancels both keys
    /// (if registered) and chains their outcomes into `close_read` /
    /// `close_write`. Callers still own closing their buffer provider and
    /// running their protocol-specific `shutdown()` step.
    pub(crate) fn cancel_keys(&self) {
        let read_key = self.read_key.lock().unwrap_or_else(PoisonError::into_inner).take();
        let write_key = self.write_key.lock().unwrap_or_else(PoisonError::into_inner).take();

        match read_key {
            Some(token) => {
                let close_read = self.futures.close_read.clone();
                self.reactor.cancel_read(token, None).on_complete(move |outcome| close_read.complete(outcome.clone()));
            }
            None => self.futures.close_read.complete(Ok(())),
        }
        match write_key {
            Some(token) => {
                let close_write = self.futures.close_write.clone();
                self.reactor.cancel_write(token, None).on_complete(move |outcome| close_write.complete(outcome.clone()));
            }
            None => self.futures.close_write.complete(Ok(())),
        }
    }
}

/// Cursor over a fixed-capacity scratch buffer: `buf[consumed..filled]` is
/// the live region. Read paths append at `filled` and drain from
/// `consumed`; write paths fill from empty and drain as bytes go out on the
/// wire. Mirrors the teacher's `ByteBuffer`-cursor style (`flip`/`compact`)
/// without pulling in a buffer-pool crate for what is, per processor, one
/// fixed-size allocation reused for the connection's lifetime.
pub(crate) struct Scratch {
    buf: Vec<u8>,
    filled: usize,
    consumed: usize,
}

impl Scratch {
    pub(crate) fn new(capacity: usize) -> Self {
        Self { buf: vec![0u8; capacity], filled: 0, consumed: 0 }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn live(&self) -> &[u8] {
        &self.buf[self.consumed..self.filled]
    }

    pub(crate) fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    pub(crate) fn spare_len(&self) -> usize {
        self.buf.len() - self.filled
    }

    pub(crate) fn advance_filled(&mut self, n: usize) {
        self.filled += n;
    }

    pub(crate) fn advance_consumed(&mut self, n: usize) {
        self.consumed += n;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.consumed == self.filled
    }

    /// Shifts unconsumed bytes to the front, or clears outright if nothing
    /// is left — spec.md §4.5.1 step 4, "compact or clear the scratch".
    pub(crate) fn compact_or_clear(&mut self) {
        if self.consumed == 0 {
            return;
        }
        if self.consumed == self.filled {
            self.filled = 0;
            self.consumed = 0;
            return;
        }
        self.buf.copy_within(self.consumed..self.filled, 0);
        self.filled -= self.consumed;
        self.consumed = 0;
    }

    pub(crate) fn clear(&mut self) {
        self.filled = 0;
        self.consumed = 0;
    }

    /// Encodes `msg` through `codec` and appends the result, assuming the
    /// caller already checked it fits in `spare_len()`.
    pub(crate) fn encode_into(
        &mut self,
        codec: &mut dyn crate::codec::Codec,
        msg: &[u8],
    ) -> Result<usize, conduit_comm::CodecError> {
        let mut encoded = Vec::with_capacity(codec.encoded_len(msg));
        codec.put(msg, &mut encoded)?;
        let len = encoded.len();
        self.spare_mut()[..len].copy_from_slice(&encoded);
        self.advance_filled(len);
        Ok(len)
    }
}

/// Drains frames out of `recv` into `chn_out`, attaching an echo
/// back-reference to `app_out` on each one. Shared by the TCP, TLS, and UDP
/// read paths (spec.md §4.5.1 step 3 / §4.5.3).
pub(crate) fn drain_frames(
    recv: &mut Scratch,
    codec: &mut dyn crate::codec::Codec,
    chn_out: &mut Producer,
    app_out_echo: Option<&Arc<dyn conduit_comm::EchoTarget>>,
    attach_peer: Option<std::net::SocketAddr>,
) -> Result<(), conduit_comm::CodecError> {
    loop {
        let wire = recv.live();
        if !codec.has_next(wire)? {
            break;
        }
        let frame_len = codec.decoded_len(wire);
        let seq = match chn_out.try_acquire(1) {
            Ok(Some(seq)) => seq,
            Ok(None) => break,
            Err(_) => break,
        };
        let consumed = {
            let payload = unsafe { chn_out.payload(seq) };
            payload.clear();
            let mut out = Vec::with_capacity(frame_len.max(1));
            let consumed = codec.get(recv.live(), &mut out)?;
            payload.extend_from_slice(&out);
            consumed
        };
        let attachment = match (app_out_echo, attach_peer) {
            (Some(echo), _) => Attachment::Echo(echo.clone()),
            (None, Some(addr)) => Attachment::PeerAddr(addr),
            (None, None) => Attachment::None,
        };
        chn_out.attach(seq, attachment);
        chn_out.release(seq);
        recv.advance_consumed(consumed);
    }
    Ok(())
}

/// Wraps `app_out` as an [`EchoTarget`](conduit_comm::EchoTarget) handle
/// when it is backed by the ring variant, which is the only variant that
/// implements the trait (its `acquire`/`release` take `&self`, matching a
/// shared back-reference's needs; the lock+condition variant's operational
/// contract requires `&mut self` throughout). Connections opened over the
/// lock+condition buffer simply carry no echo back-reference.
pub(crate) fn echo_target(app_out: &Producer) -> Option<Arc<dyn conduit_comm::EchoTarget>> {
    match app_out {
        Producer::Ring(ring) => Some(Arc::new(ring.clone()) as Arc<dyn conduit_comm::EchoTarget>),
        Producer::Blocking(_) => None,
    }
}
