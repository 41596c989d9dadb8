//! TLS `KeyProcessor` (spec.md §4.5.2). Adds a nested handshake state
//! machine driven by rustls's own non-blocking `read_tls`/`write_tls`/
//! `process_new_packets` cycle on top of the plain-TCP read/write shape.
//! Outbound connections defer their write-role registration behind a plain
//! TCP connect exactly as [`super::tcp::TcpProcessor`] does; accepted
//! connections register both roles immediately since the socket is already
//! connected and only the TLS handshake itself remains.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use conduit_comm::{Consumer, EchoTarget, HandoffBuffer, Producer, RateLimiter};
use mio::net::TcpStream;
use rustls::{ClientConnection, ServerConnection};
use tracing::{trace, warn};

use crate::codec::Codec;
use crate::config::NetworkConfig;
use crate::future::CompletionFuture;
use crate::processor::{ProcessorHandles, Scratch, drain_frames, duplicate_tcp_stream, echo_target, install_write_rearm};
use crate::reactor::command::IoSource;
use crate::reactor::{Reactor, ReactorProcessor, WriteOutcome, WriteRearm};

/// Dispatches to whichever side of the handshake this connection is on.
/// Mirrors the enum-dispatch `Producer`/`Consumer` already use for buffer
/// variants, rather than boxing a trait object for two known shapes.
pub(crate) enum TlsSession {
    Client(ClientConnection),
    Server(ServerConnection),
}

macro_rules! dispatch {
    ($self:expr, $method:ident $(, $arg:expr)*) => {
        match $self {
            TlsSession::Client(inner) => inner.$method($($arg),*),
            TlsSession::Server(inner) => inner.$method($($arg),*),
        }
    };
}

impl TlsSession {
    fn is_handshaking(&self) -> bool {
        dispatch!(self, is_handshaking)
    }

    fn wants_write(&self) -> bool {
        dispatch!(self, wants_write)
    }

    fn read_tls(&mut self, rd: &mut TcpStream) -> io::Result<usize> {
        dispatch!(self, read_tls, rd)
    }

    fn write_tls(&mut self, wr: &mut TcpStream) -> io::Result<usize> {
        dispatch!(self, write_tls, wr)
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        dispatch!(self, process_new_packets)
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        dispatch!(self, reader)
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        dispatch!(self, writer)
    }

    fn send_close_notify(&mut self) {
        dispatch!(self, send_close_notify)
    }
}

struct SendState {
    /// Application-plane cleartext buffer, filled by codec-framing messages
    /// from `chnIn` before being handed to `session.writer()` (spec.md
    /// §4.5.2 "preSendBuf").
    pre_send: Scratch,
    pending_seq: Option<u64>,
}

/// Per-connection TLS state machine. Unlike plain TCP, both read and write
/// roles touch the same `rustls::Connection`, so `session` is behind a
/// single mutex shared across the read-role and write-role selector
/// threads — the handshake interleaves unwrap/wrap on whichever thread gets
/// there first, and that serialization is exactly what spec.md §4.5.2 calls
/// "a single-threaded state machine on the owning selector thread" scaled to
/// two threads taking turns.
pub(crate) struct TlsProcessor {
    self_handle: Weak<TlsProcessor>,
    handles: ProcessorHandles,
    session: Mutex<TlsSession>,
    read_socket: Mutex<TcpStream>,
    write_socket: Mutex<TcpStream>,
    pending_write_registration: Mutex<Option<TcpStream>>,
    write_rearm: WriteRearm,
    chn_in: Mutex<Consumer>,
    chn_out: Mutex<Producer>,
    echo_target: Option<Arc<dyn EchoTarget>>,
    read_codec: Mutex<Box<dyn Codec>>,
    write_codec: Mutex<Box<dyn Codec>>,
    limiter: RateLimiter,
    /// Cleartext post-receive buffer (spec.md §4.5.2 "postRecvBuf"), fed
    /// from `session.reader()` and drained by the codec the same way the
    /// plain-TCP read path drains its wire-level scratch.
    post_recv: Mutex<Scratch>,
    send: Mutex<SendState>,
    /// Set once `closeOutbound()` has been called; the user close task is
    /// deferred until the close_notify flush completes on a later write
    /// cycle (spec.md §4.5 step 3's TLS carve-out).
    closing: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    /// Guards `connectRead`/`connectWrite` completion so it fires exactly
    /// once, the first time either role notices the handshake has finished
    /// (spec.md §4.4: "for TLS this returns only after handshake").
    handshake_announced: AtomicBool,
}

impl TlsProcessor {
    /// Constructs the processor around an already-built [`TlsSession`] (a
    /// `ClientConnection` for outbound connects, a `ServerConnection` for
    /// accepted sockets) and submits its registrations. `connecting` marks
    /// an outbound connect still in flight, exactly as
    /// [`super::tcp::TcpProcessor::spawn`]'s flag does: the write-role
    /// registration is deferred to [`ReactorProcessor::on_connectable`]
    /// succeeding, after which handshake progression rides ordinary
    /// read/write dispatch like every other TLS connection.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        reactor: Arc<Reactor>,
        socket: TcpStream,
        session: TlsSession,
        chn_in: Consumer,
        chn_out: Producer,
        app_out: &Producer,
        read_codec: Box<dyn Codec>,
        write_codec: Box<dyn Codec>,
        limiter: RateLimiter,
        config: &NetworkConfig,
        connecting: bool,
    ) -> io::Result<Arc<Self>> {
        let recv_cap = NetworkConfig::scratch_capacity(config.receive_buffer_size, read_codec.frame_length());
        let send_cap = NetworkConfig::scratch_capacity(config.send_buffer_size, write_codec.frame_length());
        let echo = echo_target(app_out);

        let read_registration = duplicate_tcp_stream(&socket)?;
        let write_socket = duplicate_tcp_stream(&socket)?;
        let write_registration = duplicate_tcp_stream(&socket)?;

        let write_token = reactor.next_token();
        let write_rearm = reactor.write_rearm(write_token);

        let processor = Arc::new_cyclic(|weak| Self {
            self_handle: weak.clone(),
            handles: ProcessorHandles::new(reactor.clone()),
            session: Mutex::new(session),
            read_socket: Mutex::new(socket),
            write_socket: Mutex::new(write_socket),
            pending_write_registration: Mutex::new(None),
            write_rearm,
            chn_in: Mutex::new(chn_in),
            chn_out: Mutex::new(chn_out),
            echo_target: echo,
            read_codec: Mutex::new(read_codec),
            write_codec: Mutex::new(write_codec),
            limiter,
            post_recv: Mutex::new(Scratch::new(recv_cap)),
            send: Mutex::new(SendState { pre_send: Scratch::new(send_cap), pending_seq: None }),
            closing: Mutex::new(None),
            handshake_announced: AtomicBool::new(false),
        });

        let read_token = reactor.next_token();
        processor.handles.set_read_key(read_token);
        processor.handles.set_write_key(write_token);
        install_write_rearm(app_out, &reactor, write_token);

        let as_read: Arc<dyn ReactorProcessor> = processor.clone();

        if connecting {
            *processor.pending_write_registration.lock().unwrap_or_else(PoisonError::into_inner) = Some(write_registration);
            reactor.register_connecting(IoSource::TcpStream(read_registration), read_token, as_read);
        } else {
            reactor.register_read(IoSource::TcpStream(read_registration), read_token, as_read);
            processor.register_write_role(write_token, write_registration);
        }

        Ok(processor)
    }

    fn register_write_role(self: &Arc<Self>, token: mio::Token, registration: TcpStream) {
        let reactor = self.handles.reactor.clone();
        let as_write: Arc<dyn ReactorProcessor> = self.clone();
        reactor.register_write(IoSource::TcpStream(registration), token, as_write);
    }

    pub(crate) fn connection_future(&self) -> CompletionFuture {
        self.handles.futures.connection.clone()
    }

    pub(crate) fn close_future(&self) -> CompletionFuture {
        self.handles.futures.close.clone()
    }

    /// Spec.md §4.5 step 3's TLS carve-out: calls `closeOutbound()` and
    /// rearms the writer so the alert flushes; the user task runs once the
    /// flush is observed in a subsequent write cycle. If the handshake
    /// never completed, there is nothing to flush and the task runs
    /// immediately.
    pub(crate) fn close(&self, user_close_task: Box<dyn FnOnce() + Send>) {
        if !self.handles.begin_shutdown() {
            return;
        }

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let run_now = session.is_handshaking();
        if !run_now {
            session.send_close_notify();
        }
        drop(session);

        if run_now {
            self.shutdown(user_close_task);
        } else {
            *self.closing.lock().unwrap_or_else(PoisonError::into_inner) = Some(user_close_task);
            self.write_rearm.request();
        }
    }

    fn shutdown(&self, user_close_task: Box<dyn FnOnce() + Send>) {
        self.chn_in.lock().unwrap_or_else(PoisonError::into_inner).close();
        self.chn_out.lock().unwrap_or_else(PoisonError::into_inner).close();
        self.handles.cancel_keys();
        self.read_codec.lock().unwrap_or_else(PoisonError::into_inner).close();
        self.write_codec.lock().unwrap_or_else(PoisonError::into_inner).close();
        user_close_task();
        self.handles.futures.shutdown.complete(Ok(()));
    }

    /// Completes `connectRead`/`connectWrite` the first time either role
    /// observes the handshake has finished. A no-op on every later call.
    fn maybe_announce_connected(&self, session: &TlsSession) {
        if session.is_handshaking() {
            return;
        }
        if self.handshake_announced.swap(true, Ordering::AcqRel) {
            return;
        }
        self.handles.futures.connect_read.complete(Ok(()));
        self.handles.futures.connect_write.complete(Ok(()));
    }

    /// Unwraps any buffered TLS records into `postRecvBuf`, running the
    /// handshake forward as far as it can go without blocking (spec.md
    /// §4.5.2 read path). Returns `false` on a fatal transport or protocol
    /// error; `true` otherwise, including the steady-state "nothing new"
    /// case.
    fn pump_read(&self, session: &mut TlsSession) -> bool {
        let mut read_socket = self.read_socket.lock().unwrap_or_else(PoisonError::into_inner);
        match session.read_tls(&mut read_socket) {
            Ok(0) => {
                trace!("peer closed during tls read");
                return false;
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                warn!(?err, "tls transport read failed");
                return false;
            }
        }
        drop(read_socket);

        let state = match session.process_new_packets() {
            Ok(state) => state,
            Err(err) => {
                warn!(?err, "tls protocol error");
                return false;
            }
        };
        if state.peer_has_closed() {
            trace!("peer sent tls close_notify");
        }

        let mut post_recv = self.post_recv.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            let spare = post_recv.spare_len();
            if spare == 0 {
                break;
            }
            let mut chunk = vec![0u8; spare];
            match session.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    post_recv.spare_mut()[..n].copy_from_slice(&chunk[..n]);
                    post_recv.advance_filled(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "tls plaintext read failed");
                    return false;
                }
            }
        }
        drop(post_recv);

        self.maybe_announce_connected(session);
        if session.wants_write() {
            self.write_rearm.request();
        }
        true
    }
}

impl ReactorProcessor for TlsProcessor {
    fn on_readable(&self) -> bool {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.pump_read(&mut session) {
            return false;
        }

        let mut post_recv = self.post_recv.lock().unwrap_or_else(PoisonError::into_inner);
        let mut read_codec = self.read_codec.lock().unwrap_or_else(PoisonError::into_inner);
        let mut chn_out = self.chn_out.lock().unwrap_or_else(PoisonError::into_inner);
        let result = drain_frames(&mut post_recv, read_codec.as_mut(), &mut chn_out, self.echo_target.as_ref(), None);
        post_recv.compact_or_clear();
        if let Err(err) = result {
            warn!(?err, "invalid encoding, closing tls connection");
            return false;
        }
        true
    }

    fn on_writable(&self) -> WriteOutcome {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let mut send = self.send.lock().unwrap_or_else(PoisonError::into_inner);

        if !session.is_handshaking() {
            let mut chn_in = self.chn_in.lock().unwrap_or_else(PoisonError::into_inner);
            let mut write_codec = self.write_codec.lock().unwrap_or_else(PoisonError::into_inner);

            loop {
                let seq = match send.pending_seq.take() {
                    Some(seq) => seq,
                    None => match chn_in.try_acquire(1) {
                        Ok(Some(seq)) => seq,
                        Ok(None) => break,
                        Err(_) => return WriteOutcome::Close,
                    },
                };

                let encoded_len = {
                    let payload = unsafe { chn_in.payload(seq) };
                    write_codec.encoded_len(payload.as_slice())
                };
                if encoded_len > send.pre_send.capacity() {
                    warn!(encoded_len, capacity = send.pre_send.capacity(), "message too large for configured send buffer");
                    return WriteOutcome::Close;
                }
                if encoded_len > send.pre_send.spare_len() {
                    send.pending_seq = Some(seq);
                    break;
                }

                let result = {
                    let payload = unsafe { chn_in.payload(seq) };
                    send.pre_send.encode_into(write_codec.as_mut(), payload.as_slice())
                };
                chn_in.release(seq);
                if let Err(err) = result {
                    warn!(?err, "message failed codec validation");
                    return WriteOutcome::Close;
                }
            }

            let live = send.pre_send.live();
            if !live.is_empty() {
                match session.writer().write(live) {
                    Ok(n) => {
                        send.pre_send.advance_consumed(n);
                        send.pre_send.compact_or_clear();
                    }
                    Err(err) => {
                        warn!(?err, "tls plaintext write failed");
                        return WriteOutcome::Close;
                    }
                }
            }
        }

        if let Err(err) = session.process_new_packets() {
            warn!(?err, "tls protocol error during write");
            return WriteOutcome::Close;
        }

        let mut write_socket = self.write_socket.lock().unwrap_or_else(PoisonError::into_inner);
        while session.wants_write() {
            match session.write_tls(&mut write_socket) {
                Ok(n) => self.limiter.consume(n as u32),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return WriteOutcome::Continue,
                Err(err) => {
                    warn!(?err, "tls transport write failed");
                    return WriteOutcome::Close;
                }
            }
        }
        drop(write_socket);

        self.maybe_announce_connected(&session);

        let mut closing = self.closing.lock().unwrap_or_else(PoisonError::into_inner);
        if closing.is_some() {
            let task = closing.take().expect("checked is_some above");
            drop(closing);
            drop(send);
            drop(session);
            self.shutdown(task);
            return WriteOutcome::Close;
        }
        drop(closing);

        let chn_in = self.chn_in.lock().unwrap_or_else(PoisonError::into_inner);
        if send.pre_send.is_empty() && send.pending_seq.is_none() && chn_in.remaining() == 0 {
            WriteOutcome::Disable
        } else {
            WriteOutcome::Continue
        }
    }

    /// Plain-TCP connect finished (outbound only). Submits the deferred
    /// write-role registration and kicks the handshake's first flight
    /// (e.g. a client's `ClientHello`) immediately rather than waiting for
    /// the next writable event.
    fn on_connectable(&self) -> bool {
        let socket = self.read_socket.lock().unwrap_or_else(PoisonError::into_inner);
        let failed = matches!(socket.take_error(), Ok(Some(_)) | Err(_));
        drop(socket);
        if failed {
            warn!("outbound tls connect failed");
            let err = conduit_comm::ChannelError::Io(Arc::new(io::Error::new(io::ErrorKind::ConnectionRefused, "tls connect failed")));
            self.handles.futures.connect_read.complete(Err(err.clone()));
            self.handles.futures.connect_write.complete(Err(err));
            return false;
        }

        let registration = self.pending_write_registration.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let (Some(registration), Some(strong)) = (registration, self.self_handle.upgrade()) {
            let token = strong.handles.write_key.lock().unwrap_or_else(PoisonError::into_inner).expect("write token preallocated in spawn");
            strong.register_write_role(token, registration);
        }

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.pump_read(&mut session) {
            return false;
        }
        true
    }

    fn on_closed_by_reactor(&self) {
        if !self.handles.begin_shutdown() {
            return;
        }
        self.shutdown(Box::new(|| {}));
    }
}
