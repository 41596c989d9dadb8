//! Plain-TCP `KeyProcessor` (spec.md §4.5.1).

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use conduit_comm::{Consumer, EchoTarget, HandoffBuffer, Producer, RateLimiter};
use mio::net::TcpStream;
use tracing::{trace, warn};

use crate::codec::Codec;
use crate::config::NetworkConfig;
use crate::future::CompletionFuture;
use crate::processor::{ProcessorHandles, Scratch, drain_frames, duplicate_tcp_stream, echo_target, install_write_rearm};
use crate::reactor::command::IoSource;
use crate::reactor::{Reactor, ReactorProcessor, WriteOutcome};

struct SendState {
    scratch: Scratch,
    /// A sequence acquired from `chn_in` whose encoded form didn't fit in
    /// the remaining scratch space last cycle; retried before acquiring
    /// anything new (spec.md §4.5.1 write step 1).
    pending_seq: Option<u64>,
}

/// Per-connection TCP state machine. `read_socket`/`write_socket` are the
/// handles this processor actually issues `read`/`write` syscalls against.
/// The reactor registers its own dup'd clone of each (see
/// [`duplicate_tcp_stream`]) purely for readiness notification, so reads
/// and writes run on different selector threads against independent
/// sockets backed by the same kernel connection — the two mutexes here
/// never contend with each other. Only `chn_in`/`chn_out` and `handles` are
/// shared across roles, and those are already internally synchronised or
/// role-exclusive.
pub(crate) struct TcpProcessor {
    self_handle: Weak<TcpProcessor>,
    handles: ProcessorHandles,
    read_socket: Mutex<TcpStream>,
    write_socket: Mutex<TcpStream>,
    /// Write-role registration clone, held until an in-flight outbound
    /// connect resolves (spec.md §4.5: the write key is only registered
    /// once `OP_CONNECT` succeeds).
    pending_write_registration: Mutex<Option<TcpStream>>,
    chn_in: Mutex<Consumer>,
    chn_out: Mutex<Producer>,
    echo_target: Option<Arc<dyn EchoTarget>>,
    read_codec: Mutex<Box<dyn Codec>>,
    write_codec: Mutex<Box<dyn Codec>>,
    limiter: RateLimiter,
    recv: Mutex<Scratch>,
    send: Mutex<SendState>,
}

impl TcpProcessor {
    /// Constructs the processor from one already-connected `TcpStream` and
    /// submits its read registration (and, unless `connecting`, its write
    /// registration too). `connecting` marks an outbound connect still in
    /// flight: the write-role registration is deferred to
    /// [`ReactorProcessor::on_connectable`] succeeding.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        reactor: Arc<Reactor>,
        socket: TcpStream,
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

        let processor = Arc::new_cyclic(|weak| Self {
            self_handle: weak.clone(),
            handles: ProcessorHandles::new(reactor.clone()),
            read_socket: Mutex::new(socket),
            write_socket: Mutex::new(write_socket),
            pending_write_registration: Mutex::new(None),
            chn_in: Mutex::new(chn_in),
            chn_out: Mutex::new(chn_out),
            echo_target: echo,
            read_codec: Mutex::new(read_codec),
            write_codec: Mutex::new(write_codec),
            limiter,
            recv: Mutex::new(Scratch::new(recv_cap)),
            send: Mutex::new(SendState { scratch: Scratch::new(send_cap), pending_seq: None }),
        });

        let read_token = reactor.next_token();
        processor.handles.set_read_key(read_token);
        // Preallocated up front regardless of `connecting`: the write-rearm
        // hook below only needs a token value to key the write role's rearm
        // set by, not an already-registered key (spec.md §4.3).
        let write_token = reactor.next_token();
        processor.handles.set_write_key(write_token);
        install_write_rearm(app_out, &reactor, write_token);

        let as_processor: Arc<dyn ReactorProcessor> = processor.clone();
        let connect_read = processor.handles.futures.connect_read.clone();

        if connecting {
            *processor.pending_write_registration.lock().unwrap_or_else(PoisonError::into_inner) = Some(write_registration);
            reactor
                .register_connecting(IoSource::TcpStream(read_registration), read_token, as_processor)
                .on_complete(move |outcome| connect_read.complete(outcome.clone()));
        } else {
            reactor
                .register_read(IoSource::TcpStream(read_registration), read_token, as_processor)
                .on_complete(move |outcome| connect_read.complete(outcome.clone()));
            processor.register_write_role(write_token, write_registration);
        }

        Ok(processor)
    }

    fn register_write_role(self: &Arc<Self>, token: mio::Token, registration: TcpStream) {
        let reactor = self.handles.reactor.clone();
        let as_processor: Arc<dyn ReactorProcessor> = self.clone();
        let connect_write = self.handles.futures.connect_write.clone();
        reactor
            .register_write(IoSource::TcpStream(registration), token, as_processor)
            .on_complete(move |outcome| connect_write.complete(outcome.clone()));
    }

    pub(crate) fn connection_future(&self) -> CompletionFuture {
        self.handles.futures.connection.clone()
    }

    pub(crate) fn close_future(&self) -> CompletionFuture {
        self.handles.futures.close.clone()
    }

    /// Spec.md §4.5 step 3: closes the buffer provider, cancels both keys,
    /// then runs the user's close task immediately (TCP never defers it).
    /// A no-op on every call after the first (explicit or reactor-driven).
    pub(crate) fn close(&self, user_close_task: Box<dyn FnOnce() + Send>) {
        if !self.handles.begin_shutdown() {
            return;
        }
        self.shutdown(user_close_task);
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
}

impl ReactorProcessor for TcpProcessor {
    fn on_readable(&self) -> bool {
        let mut recv = self.recv.lock().unwrap_or_else(PoisonError::into_inner);
        let mut socket = self.read_socket.lock().unwrap_or_else(PoisonError::into_inner);

        let n = match socket.read(recv.spare_mut()) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return true,
            Err(err) => {
                warn!(?err, "tcp read failed");
                return false;
            }
        };
        if n == 0 {
            trace!("peer closed during read");
            return false;
        }
        recv.advance_filled(n);
        self.limiter.consume(n as u32);

        let mut read_codec = self.read_codec.lock().unwrap_or_else(PoisonError::into_inner);
        let mut chn_out = self.chn_out.lock().unwrap_or_else(PoisonError::into_inner);
        let result = drain_frames(&mut recv, read_codec.as_mut(), &mut chn_out, self.echo_target.as_ref(), None);
        recv.compact_or_clear();
        if let Err(err) = result {
            warn!(?err, "invalid encoding, closing connection");
            return false;
        }
        true
    }

    fn on_writable(&self) -> WriteOutcome {
        let mut send = self.send.lock().unwrap_or_else(PoisonError::into_inner);
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
            if encoded_len > send.scratch.capacity() {
                warn!(encoded_len, capacity = send.scratch.capacity(), "message too large for configured send buffer");
                return WriteOutcome::Close;
            }
            if encoded_len > send.scratch.spare_len() {
                send.pending_seq = Some(seq);
                break;
            }

            let result = {
                let payload = unsafe { chn_in.payload(seq) };
                send.scratch.encode_into(write_codec.as_mut(), payload.as_slice())
            };
            chn_in.release(seq);
            if let Err(err) = result {
                warn!(?err, "message failed codec validation");
                return WriteOutcome::Close;
            }
        }

        if send.scratch.is_empty() {
            return if chn_in.remaining() == 0 { WriteOutcome::Disable } else { WriteOutcome::Continue };
        }

        let mut socket = self.write_socket.lock().unwrap_or_else(PoisonError::into_inner);
        let live = send.scratch.live();
        match socket.write(live) {
            Ok(0) => WriteOutcome::Continue,
            Ok(n) => {
                self.limiter.consume(n as u32);
                send.scratch.advance_consumed(n);
                send.scratch.compact_or_clear();
                if send.scratch.is_empty() && chn_in.remaining() == 0 {
                    WriteOutcome::Disable
                } else {
                    WriteOutcome::Continue
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => WriteOutcome::Continue,
            Err(err) => {
                warn!(?err, "tcp write failed");
                WriteOutcome::Close
            }
        }
    }

    /// Validates the outbound connect and, on success, completes
    /// `connectRead` and submits the write-role registration that was
    /// deferred in `spawn` (spec.md §4.5 `connect(key)`) — using
    /// `self_handle` to recover an `Arc<Self>` since the reactor thread
    /// only ever hands processors a `&self` reference.
    fn on_connectable(&self) -> bool {
        let socket = self.read_socket.lock().unwrap_or_else(PoisonError::into_inner);
        let failed = matches!(socket.take_error(), Ok(Some(_)) | Err(_));
        drop(socket);
        if failed {
            warn!("outbound tcp connect failed");
            let err = conduit_comm::ChannelError::Io(Arc::new(io::Error::new(io::ErrorKind::ConnectionRefused, "tcp connect failed")));
            self.handles.futures.connect_read.complete(Err(err.clone()));
            self.handles.futures.connect_write.complete(Err(err));
            return false;
        }

        self.handles.futures.connect_read.complete(Ok(()));
        let registration = self.pending_write_registration.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let (Some(registration), Some(strong)) = (registration, self.self_handle.upgrade()) {
            let token = strong.handles.write_key.lock().unwrap_or_else(PoisonError::into_inner).expect("write token preallocated in spawn");
            strong.register_write_role(token, registration);
        }
        true
    }

    /// The reactor's own reaction to a dead connection (spec.md §7 "peer
    /// closed" / "local I/O error"): same teardown as an application-driven
    /// `close()`, but with no user task to run, and guarded so it only
    /// fires once no matter which side (read or write) noticed first.
    fn on_closed_by_reactor(&self) {
        if !self.handles.begin_shutdown() {
            return;
        }
        self.shutdown(Box::new(|| {}));
    }
}
