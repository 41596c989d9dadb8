//! Channel facade (spec.md §4.6): the one object application code actually
//! holds. Wraps whichever processor variant backs the connection and
//! re-exposes its buffer endpoints and lifecycle futures under one name.
//!
//! TCP and TLS channels only ever come into being already "bound" in the
//! spec's sense — a client channel is born mid-`connect()`, an accepted
//! channel is born already past the OS accept — so their `bind_future` is a
//! trivial, already-settled signal; the literal server-socket bind lives on
//! [`crate::acceptor`] instead. UDP has no separate acceptor, so `bind`/
//! `connect` are real operations performed directly on the channel, exactly
//! as spec.md §6 describes ("UDP `bind(addr)` joins the multicast group if
//! the address is multicast... `connect(addr)` similarly").

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conduit_comm::{Consumer, Producer, RateLimiter};
use mio::net::{TcpStream, UdpSocket};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};

use crate::codec::Codec;
use crate::config::NetworkConfig;
use crate::future::CompletionFuture;
use crate::processor::tcp::TcpProcessor;
use crate::processor::tls::{TlsProcessor, TlsSession};
use crate::processor::udp::UdpProcessor;
use crate::reactor::SelectorPool;

enum ChannelInner {
    Tcp(Arc<TcpProcessor>),
    Tls(Arc<TlsProcessor>),
    Udp(Arc<UdpProcessor>),
}

/// One connection's application-facing handle: buffer endpoints plus the
/// three lifecycle futures (spec.md §4.6). Owns nothing about the reactor
/// directly — every I/O-side operation is delegated to the wrapped
/// processor, which is itself registered on a reactor chosen by the
/// [`SelectorPool`] at construction time.
pub struct Channel {
    inner: ChannelInner,
    /// Wrapped in a `Mutex` purely so [`Channel::output`] can hand back a
    /// `&mut Producer` through a shared `Arc<Channel>`: every processor
    /// variant already holds its own ends of the same ring behind a lock
    /// (e.g. `TcpProcessor::chn_in`), so this adds no new contention beyond
    /// what the single application writer expects to pay.
    app_out: Mutex<Producer>,
    app_in: Option<Mutex<Consumer>>,
    bind_future: CompletionFuture,
}

fn payload_capacity(read_codec: &dyn Codec, write_codec: &dyn Codec) -> usize {
    read_codec.frame_length().max(write_codec.frame_length())
}

impl Channel {
    /// Opens an outbound TCP connection (spec.md §4.6 `connect(remote)` for
    /// the TCP/TLS shared implementation). The channel's own `bind_future`
    /// is already settled: TCP/TLS never perform a literal bind at the
    /// channel layer, only at the [`crate::acceptor`] layer.
    pub fn connect_tcp(
        pool: &SelectorPool,
        remote: SocketAddr,
        read_codec: Box<dyn Codec>,
        write_codec: Box<dyn Codec>,
        limiter: RateLimiter,
        config: &NetworkConfig,
    ) -> io::Result<Arc<Channel>> {
        let capacity = payload_capacity(read_codec.as_ref(), write_codec.as_ref());
        let reactor = pool.next_reactor();
        let provider = conduit_comm::BufferProvider::own_input(&config.buffer_provider_config(capacity));
        let conduit_comm::BufferProvider { app_out, chn_in, chn_out, app_in } = provider;

        let stream = TcpStream::connect(remote)?;
        let processor =
            TcpProcessor::spawn(reactor, stream, chn_in, chn_out, &app_out, read_codec, write_codec, limiter, config, true)?;

        Ok(Arc::new(Channel {
            inner: ChannelInner::Tcp(processor),
            app_out: Mutex::new(app_out),
            app_in: app_in.map(Mutex::new),
            bind_future: already_bound(),
        }))
    }

    /// Opens an outbound TLS connection over a fresh TCP socket (spec.md
    /// §4.6 / §4.5.2). `server_name` is the SNI/certificate-verification
    /// identity; `client_config` is the caller's already-initialized rustls
    /// config (key/trust-store loading is an external collaborator per
    /// SPEC_FULL.md §3's non-goals).
    pub fn connect_tls(
        pool: &SelectorPool,
        remote: SocketAddr,
        server_name: ServerName<'static>,
        client_config: Arc<rustls::ClientConfig>,
        read_codec: Box<dyn Codec>,
        write_codec: Box<dyn Codec>,
        limiter: RateLimiter,
        config: &NetworkConfig,
    ) -> io::Result<Arc<Channel>> {
        let capacity = payload_capacity(read_codec.as_ref(), write_codec.as_ref());
        let reactor = pool.next_reactor();
        let provider = conduit_comm::BufferProvider::own_input(&config.buffer_provider_config(capacity));
        let conduit_comm::BufferProvider { app_out, chn_in, chn_out, app_in } = provider;

        let session = ClientConnection::new(client_config, server_name)
            .map(TlsSession::Client)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let stream = TcpStream::connect(remote)?;
        let processor = TlsProcessor::spawn(
            reactor,
            stream,
            session,
            chn_in,
            chn_out,
            &app_out,
            read_codec,
            write_codec,
            limiter,
            config,
            true,
        )?;

        Ok(Arc::new(Channel {
            inner: ChannelInner::Tls(processor),
            app_out: Mutex::new(app_out),
            app_in: app_in.map(Mutex::new),
            bind_future: already_bound(),
        }))
    }

    /// Used by [`crate::acceptor::TcpAcceptor`]: wraps an already-accepted,
    /// already-registering TCP stream. Both `bind_future` and the ordinary
    /// connect path are trivial here — the OS already completed the accept.
    pub(crate) fn from_accepted_tcp(
        reactor: Arc<crate::reactor::Reactor>,
        stream: TcpStream,
        read_codec: Box<dyn Codec>,
        write_codec: Box<dyn Codec>,
        limiter: RateLimiter,
        config: &NetworkConfig,
    ) -> io::Result<Arc<Channel>> {
        let capacity = payload_capacity(read_codec.as_ref(), write_codec.as_ref());
        let provider = conduit_comm::BufferProvider::own_input(&config.buffer_provider_config(capacity));
        let conduit_comm::BufferProvider { app_out, chn_in, chn_out, app_in } = provider;
        let processor =
            TcpProcessor::spawn(reactor, stream, chn_in, chn_out, &app_out, read_codec, write_codec, limiter, config, false)?;
        Ok(Arc::new(Channel {
            inner: ChannelInner::Tcp(processor),
            app_out: Mutex::new(app_out),
            app_in: app_in.map(Mutex::new),
            bind_future: already_bound(),
        }))
    }

    /// Used by [`crate::acceptor::TlsAcceptor`]: wraps an already-accepted
    /// TCP stream and a freshly constructed server-mode TLS session.
    pub(crate) fn from_accepted_tls(
        reactor: Arc<crate::reactor::Reactor>,
        stream: TcpStream,
        session: ServerConnection,
        read_codec: Box<dyn Codec>,
        write_codec: Box<dyn Codec>,
        limiter: RateLimiter,
        config: &NetworkConfig,
    ) -> io::Result<Arc<Channel>> {
        let capacity = payload_capacity(read_codec.as_ref(), write_codec.as_ref());
        let provider = conduit_comm::BufferProvider::own_input(&config.buffer_provider_config(capacity));
        let conduit_comm::BufferProvider { app_out, chn_in, chn_out, app_in } = provider;
        let processor = TlsProcessor::spawn(
            reactor,
            stream,
            TlsSession::Server(session),
            chn_in,
            chn_out,
            &app_out,
            read_codec,
            write_codec,
            limiter,
            config,
            false,
        )?;
        Ok(Arc::new(Channel {
            inner: ChannelInner::Tls(processor),
            app_out: Mutex::new(app_out),
            app_in: app_in.map(Mutex::new),
            bind_future: already_bound(),
        }))
    }

    /// `bind(local)` for the UDP variant (spec.md §4.6 / §6): binds the
    /// socket, joining the multicast group instead of a direct bind when
    /// `local` is a multicast address, then registers the resulting socket
    /// with the pool's next reactor. There is no separate UDP acceptor:
    /// this one call is both "open" and "bind".
    pub fn bind_udp(
        pool: &SelectorPool,
        local: SocketAddr,
        read_codec: Box<dyn Codec>,
        write_codec: Box<dyn Codec>,
        limiter: RateLimiter,
        config: &NetworkConfig,
    ) -> io::Result<Arc<Channel>> {
        let capacity = payload_capacity(read_codec.as_ref(), write_codec.as_ref());
        let reactor = pool.next_reactor();
        let provider = conduit_comm::BufferProvider::own_input(&config.buffer_provider_config(capacity));
        let conduit_comm::BufferProvider { app_out, chn_in, chn_out, app_in } = provider;

        let std_socket = bind_udp_socket(local)?;
        let socket = UdpSocket::from_std(std_socket);
        let processor = UdpProcessor::spawn(reactor, socket, chn_in, chn_out, &app_out, read_codec, write_codec, limiter, config)?;

        Ok(Arc::new(Channel {
            inner: ChannelInner::Udp(processor),
            app_out: Mutex::new(app_out),
            app_in: app_in.map(Mutex::new),
            bind_future: already_bound(),
        }))
    }

    /// `connect(remote)` for the UDP variant: applies the kernel-level peer
    /// filter, or joins the multicast group if `remote` is multicast (spec.md
    /// §6). A no-op error for any non-UDP channel — TCP/TLS channels are
    /// constructed already-connected via [`Channel::connect_tcp`] /
    /// [`Channel::connect_tls`].
    pub fn connect_udp_peer(&self, remote: SocketAddr) -> io::Result<()> {
        match &self.inner {
            ChannelInner::Udp(udp) => udp.connect_peer(remote),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "connect(remote) only applies to a udp channel")),
        }
    }

    /// `getConnectionFuture()`: ready once both roles have registered (and,
    /// for TLS, the handshake itself has completed).
    pub fn connection_future(&self) -> CompletionFuture {
        match &self.inner {
            ChannelInner::Tcp(p) => p.connection_future(),
            ChannelInner::Tls(p) => p.connection_future(),
            ChannelInner::Udp(p) => p.connection_future(),
        }
    }

    /// `getCloseFuture()`: ready once shutdown and both cancellations
    /// complete.
    pub fn close_future(&self) -> CompletionFuture {
        match &self.inner {
            ChannelInner::Tcp(p) => p.close_future(),
            ChannelInner::Tls(p) => p.close_future(),
            ChannelInner::Udp(p) => p.close_future(),
        }
    }

    /// `bind_future`: already settled for TCP/TLS (see module docs); settled
    /// synchronously at construction for UDP, since `bind_udp` performs the
    /// actual bind before the channel even exists.
    pub fn bind_future(&self) -> CompletionFuture {
        self.bind_future.clone()
    }

    /// `getOutputBuffer()`: the ring/lock+condition producer the
    /// application writes outbound messages into. Returns a guard rather
    /// than a bare reference since `acquire`/`release` need `&mut Producer`
    /// even though only one application thread is expected to hold it at a
    /// time.
    pub fn output(&self) -> MutexGuard<'_, Producer> {
        self.app_out.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `getInputBuffer()`: `None` only for a channel built over a
    /// shared-input [`conduit_comm::BufferProviderConfig`], where inbound
    /// frames are consumed from the fan-in group instead.
    pub fn input(&self) -> Option<MutexGuard<'_, Consumer>> {
        self.app_in.as_ref().map(|m| m.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// `close()`: asynchronous (spec.md §5 "Cancellation"). Submits the
    /// shutdown command and returns immediately; observe completion via
    /// [`Channel::close_future`].
    pub fn close(&self) {
        match &self.inner {
            ChannelInner::Tcp(p) => p.close(Box::new(|| {})),
            ChannelInner::Tls(p) => p.close(Box::new(|| {})),
            ChannelInner::Udp(p) => p.close(Box::new(|| {})),
        }
    }
}

fn already_bound() -> CompletionFuture {
    let future = CompletionFuture::new();
    future.complete(Ok(()));
    future
}

/// Binds a fresh UDP socket at `local`, joining its multicast group instead
/// of a direct bind when the address is multicast (spec.md §6).
fn bind_udp_socket(local: SocketAddr) -> io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Socket, Type};

    let domain = if local.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;

    if local.ip().is_multicast() {
        let unspecified = match local {
            SocketAddr::V4(v4) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), v4.port()),
            SocketAddr::V6(v6) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), v6.port()),
        };
        socket.bind(&unspecified.into())?;
        join_multicast(&socket, local.ip())?;
    } else {
        socket.bind(&local.into())?;
    }

    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn join_multicast(socket: &socket2::Socket, group: IpAddr) -> io::Result<()> {
    match group {
        IpAddr::V4(v4) => socket.join_multicast_v4(&v4, &Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(v6) => socket.join_multicast_v6(&v6, 0),
    }
}

/// Shared by [`Channel::bind_udp`]'s bind-time join and
/// [`UdpProcessor::connect_peer`]'s connect-time join: `connect()` the
/// kernel peer filter for a unicast remote, or join the multicast group
/// instead when `remote` is a multicast address (spec.md §6 "`connect(addr)`
/// similarly joins-if-multicast or connects-if-unicast").
pub(crate) fn connect_or_join_multicast(socket: &UdpSocket, remote: SocketAddr) -> io::Result<()> {
    if remote.ip().is_multicast() {
        let borrowed = unsafe { socket2::Socket::from_raw_fd(socket.as_raw_fd()) };
        let result = join_multicast(&borrowed, remote.ip());
        std::mem::forget(borrowed);
        result
    } else {
        socket.connect(remote)
    }
}
