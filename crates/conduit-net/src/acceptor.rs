//! Key Acceptor (spec.md §4.4): the server-socket half of the system. Each
//! acceptor owns one listening socket registered on one reactor's ACCEPT
//! role; every connection it accepts is handed off to the *pool's* next
//! reactor via round-robin, not necessarily the one the listener itself
//! lives on.

use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use conduit_comm::RateLimiter;
use mio::net::TcpListener;
use rustls::ServerConnection;
use tracing::{error, warn};

use crate::channel::Channel;
use crate::codec::Codec;
use crate::config::NetworkConfig;
use crate::future::CompletionFuture;
use crate::processor::duplicate_tcp_listener;
use crate::reactor::command::IoSource;
use crate::reactor::{Acceptor, Reactor, SelectorPool};

/// Per-connection construction recipe handed to an acceptor: fresh codec and
/// rate-limiter instances for each accepted socket (spec.md §9 "Factory
/// callbacks for codec/limiter/provider: pass as move-once constructors;
/// each accept produces a fresh instance"), plus the network config every
/// accepted channel is built with.
pub struct ConnectionFactories {
    pub read_codec: Box<dyn Fn() -> Box<dyn Codec> + Send + Sync>,
    pub write_codec: Box<dyn Fn() -> Box<dyn Codec> + Send + Sync>,
    pub limiter: Box<dyn Fn() -> RateLimiter + Send + Sync>,
    pub config: NetworkConfig,
}

/// As [`ConnectionFactories`], plus the server-mode rustls config every
/// accepted socket's TLS engine is constructed from. Key/trust-store
/// loading is the caller's concern (SPEC_FULL.md §3's non-goals); this only
/// needs an already-initialized `Arc<rustls::ServerConfig>`.
pub struct TlsConnectionFactories {
    pub inner: ConnectionFactories,
    pub server_config: Arc<rustls::ServerConfig>,
}

/// Runs a user-supplied `onAccept` callback, catching and logging a panic
/// instead of bringing down the ACCEPT thread (spec.md §7: "an uncaught
/// exception in a user-supplied handler must be caught by the dispatching
/// thread... and forwarded to standard error without killing the thread").
fn dispatch_on_accept(on_accept: &(dyn Fn(SocketAddr, Result<Arc<Channel>, conduit_comm::ChannelError>) + Send + Sync), addr: SocketAddr, result: Result<Arc<Channel>, conduit_comm::ChannelError>) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| on_accept(addr, result))) {
        eprintln!("panic in onAccept handler: {panic:?}");
    }
}

/// Plain-TCP server socket lifecycle (spec.md §4.4).
pub struct TcpAcceptor {
    accept_reactor: Arc<Reactor>,
    pool: Arc<SelectorPool>,
    /// The acceptor's own handle, kept so `close()` can run the user task
    /// against it; the registered clone handed to the ACCEPT thread is a
    /// separate descriptor over the same kernel socket.
    listener: Mutex<TcpListener>,
    token: Mutex<Option<mio::Token>>,
    factories: ConnectionFactories,
    on_accept: Box<dyn Fn(SocketAddr, Result<Arc<Channel>, conduit_comm::ChannelError>) + Send + Sync>,
}

impl TcpAcceptor {
    /// Binds `local`, registers the listener on `accept_reactor`'s ACCEPT
    /// role, and returns the acceptor alongside its bind future (spec.md
    /// §4.4 "Bind"). Accepted connections are routed across `pool`, which
    /// need not be the same pool `accept_reactor` came from a priori, but in
    /// practice always is.
    pub fn bind(
        accept_reactor: Arc<Reactor>,
        pool: Arc<SelectorPool>,
        local: SocketAddr,
        factories: ConnectionFactories,
        on_accept: Box<dyn Fn(SocketAddr, Result<Arc<Channel>, conduit_comm::ChannelError>) + Send + Sync>,
    ) -> io::Result<(Arc<Self>, CompletionFuture)> {
        let listener = TcpListener::bind(local)?;
        let registered = duplicate_tcp_listener(&listener)?;
        let token = accept_reactor.next_token();

        let acceptor = Arc::new(Self {
            accept_reactor: accept_reactor.clone(),
            pool,
            listener: Mutex::new(listener),
            token: Mutex::new(Some(token)),
            factories,
            on_accept,
        });

        let as_acceptor: Arc<dyn Acceptor> = acceptor.clone();
        let bound = accept_reactor.bind(IoSource::TcpListener(registered), token, as_acceptor);
        Ok((acceptor, bound))
    }

    /// Submits a cancel command for the listening key and closes the
    /// underlying socket from the user task it runs (spec.md §4.4 "Close").
    pub fn close(&self) -> CompletionFuture {
        let Some(token) = self.token.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            let already = CompletionFuture::new();
            already.complete(Ok(()));
            return already;
        };
        self.accept_reactor.cancel_accept(token, Some(Box::new(|| {})))
    }
}

impl Acceptor for TcpAcceptor {
    /// Accept-loop-until-would-block: keeps calling `accept()` on the
    /// ACCEPT thread until the kernel has nothing left to hand back,
    /// exactly the style `TcpConnector`'s listener branch uses.
    fn accept_ready(&self) {
        loop {
            let accepted = {
                let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
                listener.accept()
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "tcp accept failed");
                    return;
                }
            };

            let read_codec = (self.factories.read_codec)();
            let write_codec = (self.factories.write_codec)();
            let limiter = (self.factories.limiter)();
            let reactor = self.pool.next_reactor();

            match Channel::from_accepted_tcp(reactor, stream, read_codec, write_codec, limiter, &self.factories.config) {
                Ok(channel) => {
                    // Brief block for the child's connect future (spec.md
                    // §4.4): for plain TCP this resolves almost immediately
                    // once both roles register.
                    match channel.connection_future().wait() {
                        Ok(()) => dispatch_on_accept(self.on_accept.as_ref(), peer_addr, Ok(channel)),
                        Err(err) => {
                            channel.close();
                            dispatch_on_accept(self.on_accept.as_ref(), peer_addr, Err(err));
                        }
                    }
                }
                Err(err) => {
                    error!(?err, "failed to register accepted tcp connection");
                    dispatch_on_accept(self.on_accept.as_ref(), peer_addr, Err(err.into()));
                }
            }
        }
    }
}

/// TLS server socket lifecycle (spec.md §4.4, with the TLS carve-out: "for
/// TLS this returns only after handshake").
pub struct TlsAcceptor {
    accept_reactor: Arc<Reactor>,
    pool: Arc<SelectorPool>,
    listener: Mutex<TcpListener>,
    token: Mutex<Option<mio::Token>>,
    factories: TlsConnectionFactories,
    on_accept: Box<dyn Fn(SocketAddr, Result<Arc<Channel>, conduit_comm::ChannelError>) + Send + Sync>,
}

impl TlsAcceptor {
    pub fn bind(
        accept_reactor: Arc<Reactor>,
        pool: Arc<SelectorPool>,
        local: SocketAddr,
        factories: TlsConnectionFactories,
        on_accept: Box<dyn Fn(SocketAddr, Result<Arc<Channel>, conduit_comm::ChannelError>) + Send + Sync>,
    ) -> io::Result<(Arc<Self>, CompletionFuture)> {
        let listener = TcpListener::bind(local)?;
        let registered = duplicate_tcp_listener(&listener)?;
        let token = accept_reactor.next_token();

        let acceptor = Arc::new(Self {
            accept_reactor: accept_reactor.clone(),
            pool,
            listener: Mutex::new(listener),
            token: Mutex::new(Some(token)),
            factories,
            on_accept,
        });

        let as_acceptor: Arc<dyn Acceptor> = acceptor.clone();
        let bound = accept_reactor.bind(IoSource::TcpListener(registered), token, as_acceptor);
        Ok((acceptor, bound))
    }

    pub fn close(&self) -> CompletionFuture {
        let Some(token) = self.token.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            let already = CompletionFuture::new();
            already.complete(Ok(()));
            return already;
        };
        self.accept_reactor.cancel_accept(token, Some(Box::new(|| {})))
    }
}

impl Acceptor for TlsAcceptor {
    fn accept_ready(&self) {
        loop {
            let accepted = {
                let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
                listener.accept()
            };
            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "tls accept failed");
                    return;
                }
            };

            let session = match ServerConnection::new(self.factories.server_config.clone()) {
                Ok(session) => session,
                Err(err) => {
                    error!(?err, "failed to construct tls server session for accepted connection");
                    dispatch_on_accept(
                        self.on_accept.as_ref(),
                        peer_addr,
                        Err(conduit_comm::ChannelError::Io(Arc::new(io::Error::new(io::ErrorKind::Other, err)))),
                    );
                    continue;
                }
            };

            let read_codec = (self.factories.inner.read_codec)();
            let write_codec = (self.factories.inner.write_codec)();
            let limiter = (self.factories.inner.limiter)();
            let reactor = self.pool.next_reactor();

            match Channel::from_accepted_tls(reactor, stream, session, read_codec, write_codec, limiter, &self.factories.inner.config) {
                Ok(channel) => {
                    // Blocks until the handshake itself completes, per
                    // spec.md §4.4's explicit TLS carve-out.
                    match channel.connection_future().wait() {
                        Ok(()) => dispatch_on_accept(self.on_accept.as_ref(), peer_addr, Ok(channel)),
                        Err(err) => {
                            channel.close();
                            dispatch_on_accept(self.on_accept.as_ref(), peer_addr, Err(err));
                        }
                    }
                }
                Err(err) => {
                    error!(?err, "failed to register accepted tls connection");
                    dispatch_on_accept(self.on_accept.as_ref(), peer_addr, Err(err.into()));
                }
            }
        }
    }
}
