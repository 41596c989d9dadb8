//! The reactor itself tears a connection down once the peer closes while a
//! read is pending, with no explicit `close()` call on the side that
//! noticed (spec.md §7 "peer closed" / §8 seed test: "peer closes mid-read").

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use conduit_comm::RateLimiter;
use conduit_net::codec::ShortLengthCodec;
use conduit_net::{Channel, ConnectionFactories, NetworkConfig, ReactorPoolConfig, SelectorPool, TcpAcceptor};

fn factories() -> ConnectionFactories {
    ConnectionFactories {
        read_codec: Box::new(|| Box::new(ShortLengthCodec::new(4096))),
        write_codec: Box::new(|| Box::new(ShortLengthCodec::new(4096))),
        limiter: Box::new(RateLimiter::no_limit),
        config: NetworkConfig::default(),
    }
}

#[test]
fn peer_close_during_read_tears_down_without_explicit_close() {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 24813);
    let pool = Arc::new(SelectorPool::new(ReactorPoolConfig::default()).unwrap());

    let (accepted_tx, accepted_rx) = mpsc::channel::<Arc<Channel>>();
    let on_accept = Box::new(move |_addr: SocketAddr, result: Result<Arc<Channel>, conduit_comm::ChannelError>| {
        accepted_tx.send(result.expect("accept should succeed")).unwrap();
    });
    let (acceptor, bound) = TcpAcceptor::bind(pool.reactor(0), pool.clone(), bind_addr, factories(), on_accept).unwrap();
    bound.wait().unwrap();

    let client = Channel::connect_tcp(
        &pool,
        bind_addr,
        Box::new(ShortLengthCodec::new(4096)),
        Box::new(ShortLengthCodec::new(4096)),
        RateLimiter::no_limit(),
        &NetworkConfig::default(),
    )
    .unwrap();
    client.connection_future().wait().unwrap();

    let server = accepted_rx.recv_timeout(Duration::from_secs(2)).expect("server never accepted connection");
    server.connection_future().wait().unwrap();

    // The client closes without the server ever calling `close()` itself;
    // the server's read role must notice the peer's FIN on its own.
    client.close();
    client.close_future().wait().unwrap();

    let server_closed = server.close_future().wait_timeout(Duration::from_secs(2));
    assert!(server_closed.is_some(), "server channel should tear down once it notices the peer closed");
    assert!(server_closed.unwrap().is_ok());

    acceptor.close().wait().unwrap();
    pool.close().wait().unwrap();
}
