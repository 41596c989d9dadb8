//! TCP client/server exchange over a plain accepted connection (spec.md §8
//! seed test 1: "TCP echo round trip").

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;

use conduit_comm::{HandoffBuffer, RateLimiter};
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
fn tcp_roundtrip() {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 24811);
    let pool = Arc::new(SelectorPool::new(ReactorPoolConfig::default()).unwrap());

    let (accepted_tx, accepted_rx) = mpsc::channel::<Arc<Channel>>();
    let on_accept = Box::new(move |_addr: SocketAddr, result: Result<Arc<Channel>, conduit_comm::ChannelError>| {
        accepted_tx.send(result.expect("accept should succeed")).unwrap();
    });

    let (acceptor, bound) = TcpAcceptor::bind(pool.reactor(0), pool.clone(), bind_addr, factories(), on_accept).unwrap();
    bound.wait().unwrap();

    let client = Channel::connect_tcp(&pool, bind_addr, Box::new(ShortLengthCodec::new(4096)), Box::new(ShortLengthCodec::new(4096)), RateLimiter::no_limit(), &NetworkConfig::default()).unwrap();
    client.connection_future().wait().unwrap();

    let server = accepted_rx.recv_timeout(Duration::from_secs(2)).expect("server never accepted connection");
    server.connection_future().wait().unwrap();

    {
        let mut out = client.output();
        let seq = out.acquire(1).unwrap();
        unsafe { out.payload(seq).extend_from_slice(b"hello server") };
        out.release(seq);
    }

    let received = {
        let mut input = server.input().expect("own-input channel always has an input buffer");
        let seq = input.acquire(1).unwrap();
        let bytes = unsafe { input.payload(seq).as_slice() }.to_vec();
        input.release(seq);
        bytes
    };
    assert_eq!(received, b"hello server");

    {
        let mut out = server.output();
        let seq = out.acquire(1).unwrap();
        unsafe { out.payload(seq).extend_from_slice(b"hello client") };
        out.release(seq);
    }

    let reply = {
        let mut input = client.input().expect("own-input channel always has an input buffer");
        let seq = input.acquire(1).unwrap();
        let bytes = unsafe { input.payload(seq).as_slice() }.to_vec();
        input.release(seq);
        bytes
    };
    assert_eq!(reply, b"hello client");

    client.close();
    server.close();
    client.close_future().wait().unwrap();
    server.close_future().wait().unwrap();

    acceptor.close().wait().unwrap();
    pool.close().wait().unwrap();
}
