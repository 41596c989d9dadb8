//! A tight per-connection [`RateLimiter`] measurably slows a transfer down
//! (spec.md §6 "Rate Limiter" / §8 seed test: "rate-limited TCP transfer
//! takes at least as long as the token bucket demands").

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use conduit_comm::{HandoffBuffer, RateLimiter};
use conduit_net::codec::ShortLengthCodec;
use conduit_net::{Channel, ConnectionFactories, NetworkConfig, ReactorPoolConfig, SelectorPool, TcpAcceptor};

const MESSAGE_LEN: usize = 8_000;
const MESSAGE_COUNT: usize = 6;
const RATE_BYTES_PER_SEC: u32 = 40_000;
const BURST_BYTES: u32 = 8_000;

fn factories(limiter: RateLimiter) -> ConnectionFactories {
    ConnectionFactories {
        read_codec: Box::new(|| Box::new(ShortLengthCodec::new(MESSAGE_LEN))),
        write_codec: Box::new(|| Box::new(ShortLengthCodec::new(MESSAGE_LEN))),
        limiter: Box::new(move || limiter.clone()),
        config: NetworkConfig::default(),
    }
}

#[test]
fn rate_limited_transfer_takes_at_least_the_token_bucket_time() {
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 24814);
    let pool = Arc::new(SelectorPool::new(ReactorPoolConfig::default()).unwrap());

    let limiter = RateLimiter::bytes_per_sec(RATE_BYTES_PER_SEC, BURST_BYTES);
    let (accepted_tx, accepted_rx) = mpsc::channel::<Arc<Channel>>();
    let on_accept = Box::new(move |_addr: SocketAddr, result: Result<Arc<Channel>, conduit_comm::ChannelError>| {
        accepted_tx.send(result.expect("accept should succeed")).unwrap();
    });
    let (acceptor, bound) =
        TcpAcceptor::bind(pool.reactor(0), pool.clone(), bind_addr, factories(limiter), on_accept).unwrap();
    bound.wait().unwrap();

    let client = Channel::connect_tcp(
        &pool,
        bind_addr,
        Box::new(ShortLengthCodec::new(MESSAGE_LEN)),
        Box::new(ShortLengthCodec::new(MESSAGE_LEN)),
        RateLimiter::no_limit(),
        &NetworkConfig::default(),
    )
    .unwrap();
    client.connection_future().wait().unwrap();
    let server = accepted_rx.recv_timeout(Duration::from_secs(2)).expect("server never accepted connection");
    server.connection_future().wait().unwrap();

    let start = Instant::now();
    {
        let mut out = client.output();
        for i in 0..MESSAGE_COUNT {
            let seq = out.acquire(1).unwrap();
            unsafe { out.payload(seq).extend_from_slice(&vec![i as u8; MESSAGE_LEN]) };
            out.release(seq);
        }
    }

    let mut input = server.input().expect("own-input channel always has an input buffer");
    for i in 0..MESSAGE_COUNT {
        let seq = input.acquire(1).unwrap();
        let body = unsafe { input.payload(seq).as_slice() }.to_vec();
        input.release(seq);
        assert_eq!(body, vec![i as u8; MESSAGE_LEN]);
    }
    let elapsed = start.elapsed();
    drop(input);

    let total_bytes = (MESSAGE_COUNT * MESSAGE_LEN) as u64;
    let expected_min = Duration::from_secs_f64((total_bytes - u64::from(BURST_BYTES)) as f64 / f64::from(RATE_BYTES_PER_SEC));
    assert!(
        elapsed >= expected_min.mul_f64(0.5),
        "transfer of {total_bytes} bytes at {RATE_BYTES_PER_SEC} B/s finished in {elapsed:?}, expected at least ~{expected_min:?}"
    );

    client.close();
    server.close();
    client.close_future().wait().unwrap();
    server.close_future().wait().unwrap();
    acceptor.close().wait().unwrap();
    pool.close().wait().unwrap();
}
