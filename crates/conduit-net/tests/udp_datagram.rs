//! UDP datagram exchange between two bound channels, including the
//! channel-level `connect(remote)` peer filter (spec.md §4.5.3, §6).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use conduit_comm::{Attachment, HandoffBuffer, RateLimiter};
use conduit_net::codec::ShortLengthCodec;
use conduit_net::{Channel, NetworkConfig, ReactorPoolConfig, SelectorPool};

#[test]
fn udp_datagrams_round_trip_with_peer_attachment() {
    let addr_a = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 24815);
    let addr_b = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 24816);
    let pool = Arc::new(SelectorPool::new(ReactorPoolConfig::default()).unwrap());

    let channel_a = Channel::bind_udp(
        &pool,
        addr_a,
        Box::new(ShortLengthCodec::new(1024)),
        Box::new(ShortLengthCodec::new(1024)),
        RateLimiter::no_limit(),
        &NetworkConfig::default(),
    )
    .unwrap();
    let channel_b = Channel::bind_udp(
        &pool,
        addr_b,
        Box::new(ShortLengthCodec::new(1024)),
        Box::new(ShortLengthCodec::new(1024)),
        RateLimiter::no_limit(),
        &NetworkConfig::default(),
    )
    .unwrap();
    channel_a.connection_future().wait().unwrap();
    channel_b.connection_future().wait().unwrap();

    // Restrict channel_a's socket to only ever talk to channel_b (spec.md §6
    // `connect(remote)`); a plain unicast peer, so this is a kernel
    // `connect()` rather than a multicast join.
    channel_a.connect_udp_peer(addr_b).unwrap();

    {
        let mut out = channel_a.output();
        let seq = out.acquire(1).unwrap();
        unsafe { out.payload(seq).extend_from_slice(b"ping") };
        out.attach(seq, Attachment::PeerAddr(addr_b));
        out.release(seq);
    }

    let (body, attachment) = {
        let mut input = channel_b.input().expect("own-input channel always has an input buffer");
        let seq = input.acquire(1).unwrap();
        let body = unsafe { input.payload(seq).as_slice() }.to_vec();
        let attachment = input.attachment(seq);
        input.release(seq);
        (body, attachment)
    };
    assert_eq!(body, b"ping");
    assert_eq!(attachment.peer_addr(), Some(addr_a));

    channel_a.close();
    channel_b.close();
    channel_a.close_future().wait_timeout(Duration::from_secs(2)).expect("channel_a close timed out").unwrap();
    channel_b.close_future().wait_timeout(Duration::from_secs(2)).expect("channel_b close timed out").unwrap();
    pool.close().wait().unwrap();
}
