//! TLS handshake plus a 512-frame echo over the encrypted channel (spec.md
//! §4.5.2, §8 seed test: "TLS echo of 512 frames").

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

use conduit_comm::{HandoffBuffer, RateLimiter};
use conduit_net::codec::ShortLengthCodec;
use conduit_net::{Channel, ConnectionFactories, NetworkConfig, ReactorPoolConfig, SelectorPool, TlsAcceptor, TlsConnectionFactories};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};

const FRAME_COUNT: usize = 512;

fn install_crypto_provider_once() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        rustls::crypto::ring::default_provider().install_default().expect("install default rustls crypto provider");
    });
}

fn self_signed_localhost_cert() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let certificate = params.self_signed(&key_pair).unwrap();
    let cert_der = certificate.der().clone();
    let key_der: PrivateKeyDer<'static> = PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into();
    (cert_der, key_der)
}

#[test]
fn tls_echoes_512_frames() {
    install_crypto_provider_once();
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 24817);
    let pool = Arc::new(SelectorPool::new(ReactorPoolConfig::default()).unwrap());

    let (cert_der, key_der) = self_signed_localhost_cert();

    let server_config = Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der.clone()], key_der)
            .unwrap(),
    );
    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client_config =
        Arc::new(rustls::ClientConfig::builder().with_root_certificates(roots).with_no_client_auth());

    let inner = ConnectionFactories {
        read_codec: Box::new(|| Box::new(ShortLengthCodec::new(256))),
        write_codec: Box::new(|| Box::new(ShortLengthCodec::new(256))),
        limiter: Box::new(RateLimiter::no_limit),
        config: NetworkConfig::default(),
    };
    let tls_factories = TlsConnectionFactories { inner, server_config };

    let (accepted_tx, accepted_rx) = mpsc::channel::<Arc<Channel>>();
    let on_accept = Box::new(move |_addr: SocketAddr, result: Result<Arc<Channel>, conduit_comm::ChannelError>| {
        accepted_tx.send(result.expect("tls accept should succeed")).unwrap();
    });
    let (acceptor, bound) =
        TlsAcceptor::bind(pool.reactor(0), pool.clone(), bind_addr, tls_factories, on_accept).unwrap();
    bound.wait().unwrap();

    let server_name = ServerName::try_from("localhost").unwrap().to_owned();
    let client = Channel::connect_tls(
        &pool,
        bind_addr,
        server_name,
        client_config,
        Box::new(ShortLengthCodec::new(256)),
        Box::new(ShortLengthCodec::new(256)),
        RateLimiter::no_limit(),
        &NetworkConfig::default(),
    )
    .unwrap();
    client.connection_future().wait().unwrap();

    let server = accepted_rx.recv_timeout(Duration::from_secs(5)).expect("server never accepted tls connection");
    server.connection_future().wait().unwrap();

    let echo_server = server.clone();
    let echoed = thread::spawn(move || {
        for _ in 0..FRAME_COUNT {
            let mut input = echo_server.input().expect("own-input channel always has an input buffer");
            let seq = input.acquire(1).unwrap();
            let body = unsafe { input.payload(seq).as_slice() }.to_vec();
            input.release(seq);
            drop(input);

            let mut out = echo_server.output();
            let seq = out.acquire(1).unwrap();
            unsafe { out.payload(seq).extend_from_slice(&body) };
            out.release(seq);
        }
    });

    for i in 0..FRAME_COUNT {
        let frame = format!("frame-{i}").into_bytes();
        {
            let mut out = client.output();
            let seq = out.acquire(1).unwrap();
            unsafe { out.payload(seq).extend_from_slice(&frame) };
            out.release(seq);
        }
        let mut input = client.input().expect("own-input channel always has an input buffer");
        let seq = input.acquire(1).unwrap();
        let body = unsafe { input.payload(seq).as_slice() }.to_vec();
        input.release(seq);
        assert_eq!(body, frame, "frame {i} echoed back out of order or corrupted");
    }

    echoed.join().unwrap();

    client.close();
    server.close();
    client.close_future().wait().unwrap();
    server.close_future().wait().unwrap();
    acceptor.close().wait().unwrap();
    pool.close().wait().unwrap();
}
