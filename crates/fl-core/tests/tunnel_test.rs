//! End-to-end tunnel data path:
//! client -> TunnelListener -> peer stream -> TunnelIngress -> echo server

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use fl_core::network::Transport;
use fl_core::tls::server_config_from_pem;
use fl_core::tunnel::SSL_REQUEST;
use fl_core::{MemoryHub, MemoryRegistry, PeerId, TunnelIngress, TunnelListener, TUNNEL_PROTOCOL};

/// Echo server on an ephemeral port
async fn start_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut r, mut w) = socket.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

struct Lane {
    listener_addr: String,
    stats: Arc<fl_core::tunnel::ProxyStats>,
    closer: CancellationToken,
}

async fn start_lane(tls: Option<Arc<rustls::ServerConfig>>) -> Lane {
    let hub = MemoryHub::new();
    let (a, b) = (PeerId::random(), PeerId::random());
    let ta = hub.join(a, None);
    let tb = hub.join(b, None);
    hub.link(&a, &b);
    ta.add_addresses(b, tb.listen_addrs()).await.unwrap();

    let target = start_echo_server().await;
    let ingress = Arc::new(TunnelIngress::new(target, Arc::new(MemoryRegistry::new())));
    let incoming = tb.accept(TUNNEL_PROTOCOL).unwrap();
    tokio::spawn(ingress.serve(incoming, CancellationToken::new()));

    let listener = TunnelListener::bind("127.0.0.1:0", Arc::new(ta), b, TUNNEL_PROTOCOL, tls)
        .await
        .unwrap();
    let lane = Lane {
        listener_addr: listener.local_addr().to_string(),
        stats: listener.stats(),
        closer: listener.closer(),
    };
    tokio::spawn(listener.run());
    lane
}

#[tokio::test]
async fn test_plain_tunnel_echo() {
    let lane = start_lane(None).await;

    let mut client = TcpStream::connect(&lane.listener_addr).await.unwrap();
    client.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"hello through the tunnel");
    drop(client);

    // wait for the bridge to wind down and the counters to settle
    timeout(Duration::from_secs(5), async {
        while lane.stats.snapshot().connections_active > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    let stats = lane.stats.snapshot();
    assert_eq!(stats.connections_total, 1);
    assert_eq!(stats.bytes_sent, 24);

    lane.closer.cancel();
}

#[tokio::test]
async fn test_tls_upgrade_after_ssl_request() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let server = server_config_from_pem(
        certified.cert.pem().as_bytes(),
        certified.key_pair.serialize_pem().as_bytes(),
    )
    .unwrap();
    let lane = start_lane(Some(server)).await;

    let mut tcp = TcpStream::connect(&lane.listener_addr).await.unwrap();
    tcp.write_all(&SSL_REQUEST).await.unwrap();
    let mut answer = [0u8; 1];
    tcp.read_exact(&mut answer).await.unwrap();
    assert_eq!(answer[0], b'S');

    let mut roots = RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let mut tls = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();

    tls.write_all(b"secret").await.unwrap();
    let mut buf = [0u8; 6];
    timeout(Duration::from_secs(5), tls.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"secret");
}

#[tokio::test]
async fn test_tls_lane_closes_plain_clients() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let server = server_config_from_pem(
        certified.cert.pem().as_bytes(),
        certified.key_pair.serialize_pem().as_bytes(),
    )
    .unwrap();
    let lane = start_lane(Some(server)).await;

    let mut tcp = TcpStream::connect(&lane.listener_addr).await.unwrap();
    tcp.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
    let mut buf = Vec::new();
    let n = timeout(Duration::from_secs(5), tcp.read_to_end(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_closed_listener_refuses_connections() {
    let lane = start_lane(None).await;
    lane.closer.cancel();

    timeout(Duration::from_secs(5), async {
        while TcpStream::connect(&lane.listener_addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}
