//! In-band TLS upgrade negotiation
//!
//! Clients of some TCP protocols (PostgreSQL among them) open with an
//! 8-byte request asking whether the server speaks TLS. The tunnel answers
//! `S` and performs the handshake itself.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

use crate::error::{FedError, Result};
use crate::network::BoxStream;

/// PostgreSQL SSLRequest: length 8, code 80877103
pub const SSL_REQUEST: [u8; 8] = [0x00, 0x00, 0x00, 0x08, 0x04, 0xd2, 0x16, 0x2f];

/// Byte sent to accept the upgrade
pub const SSL_ACCEPT: u8 = b'S';

/// Bound on the TLS handshake after the upgrade was accepted
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound on reading the upgrade request itself
pub const UPGRADE_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Negotiate TLS on a fresh connection.
///
/// Returns `None` when the client did not open with an upgrade request;
/// the caller closes the connection without replying.
pub async fn upgrade(tcp: TcpStream, acceptor: &TlsAcceptor) -> Result<Option<BoxStream>> {
    upgrade_with_deadline(tcp, acceptor, UPGRADE_READ_TIMEOUT).await
}

/// [`upgrade`] with the wait for the 8-byte request bounded by `deadline`
pub async fn upgrade_with_deadline(
    mut tcp: TcpStream,
    acceptor: &TlsAcceptor,
    deadline: Duration,
) -> Result<Option<BoxStream>> {
    let mut header = [0u8; 8];
    let first = tokio::time::timeout(deadline, async {
        tcp.read_exact(&mut header[..1]).await?;
        if header[0] != 0 {
            return Ok::<_, std::io::Error>(false);
        }
        tcp.read_exact(&mut header[1..]).await?;
        Ok(true)
    })
    .await
    .map_err(|_| FedError::Timeout(format!("upgrade request not read within {:?}", deadline)))??;

    if !first {
        debug!("First byte {:#04x} is not an upgrade request", header[0]);
        return Ok(None);
    }
    if header == SSL_REQUEST {
        debug!("PostgreSQL SSLRequest received");
    } else {
        debug!("Upgrade request {:02x?}", header);
    }

    tcp.write_all(&[SSL_ACCEPT]).await?;
    tcp.flush().await?;

    let tls = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp))
        .await
        .map_err(|_| FedError::Timeout("TLS handshake".to_string()))?
        .map_err(|e| FedError::TlsHandshake(e.to_string()))?;

    Ok(Some(Box::new(tls)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::server_config_from_pem;
    use tokio::net::TcpListener;

    fn acceptor() -> TlsAcceptor {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let config = server_config_from_pem(
            certified.cert.pem().as_bytes(),
            certified.key_pair.serialize_pem().as_bytes(),
        )
        .unwrap();
        TlsAcceptor::from(config)
    }

    async fn connected() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_stalled_upgrade_request_times_out() {
        let acceptor = acceptor();

        // half an SSLRequest, then nothing
        let (mut client, server) = connected().await;
        client.write_all(&SSL_REQUEST[..4]).await.unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            upgrade_with_deadline(server, &acceptor, Duration::from_millis(100)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(FedError::Timeout(_))));

        // a client that never speaks
        let (_silent, server) = connected().await;
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            upgrade_with_deadline(server, &acceptor, Duration::from_millis(100)),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(FedError::Timeout(_))));
        drop(client);
    }

    #[tokio::test]
    async fn test_plain_first_byte_is_not_upgraded() {
        let acceptor = acceptor();
        let (mut client, server) = connected().await;
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let result = upgrade_with_deadline(server, &acceptor, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
