//! TCP relay for established SOCKS sessions
//!
//! Splices the inbound client connection with the outbound target
//! connection. Each direction is copied independently; when one direction
//! reaches end-of-stream the peer's write half is shut down and the other
//! direction gets a bounded grace period before both legs are dropped.

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Grace period for a peer to finish after its connection was ended
pub const END_CONNECTION_TIMEOUT: Duration = Duration::from_secs(3);

/// Default copy buffer size for each relay direction
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes relayed in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to target
    pub sent: u64,
    /// Target to client
    pub received: u64,
}

/// Gracefully end a connection
///
/// Flushes pending writes and sends end-of-stream. Gives up after
/// [`END_CONNECTION_TIMEOUT`]; the caller then drops the connection.
pub async fn end_connection<W>(writer: &mut W)
where
    W: AsyncWrite + Unpin + ?Sized,
{
    match tokio::time::timeout(END_CONNECTION_TIMEOUT, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to end connection: {}", e),
        Err(_) => warn!(
            "Connection did not end within {:?}, forcing close",
            END_CONNECTION_TIMEOUT
        ),
    }
}

/// Relay data bidirectionally between two streams
///
/// Returns once both directions finished, or once the grace period after
/// the first finished direction expired. Both streams are dropped on return.
pub async fn relay<A, B>(inbound: A, outbound: B, buffer_size: usize) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let buffer_size = buffer_size.max(1);
    let (in_read, mut in_write) = tokio::io::split(inbound);
    let (out_read, mut out_write) = tokio::io::split(outbound);
    let mut in_read = BufReader::with_capacity(buffer_size, in_read);
    let mut out_read = BufReader::with_capacity(buffer_size, out_read);

    let upstream = async {
        let result = tokio::io::copy_buf(&mut in_read, &mut out_write).await;
        end_connection(&mut out_write).await;
        direction_bytes("client -> target", result)
    };
    let downstream = async {
        let result = tokio::io::copy_buf(&mut out_read, &mut in_write).await;
        end_connection(&mut in_write).await;
        direction_bytes("target -> client", result)
    };
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let mut stats = RelayStats::default();
    tokio::select! {
        sent = &mut upstream => {
            stats.sent = sent;
            match tokio::time::timeout(END_CONNECTION_TIMEOUT, &mut downstream).await {
                Ok(received) => stats.received = received,
                Err(_) => debug!("Target did not finish within grace period, closing"),
            }
        }
        received = &mut downstream => {
            stats.received = received;
            match tokio::time::timeout(END_CONNECTION_TIMEOUT, &mut upstream).await {
                Ok(sent) => stats.sent = sent,
                Err(_) => debug!("Client did not finish within grace period, closing"),
            }
        }
    }

    stats
}

fn direction_bytes(direction: &str, result: std::io::Result<u64>) -> u64 {
    match result {
        Ok(bytes) => {
            debug!("{} finished: {} bytes", direction, bytes);
            bytes
        }
        Err(e) => {
            debug!("{} error: {}", direction, e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_relay_echo_both_directions() {
        let (mut client, inbound) = duplex(1024);
        let (outbound, mut target) = duplex(1024);

        let relay_handle = tokio::spawn(relay(inbound, outbound, 16));

        client.write_all(b"hello from client").await.unwrap();
        let mut buf = [0u8; 17];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from client");

        target.write_all(b"hello from target").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello from target");

        drop(client);
        drop(target);

        let stats = tokio::time::timeout(Duration::from_secs(1), relay_handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.sent, 17);
        assert_eq!(stats.received, 17);
    }

    #[tokio::test]
    async fn test_relay_half_close_keeps_other_direction() {
        let (mut client, inbound) = duplex(1024);
        let (outbound, mut target) = duplex(1024);

        let relay_handle = tokio::spawn(relay(inbound, outbound, 1024));

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        target.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        target.write_all(b"response").await.unwrap();
        drop(target);

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response");

        let stats = relay_handle.await.unwrap();
        assert_eq!(stats, RelayStats { sent: 7, received: 8 });
    }

    #[tokio::test]
    async fn test_relay_target_end_closes_idle_client() {
        let (mut client, inbound) = duplex(1024);
        let (outbound, target) = duplex(1024);

        let started = Instant::now();
        let relay_handle = tokio::spawn(relay(inbound, outbound, 1024));
        drop(target);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(1), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(END_CONNECTION_TIMEOUT + Duration::from_secs(2), relay_handle)
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < END_CONNECTION_TIMEOUT + Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_end_connection_sends_eof() {
        let (mut a, mut b) = duplex(64);
        a.write_all(b"bye").await.unwrap();
        end_connection(&mut a).await;

        let mut buf = Vec::new();
        b.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");
    }
}
