//! Bidirectional byte relay for CONNECT tunnels.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy buffer size per direction.
const RELAY_BUFFER_SIZE: usize = 8192;

/// Bytes moved by a finished tunnel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Client to server.
    pub bytes_to_server: u64,
    /// Server to client.
    pub bytes_to_client: u64,
}

/// Relay bytes between `client` and `server` until either side finishes.
///
/// The first EOF or I/O error in either direction ends the whole tunnel:
/// both streams are shut down and dropped. There is no idle timeout.
pub async fn relay<C, S>(client: C, server: S) -> RelayStats
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let mut stats = RelayStats::default();

    {
        let to_server = copy_counted(
            &mut client_read,
            &mut server_write,
            &mut stats.bytes_to_server,
        );
        let to_client = copy_counted(
            &mut server_read,
            &mut client_write,
            &mut stats.bytes_to_client,
        );

        tokio::select! {
            result = to_server => {
                if let Err(e) = result {
                    debug!(error = %e, "Client side of tunnel failed");
                }
            }
            result = to_client => {
                if let Err(e) = result {
                    debug!(error = %e, "Server side of tunnel failed");
                }
            }
        }
    }

    let _ = server_write.shutdown().await;
    let _ = client_write.shutdown().await;

    debug!(
        bytes_to_server = stats.bytes_to_server,
        bytes_to_client = stats.bytes_to_client,
        "Tunnel closed"
    );

    stats
}

/// Copy until EOF, keeping a running total in `total`.
async fn copy_counted<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}
