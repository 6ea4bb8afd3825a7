use crate::http::MessageReader;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Relay raw bytes in both directions until both sides have closed.
///
/// Bytes already buffered by either reader are delivered first. A direction
/// that reaches EOF half-closes its destination; an error in either direction
/// ends the tunnel. Returns the bytes sent upstream and downstream.
pub(super) async fn relay<CR, CW, SR, SW>(
    client: MessageReader<CR>,
    mut client_writer: CW,
    server: MessageReader<SR>,
    mut server_writer: SW,
) -> io::Result<(u64, u64)>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    SR: AsyncRead + Unpin,
    SW: AsyncWrite + Unpin,
{
    let (mut client_reader, client_pending) = client.into_parts();
    let (mut server_reader, server_pending) = server.into_parts();

    let upstream = async {
        server_writer.write_all(&client_pending).await?;
        let n = tokio::io::copy(&mut client_reader, &mut server_writer).await?;
        server_writer.shutdown().await?;
        Ok::<_, io::Error>(n + client_pending.len() as u64)
    };
    let downstream = async {
        client_writer.write_all(&server_pending).await?;
        let n = tokio::io::copy(&mut server_reader, &mut client_writer).await?;
        client_writer.shutdown().await?;
        Ok::<_, io::Error>(n + server_pending.len() as u64)
    };

    tokio::try_join!(upstream, downstream)
}
