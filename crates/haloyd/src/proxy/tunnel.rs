//! Raw bidirectional piping shared by the WebSocket upgrade path and
//! the `/v1/tunnel/<app>` TCP tunnel. The tunnel endpoint always
//! replies `101 Switching Protocols` and only then attempts the
//! backend connection, so a backend that's down surfaces as a dead
//! tunnel rather than a rejected upgrade.

use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};

pub async fn splice<A, B>(mut client: A, mut backend: B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    copy_bidirectional(&mut client, &mut backend).await
}
