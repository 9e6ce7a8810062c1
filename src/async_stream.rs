use tokio::io::{AsyncRead, AsyncWrite};

/// Marker trait for the byte streams the gateway shuffles around: the client
/// side of a bridge session and the streams produced by upstream connectors.
/// Blanket-implemented so tests can substitute in-memory duplex pipes for
/// real TCP sockets.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}
