use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;

use crate::async_stream::AsyncStream;
use crate::error::ProtocolError;
use crate::line_reader::LineReader;
use crate::upstream::{connect_upstream, UpstreamTarget};

const VER_SOCKS5: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// One accepted client connection: runs the SOCKS5 front-end handshake,
/// opens the tunnel through the configured upstream proxy, and relays bytes
/// until either side closes.
pub struct BridgeSession {
    upstream: Arc<UpstreamTarget>,
    connect_timeout: Duration,
}

impl BridgeSession {
    pub fn new(upstream: Arc<UpstreamTarget>, connect_timeout: Duration) -> Self {
        Self {
            upstream,
            connect_timeout,
        }
    }

    pub async fn run(&self, client_stream: Box<dyn AsyncStream>) -> Result<(), ProtocolError> {
        let mut client_stream = client_stream;
        let mut reader = LineReader::new();

        let (dest_host, dest_port) =
            accept_socks5_request(&mut client_stream, &mut reader).await?;
        log::debug!("bridging to {dest_host}:{dest_port}");

        let connection = match connect_upstream(
            &self.upstream,
            &dest_host,
            dest_port,
            self.connect_timeout,
        )
        .await
        {
            Ok(connection) => connection,
            Err(e) => {
                log::warn!("upstream connect for {dest_host}:{dest_port} failed: {e}");
                write_reply(&mut client_stream, REPLY_CONNECTION_REFUSED).await?;
                let _ = client_stream.shutdown().await;
                return Ok(());
            }
        };

        write_reply(&mut client_stream, REPLY_SUCCESS).await?;

        let mut upstream_stream = connection.stream;
        // Bytes that crossed either handshake boundary belong to the relay.
        if let Some(early_data) = connection.early_data {
            client_stream.write_all(&early_data).await?;
        }
        let leftover = reader.unparsed_data();
        if !leftover.is_empty() {
            upstream_stream.write_all(leftover).await?;
        }
        client_stream.flush().await?;
        upstream_stream.flush().await?;

        // One future drives both directions, so an error or EOF on either
        // side tears the whole relay down at once.
        let result =
            tokio::io::copy_bidirectional(&mut client_stream, &mut upstream_stream).await;
        if let Err(ref e) = result {
            log::debug!("relay for {dest_host}:{dest_port} ended with error: {e}");
        }

        let (_, _) = futures::join!(client_stream.shutdown(), upstream_stream.shutdown());
        Ok(())
    }
}

/// Runs the greeting and request phases of the client-facing SOCKS5 state
/// machine, returning the requested destination. Error replies for
/// unsupported commands and address types are written before returning.
async fn accept_socks5_request(
    client_stream: &mut Box<dyn AsyncStream>,
    reader: &mut LineReader,
) -> Result<(String, u16), ProtocolError> {
    let version = reader.read_u8(client_stream).await?;
    if version != VER_SOCKS5 {
        // No reply: the peer is not speaking SOCKS5 at all.
        return Err(ProtocolError::BadVersion(version));
    }
    let method_count = reader.read_u8(client_stream).await?;
    reader.read_slice(client_stream, method_count as usize).await?;

    // Upstream auth is the gateway's business, never the client's.
    client_stream.write_all(&[VER_SOCKS5, METHOD_NONE]).await?;
    client_stream.flush().await?;

    let version = reader.read_u8(client_stream).await?;
    if version != VER_SOCKS5 {
        return Err(ProtocolError::BadVersion(version));
    }
    let command = reader.read_u8(client_stream).await?;
    if command != CMD_CONNECT {
        write_reply(client_stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        let _ = client_stream.shutdown().await;
        return Err(ProtocolError::UnsupportedCommand(command));
    }
    let _reserved = reader.read_u8(client_stream).await?;

    let atyp = reader.read_u8(client_stream).await?;
    let dest_host = match atyp {
        ATYP_IPV4 => {
            let octets = reader.read_slice(client_stream, 4).await?;
            Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]).to_string()
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8(client_stream).await? as usize;
            let bytes = reader.read_slice(client_stream, len).await?;
            match std::str::from_utf8(bytes) {
                Ok(domain) => domain.to_string(),
                Err(_) => {
                    return Err(ProtocolError::BadAddress(format!(
                        "domain is not valid utf8: {bytes:?}"
                    )));
                }
            }
        }
        ATYP_IPV6 => {
            let bytes = reader.read_slice(client_stream, 16).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            write_reply(client_stream, REPLY_ATYP_NOT_SUPPORTED).await?;
            let _ = client_stream.shutdown().await;
            return Err(ProtocolError::UnsupportedAddressType(other));
        }
    };
    let dest_port = reader.read_u16_be(client_stream).await?;

    Ok((dest_host, dest_port))
}

/// Standard 10-byte SOCKS5 reply with a zeroed IPv4 bound address. Clients
/// of a CONNECT-only gateway have no use for the real one.
async fn write_reply(
    client_stream: &mut Box<dyn AsyncStream>,
    code: u8,
) -> std::io::Result<()> {
    client_stream
        .write_all(&[VER_SOCKS5, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    client_stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn client_side(request: &[u8]) -> (Box<dyn AsyncStream>, tokio::io::DuplexStream) {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(request).await.unwrap();
        (Box::new(server) as Box<dyn AsyncStream>, client)
    }

    #[tokio::test]
    async fn test_accept_connect_with_domain() {
        let mut request = vec![VER_SOCKS5, 1, METHOD_NONE];
        request.extend_from_slice(&[VER_SOCKS5, CMD_CONNECT, 0x00, ATYP_DOMAIN, 11]);
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());

        let (mut stream, mut client) = client_side(&request).await;
        let mut reader = LineReader::new();
        let (host, port) = accept_socks5_request(&mut stream, &mut reader)
            .await
            .unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);

        let mut greeting_reply = [0u8; 2];
        client.read_exact(&mut greeting_reply).await.unwrap();
        assert_eq!(greeting_reply, [VER_SOCKS5, METHOD_NONE]);
    }

    #[tokio::test]
    async fn test_accept_connect_with_ipv4_and_ipv6() {
        let mut request = vec![VER_SOCKS5, 1, METHOD_NONE];
        request.extend_from_slice(&[VER_SOCKS5, CMD_CONNECT, 0x00, ATYP_IPV4, 10, 0, 0, 5]);
        request.extend_from_slice(&1080u16.to_be_bytes());

        let (mut stream, _client) = client_side(&request).await;
        let mut reader = LineReader::new();
        let (host, port) = accept_socks5_request(&mut stream, &mut reader)
            .await
            .unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 1080);

        let mut request = vec![VER_SOCKS5, 1, METHOD_NONE];
        request.extend_from_slice(&[VER_SOCKS5, CMD_CONNECT, 0x00, ATYP_IPV6]);
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&8443u16.to_be_bytes());

        let (mut stream, _client) = client_side(&request).await;
        let mut reader = LineReader::new();
        let (host, port) = accept_socks5_request(&mut stream, &mut reader)
            .await
            .unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 8443);
    }

    #[tokio::test]
    async fn test_bind_command_gets_command_not_supported() {
        let mut request = vec![VER_SOCKS5, 1, METHOD_NONE];
        // BIND
        request.extend_from_slice(&[VER_SOCKS5, 0x02, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 80]);

        let (mut stream, mut client) = client_side(&request).await;
        let mut reader = LineReader::new();
        let err = accept_socks5_request(&mut stream, &mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedCommand(0x02)));

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[2], VER_SOCKS5);
        assert_eq!(reply[3], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_unknown_address_type_gets_atyp_not_supported() {
        let mut request = vec![VER_SOCKS5, 1, METHOD_NONE];
        request.extend_from_slice(&[VER_SOCKS5, CMD_CONNECT, 0x00, 0x09]);

        let (mut stream, mut client) = client_side(&request).await;
        let mut reader = LineReader::new();
        let err = accept_socks5_request(&mut stream, &mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedAddressType(0x09)));

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[3], REPLY_ATYP_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_wrong_version_closes_without_reply() {
        let (mut stream, mut client) = client_side(&[0x04, 1, 0]).await;
        let mut reader = LineReader::new();
        let err = accept_socks5_request(&mut stream, &mut reader)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::BadVersion(0x04)));
        drop(stream);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
