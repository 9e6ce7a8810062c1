use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::address::NetLocation;
use crate::async_stream::AsyncStream;
use crate::error::ConnectError;
use crate::line_reader::LineReader;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const VER_SOCKS5: u8 = 0x05;
const VER_SOCKS4: u8 = 0x04;
const VER_AUTH: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERNAME: u8 = 0x02;
const CMD_CONNECT: u8 = 0x01;
const RESULT_SUCCESS: u8 = 0x00;
const SOCKS4_RESULT_GRANTED: u8 = 90;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpstreamProtocol {
    Http,
    Https,
    HttpTunnel,
    Socks4,
    Socks5,
}

/// A fully-resolved upstream proxy: where it is, how to talk to it, and the
/// credentials to present.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub protocol: UpstreamProtocol,
    pub location: NetLocation,
    pub credentials: Option<(String, String)>,
}

/// A negotiated tunnel. `early_data` holds any bytes the proxy sent past the
/// end of its handshake reply; they belong to the destination stream.
pub struct UpstreamConnection {
    pub stream: Box<dyn AsyncStream>,
    pub early_data: Option<Vec<u8>>,
}

impl std::fmt::Debug for UpstreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConnection")
            .field(
                "early_data",
                &self.early_data.as_ref().map(|data| data.len()),
            )
            .finish_non_exhaustive()
    }
}

/// Negotiates a tunnel to `dest_host:dest_port` over an already-connected
/// proxy stream.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect_tunnel(
        &self,
        proxy_stream: Box<dyn AsyncStream>,
        dest_host: &str,
        dest_port: u16,
    ) -> Result<UpstreamConnection, ConnectError>;
}

pub fn create_connector(target: &UpstreamTarget) -> Box<dyn UpstreamConnector> {
    match target.protocol {
        // TLS to the proxy itself is handled by an external hop; all three
        // HTTP flavors negotiate a plain CONNECT tunnel here.
        UpstreamProtocol::Http | UpstreamProtocol::Https | UpstreamProtocol::HttpTunnel => {
            Box::new(HttpConnectUpstream::new(target.credentials.clone()))
        }
        UpstreamProtocol::Socks4 => Box::new(Socks4Upstream::new(
            target
                .credentials
                .as_ref()
                .map(|(username, _)| username.clone()),
        )),
        UpstreamProtocol::Socks5 => Box::new(Socks5Upstream::new(target.credentials.clone())),
    }
}

/// Connects to the upstream proxy and runs its protocol handshake for the
/// requested destination.
pub async fn connect_upstream(
    target: &UpstreamTarget,
    dest_host: &str,
    dest_port: u16,
    connect_timeout: Duration,
) -> Result<UpstreamConnection, ConnectError> {
    let proxy_addr = target.location.to_string();
    let addr = tokio::net::lookup_host(&proxy_addr)
        .await
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConnectError::Unresolvable(proxy_addr.clone()))?;

    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ConnectError::Io(e)),
        Err(_) => return Err(ConnectError::Timeout),
    };
    if let Err(e) = stream.set_nodelay(true) {
        log::warn!("failed to set nodelay on upstream socket: {e}");
    }

    let connector = create_connector(target);
    connector
        .connect_tunnel(Box::new(stream), dest_host, dest_port)
        .await
}

pub struct HttpConnectUpstream {
    auth_header: Option<String>,
}

impl HttpConnectUpstream {
    pub fn new(credentials: Option<(String, String)>) -> Self {
        let auth_header = credentials.map(|(username, password)| {
            let encoded = BASE64_STANDARD.encode(format!("{username}:{password}"));
            format!("Proxy-Authorization: Basic {encoded}\r\n")
        });
        Self { auth_header }
    }
}

#[async_trait]
impl UpstreamConnector for HttpConnectUpstream {
    async fn connect_tunnel(
        &self,
        mut proxy_stream: Box<dyn AsyncStream>,
        dest_host: &str,
        dest_port: u16,
    ) -> Result<UpstreamConnection, ConnectError> {
        // IPv6 literals need brackets in the authority form.
        let host_port = if dest_host.contains(':') {
            format!("[{dest_host}]:{dest_port}")
        } else {
            format!("{dest_host}:{dest_port}")
        };
        let mut request =
            format!("CONNECT {host_port} HTTP/1.1\r\nHost: {host_port}\r\n");
        if let Some(ref header) = self.auth_header {
            request.push_str(header);
        }
        request.push_str("\r\n");
        proxy_stream.write_all(request.as_bytes()).await?;
        proxy_stream.flush().await?;

        let mut reader = LineReader::new();
        let status_line = reader.read_line(&mut proxy_stream).await?.to_string();
        // Lenient on purpose: some proxies answer HTTP/1.0, some pad the
        // reason phrase. Any 200 in the status line counts as established.
        if !status_line.contains("200") {
            return Err(ConnectError::HttpRejected(status_line));
        }
        loop {
            let line = reader.read_line(&mut proxy_stream).await?;
            if line.is_empty() {
                break;
            }
        }

        let early_data = match reader.unparsed_data() {
            data if data.is_empty() => None,
            data => Some(data.to_vec()),
        };
        Ok(UpstreamConnection {
            stream: proxy_stream,
            early_data,
        })
    }
}

pub struct Socks5Upstream {
    credentials: Option<(String, String)>,
}

impl Socks5Upstream {
    pub fn new(credentials: Option<(String, String)>) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl UpstreamConnector for Socks5Upstream {
    async fn connect_tunnel(
        &self,
        mut proxy_stream: Box<dyn AsyncStream>,
        dest_host: &str,
        dest_port: u16,
    ) -> Result<UpstreamConnection, ConnectError> {
        if dest_host.len() > 255 {
            return Err(ConnectError::HostTooLong(dest_host.to_string()));
        }

        let greeting: &[u8] = if self.credentials.is_some() {
            &[VER_SOCKS5, 2, METHOD_NONE, METHOD_USERNAME]
        } else {
            &[VER_SOCKS5, 1, METHOD_NONE]
        };
        proxy_stream.write_all(greeting).await?;
        proxy_stream.flush().await?;

        let mut reader = LineReader::new_with_buffer_size(400);
        let version = reader.read_u8(&mut proxy_stream).await?;
        if version != VER_SOCKS5 {
            return Err(ConnectError::BadVersion(version));
        }
        let method = reader.read_u8(&mut proxy_stream).await?;
        match method {
            METHOD_NONE => {}
            METHOD_USERNAME => {
                let (username, password) = self
                    .credentials
                    .as_ref()
                    .ok_or(ConnectError::AuthMethodRejected)?;
                let mut auth = vec![VER_AUTH, username.len() as u8];
                auth.extend_from_slice(username.as_bytes());
                auth.push(password.len() as u8);
                auth.extend_from_slice(password.as_bytes());
                proxy_stream.write_all(&auth).await?;
                proxy_stream.flush().await?;

                let auth_version = reader.read_u8(&mut proxy_stream).await?;
                if auth_version != VER_AUTH {
                    return Err(ConnectError::BadVersion(auth_version));
                }
                let status = reader.read_u8(&mut proxy_stream).await?;
                if status != RESULT_SUCCESS {
                    return Err(ConnectError::AuthFailed(status));
                }
            }
            _ => {
                return Err(ConnectError::AuthMethodRejected);
            }
        }

        // Always address by domain name so the proxy does the resolution.
        let mut request = vec![
            VER_SOCKS5,
            CMD_CONNECT,
            0x00,
            ATYP_DOMAIN,
            dest_host.len() as u8,
        ];
        request.extend_from_slice(dest_host.as_bytes());
        request.extend_from_slice(&dest_port.to_be_bytes());
        proxy_stream.write_all(&request).await?;
        proxy_stream.flush().await?;

        let version = reader.read_u8(&mut proxy_stream).await?;
        if version != VER_SOCKS5 {
            return Err(ConnectError::BadVersion(version));
        }
        let reply = reader.read_u8(&mut proxy_stream).await?;
        if reply != RESULT_SUCCESS {
            return Err(ConnectError::SocksRejected(reply));
        }
        let _reserved = reader.read_u8(&mut proxy_stream).await?;

        // Discard the bound address; the relay does not use it.
        let atyp = reader.read_u8(&mut proxy_stream).await?;
        match atyp {
            ATYP_IPV4 => {
                reader.read_slice(&mut proxy_stream, 4 + 2).await?;
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8(&mut proxy_stream).await? as usize;
                reader.read_slice(&mut proxy_stream, len + 2).await?;
            }
            ATYP_IPV6 => {
                reader.read_slice(&mut proxy_stream, 16 + 2).await?;
            }
            other => {
                return Err(ConnectError::SocksRejected(other));
            }
        }

        let early_data = match reader.unparsed_data() {
            data if data.is_empty() => None,
            data => Some(data.to_vec()),
        };
        Ok(UpstreamConnection {
            stream: proxy_stream,
            early_data,
        })
    }
}

pub struct Socks4Upstream {
    userid: Option<String>,
}

impl Socks4Upstream {
    pub fn new(userid: Option<String>) -> Self {
        Self { userid }
    }
}

#[async_trait]
impl UpstreamConnector for Socks4Upstream {
    async fn connect_tunnel(
        &self,
        mut proxy_stream: Box<dyn AsyncStream>,
        dest_host: &str,
        dest_port: u16,
    ) -> Result<UpstreamConnection, ConnectError> {
        let mut request = vec![VER_SOCKS4, CMD_CONNECT];
        request.extend_from_slice(&dest_port.to_be_bytes());

        let hostname_form = match dest_host.parse::<std::net::Ipv4Addr>() {
            Ok(ip) => {
                request.extend_from_slice(&ip.octets());
                false
            }
            Err(_) => {
                // SOCKS4a: an invalid destination IP of 0.0.0.x tells the
                // proxy the hostname follows the userid field.
                request.extend_from_slice(&[0, 0, 0, 1]);
                true
            }
        };
        if let Some(ref userid) = self.userid {
            request.extend_from_slice(userid.as_bytes());
        }
        request.push(0);
        if hostname_form {
            request.extend_from_slice(dest_host.as_bytes());
            request.push(0);
        }
        proxy_stream.write_all(&request).await?;
        proxy_stream.flush().await?;

        let mut reader = LineReader::new_with_buffer_size(400);
        let reply = reader.read_slice(&mut proxy_stream, 8).await?;
        let code = reply[1];
        if code != SOCKS4_RESULT_GRANTED {
            return Err(ConnectError::SocksRejected(code));
        }

        let early_data = match reader.unparsed_data() {
            data if data.is_empty() => None,
            data => Some(data.to_vec()),
        };
        Ok(UpstreamConnection {
            stream: proxy_stream,
            early_data,
        })
    }
}
