//! WebSocket dialer used for both the bootstrap probe and tunnel sessions.
//!
//! The dialer owns everything about *how* a connection is made: buffer sizes
//! and message limits, the (opaque) TLS client configuration, an optional
//! HTTP proxy, and an optional local source IP for the outbound socket. The
//! TCP stream is always established by hand so the source address and proxy
//! hop apply before the TLS and WebSocket handshakes run on top.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite::error::UrlError;
use tokio_tungstenite::tungstenite::handshake::client::Response;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

/// A live tunnel socket.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Socket write buffer size. tungstenite exposes no read-side counterpart;
/// inbound frames are bounded by [`MAX_MESSAGE_SIZE`] instead.
const WRITE_BUFFER_SIZE: usize = 100 * 1024;

/// Largest message accepted on the socket.
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Upper bound on a proxy's CONNECT response headers.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Configured WebSocket dialer.
///
/// Built once by `test_connection` and reused for every session dial.
#[derive(Clone)]
pub struct TunnelDialer {
    tls: Option<Arc<rustls::ClientConfig>>,
    proxy: Option<Url>,
    local_source_ip: Option<IpAddr>,
}

impl TunnelDialer {
    #[must_use]
    pub fn new(
        tls: Option<Arc<rustls::ClientConfig>>,
        proxy: Option<Url>,
        local_source_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            tls,
            proxy,
            local_source_ip,
        }
    }

    /// Dial `url` and run the WebSocket client handshake.
    ///
    /// TCP and proxy failures are reported as [`WsError::Io`]; a completed
    /// HTTP exchange that did not upgrade is [`WsError::Http`] carrying the
    /// response.
    pub async fn connect(&self, url: &str) -> Result<(WsStream, Response), WsError> {
        let parsed =
            Url::parse(url).map_err(|_| WsError::Url(UrlError::UnableToConnect(url.to_string())))?;
        let secure = match parsed.scheme() {
            "wss" => true,
            "ws" => false,
            _ => return Err(WsError::Url(UrlError::UnsupportedUrlScheme)),
        };
        let host = parsed
            .host_str()
            .ok_or(WsError::Url(UrlError::NoHostName))?;
        let port = parsed
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });

        let stream = self.tcp_connect(host, port).await.map_err(WsError::Io)?;

        let connector = if secure {
            // None falls back to the crate's bundled roots
            self.tls.clone().map(Connector::Rustls)
        } else {
            Some(Connector::Plain)
        };
        client_async_tls_with_config(url, stream, Some(Self::ws_config()), connector).await
    }

    #[allow(clippy::field_reassign_with_default)]
    fn ws_config() -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.write_buffer_size = WRITE_BUFFER_SIZE;
        config.max_message_size = Some(MAX_MESSAGE_SIZE);
        config.max_frame_size = Some(MAX_MESSAGE_SIZE);
        config
    }

    /// Open the raw TCP stream, via the proxy when one is configured.
    async fn tcp_connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        match &self.proxy {
            Some(proxy) => {
                let proxy_host = proxy.host_str().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "proxy URL has no host")
                })?;
                let proxy_port = proxy.port_or_known_default().unwrap_or(80);
                debug!(proxy = %proxy, "connecting through HTTP proxy");
                let stream = self.dial_direct(proxy_host, proxy_port).await?;
                proxy_handshake(stream, host, port).await
            }
            None => self.dial_direct(host, port).await,
        }
    }

    /// Dial `host:port`, binding the configured local source IP when set.
    async fn dial_direct(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host(format!("{host}:{port}")).await? {
            let attempt = match self.local_source_ip {
                Some(ip) => {
                    if ip.is_ipv4() != addr.is_ipv4() {
                        continue;
                    }
                    bound_connect(ip, addr).await
                }
                None => TcpStream::connect(addr).await,
            };
            match attempt {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no usable address for {host}:{port}"),
            )
        }))
    }
}

/// Connect to `addr` from a socket bound to `local_ip` (ephemeral port).
async fn bound_connect(local_ip: IpAddr, addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(SocketAddr::new(local_ip, 0))?;
    socket.connect(addr).await
}

/// Issue an HTTP CONNECT to the proxy and wait for the 200 that opens the
/// tunnel to `host:port`.
async fn proxy_handshake(mut stream: TcpStream, host: &str, port: u16) -> io::Result<TcpStream> {
    let request =
        format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut response = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed the connection during CONNECT",
            ));
        }
        response.extend_from_slice(&chunk[..n]);
        if response.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if response.len() > MAX_PROXY_RESPONSE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized proxy CONNECT response",
            ));
        }
    }

    if connect_established(&response) {
        Ok(stream)
    } else {
        Err(io::Error::other("proxy refused CONNECT"))
    }
}

/// True when the proxy's status line reports 200.
fn connect_established(response: &[u8]) -> bool {
    let head = String::from_utf8_lossy(response);
    let Some(status_line) = head.lines().next() else {
        return false;
    };
    let mut parts = status_line.split_whitespace();
    parts.next().is_some_and(|v| v.starts_with("HTTP/")) && parts.next() == Some("200")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_established_accepts_200() {
        assert!(connect_established(
            b"HTTP/1.1 200 Connection established\r\n\r\n"
        ));
        assert!(connect_established(b"HTTP/1.0 200 OK\r\n\r\n"));
    }

    #[test]
    fn connect_established_rejects_other_statuses() {
        assert!(!connect_established(b"HTTP/1.1 407 Proxy Auth Required\r\n\r\n"));
        assert!(!connect_established(b"HTTP/1.1 502 Bad Gateway\r\n\r\n"));
        assert!(!connect_established(b"garbage"));
        assert!(!connect_established(b""));
    }

    #[tokio::test]
    async fn dial_rejects_non_websocket_scheme() {
        let dialer = TunnelDialer::new(None, None, None);
        let err = dialer.connect("https://example.com/x").await.unwrap_err();
        assert!(matches!(err, WsError::Url(UrlError::UnsupportedUrlScheme)));
    }
}
