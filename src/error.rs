//! Error types for tunnel bootstrap and session management.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors surfaced by [`TunnelClient`](crate::tunnel::TunnelClient).
///
/// Configuration variants are only produced by `test_connection`; the session
/// loop never sees them. Dial and handshake failures inside the session loop
/// are contained there and reported through logging and
/// [`TunnelStats`](crate::state::TunnelStats).
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No tunnel server was configured.
    #[error("tunnel server must be specified as host[:port]")]
    MissingTunnelServer,

    /// The tunnel URL does not carry a WebSocket scheme.
    #[error("tunnel URL must begin with ws:// or wss://")]
    BadTunnelScheme,

    /// No local relay was configured.
    #[error("local relay must be specified as hostOrIP:port")]
    MissingLocalRelay,

    /// The local relay address carries an HTTP scheme; it must be a bare
    /// host:port.
    #[error("local relay must not begin with http:// or https://")]
    BadLocalRelayScheme,

    /// A configured URL failed to parse.
    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The configured local source IP failed to parse.
    #[error("invalid local source IP: {0}")]
    BadSourceIp(String),

    /// The bootstrap probe completed but answered with an unexpected HTTP
    /// status.
    #[error("connection probe answered with HTTP status {status}")]
    Handshake { status: u16 },

    /// The WebSocket dial itself failed (TCP, TLS, or upgrade).
    #[error("websocket dial failed: {0}")]
    Dial(#[from] tungstenite::Error),

    /// `start` was called before a successful `test_connection`.
    #[error("connection has not been tested; call test_connection first")]
    NotTested,
}
