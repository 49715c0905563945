//! Reverse tunnel for devices without inbound reachability.
//!
//! The device opens an outbound WebSocket to the backend; the backend then
//! initiates requests *over* that socket. Each binary frame carries a
//! 4-hex-digit id and an opaque payload which is written verbatim to a local
//! TCP relay; whatever the relay answers within a short window is framed and
//! streamed back on the same socket.
//!
//! - [`client`] — session supervisor: bootstrap probe, dial loop, retry
//!   ceiling and floor
//! - [`session`] — one live connection: request pump, response pump, pinger
//! - [`relay`] — cached TCP connection to the local relay
//! - [`dialer`] — TCP/TLS/WS handshake with proxy and source-IP support
//! - [`frame`] — the id + payload message framing

pub mod client;
pub mod dialer;
pub mod frame;
pub mod relay;
pub(crate) mod session;

pub use client::TunnelClient;
pub use dialer::TunnelDialer;
