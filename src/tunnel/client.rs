//! Tunnel client — persistent outbound WS connection from device to backend.
//!
//! [`TunnelClient`] represents one tunnel that can cycle through many
//! websockets over its lifetime. `test_connection` validates the configured
//! endpoints and probes the backend once; `start` then runs the session loop
//! in the background: dial, serve one connection until it dies, wait out the
//! retry floor, dial again — up to a ceiling of consecutive failures.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info};
use url::Url;

use crate::error::TunnelError;
use crate::state::{TunnelEventType, TunnelStats};
use crate::tunnel::dialer::TunnelDialer;
use crate::tunnel::session::WsConnection;

/// Consecutive dial failures after which the session loop gives up.
const MAX_RETRY_ATTEMPTS: u32 = 50;

/// Minimum wall-clock spacing between dial attempts.
const RETRY_FLOOR: Duration = Duration::from_secs(30);

/// Default maximum gap between pongs.
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(30);

/// Bootstrap probe endpoint; answers HTTP 200 without upgrading.
const PING_PATH: &str = "/api/v1/edgedevice/connection/ping";

/// Tunnel endpoint; upgrades to the framed WebSocket protocol.
const TUNNEL_PATH: &str = "/api/v1/edgedevice/connection/tunnel";

/// How much of an HTTP error body is logged on dial failure.
const DIAL_BODY_LOG_LIMIT: usize = 80;

/// A persistent reverse tunnel from this device to the backend.
pub struct TunnelClient {
    server_name: String,
    tunnel_url: String,
    local_relay: String,
    ping_timeout: Duration,
    dest_url: Option<String>,
    dialer: Option<TunnelDialer>,
    stats: Arc<TunnelStats>,
    exiting: Arc<AtomicBool>,
}

impl TunnelClient {
    /// Create a client for `server_name` (host[:port], `wss://` implied
    /// unless a `ws://`/`wss://` scheme is given) relaying to `local_relay`
    /// (host:port).
    #[must_use]
    pub fn new(server_name: &str, local_relay: &str) -> Self {
        let tunnel_url = if server_name.starts_with("ws://") || server_name.starts_with("wss://") {
            server_name.to_string()
        } else {
            format!("wss://{server_name}")
        };
        Self {
            server_name: server_name.to_string(),
            tunnel_url,
            local_relay: local_relay.to_string(),
            ping_timeout: DEFAULT_PING_TIMEOUT,
            dest_url: None,
            dialer: None,
            stats: Arc::new(TunnelStats::new()),
            exiting: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_ping_timeout(mut self, ping_timeout: Duration) -> Self {
        self.ping_timeout = ping_timeout;
        self
    }

    /// Validate the configured endpoints and probe the backend.
    ///
    /// On success the tunnel endpoint URL and the finalized dialer are stored
    /// for [`start`](Self::start); no socket is retained.
    pub async fn test_connection(
        &mut self,
        tls: Option<Arc<rustls::ClientConfig>>,
        proxy: Option<Url>,
        local_source_ip: Option<IpAddr>,
    ) -> Result<(), TunnelError> {
        if self.server_name.is_empty() {
            return Err(TunnelError::MissingTunnelServer);
        }
        if !self.tunnel_url.starts_with("ws://") && !self.tunnel_url.starts_with("wss://") {
            return Err(TunnelError::BadTunnelScheme);
        }
        self.tunnel_url = self.tunnel_url.trim_end_matches('/').to_string();

        if self.local_relay.is_empty() {
            return Err(TunnelError::MissingLocalRelay);
        }
        if self.local_relay.starts_with("http://") || self.local_relay.starts_with("https://") {
            return Err(TunnelError::BadLocalRelayScheme);
        }
        self.local_relay = self.local_relay.trim_end_matches('/').to_string();

        // catches empty or malformed hosts before any dialing happens
        Url::parse(&self.tunnel_url).map_err(|e| TunnelError::InvalidUrl {
            url: self.tunnel_url.clone(),
            source: e,
        })?;

        debug!(
            url = %self.tunnel_url,
            ?proxy,
            ?local_source_ip,
            "testing connection"
        );
        let dialer = TunnelDialer::new(tls, proxy, local_source_ip);
        let ping_url = format!("{}{PING_PATH}", self.tunnel_url);

        match dialer.connect(&ping_url).await {
            // The probe endpoint answers 200 without upgrading, so the dial
            // "fails" with an HTTP response; that response is the result.
            Err(WsError::Http(response)) if response.status() == StatusCode::OK => {
                let dest_url = format!("{}{TUNNEL_PATH}", self.tunnel_url);
                info!(url = %dest_url, "connection test succeeded");
                self.dest_url = Some(dest_url);
                self.dialer = Some(dialer);
                Ok(())
            }
            Err(WsError::Http(response)) => Err(TunnelError::Handshake {
                status: response.status().as_u16(),
            }),
            Err(e) => Err(TunnelError::Dial(e)),
            Ok((mut ws, response)) => {
                // the probe endpoint never upgrades; treat this as a bad deployment
                let _ = ws.close(None).await;
                Err(TunnelError::Handshake {
                    status: response.status().as_u16(),
                })
            }
        }
    }

    /// Start the session loop in the background. Returns immediately.
    pub fn start(&self) -> Result<JoinHandle<()>, TunnelError> {
        let ctx = SessionLoop {
            dest_url: self.dest_url.clone().ok_or(TunnelError::NotTested)?,
            dialer: self.dialer.clone().ok_or(TunnelError::NotTested)?,
            local_relay: self.local_relay.clone(),
            ping_timeout: self.ping_timeout,
            stats: self.stats.clone(),
            exiting: self.exiting.clone(),
        };
        Ok(tokio::spawn(run_session_loop(ctx)))
    }

    /// Ask the session loop to exit instead of redialing.
    ///
    /// An in-flight connection is not interrupted; it winds down through its
    /// normal read-error path and the loop observes the flag afterwards.
    pub fn stop(&self) {
        info!("shutting down websocket tunnel client");
        self.exiting.store(true, Ordering::SeqCst);
    }

    /// True while a request pump is running on a live socket.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.stats.connected.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn stats(&self) -> Arc<TunnelStats> {
        self.stats.clone()
    }

    #[must_use]
    pub fn tunnel_url(&self) -> &str {
        &self.tunnel_url
    }

    #[must_use]
    pub fn local_relay(&self) -> &str {
        &self.local_relay
    }

    /// Tunnel endpoint URL, set by a successful `test_connection`.
    #[must_use]
    pub fn dest_url(&self) -> Option<&str> {
        self.dest_url.as_deref()
    }
}

/// Everything the background dial loop needs, detached from the client.
struct SessionLoop {
    dest_url: String,
    dialer: TunnelDialer,
    local_relay: String,
    ping_timeout: Duration,
    stats: Arc<TunnelStats>,
    exiting: Arc<AtomicBool>,
}

/// Dial loop: one iteration per websocket lifetime.
async fn run_session_loop(ctx: SessionLoop) {
    let mut retries: u32 = 0;
    debug!("looping through websocket connection requests");
    loop {
        if retries == MAX_RETRY_ATTEMPTS {
            error!(
                attempts = MAX_RETRY_ATTEMPTS,
                "shutting down tunnel session loop after repeated dial failures"
            );
            break;
        }

        // armed before the dial so attempts stay spaced even when dialing
        // or the session itself is quick to fail
        let floor = sleep(RETRY_FLOOR);
        tokio::pin!(floor);

        debug!(url = %ctx.dest_url, "attempting websocket connection");
        match ctx.dialer.connect(&ctx.dest_url).await {
            Err(e) => {
                retries += 1;
                ctx.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                log_dial_failure(&e, retries);
                ctx.stats
                    .push_event(TunnelEventType::ReconnectAttempt, e.to_string())
                    .await;
            }
            Ok((ws, _response)) => {
                retries = 0;
                ctx.stats.connected.store(true, Ordering::Relaxed);
                ctx.stats
                    .push_event(TunnelEventType::Connected, ctx.dest_url.clone())
                    .await;

                let session = WsConnection::new(
                    &ctx.dest_url,
                    &ctx.local_relay,
                    ctx.ping_timeout,
                    ctx.stats.clone(),
                );
                session.run(ws).await;

                ctx.stats.connected.store(false, Ordering::Relaxed);
                ctx.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                ctx.stats
                    .push_event(TunnelEventType::Disconnected, ctx.dest_url.clone())
                    .await;
            }
        }

        if ctx.exiting.load(Ordering::SeqCst) {
            info!("exit requested, leaving session loop");
            break;
        }
        floor.as_mut().await;
    }
}

/// Log a failed dial, including the HTTP status and the head of the response
/// body when the handshake got far enough to produce one.
fn log_dial_failure(err: &WsError, attempt: u32) {
    if let WsError::Http(response) = err {
        let status = response.status();
        let body = response.body().as_deref().unwrap_or(&[]);
        let head = String::from_utf8_lossy(&body[..body.len().min(DIAL_BODY_LOG_LIMIT)]);
        error!(%status, attempt, "error opening connection: {head}");
    } else {
        error!(attempt, error = %err, "error opening connection");
    }
}
