//! A single WebSocket session: request pump, response pump, and pinger.
//!
//! The session supervisor hands a freshly dialed socket to
//! [`WsConnection::run`], which splits it and runs three tasks:
//!
//! - the **request pump** (this task, sole reader) decodes inbound frames and
//!   forwards payloads to the local relay;
//! - the **response pump** wakes on a request-sent signal, drains the relay,
//!   and writes framed responses back;
//! - the **pinger** keeps the connection alive and tears it down when pongs
//!   stop arriving.
//!
//! The write half lives behind a mutex shared by the response pump and the
//! pinger, so response frames and control frames never interleave. `run`
//! returns when the request pump exits, which is the session's end of life.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{interval, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

use crate::state::{TunnelEventType, TunnelStats};
use crate::tunnel::dialer::WsStream;
use crate::tunnel::frame;
use crate::tunnel::relay::LocalRelay;

/// Write half of the socket, shared by the response pump and the pinger.
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

/// Deadline for writing one response frame.
const WRITE_DEADLINE: Duration = Duration::from_secs(60);

/// Deadline for the close frame sent on ping timeout.
const CLOSE_FRAME_DEADLINE: Duration = Duration::from_secs(1);

/// Grace period between the close frame and the hard teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(15);

/// Delay before the socket is force-closed after the request pump returns,
/// allowing pending writes to drain.
const CLOSE_DRAIN_DELAY: Duration = Duration::from_secs(5);

/// One live tunnel connection.
pub(crate) struct WsConnection {
    dest_url: String,
    local: LocalRelay,
    ping_timeout: Duration,
    stats: Arc<TunnelStats>,
}

impl WsConnection {
    pub(crate) fn new(
        dest_url: &str,
        local_relay: &str,
        ping_timeout: Duration,
        stats: Arc<TunnelStats>,
    ) -> Self {
        Self {
            dest_url: dest_url.to_string(),
            local: LocalRelay::new(local_relay),
            ping_timeout,
            stats,
        }
    }

    /// Drive the session until the socket dies. Blocks the caller for the
    /// whole connection lifetime.
    pub(crate) async fn run(self, ws: WsStream) {
        let (sink, stream) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));

        // Capacity 1 and edge-triggered: a burst of requests may coalesce
        // into one wakeup, which is fine because the responder drains
        // everything the relay has buffered on each pass.
        let (request_tx, request_rx) = mpsc::channel::<()>(1);
        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let shutdown = Arc::new(Notify::new());

        let pinger_task = tokio::spawn(pinger(
            sink.clone(),
            pong_rx,
            self.ping_timeout,
            shutdown.clone(),
            self.stats.clone(),
            self.dest_url.clone(),
        ));
        let responder = tokio::spawn(pump_responses(
            sink.clone(),
            self.local.clone(),
            request_rx,
            self.stats.clone(),
        ));

        self.pump_requests(stream, request_tx, pong_tx, &shutdown)
            .await;

        tokio::spawn(async move {
            info!("closing websocket connection");
            sleep(CLOSE_DRAIN_DELAY).await;
            let _ = sink.lock().await.close().await;
            pinger_task.abort();
            responder.abort();
        });
    }

    /// Sole reader of the socket. Exits on read error, a non-binary data
    /// frame, an undecodable id, or the pinger's teardown signal.
    async fn pump_requests(
        &self,
        mut stream: SplitStream<WsStream>,
        request_tx: mpsc::Sender<()>,
        pong_tx: watch::Sender<Instant>,
        shutdown: &Notify,
    ) {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                () = shutdown.notified() => {
                    debug!("session torn down by ping supervisor");
                    break;
                }
            };
            let Some(next) = next else {
                debug!("websocket closed by peer");
                break;
            };
            let message = match next {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "websocket read failed");
                    break;
                }
            };
            match message {
                Message::Binary(raw) => {
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    let (id, payload) = match frame::decode_request(&raw) {
                        Ok(parts) => parts,
                        Err(e) => {
                            debug!(error = %e, "cannot read request id");
                            break;
                        }
                    };
                    if payload.is_empty() {
                        debug!(id, "request frame with no payload");
                        continue;
                    }
                    debug!(id, len = payload.len(), "forwarding request to local relay");
                    match self.local.forward(payload).await {
                        Ok(()) => {
                            debug!(id, "completed writing request to local relay");
                            let _ = request_tx.try_send(());
                        }
                        Err(e) => {
                            error!(id, error = %e, "failed to forward request to local relay");
                        }
                    }
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(Instant::now());
                }
                // tungstenite queues the reply pong on its own
                Message::Ping(_) => {}
                Message::Close(frame) => {
                    debug!(?frame, "close frame received");
                    break;
                }
                other => {
                    debug!(message = ?other, "invalid message type on tunnel socket");
                    break;
                }
            }
        }
    }
}

/// Waits for request-sent signals, drains the local relay, and writes framed
/// responses. Response ids count up from zero per session and are not
/// correlated with request ids; the backend relies on arrival order.
async fn pump_responses(
    sink: WsSink,
    local: LocalRelay,
    mut request_rx: mpsc::Receiver<()>,
    stats: Arc<TunnelStats>,
) {
    info!(relay = %local.host(), "processing responses from local relay");
    let mut id: u16 = 0;
    // recv() yields None once the request pump drops its sender, which bounds
    // this task to the socket lifetime
    while request_rx.recv().await.is_some() {
        let response = match local.drain().await {
            Ok(buf) => buf,
            Err(e) => {
                error!(error = %e, "could not read response from local relay");
                continue;
            }
        };
        if response.is_empty() {
            continue;
        }
        debug!(id, len = response.len(), "read local relay payload");
        let framed = frame::encode_response(id, &response);
        let write = timeout(WRITE_DEADLINE, async {
            sink.lock().await.send(Message::Binary(framed)).await
        })
        .await;
        match write {
            Ok(Ok(())) => {
                debug!(id, "completed writing response");
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                id = id.wrapping_add(1);
            }
            Ok(Err(e)) => {
                error!(id, error = %e, "websocket write failed");
                stats
                    .push_event(TunnelEventType::WriterFailed, e.to_string())
                    .await;
                let _ = sink.lock().await.close().await;
                break;
            }
            Err(_) => {
                error!(id, "websocket write timed out");
                stats
                    .push_event(TunnelEventType::WriterFailed, "write deadline exceeded".into())
                    .await;
                let _ = sink.lock().await.close().await;
                break;
            }
        }
    }
}

/// Keeps the connection alive and terminates it when it looks stuck.
///
/// A ping goes out every `ping_timeout / 3`; each pong observed by the
/// request pump pushes the deadline out by `ping_timeout`. If the deadline
/// passes — three pings with no pong — a close frame is sent, the peer gets a
/// grace window, and the session is torn down.
async fn pinger(
    sink: WsSink,
    mut pong_rx: watch::Receiver<Instant>,
    ping_timeout: Duration,
    shutdown: Arc<Notify>,
    stats: Arc<TunnelStats>,
    dest_url: String,
) {
    info!(url = %dest_url, "pinger starting");
    let ping_interval = ping_timeout / 3;
    let mut ticker = interval(ping_interval);
    let mut deadline = Instant::now() + ping_timeout;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let write = timeout(ping_interval, async {
                    sink.lock().await.send(Message::Ping(Vec::new())).await
                })
                .await;
                match write {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(error = %e, "ping write failed");
                        break;
                    }
                    Err(_) => {
                        error!("ping write timed out");
                        break;
                    }
                }
            }
            changed = pong_rx.changed() => {
                match changed {
                    Ok(()) => deadline = *pong_rx.borrow_and_update() + ping_timeout,
                    // request pump is gone, socket is coming down anyway
                    Err(_) => break,
                }
            }
            () = sleep_until(deadline) => {
                info!(url = %dest_url, "ping timeout, closing websocket connection");
                stats.push_event(TunnelEventType::PongTimeout, dest_url.clone()).await;
                let _ = timeout(CLOSE_FRAME_DEADLINE, async {
                    sink.lock().await.send(Message::Close(None)).await
                })
                .await;
                sleep(CLOSE_GRACE).await;
                // hard close: shut the write half down here, then release the
                // request pump from its blocked read
                let _ = sink.lock().await.close().await;
                shutdown.notify_one();
                break;
            }
        }
    }
    info!(url = %dest_url, "pinger ending");
}
