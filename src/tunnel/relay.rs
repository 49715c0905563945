//! Cached TCP connection to the local relay server.
//!
//! The relay speaks a request/response protocol (typically HTTP) over plain
//! TCP. [`LocalRelay`] keeps a single cached connection, probes it for
//! liveness before reuse, and re-dials on demand. The stream is split into
//! owned halves so the request pump (writes) and the response pump (reads)
//! can use it concurrently; the mutex around the cache slot covers only the
//! probe-then-replace critical section, so two tasks cannot race to install
//! a fresh connection.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error};

/// Write attempts per payload before the error is surfaced.
const WRITE_ATTEMPTS: u32 = 3;

/// How long `drain` keeps reading after a forwarded request.
const DRAIN_DEADLINE: Duration = Duration::from_millis(500);

/// Initial capacity of the drain buffer.
const DRAIN_BUF_CAPACITY: usize = 512 * 1024;

/// One dialed relay connection, split so reads and writes don't contend.
struct RelayConn {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
}

/// Cached connection to the local relay.
#[derive(Clone)]
pub struct LocalRelay {
    host: String,
    conn: Arc<Mutex<Option<Arc<RelayConn>>>>,
}

impl LocalRelay {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Write `payload` to the relay, re-dialing on write errors.
    ///
    /// Up to [`WRITE_ATTEMPTS`] writes are made; each failure forces a fresh
    /// connection. The last error is surfaced if every attempt fails.
    pub async fn forward(&self, payload: &[u8]) -> io::Result<()> {
        let mut force = false;
        let mut last_err = None;
        for attempt in 1..=WRITE_ATTEMPTS {
            let conn = self.ensure(force).await?;
            let mut writer = conn.writer.lock().await;
            match writer.write_all(payload).await {
                Ok(()) => {
                    debug!(len = payload.len(), "wrote request to local relay");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "local relay write failed, reconnecting");
                    last_err = Some(e);
                    force = true;
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::other("local relay write failed")))
    }

    /// Read whatever the relay produces within [`DRAIN_DEADLINE`].
    ///
    /// Hitting the deadline is not an error; it means no (more) response is
    /// available right now. The returned buffer may be empty.
    pub async fn drain(&self) -> io::Result<Vec<u8>> {
        let conn = self.ensure(false).await?;
        let mut reader = conn.reader.lock().await;

        let deadline = Instant::now() + DRAIN_DEADLINE;
        let mut buf = Vec::with_capacity(DRAIN_BUF_CAPACITY);
        let mut chunk = [0u8; 16 * 1024];
        let mut lost = false;
        loop {
            match timeout_at(deadline, reader.read(&mut chunk)).await {
                Err(_) => break, // deadline: nothing more for now
                Ok(Ok(0)) => {
                    debug!("local relay closed the connection after responding");
                    lost = true;
                    break;
                }
                Ok(Ok(n)) => buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    debug!(error = %e, "local relay read failed");
                    lost = true;
                    break;
                }
            }
        }
        drop(reader);
        if lost {
            self.invalidate(&conn).await;
        }
        Ok(buf)
    }

    /// Probe-then-replace: return a plausibly-live connection, dialing a new
    /// one when the cache is empty, stale, or `force` is set.
    ///
    /// The slot lock is held only for this step, never across the caller's
    /// reads and writes.
    async fn ensure(&self, force: bool) -> io::Result<Arc<RelayConn>> {
        let mut slot = self.conn.lock().await;
        if !force {
            if let Some(conn) = slot.as_ref() {
                let alive = match conn.reader.try_lock() {
                    Ok(mut reader) => probe_alive(&mut reader).await,
                    // a drain is mid-read on it, so the socket is in use
                    Err(_) => true,
                };
                if alive {
                    return Ok(conn.clone());
                }
            }
        }
        debug!(host = %self.host, "dialing local relay");
        let stream = TcpStream::connect(self.host.as_str()).await.map_err(|e| {
            error!(host = %self.host, error = %e, "could not connect to local relay");
            e
        })?;
        debug!(host = %self.host, "connected to local relay");
        let (reader, writer) = stream.into_split();
        let conn = Arc::new(RelayConn {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        });
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop `stale` from the cache unless something newer was installed.
    async fn invalidate(&self, stale: &Arc<RelayConn>) {
        let mut slot = self.conn.lock().await;
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, stale)) {
            *slot = None;
        }
    }
}

/// Best-effort liveness probe on a cached connection.
///
/// A zero-timeout peek resolves immediately with EOF or an error on a dead
/// socket, with pending bytes (not consumed) on a busy one, and times out on
/// an open idle one. A false positive costs one extra dial.
async fn probe_alive(reader: &mut OwnedReadHalf) -> bool {
    let mut scratch = [0u8; 1];
    match timeout(Duration::ZERO, reader.peek(&mut scratch)).await {
        Err(_) => true,     // open, nothing readable
        Ok(Ok(0)) => {
            debug!("lost local relay connection, reconnecting");
            false
        }
        Ok(Ok(_)) => true,  // response bytes pending
        Ok(Err(e)) => {
            error!(error = %e, "local relay liveness probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn forward_then_drain_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = conn.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"GET / HTTP/1.1\r\n\r\n");
            conn.write_all(b"HTTP/1.1 200 OK\r\n\r\nOK").await.unwrap();
            // keep the connection open until the drain deadline passes
            let _ = conn.read(&mut buf).await;
        });

        let relay = LocalRelay::new(addr.to_string());
        relay.forward(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let response = relay.drain().await.unwrap();
        assert_eq!(response, b"HTTP/1.1 200 OK\r\n\r\nOK");
    }

    #[tokio::test]
    async fn drain_returns_empty_when_relay_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = conn.read(&mut buf).await;
        });

        let relay = LocalRelay::new(addr.to_string());
        let response = relay.drain().await.unwrap();
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn forward_is_not_blocked_by_a_concurrent_drain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            loop {
                let Ok(n) = conn.read(&mut buf).await else { break };
                if n == 0 {
                    break;
                }
            }
        });

        let relay = LocalRelay::new(addr.to_string());
        relay.forward(b"first").await.unwrap();

        // start a drain that will sit on the reader for its full deadline
        let drainer = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.drain().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // a forward issued mid-drain must complete well inside the deadline
        let start = Instant::now();
        relay.forward(b"second").await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(250));

        let drained = drainer.await.unwrap().unwrap();
        assert!(drained.is_empty());
    }

    #[tokio::test]
    async fn forward_redials_after_relay_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dropped_tx, dropped_rx) = oneshot::channel();
        tokio::spawn(async move {
            // first connection: read one request, then drop it
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = conn.read(&mut buf).await.unwrap();
            drop(conn);
            dropped_tx.send(()).unwrap();
            // second connection: the re-dial after the probe sees EOF
            let (mut conn, _) = listener.accept().await.unwrap();
            let n = conn.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"second");
            let _ = conn.read(&mut buf).await;
        });

        let relay = LocalRelay::new(addr.to_string());
        relay.forward(b"first").await.unwrap();
        dropped_rx.await.unwrap();
        // give the FIN time to arrive so the probe observes EOF
        tokio::time::sleep(Duration::from_millis(50)).await;
        relay.forward(b"second").await.unwrap();
    }

    #[tokio::test]
    async fn forward_surfaces_error_when_relay_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let relay = LocalRelay::new(addr.to_string());
        assert!(relay.forward(b"request").await.is_err());
    }
}
