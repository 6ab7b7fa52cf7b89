//! Cellwire: id-correlated request/response between a host and its cells
//!
//! A minimal async correlation layer that works over:
//! - Channels (a cell running on its own thread in the same process)
//! - Byte streams (a cell in a separate process, over its stdio)
//!
//! # Wire Protocol
//!
//! Messages are length-prefixed frames:
//! ```text
//! [length: u32 little-endian][frame: JSON-encoded envelope]
//! ```
//!
//! Every envelope carries a caller-assigned id. A response is delivered to
//! whoever sent the request with the same id, so many calls can be in flight
//! at once and complete in any order.

pub mod socket;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Largest frame body accepted in either direction (64 MiB)
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Anything that carries a correlation id.
///
/// Implemented by both directions of an envelope pair.
pub trait Correlated {
    fn correlation_id(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("failed to serialize frame: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the 64 MiB frame limit")]
    TooLarge(usize),
}

impl From<EncodeError> for std::io::Error {
    fn from(e: EncodeError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

/// Encode a value to bytes (length-prefixed JSON)
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let body = serde_json::to_vec(value)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(EncodeError::TooLarge(body.len()));
    }
    let len = body.len() as u32;
    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Read one frame body from a stream.
///
/// Returns `Ok(None)` when the stream ends before a new frame starts.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("incoming frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Encode a value and write it as one frame, flushing afterwards.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode_frame(value)?;
    writer.write_all(&encoded).await?;
    writer.flush().await
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("request id `{0}` is already in flight")]
    DuplicateId(String),

    #[error("failed to send request")]
    SendFailed,

    #[error("request cancelled")]
    Cancelled,

    #[error("request `{0}` timed out")]
    TimedOut(String),
}

/// Pending requests waiting for responses
type PendingRequests<Resp> = Arc<Mutex<HashMap<String, oneshot::Sender<Resp>>>>;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Inner state of a connection (shared via Arc)
struct ConnectionInner<Req, Resp> {
    /// Send requests out
    tx: mpsc::Sender<Req>,
    /// Prefix making generated ids unique per connection
    prefix: String,
    /// Counter for generating request ids
    next_id: AtomicU64,
    /// Pending requests waiting for responses
    pending: PendingRequests<Resp>,
    /// Set once the peer is gone; no new waiters are accepted
    closed: AtomicBool,
}

/// The caller side of a connection to one cell.
pub struct Connection<Req, Resp> {
    inner: Arc<ConnectionInner<Req, Resp>>,
}

impl<Req, Resp> Clone for Connection<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// A connection handle that does not keep the outgoing side open.
///
/// Transport tasks hold one of these so that dropping the last
/// [`Connection`] closes the request channel and lets the peer shut down.
pub struct WeakConnection<Req, Resp> {
    inner: Weak<ConnectionInner<Req, Resp>>,
}

impl<Req, Resp> WeakConnection<Req, Resp> {
    pub fn upgrade(&self) -> Option<Connection<Req, Resp>> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl<Req, Resp> Clone for WeakConnection<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Req, Resp> Connection<Req, Resp>
where
    Req: Correlated,
    Resp: Correlated,
{
    /// Create a new connection.
    ///
    /// Returns the connection and the receiver of outgoing requests. Whatever
    /// drains that receiver is responsible for feeding responses back through
    /// [`Connection::handle_incoming`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Req>) {
        let (tx, rx) = mpsc::channel(capacity);
        let connection_no = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let inner = ConnectionInner {
            tx,
            prefix: format!("c{connection_no}"),
            next_id: AtomicU64::new(1),
            pending: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        };
        let conn = Self {
            inner: Arc::new(inner),
        };
        (conn, rx)
    }

    pub fn downgrade(&self) -> WeakConnection<Req, Resp> {
        WeakConnection {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Generate an id that is not used by any other request on this connection.
    pub fn next_id(&self) -> String {
        let n = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.inner.prefix)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Resp>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for the response with the same id.
    ///
    /// The waiter is registered before the request leaves, so a fast
    /// response cannot be missed. If this future is dropped the waiter is
    /// removed and a late response is discarded.
    pub async fn request(&self, request: Req) -> Result<Resp, RequestError> {
        let id = request.correlation_id().to_owned();

        let response_rx = {
            let mut pending = self.pending();
            if pending.contains_key(&id) {
                return Err(RequestError::DuplicateId(id));
            }
            let (response_tx, response_rx) = oneshot::channel();
            pending.insert(id.clone(), response_tx);
            response_rx
        };
        let mut guard = WaiterGuard {
            conn: self,
            id: &id,
            armed: true,
        };

        if self.is_closed() {
            return Err(RequestError::Cancelled);
        }

        self.inner
            .tx
            .send(request)
            .await
            .map_err(|_| RequestError::SendFailed)?;

        let response = response_rx.await.map_err(|_| RequestError::Cancelled);
        guard.armed = false;
        response
    }

    /// Like [`Connection::request`], giving up after `timeout`.
    ///
    /// The request keeps running on the cell; its response is dropped when
    /// it eventually arrives.
    pub async fn request_timeout(
        &self,
        request: Req,
        timeout: Duration,
    ) -> Result<Resp, RequestError> {
        let id = request.correlation_id().to_owned();
        match tokio::time::timeout(timeout, self.request(request)).await {
            Ok(result) => result,
            Err(_) => {
                debug!(%id, ?timeout, "request timed out, late response will be discarded");
                Err(RequestError::TimedOut(id))
            }
        }
    }

    /// Deliver an incoming response to its waiter.
    ///
    /// Returns `true` if a waiter received it. Responses for ids nobody is
    /// waiting on are dropped.
    pub fn handle_incoming(&self, response: Resp) -> bool {
        let waiter = self.pending().remove(response.correlation_id());
        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                warn!(
                    id = response.correlation_id(),
                    "dropping response for unknown request id"
                );
                false
            }
        }
    }

    /// Stop waiting for one request. Its waiter resolves with `Cancelled`.
    pub fn abandon(&self, id: &str) -> bool {
        self.pending().remove(id).is_some()
    }

    /// Mark the peer as gone and release every waiter with `Cancelled`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let abandoned = std::mem::take(&mut *self.pending());
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "connection closed with requests in flight");
        }
    }
}

/// Removes a waiter whose request future was dropped before completion.
struct WaiterGuard<'a, Req, Resp>
where
    Req: Correlated,
    Resp: Correlated,
{
    conn: &'a Connection<Req, Resp>,
    id: &'a str,
    armed: bool,
}

impl<Req, Resp> Drop for WaiterGuard<'_, Req, Resp>
where
    Req: Correlated,
    Resp: Correlated,
{
    fn drop(&mut self) {
        if self.armed {
            self.conn.abandon(self.id);
        }
    }
}
