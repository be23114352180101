//! Low-level HTTP/2 stream seam
//!
//! [`Http2Connection`] is the boundary between the exchange/pool layers and
//! the actual wire: one physical connection on which streams are created on
//! demand. Each created stream is a channel of [`StreamEvent`]s plus a
//! cancelable [`Http2StreamHandle`]. Production uses the h2-backed
//! [`client::H2Connection`]; tests substitute an in-process fake.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::error::Http2Error;

pub mod client;
pub(crate) mod mime;

/// Body of one outbound stream
pub enum RequestBody {
    /// No body (downchannel open, ping)
    Empty,
    /// A complete in-memory body, sent then ended
    Bytes(Bytes),
    /// A streamed body; the channel closing ends the stream
    Stream(mpsc::Receiver<Bytes>),
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Everything needed to create and send one stream
#[derive(Debug)]
pub struct Http2RequestConfig {
    /// Opaque stream identifier, unique per connection
    pub id: String,
    /// Request method
    pub method: http::Method,
    /// Absolute request URL (gateway origin + path)
    pub url: String,
    /// Header pairs in the exact order they go on the wire
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: RequestBody,
}

impl Http2RequestConfig {
    /// Headers rendered as `"<key>: <value>"` lines, wire order
    pub fn header_lines(&self) -> Vec<String> {
        self.headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect()
    }
}

/// Why a stream stopped producing events
#[derive(Debug, Clone)]
pub enum FinishReason {
    /// The exchange ran to completion (any HTTP status)
    Complete,
    /// The stream was canceled through its handle
    Canceled,
    /// The transport failed mid-exchange
    Error(Http2Error),
}

/// One low-level transport callback, delivered in stream order
#[derive(Debug)]
pub enum StreamEvent {
    /// The request body has been fully flushed to the stream
    BodySent,
    /// Response headers arrived
    Headers {
        /// HTTP status code
        status: u16,
    },
    /// A chunk of the response body
    Data(Bytes),
    /// The stream is done; no further events follow
    Finished(FinishReason),
}

/// Cancelable identity of one stream
///
/// `cancel` is a request, not a guarantee: the stream may already be at or
/// past its terminal event.
#[derive(Debug)]
pub struct Http2StreamHandle {
    id: String,
    canceled: AtomicBool,
    terminal: AtomicBool,
    cancel_signal: Notify,
}

impl Http2StreamHandle {
    /// Opaque stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Best-effort abort
    ///
    /// Returns `false` when the stream is already terminal or was canceled
    /// before; calling again is always safe.
    pub fn cancel(&self) -> bool {
        if self.terminal.load(Ordering::Acquire) || self.canceled.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel_signal.notify_one();
        true
    }

    /// Whether `cancel` has been requested
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Resolves once `cancel` is requested
    pub(crate) async fn canceled(&self) {
        if self.is_canceled() {
            return;
        }
        self.cancel_signal.notified().await;
    }
}

/// Consumer side of one created stream
#[derive(Debug)]
pub struct Http2Stream {
    handle: Arc<Http2StreamHandle>,
    events: mpsc::Receiver<StreamEvent>,
}

impl Http2Stream {
    /// A stream plus the producer side that feeds it
    pub fn channel(id: impl Into<String>) -> (Self, StreamEventSender) {
        let (tx, rx) = mpsc::channel(8);
        let handle = Arc::new(Http2StreamHandle {
            id: id.into(),
            canceled: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
            cancel_signal: Notify::new(),
        });
        (
            Self {
                handle: handle.clone(),
                events: rx,
            },
            StreamEventSender { tx, handle },
        )
    }

    /// The stream's cancelable handle
    pub fn handle(&self) -> Arc<Http2StreamHandle> {
        self.handle.clone()
    }

    /// Next event, or `None` if the producer vanished without a terminal event
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }
}

/// Producer side of one created stream, held by the connection
#[derive(Debug, Clone)]
pub struct StreamEventSender {
    tx: mpsc::Sender<StreamEvent>,
    handle: Arc<Http2StreamHandle>,
}

impl StreamEventSender {
    /// Deliver a non-terminal event; fails silently if the consumer is gone
    pub async fn send(&self, event: StreamEvent) {
        debug_assert!(!matches!(event, StreamEvent::Finished(_)));
        let _ = self.tx.send(event).await;
    }

    /// Deliver the terminal event; after this, `cancel` on the handle is a no-op
    pub async fn finish(&self, reason: FinishReason) {
        self.handle.terminal.store(true, Ordering::Release);
        let _ = self.tx.send(StreamEvent::Finished(reason)).await;
    }

    /// Resolves once the consumer requested cancellation
    pub async fn canceled(&self) {
        self.handle.canceled().await;
    }

    /// Whether cancellation has been requested
    pub fn is_canceled(&self) -> bool {
        self.handle.is_canceled()
    }

    /// Whether the terminal event has been delivered
    pub(crate) fn is_terminal(&self) -> bool {
        self.handle.terminal.load(Ordering::Acquire)
    }

    /// Deliver the terminal event without awaiting channel capacity
    ///
    /// Used on connection teardown, where the caller cannot block. If the
    /// event channel happens to be full the terminal event is flushed from a
    /// short-lived task instead of being dropped.
    pub(crate) fn finish_now(&self, reason: FinishReason) {
        self.handle.terminal.store(true, Ordering::Release);
        if let Err(mpsc::error::TrySendError::Full(event)) =
            self.tx.try_send(StreamEvent::Finished(reason))
        {
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(event).await;
            });
        }
    }
}

/// Producer sides of a connection's open streams, tracked for teardown
///
/// `disconnect` walks this to deliver an error finish to every stream that
/// has not reached its terminal event, so no consumer is left waiting on a
/// dead connection.
#[derive(Debug, Default)]
pub(crate) struct StreamRegistry {
    senders: Mutex<Vec<StreamEventSender>>,
}

impl StreamRegistry {
    pub(crate) fn register(&self, sender: StreamEventSender) {
        let mut senders = self.senders.lock().unwrap();
        senders.retain(|s| !s.is_terminal());
        senders.push(sender);
    }

    /// Error-finish every stream still open; the registry ends up empty
    pub(crate) fn finish_all(&self, error: Http2Error) {
        let senders: Vec<StreamEventSender> = {
            let mut senders = self.senders.lock().unwrap();
            senders.drain(..).collect()
        };
        for sender in senders {
            if !sender.is_terminal() {
                sender.finish_now(FinishReason::Error(error.clone()));
            }
        }
    }
}

/// One physical HTTP/2 connection on which streams are multiplexed
///
/// All stream creation goes through this trait; no other component touches
/// the wire directly.
pub trait Http2Connection: Send + Sync + fmt::Debug + 'static {
    /// Allocate a new stream and start the exchange immediately
    fn create_and_send_request(&self, config: Http2RequestConfig) -> Result<Http2Stream, Http2Error>;

    /// Tear down the physical connection; open streams see an error finish
    fn disconnect(&self);

    /// Whether the physical connection is gone
    fn is_closed(&self) -> bool;
}

/// Future returned by [`Http2ConnectionFactory::connect`]
pub type ConnectFuture =
    Pin<Box<dyn Future<Output = Result<Arc<dyn Http2Connection>, Http2Error>> + Send>>;

/// Establishes physical connections to a gateway
pub trait Http2ConnectionFactory: Send + Sync + 'static {
    /// Connect to `gateway` (an `https://host[:port]` origin)
    fn connect(&self, gateway: &str) -> ConnectFuture;
}
