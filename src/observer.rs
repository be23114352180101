//! Observer and collaborator seams
//!
//! Every cross-component notification in the transport goes through one of
//! these traits, held as `Arc<dyn ..>` by the notifying side and always
//! invoked outside the notifier's lock.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::status::{ChangedReason, ConnectionStatus, SendMessageStatus};

/// Readable source for an outbound binary attachment
pub type AttachmentSource = Box<dyn AsyncRead + Send + Unpin>;

/// Writable sink for an inbound binary attachment
pub type AttachmentSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Receives every connection-status transition
///
/// A newly added observer is notified synchronously with the current
/// (status, reason) pair before the registration call returns, so it can
/// never miss the state that was current at registration time.
pub trait ConnectionStatusObserver: Send + Sync {
    /// The connection moved to `status` because of `reason`
    fn on_connection_status_changed(&self, status: ConnectionStatus, reason: ChangedReason);
}

/// Receives the outcome of one [`MessageRequest`]
///
/// [`MessageRequest`]: crate::MessageRequest
pub trait MessageRequestObserver: Send + Sync {
    /// The request reached `status`
    ///
    /// `Pending` may be reported once before a terminal value; every request
    /// that the transport accepts eventually reports exactly one terminal
    /// value to each registered observer.
    fn on_send_completed(&self, status: SendMessageStatus);

    /// The server attached an exception payload to a failed request
    fn on_exception_received(&self, exception_message: &str) {
        let _ = exception_message;
    }
}

/// Receives ordered inbound message bytes from the downchannel and from
/// event-stream response bodies
///
/// Framing and JSON/directive parsing happen downstream of this trait.
pub trait MessageConsumer: Send + Sync {
    /// A chunk of a server-pushed message, in stream order
    fn on_message(&self, bytes: Bytes);
}

/// Supplies the current bearer token and learns about rejected ones
pub trait AuthTokenProvider: Send + Sync {
    /// The token to place in the `Authorization` header of the next stream,
    /// or `None` if no valid token is currently available
    ///
    /// Called once per stream creation; tokens rotate, so the result is never
    /// cached beyond one exchange.
    fn auth_token(&self) -> Option<String>;

    /// The gateway returned 403 for `token`; the provider should refresh
    fn on_auth_failure(&self, token: &str) {
        let _ = token;
    }
}

/// Resolves attachment ids to readable sources and writable sinks
pub trait AttachmentManager: Send + Sync {
    /// Open the outbound attachment named by a [`MessageRequest`]
    ///
    /// [`MessageRequest`]: crate::MessageRequest
    fn open_reader(&self, attachment_id: &str) -> Option<AttachmentSource>;

    /// Open a sink for an inbound attachment; consumed by the directive
    /// layer downstream of [`MessageConsumer`]
    fn open_writer(&self, attachment_id: &str) -> Option<AttachmentSink>;
}

/// Per-stream timing and outcome record
#[derive(Debug, Clone)]
pub struct StreamMetric {
    /// Opaque stream identifier
    pub stream_id: String,
    /// HTTP status of the response, if one arrived
    pub response_status: Option<u16>,
    /// Terminal status delivered to the request, for event streams
    pub send_status: Option<SendMessageStatus>,
    /// Wall time from stream creation to its terminal state
    pub elapsed: Duration,
}

/// Receives one [`StreamMetric`] per finished stream
pub trait MetricRecorder: Send + Sync {
    /// Record a finished stream
    fn record(&self, metric: StreamMetric);
}

/// Recorder that drops every metric
#[derive(Debug, Default, Copy, Clone)]
pub struct NoopMetricRecorder;

impl MetricRecorder for NoopMetricRecorder {
    fn record(&self, _metric: StreamMetric) {}
}
