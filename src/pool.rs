use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::debug;

use crate::error::Http2Error;
use crate::http2::{Http2Connection, Http2RequestConfig, Http2Stream};

/// Stream identifier of the single downchannel
pub(crate) const DOWNCHANNEL_STREAM_ID: &str = "DOWNCHANNEL";

/// Bounds stream concurrency on one physical connection
///
/// One slot is reserved for the downchannel; at most
/// `max_concurrent_event_streams` outbound event streams are open at once,
/// with overflow waiting FIFO on the semaphore. Pings bypass the event
/// slots: a stuck pool must not stop connection-health probing.
pub struct StreamPool {
    connection: Arc<dyn Http2Connection>,
    event_slots: Arc<Semaphore>,
    acquire_timeout: Duration,
    next_event_stream: AtomicU64,
    next_ping_stream: AtomicU64,
    downchannel_open: AtomicBool,
}

impl fmt::Debug for StreamPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPool")
            .field("connection", &self.connection)
            .field("available_event_slots", &self.event_slots.available_permits())
            .field("downchannel_open", &self.downchannel_open)
            .finish()
    }
}

impl StreamPool {
    /// A pool bounding `connection` to `max_concurrent_event_streams`
    pub fn new(
        connection: Arc<dyn Http2Connection>,
        max_concurrent_event_streams: usize,
        acquire_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            event_slots: Arc::new(Semaphore::new(max_concurrent_event_streams)),
            acquire_timeout,
            next_event_stream: AtomicU64::new(0),
            next_ping_stream: AtomicU64::new(0),
            downchannel_open: AtomicBool::new(false),
        })
    }

    /// Allocate a new stream on the physical connection and start sending
    ///
    /// The returned stream's handle carries the opaque id and best-effort
    /// `cancel`. Event-stream callers must hold a slot permit first.
    pub fn create_and_send_request(
        &self,
        config: Http2RequestConfig,
    ) -> Result<Http2Stream, Http2Error> {
        self.connection.create_and_send_request(config)
    }

    /// Wait for a free event-stream slot, bounded
    ///
    /// Saturation is a bounded wait: exceeding `acquire_timeout` fails with
    /// [`Http2Error::StreamLimit`] instead of hanging.
    pub async fn acquire_event_slot(
        self: &Arc<Self>,
    ) -> Result<OwnedSemaphorePermit, Http2Error> {
        match timeout(self.acquire_timeout, self.event_slots.clone().acquire_owned()).await {
            Err(_) => {
                debug!("event stream slots saturated for {:?}", self.acquire_timeout);
                Err(Http2Error::StreamLimit)
            }
            Ok(Err(_)) => Err(Http2Error::ConnectionClosed),
            Ok(Ok(permit)) => Ok(permit),
        }
    }

    /// Claim the downchannel slot; `false` if it is already open
    pub fn try_open_downchannel(&self) -> bool {
        !self.downchannel_open.swap(true, Ordering::AcqRel)
    }

    /// Release the downchannel slot after its stream finished
    pub fn downchannel_closed(&self) {
        self.downchannel_open.store(false, Ordering::Release);
    }

    /// Next opaque event-stream identifier
    pub fn next_event_stream_id(&self) -> String {
        format!(
            "AVSEVENT-{}",
            self.next_event_stream.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Next opaque ping-stream identifier
    pub fn next_ping_stream_id(&self) -> String {
        format!(
            "AVSPING-{}",
            self.next_ping_stream.fetch_add(1, Ordering::Relaxed)
        )
    }

    /// Tear down: no new slots, and the physical connection is dropped
    pub fn disconnect(&self) {
        self.event_slots.close();
        self.connection.disconnect();
    }

    /// Whether the physical connection is gone
    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }
}
