//! In-process fakes shared by the test suite
//!
//! The wire is mocked one seam below the exchange handlers: a
//! [`MockConnection`] hands out real [`Http2Stream`]s whose producer sides
//! the test holds, so every timeout, cancellation, and callback path runs
//! exactly as in production. Callback results are awaited through one-shot
//! result cells built on [`Notify`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};

use crate::error::Http2Error;
use crate::exchange::ExchangeContext;
use crate::http2::{
    ConnectFuture, FinishReason, Http2Connection, Http2ConnectionFactory, Http2RequestConfig,
    Http2Stream, RequestBody, StreamEvent, StreamEventSender, StreamRegistry,
};
use crate::observer::{
    AttachmentManager, AttachmentSink, AttachmentSource, AuthTokenProvider,
    ConnectionStatusObserver, MessageConsumer, MessageRequestObserver,
};
use crate::status::{ChangedReason, ConnectionStatus, SendMessageStatus};

pub(crate) fn subscribe() -> tracing::subscriber::DefaultGuard {
    let sub = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .finish();
    tracing::subscriber::set_default(sub)
}

/// One stream created on a [`MockConnection`], as seen by the test
pub(crate) struct MockRequest {
    pub id: String,
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub events: StreamEventSender,
}

impl MockRequest {
    /// Play out a whole exchange: body flushed, headers, optional body, done
    pub async fn respond(&self, status: u16, body: Option<&[u8]>) {
        self.events.send(StreamEvent::BodySent).await;
        self.events.send(StreamEvent::Headers { status }).await;
        if let Some(body) = body {
            self.events
                .send(StreamEvent::Data(Bytes::copy_from_slice(body)))
                .await;
        }
        self.events.finish(FinishReason::Complete).await;
    }

    /// Collect the request body the client is sending
    pub async fn body_bytes(&mut self) -> Vec<u8> {
        match &mut self.body {
            RequestBody::Empty => Vec::new(),
            RequestBody::Bytes(bytes) => bytes.to_vec(),
            RequestBody::Stream(rx) => {
                let mut out = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk);
                }
                out
            }
        }
    }
}

/// Connection fake: every created stream is surfaced to the test
#[derive(Debug)]
pub(crate) struct MockConnection {
    requests: mpsc::UnboundedSender<MockRequest>,
    closed: AtomicBool,
    streams: StreamRegistry,
}

pub(crate) struct MockRequests(mpsc::UnboundedReceiver<MockRequest>);

impl MockRequests {
    /// Next stream the code under test created
    pub async fn next(&mut self) -> MockRequest {
        self.0.recv().await.expect("mock connection dropped")
    }
}

impl MockConnection {
    pub fn new() -> (Arc<Self>, MockRequests) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                requests: tx,
                closed: AtomicBool::new(false),
                streams: StreamRegistry::default(),
            }),
            MockRequests(rx),
        )
    }
}

impl Http2Connection for MockConnection {
    fn create_and_send_request(
        &self,
        config: Http2RequestConfig,
    ) -> Result<Http2Stream, Http2Error> {
        if self.is_closed() {
            return Err(Http2Error::ConnectionClosed);
        }
        let (stream, events) = Http2Stream::channel(config.id.clone());
        self.streams.register(events.clone());
        let _ = self.requests.send(MockRequest {
            id: config.id,
            method: config.method,
            url: config.url,
            headers: config.headers,
            body: config.body,
            events,
        });
        Ok(stream)
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        self.streams.finish_all(Http2Error::ConnectionClosed);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Factory that hands out pre-queued mock connections
pub(crate) struct MockFactory {
    connections: Mutex<VecDeque<Arc<MockConnection>>>,
    gateways: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(VecDeque::new()),
            gateways: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, connection: Arc<MockConnection>) {
        self.connections.lock().unwrap().push_back(connection);
    }

    pub fn connected_gateways(&self) -> Vec<String> {
        self.gateways.lock().unwrap().clone()
    }
}

impl Http2ConnectionFactory for MockFactory {
    fn connect(&self, gateway: &str) -> ConnectFuture {
        let next = self.connections.lock().unwrap().pop_front();
        self.gateways.lock().unwrap().push(gateway.to_owned());
        Box::pin(async move {
            match next {
                Some(connection) => Ok(connection as Arc<dyn Http2Connection>),
                None => Err(Http2Error::ConnectTimeout),
            }
        })
    }
}

/// One-shot style recorder for connection-status transitions
#[derive(Default)]
pub(crate) struct StatusRecorder {
    seen: Mutex<Vec<(ConnectionStatus, ChangedReason)>>,
    notify: Notify,
}

impl StatusRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seen(&self) -> Vec<(ConnectionStatus, ChangedReason)> {
        self.seen.lock().unwrap().clone()
    }

    /// Await the first transition matching `pred`
    pub async fn wait_for(
        &self,
        mut pred: impl FnMut(ConnectionStatus, ChangedReason) -> bool,
    ) -> (ConnectionStatus, ChangedReason) {
        loop {
            let notified = self.notify.notified();
            if let Some(hit) = self
                .seen
                .lock()
                .unwrap()
                .iter()
                .copied()
                .find(|(s, r)| pred(*s, *r))
            {
                return hit;
            }
            notified.await;
        }
    }
}

impl ConnectionStatusObserver for StatusRecorder {
    fn on_connection_status_changed(&self, status: ConnectionStatus, reason: ChangedReason) {
        self.seen.lock().unwrap().push((status, reason));
        self.notify.notify_waiters();
    }
}

/// Recorder for one request's outcome
#[derive(Default)]
pub(crate) struct CompletionRecorder {
    statuses: Mutex<Vec<SendMessageStatus>>,
    exceptions: Mutex<Vec<String>>,
    notify: Notify,
}

impl CompletionRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses(&self) -> Vec<SendMessageStatus> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn terminal_statuses(&self) -> Vec<SendMessageStatus> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|s| s.is_terminal())
            .collect()
    }

    pub fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().unwrap().clone()
    }

    /// Await the terminal status
    pub async fn wait_terminal(&self) -> SendMessageStatus {
        loop {
            let notified = self.notify.notified();
            if let Some(status) = self
                .statuses
                .lock()
                .unwrap()
                .iter()
                .copied()
                .find(|s| s.is_terminal())
            {
                return status;
            }
            notified.await;
        }
    }
}

impl MessageRequestObserver for CompletionRecorder {
    fn on_send_completed(&self, status: SendMessageStatus) {
        self.statuses.lock().unwrap().push(status);
        self.notify.notify_waiters();
    }

    fn on_exception_received(&self, exception_message: &str) {
        self.exceptions
            .lock()
            .unwrap()
            .push(exception_message.to_owned());
    }
}

/// Context-callback record for handler unit tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ContextCall {
    DownchannelConnected,
    DownchannelFinished,
    Sent,
    Acknowledged(u16),
    Finished,
    Timeout,
    PingAcknowledged(bool),
    PingTimeout,
    Forbidden(String),
}

/// [`ExchangeContext`] fake recording every callback in order
pub(crate) struct MockContext {
    connection: Arc<MockConnection>,
    gateway: String,
    calls: Mutex<Vec<ContextCall>>,
    notify: Notify,
}

impl MockContext {
    pub fn new(connection: Arc<MockConnection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            gateway: "https://gateway.example".to_owned(),
            calls: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }

    /// Calls so far, activity omitted
    pub fn calls(&self) -> Vec<ContextCall> {
        self.calls.lock().unwrap().clone()
    }

    pub async fn wait_for_call(&self, expected: ContextCall) {
        loop {
            let notified = self.notify.notified();
            if self.calls.lock().unwrap().contains(&expected) {
                return;
            }
            notified.await;
        }
    }

    fn record(&self, call: ContextCall) {
        self.calls.lock().unwrap().push(call);
        self.notify.notify_waiters();
    }
}

impl ExchangeContext for MockContext {
    fn create_and_send_request(
        &self,
        config: Http2RequestConfig,
    ) -> Result<Http2Stream, Http2Error> {
        self.connection.create_and_send_request(config)
    }

    fn gateway(&self) -> String {
        self.gateway.clone()
    }

    fn on_downchannel_connected(&self) {
        self.record(ContextCall::DownchannelConnected);
    }

    fn on_downchannel_finished(&self) {
        self.record(ContextCall::DownchannelFinished);
    }

    fn on_message_request_sent(&self) {
        self.record(ContextCall::Sent);
    }

    fn on_message_request_acknowledged(&self, status: u16) {
        self.record(ContextCall::Acknowledged(status));
    }

    fn on_message_request_finished(&self) {
        self.record(ContextCall::Finished);
    }

    fn on_message_request_timeout(&self) {
        self.record(ContextCall::Timeout);
    }

    fn on_ping_acknowledged(&self, success: bool) {
        self.record(ContextCall::PingAcknowledged(success));
    }

    fn on_ping_timeout(&self) {
        self.record(ContextCall::PingTimeout);
    }

    fn on_activity(&self) {}

    fn on_forbidden(&self, token: &str) {
        self.record(ContextCall::Forbidden(token.to_owned()));
    }
}

/// Consumer collecting inbound message bytes
#[derive(Default)]
pub(crate) struct CollectingConsumer {
    messages: Mutex<Vec<Bytes>>,
    notify: Notify,
}

impl CollectingConsumer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Bytes> {
        self.messages.lock().unwrap().clone()
    }

    pub async fn wait_for_message(&self) -> Bytes {
        loop {
            let notified = self.notify.notified();
            if let Some(first) = self.messages.lock().unwrap().first().cloned() {
                return first;
            }
            notified.await;
        }
    }
}

impl MessageConsumer for CollectingConsumer {
    fn on_message(&self, bytes: Bytes) {
        self.messages.lock().unwrap().push(bytes);
        self.notify.notify_waiters();
    }
}

/// Token provider with a settable token and failure log
pub(crate) struct FixedAuth {
    token: Mutex<Option<String>>,
    failures: Mutex<Vec<String>>,
}

impl FixedAuth {
    pub fn new(token: &str) -> Arc<Self> {
        Arc::new(Self {
            token: Mutex::new(Some(token.to_owned())),
            failures: Mutex::new(Vec::new()),
        })
    }

    pub fn failures(&self) -> Vec<String> {
        self.failures.lock().unwrap().clone()
    }
}

impl AuthTokenProvider for FixedAuth {
    fn auth_token(&self) -> Option<String> {
        self.token.lock().unwrap().clone()
    }

    fn on_auth_failure(&self, token: &str) {
        self.failures.lock().unwrap().push(token.to_owned());
    }
}

/// Attachment manager serving in-memory blobs by id
#[derive(Default)]
pub(crate) struct MemoryAttachments {
    blobs: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryAttachments {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, id: &str, bytes: Vec<u8>) {
        self.blobs.lock().unwrap().push((id.to_owned(), bytes));
    }
}

impl AttachmentManager for MemoryAttachments {
    fn open_reader(&self, attachment_id: &str) -> Option<AttachmentSource> {
        self.blobs
            .lock()
            .unwrap()
            .iter()
            .find(|(id, _)| id == attachment_id)
            .map(|(_, bytes)| Box::new(std::io::Cursor::new(bytes.clone())) as AttachmentSource)
    }

    fn open_writer(&self, _attachment_id: &str) -> Option<AttachmentSink> {
        None
    }
}
