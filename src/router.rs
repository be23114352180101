use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::config::TransportConfig;
use crate::connection_state::ConnectionStateMachine;
use crate::message::MessageRequest;
use crate::observer::{
    AttachmentManager, AuthTokenProvider, ConnectionStatusObserver, MessageConsumer,
    MetricRecorder,
};
use crate::status::{ConnectionStatus, SendMessageStatus};
use crate::transport::{Command, Http2Transport, TransportHandle};
use crate::http2::Http2ConnectionFactory;

/// Top-level façade over the transport
///
/// The rest of the SDK hands outbound [`MessageRequest`]s here and learns
/// about connectivity through [`ConnectionStatusObserver`]s; inbound
/// directive bytes flow to the [`MessageConsumer`] given at construction.
/// All sends are asynchronous: completion is reported only through the
/// request's own observers, never via a return value.
pub struct MessageRouter {
    config: TransportConfig,
    factory: Arc<dyn Http2ConnectionFactory>,
    auth: Arc<dyn AuthTokenProvider>,
    consumer: Arc<dyn MessageConsumer>,
    attachments: Arc<dyn AttachmentManager>,
    metrics: Arc<dyn MetricRecorder>,
    state: Arc<ConnectionStateMachine>,
    inner: Mutex<Inner>,
}

struct Inner {
    gateway: String,
    transport: Option<TransportHandle>,
}

impl MessageRouter {
    /// A router that will connect to `gateway` once enabled
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TransportConfig,
        factory: Arc<dyn Http2ConnectionFactory>,
        auth: Arc<dyn AuthTokenProvider>,
        consumer: Arc<dyn MessageConsumer>,
        attachments: Arc<dyn AttachmentManager>,
        metrics: Arc<dyn MetricRecorder>,
        gateway: impl Into<String>,
    ) -> Self {
        Self {
            config,
            factory,
            auth,
            consumer,
            attachments,
            metrics,
            state: Arc::new(ConnectionStateMachine::new()),
            inner: Mutex::new(Inner {
                gateway: gateway.into(),
                transport: None,
            }),
        }
    }

    /// Start connecting; must be called within a tokio runtime
    ///
    /// Idempotent: a second call while enabled does nothing.
    pub fn enable(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.transport.is_some() {
            return;
        }
        info!(gateway = %inner.gateway, "enabling transport");
        inner.transport = Some(Http2Transport::spawn(
            self.config.clone(),
            self.factory.clone(),
            self.auth.clone(),
            self.consumer.clone(),
            self.attachments.clone(),
            self.metrics.clone(),
            self.state.clone(),
            inner.gateway.clone(),
        ));
    }

    /// Stop the transport; queued requests resolve `Canceled`
    pub fn disable(&self) {
        let handle = self.inner.lock().unwrap().transport.take();
        if let Some(handle) = handle {
            handle.command(Command::Shutdown);
        }
    }

    /// Hand `request` to the transport; returns immediately
    ///
    /// While disabled, the request resolves `NotConnected`. While a
    /// reconnect is in progress, requests queue FIFO and go out once the
    /// connection is re-established.
    pub fn send_message(&self, request: Arc<MessageRequest>) {
        let inner = self.inner.lock().unwrap();
        match &inner.transport {
            Some(handle) => {
                if !handle.command(Command::Send(request.clone())) {
                    request.complete(SendMessageStatus::NotConnected);
                }
            }
            None => {
                debug!("send while disabled");
                request.complete(SendMessageStatus::NotConnected);
            }
        }
    }

    /// `true` iff the current status is `Connected` (`Pending` counts as not)
    pub fn is_connected(&self) -> bool {
        self.state.status() == ConnectionStatus::Connected
    }

    /// Register a status observer; it is synchronously told the current
    /// (status, reason) before this returns
    pub fn add_connection_status_observer(&self, observer: Arc<dyn ConnectionStatusObserver>) {
        self.state.add_observer(observer);
    }

    /// Deregister a status observer
    pub fn remove_connection_status_observer(&self, observer: &Arc<dyn ConnectionStatusObserver>) {
        self.state.remove_observer(observer);
    }

    /// The gateway used for new connections
    pub fn gateway(&self) -> String {
        self.inner.lock().unwrap().gateway.clone()
    }

    /// Use `gateway` for future connections
    ///
    /// Already-open streams are unaffected; if connected, the transport
    /// reconnects to the new endpoint.
    pub fn set_gateway(&self, gateway: impl Into<String>) {
        let gateway = gateway.into();
        let mut inner = self.inner.lock().unwrap();
        if inner.gateway == gateway {
            return;
        }
        inner.gateway = gateway.clone();
        if let Some(handle) = &inner.transport {
            handle.command(Command::SetGateway(gateway));
        }
    }

    /// The shared connection state, for composition with other components
    pub fn connection_state(&self) -> &Arc<ConnectionStateMachine> {
        &self.state
    }

    /// Disable and drop all status observers
    pub fn shutdown(&self) {
        self.disable();
        self.state.clear_observers();
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.disable();
    }
}
