//! Connection lifecycle: connect, downchannel, keepalive, reconnect
//!
//! One transport task owns the physical connection end to end. It dials the
//! gateway, opens the downchannel, then sits in a select loop dispatching
//! event sends, scheduling pings off connection inactivity, and tearing the
//! session down when the downchannel finishes or a ping goes unanswered.
//! Reconnection delays come from the injected [`RetryPolicy`].
//!
//! [`RetryPolicy`]: crate::RetryPolicy

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::config::TransportConfig;
use crate::connection_state::ConnectionStateMachine;
use crate::error::Http2Error;
use crate::exchange::{
    DownchannelHandler, ExchangeContext, MessageRequestHandler, PingHandler,
};
use crate::http2::{Http2ConnectionFactory, Http2RequestConfig, Http2Stream};
use crate::message::MessageRequest;
use crate::observer::{AttachmentManager, AuthTokenProvider, MessageConsumer, MetricRecorder};
use crate::pool::{StreamPool, DOWNCHANNEL_STREAM_ID};
use crate::status::{ChangedReason, ConnectionStatus, SendMessageStatus};

/// Instructions from the router to the transport task
#[derive(Debug)]
pub(crate) enum Command {
    /// Dispatch one event request
    Send(Arc<MessageRequest>),
    /// Use a new gateway for future connections
    SetGateway(String),
    /// Tear everything down and end the task
    Shutdown,
}

/// Reports from exchange handlers to the transport task
#[derive(Debug)]
enum SessionEvent {
    DownchannelConnected,
    DownchannelFinished,
    PingAcknowledged(bool),
    PingTimeout,
    Forbidden(String),
}

/// Sender half owned by the router once the transport task is spawned
#[derive(Debug)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl TransportHandle {
    pub(crate) fn command(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }
}

/// Owns the persistent connection to the gateway and multiplexes all streams
/// over it
pub struct Http2Transport {
    config: TransportConfig,
    factory: Arc<dyn Http2ConnectionFactory>,
    auth: Arc<dyn AuthTokenProvider>,
    consumer: Arc<dyn MessageConsumer>,
    attachments: Arc<dyn AttachmentManager>,
    metrics: Arc<dyn MetricRecorder>,
    state: Arc<ConnectionStateMachine>,
}

enum Flow {
    /// Delay elapsed; try the next attempt
    Retry,
    /// The gateway changed; try again immediately
    Reconnect,
    /// Shutdown was requested; the task must end
    Shutdown,
}

impl Http2Transport {
    /// Spawn the transport task; must be called within a tokio runtime
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        config: TransportConfig,
        factory: Arc<dyn Http2ConnectionFactory>,
        auth: Arc<dyn AuthTokenProvider>,
        consumer: Arc<dyn MessageConsumer>,
        attachments: Arc<dyn AttachmentManager>,
        metrics: Arc<dyn MetricRecorder>,
        state: Arc<ConnectionStateMachine>,
        gateway: String,
    ) -> TransportHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let transport = Self {
            config,
            factory,
            auth,
            consumer,
            attachments,
            metrics,
            state,
        };
        tokio::spawn(
            transport
                .run(gateway, commands_rx)
                .instrument(info_span!("transport")),
        );
        TransportHandle {
            commands: commands_tx,
        }
    }

    async fn run(self, mut gateway: String, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempt: u32 = 0;
        let mut connect_reason = ChangedReason::ClientRequest;
        let mut queued: VecDeque<Arc<MessageRequest>> = VecDeque::new();
        self.state
            .update(ConnectionStatus::Pending, connect_reason);

        loop {
            let token = match self.auth.auth_token().filter(|t| !t.is_empty()) {
                Some(token) => token,
                None => {
                    warn!("no auth token available, delaying connection");
                    self.state
                        .update(ConnectionStatus::Pending, ChangedReason::InvalidAuth);
                    match self
                        .backoff(&mut commands, &mut queued, &mut gateway, attempt)
                        .await
                    {
                        Flow::Retry => attempt += 1,
                        Flow::Reconnect => {
                            attempt = 0;
                            connect_reason = ChangedReason::ServerEndpointChanged;
                        }
                        Flow::Shutdown => return,
                    }
                    continue;
                }
            };

            debug!(%gateway, attempt, "connecting");
            let connection = match self.factory.connect(&gateway).await {
                Ok(connection) => connection,
                Err(error) => {
                    warn!(%error, "connection attempt failed");
                    self.state
                        .update(ConnectionStatus::Pending, error.changed_reason());
                    match self
                        .backoff(&mut commands, &mut queued, &mut gateway, attempt)
                        .await
                    {
                        Flow::Retry => attempt += 1,
                        Flow::Reconnect => {
                            attempt = 0;
                            connect_reason = ChangedReason::ServerEndpointChanged;
                        }
                        Flow::Shutdown => return,
                    }
                    continue;
                }
            };

            let pool = StreamPool::new(
                connection,
                self.config.max_concurrent_event_streams,
                self.config.stream_acquire_timeout,
            );
            let (events_tx, mut events) = mpsc::unbounded_channel();
            let last_activity = Arc::new(Mutex::new(Instant::now()));
            let ctx: Arc<dyn ExchangeContext> = Arc::new(SessionContext {
                pool: pool.clone(),
                gateway: gateway.clone(),
                events: events_tx,
                last_activity: last_activity.clone(),
            });

            pool.try_open_downchannel();
            let downchannel = DownchannelHandler::new(
                ctx.clone(),
                &token,
                self.consumer.clone(),
                DOWNCHANNEL_STREAM_ID.to_owned(),
                self.config.connect_timeout,
            );
            if downchannel.is_none() {
                self.state
                    .update(ConnectionStatus::Pending, ChangedReason::InternalError);
                pool.disconnect();
                match self
                    .backoff(&mut commands, &mut queued, &mut gateway, attempt)
                    .await
                {
                    Flow::Retry => attempt += 1,
                    Flow::Reconnect => {
                        attempt = 0;
                        connect_reason = ChangedReason::ServerEndpointChanged;
                    }
                    Flow::Shutdown => return,
                }
                continue;
            }

            // Establishment: the downchannel handler enforces its own connect
            // deadline and reports back either way.
            let mut forbidden = false;
            let mut endpoint_changed = false;
            let established = loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(SessionEvent::DownchannelConnected) => break true,
                        Some(SessionEvent::DownchannelFinished) | None => break false,
                        Some(SessionEvent::Forbidden(bad_token)) => {
                            forbidden = true;
                            self.auth.on_auth_failure(&bad_token);
                        }
                        Some(_) => {}
                    },
                    command = commands.recv() => match command {
                        None | Some(Command::Shutdown) => {
                            self.shutdown(Some(&pool), &mut queued, &mut commands);
                            return;
                        }
                        Some(Command::Send(request)) => queued.push_back(request),
                        Some(Command::SetGateway(url)) => {
                            if url != gateway {
                                gateway = url;
                                endpoint_changed = true;
                                break false;
                            }
                        }
                    },
                }
            };
            if !established {
                let reason = if endpoint_changed {
                    ChangedReason::ServerEndpointChanged
                } else if forbidden {
                    ChangedReason::InvalidAuth
                } else {
                    ChangedReason::ConnectTimeout
                };
                self.state.update(ConnectionStatus::Pending, reason);
                pool.disconnect();
                if endpoint_changed {
                    attempt = 0;
                    connect_reason = ChangedReason::ServerEndpointChanged;
                    continue;
                }
                match self
                    .backoff(&mut commands, &mut queued, &mut gateway, attempt)
                    .await
                {
                    Flow::Retry => attempt += 1,
                    Flow::Reconnect => {
                        attempt = 0;
                        connect_reason = ChangedReason::ServerEndpointChanged;
                    }
                    Flow::Shutdown => return,
                }
                continue;
            }

            info!(%gateway, "connected");
            attempt = 0;
            self.state.update(ConnectionStatus::Connected, connect_reason);
            while let Some(request) = queued.pop_front() {
                self.dispatch(request, &ctx, &pool);
            }

            // Connected: dispatch sends, watch session health, ping on idle.
            let mut ping_in_flight = false;
            let disconnect_reason = loop {
                let deadline = if ping_in_flight {
                    Instant::now() + self.config.inactivity_timeout
                } else {
                    *last_activity.lock().unwrap() + self.config.inactivity_timeout
                };
                tokio::select! {
                    command = commands.recv() => match command {
                        None | Some(Command::Shutdown) => {
                            self.shutdown(Some(&pool), &mut queued, &mut commands);
                            return;
                        }
                        Some(Command::Send(request)) => self.dispatch(request, &ctx, &pool),
                        Some(Command::SetGateway(url)) => {
                            if url != gateway {
                                gateway = url;
                                break ChangedReason::ServerEndpointChanged;
                            }
                        }
                    },
                    event = events.recv() => match event {
                        Some(SessionEvent::DownchannelConnected) => {}
                        Some(SessionEvent::DownchannelFinished) | None => {
                            break ChangedReason::ServerSideDisconnect;
                        }
                        Some(SessionEvent::PingAcknowledged(true)) => ping_in_flight = false,
                        Some(SessionEvent::PingAcknowledged(false))
                        | Some(SessionEvent::PingTimeout) => break ChangedReason::PingTimeout,
                        Some(SessionEvent::Forbidden(bad_token)) => {
                            self.auth.on_auth_failure(&bad_token);
                            break ChangedReason::InvalidAuth;
                        }
                    },
                    _ = sleep_until(deadline) => {
                        let idle = last_activity.lock().unwrap().elapsed()
                            >= self.config.inactivity_timeout;
                        if idle && !ping_in_flight {
                            let Some(ping_token) =
                                self.auth.auth_token().filter(|t| !t.is_empty())
                            else {
                                break ChangedReason::InvalidAuth;
                            };
                            trace!("connection idle, sending ping");
                            *last_activity.lock().unwrap() = Instant::now();
                            if PingHandler::new(
                                ctx.clone(),
                                &ping_token,
                                pool.next_ping_stream_id(),
                                self.config.ping_timeout,
                            )
                            .is_some()
                            {
                                ping_in_flight = true;
                            }
                        }
                    },
                }
            };

            pool.disconnect();
            self.state
                .update(ConnectionStatus::Pending, disconnect_reason);
            connect_reason = disconnect_reason;
            if disconnect_reason == ChangedReason::ServerEndpointChanged {
                // Endpoint changes reconnect immediately.
                continue;
            }
            match self
                .backoff(&mut commands, &mut queued, &mut gateway, attempt)
                .await
            {
                Flow::Retry => attempt += 1,
                Flow::Reconnect => {
                    attempt = 0;
                    connect_reason = ChangedReason::ServerEndpointChanged;
                }
                Flow::Shutdown => return,
            }
        }
    }

    /// Wait out the retry delay while still honoring commands
    async fn backoff(
        &self,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        queued: &mut VecDeque<Arc<MessageRequest>>,
        gateway: &mut String,
        attempt: u32,
    ) -> Flow {
        let delay = self.config.retry_policy.delay(attempt);
        debug!(?delay, attempt, "waiting before reconnect");
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return Flow::Retry,
                command = commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        self.shutdown(None, queued, commands);
                        return Flow::Shutdown;
                    }
                    Some(Command::Send(request)) => queued.push_back(request),
                    Some(Command::SetGateway(url)) => {
                        if url != *gateway {
                            *gateway = url;
                            return Flow::Reconnect;
                        }
                    }
                },
            }
        }
    }

    /// Cancel everything queued and report the terminal disconnect
    fn shutdown(
        &self,
        pool: Option<&Arc<StreamPool>>,
        queued: &mut VecDeque<Arc<MessageRequest>>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) {
        if let Some(pool) = pool {
            pool.disconnect();
        }
        for request in queued.drain(..) {
            request.complete(SendMessageStatus::Canceled);
        }
        while let Ok(command) = commands.try_recv() {
            if let Command::Send(request) = command {
                request.complete(SendMessageStatus::Canceled);
            }
        }
        self.state
            .update(ConnectionStatus::Disconnected, ChangedReason::Disabled);
        info!("transport shut down");
    }

    /// Run one event request: wait for a slot, then hand off to a handler
    fn dispatch(
        &self,
        request: Arc<MessageRequest>,
        ctx: &Arc<dyn ExchangeContext>,
        pool: &Arc<StreamPool>,
    ) {
        let ctx = ctx.clone();
        let pool = pool.clone();
        let auth = self.auth.clone();
        let consumer = self.consumer.clone();
        let attachments = self.attachments.clone();
        let metrics = self.metrics.clone();
        let ack_timeout = self.config.ack_timeout;
        tokio::spawn(async move {
            let permit = match pool.acquire_event_slot().await {
                Ok(permit) => permit,
                Err(Http2Error::StreamLimit) => {
                    request.complete(SendMessageStatus::InternalError);
                    return;
                }
                Err(_) => {
                    request.complete(SendMessageStatus::NotConnected);
                    return;
                }
            };
            let Some(token) = auth.auth_token().filter(|t| !t.is_empty()) else {
                request.complete(SendMessageStatus::InvalidAuth);
                return;
            };
            let stream_id = pool.next_event_stream_id();
            let _handler = MessageRequestHandler::new(
                ctx,
                &token,
                request,
                consumer,
                attachments,
                metrics,
                stream_id,
                ack_timeout,
                Some(permit),
            );
        });
    }
}

/// Per-connection [`ExchangeContext`]: the relationship object between the
/// pool and its handlers
struct SessionContext {
    pool: Arc<StreamPool>,
    gateway: String,
    events: mpsc::UnboundedSender<SessionEvent>,
    last_activity: Arc<Mutex<Instant>>,
}

impl SessionContext {
    fn emit(&self, event: SessionEvent) {
        // The session may already be torn down; late handler reports are fine
        // to drop.
        let _ = self.events.send(event);
    }
}

impl ExchangeContext for SessionContext {
    fn create_and_send_request(
        &self,
        config: Http2RequestConfig,
    ) -> Result<Http2Stream, Http2Error> {
        self.pool.create_and_send_request(config)
    }

    fn gateway(&self) -> String {
        self.gateway.clone()
    }

    fn on_downchannel_connected(&self) {
        self.emit(SessionEvent::DownchannelConnected);
    }

    fn on_downchannel_finished(&self) {
        self.pool.downchannel_closed();
        self.emit(SessionEvent::DownchannelFinished);
    }

    fn on_message_request_sent(&self) {
        trace!("event request body sent");
    }

    fn on_message_request_acknowledged(&self, status: u16) {
        trace!(status, "event request acknowledged");
    }

    fn on_message_request_finished(&self) {
        trace!("event request finished");
    }

    fn on_message_request_timeout(&self) {
        // A single slow event stream does not indict the connection; pings
        // decide connection health.
        debug!("event request timed out");
    }

    fn on_ping_acknowledged(&self, success: bool) {
        self.emit(SessionEvent::PingAcknowledged(success));
    }

    fn on_ping_timeout(&self) {
        self.emit(SessionEvent::PingTimeout);
    }

    fn on_activity(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    fn on_forbidden(&self, token: &str) {
        self.emit(SessionEvent::Forbidden(token.to_owned()));
    }
}
