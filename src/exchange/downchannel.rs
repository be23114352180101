use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, debug_span, info, warn, Instrument};

use super::{
    build_headers, finish_state, set_state, shared_state, ExchangeContext, HandlerState,
    SharedState, DIRECTIVES_PATH,
};
use crate::http2::{
    FinishReason, Http2RequestConfig, Http2Stream, Http2StreamHandle, RequestBody, StreamEvent,
};
use crate::observer::MessageConsumer;

/// Drives the single long-lived directive stream
///
/// Never carries a [`MessageRequest`]; stays open indefinitely forwarding
/// server-pushed bytes to the [`MessageConsumer`], and is re-created by its
/// owner whenever it finishes — never by itself.
///
/// [`MessageRequest`]: crate::MessageRequest
pub struct DownchannelHandler {
    state: SharedState,
    handle: Arc<Http2StreamHandle>,
}

impl DownchannelHandler {
    /// Open the downchannel stream and start reading it
    ///
    /// Returns `None` on an empty token or failed stream creation; the
    /// context hears `on_downchannel_finished` in the failure case so the
    /// owner's bookkeeping stays consistent.
    pub fn new(
        context: Arc<dyn ExchangeContext>,
        auth_token: &str,
        consumer: Arc<dyn MessageConsumer>,
        stream_id: String,
        connect_timeout: Duration,
    ) -> Option<Arc<Self>> {
        if auth_token.is_empty() {
            warn!("refusing to open downchannel with an empty auth token");
            return None;
        }
        let config = Http2RequestConfig {
            id: stream_id.clone(),
            method: http::Method::GET,
            url: format!("{}{}", context.gateway(), DIRECTIVES_PATH),
            headers: build_headers(auth_token, &[]),
            body: RequestBody::Empty,
        };
        let stream = match context.create_and_send_request(config) {
            Ok(stream) => stream,
            Err(error) => {
                warn!(id = %stream_id, %error, "downchannel stream creation failed");
                context.on_downchannel_finished();
                return None;
            }
        };

        let state = shared_state();
        let this = Arc::new(Self {
            state: state.clone(),
            handle: stream.handle(),
        });
        let span = debug_span!("downchannel", id = %stream_id);
        let token = auth_token.to_owned();
        tokio::spawn(drive(state, context, consumer, stream, token, connect_timeout).instrument(span));
        Some(this)
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandlerState {
        *self.state.lock().unwrap()
    }

    /// Best-effort abort; `false` once the stream is already terminal
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }
}

async fn drive(
    state: SharedState,
    context: Arc<dyn ExchangeContext>,
    consumer: Arc<dyn MessageConsumer>,
    mut stream: Http2Stream,
    auth_token: String,
    connect_timeout: Duration,
) {
    set_state(&state, HandlerState::Ongoing);
    let handle = stream.handle();
    let mut connected = false;

    loop {
        // Before acknowledgment the connect deadline applies; afterwards the
        // stream idles indefinitely between directives.
        let event = if connected {
            stream.next_event().await
        } else {
            match timeout(connect_timeout, stream.next_event()).await {
                Ok(event) => event,
                Err(_) => {
                    debug!("downchannel not acknowledged within {connect_timeout:?}");
                    handle.cancel();
                    finish_state(&state, HandlerState::TimedOut);
                    context.on_downchannel_finished();
                    return;
                }
            }
        };
        let Some(event) = event else {
            finish_state(&state, HandlerState::Completed);
            context.on_downchannel_finished();
            return;
        };
        context.on_activity();
        match event {
            StreamEvent::BodySent => {}
            StreamEvent::Headers { status } => {
                if (200..300).contains(&status) {
                    info!(status, "downchannel established");
                    connected = true;
                    context.on_downchannel_connected();
                } else {
                    warn!(status, "downchannel refused");
                    if status == 403 {
                        context.on_forbidden(&auth_token);
                    }
                }
            }
            StreamEvent::Data(bytes) => {
                if connected {
                    consumer.on_message(bytes);
                }
            }
            StreamEvent::Finished(reason) => {
                match reason {
                    FinishReason::Complete => finish_state(&state, HandlerState::Completed),
                    FinishReason::Canceled => finish_state(&state, HandlerState::Aborted),
                    FinishReason::Error(error) => {
                        warn!(%error, "downchannel stream failed");
                        finish_state(&state, HandlerState::Completed);
                    }
                }
                context.on_downchannel_finished();
                return;
            }
        }
    }
}
