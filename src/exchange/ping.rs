use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    build_headers, finish_state, set_state, shared_state, ExchangeContext, HandlerState,
    SharedState, PING_PATH,
};
use crate::http2::{
    FinishReason, Http2RequestConfig, Http2Stream, Http2StreamHandle, RequestBody, StreamEvent,
};

/// Drives one keepalive ping exchange
///
/// An unanswered ping is the primary driver of ping-timeout connection
/// transitions; the handler itself only reports, the owner escalates.
pub struct PingHandler {
    state: SharedState,
    handle: Arc<Http2StreamHandle>,
}

impl PingHandler {
    /// Send a ping and resolve it within `ping_timeout`
    ///
    /// A zero timeout resolves the ping immediately (as a timeout) rather
    /// than blocking. Returns `None` on an empty token or failed stream
    /// creation, reporting `on_ping_acknowledged(false)` in the latter case.
    pub fn new(
        context: Arc<dyn ExchangeContext>,
        auth_token: &str,
        stream_id: String,
        ping_timeout: Duration,
    ) -> Option<Arc<Self>> {
        if auth_token.is_empty() {
            warn!("refusing to ping with an empty auth token");
            return None;
        }
        let config = Http2RequestConfig {
            id: stream_id.clone(),
            method: http::Method::GET,
            url: format!("{}{}", context.gateway(), PING_PATH),
            headers: build_headers(auth_token, &[]),
            body: RequestBody::Empty,
        };
        let stream = match context.create_and_send_request(config) {
            Ok(stream) => stream,
            Err(error) => {
                warn!(id = %stream_id, %error, "ping stream creation failed");
                context.on_ping_acknowledged(false);
                return None;
            }
        };

        let state = shared_state();
        let this = Arc::new(Self {
            state: state.clone(),
            handle: stream.handle(),
        });
        let span = debug_span!("ping", id = %stream_id);
        tokio::spawn(drive(state, context, stream, ping_timeout).instrument(span));
        Some(this)
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandlerState {
        *self.state.lock().unwrap()
    }

    /// Best-effort abort; `false` once the ping is already terminal
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }
}

async fn drive(
    state: SharedState,
    context: Arc<dyn ExchangeContext>,
    mut stream: Http2Stream,
    ping_timeout: Duration,
) {
    set_state(&state, HandlerState::Ongoing);
    let handle = stream.handle();
    let mut response_status: Option<u16> = None;

    loop {
        let event = match timeout(ping_timeout, stream.next_event()).await {
            Ok(event) => event,
            Err(_) => {
                debug!("ping unanswered within {ping_timeout:?}");
                handle.cancel();
                finish_state(&state, HandlerState::TimedOut);
                context.on_ping_timeout();
                return;
            }
        };
        let Some(event) = event else {
            finish_state(&state, HandlerState::Completed);
            context.on_ping_acknowledged(false);
            return;
        };
        context.on_activity();
        match event {
            StreamEvent::BodySent => {}
            StreamEvent::Headers { status } => response_status = Some(status),
            StreamEvent::Data(_) => {}
            StreamEvent::Finished(reason) => {
                let success = matches!(reason, FinishReason::Complete)
                    && matches!(response_status, Some(status) if (200..300).contains(&status));
                match reason {
                    FinishReason::Canceled => finish_state(&state, HandlerState::Aborted),
                    _ => finish_state(&state, HandlerState::Completed),
                }
                context.on_ping_acknowledged(success);
                return;
            }
        }
    }
}
