//! Per-stream exchange handlers
//!
//! Each outbound unit of work — the downchannel open, one event send, one
//! keepalive ping — is driven by a handler task that consumes the stream's
//! [`StreamEvent`]s and reports typed outcomes back to the owning pool
//! through [`ExchangeContext`].
//!
//! [`StreamEvent`]: crate::http2::StreamEvent

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::error::Http2Error;
use crate::http2::{Http2RequestConfig, Http2Stream};

mod downchannel;
mod message_handler;
mod ping;

pub use downchannel::DownchannelHandler;
pub use message_handler::MessageRequestHandler;
pub use ping::PingHandler;

/// Gateway path of the server-push directive stream
pub(crate) const DIRECTIVES_PATH: &str = "/v20160207/directives";
/// Gateway path events are POSTed to
pub(crate) const EVENTS_PATH: &str = "/v20160207/events";
/// Gateway path of the keepalive ping
pub(crate) const PING_PATH: &str = "/ping";

/// What the owning pool exposes to a handler, and what the handler reports
/// back
///
/// Implemented by the transport; handlers hold it as `Arc<dyn ..>` while the
/// pool keeps only weak knowledge of its handlers and may cancel their
/// underlying streams at any time. Each `on_*` terminal callback fires at
/// most once per terminal condition.
pub trait ExchangeContext: Send + Sync + 'static {
    /// Allocate a new stream on the physical connection and start sending
    fn create_and_send_request(&self, config: Http2RequestConfig) -> Result<Http2Stream, Http2Error>;

    /// Endpoint URL used for new stream creation
    fn gateway(&self) -> String;

    /// The downchannel response was acknowledged; directives may now arrive
    fn on_downchannel_connected(&self);
    /// The downchannel stream closed; the owner decides whether to re-create it
    fn on_downchannel_finished(&self);

    /// An event request's body was fully flushed to its stream
    fn on_message_request_sent(&self);
    /// The server acknowledged an event request with response headers
    fn on_message_request_acknowledged(&self, status: u16);
    /// An event request's stream fully closed, all callbacks done
    fn on_message_request_finished(&self);
    /// An event request saw no acknowledgment within its deadline
    fn on_message_request_timeout(&self);

    /// A ping resolved; `success` iff the server answered 2xx
    fn on_ping_acknowledged(&self, success: bool);
    /// A ping went unanswered within its deadline
    fn on_ping_timeout(&self);

    /// Bytes moved on some stream; resets the connection inactivity clock
    fn on_activity(&self);

    /// The server answered 403 for a stream carrying `token`
    fn on_forbidden(&self, token: &str);
}

/// Lifecycle of one exchange
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum HandlerState {
    /// Constructed; the drive task has not started
    Created,
    /// The exchange is in flight
    Ongoing,
    /// The exchange ran to a terminal outcome
    Completed,
    /// The exchange hit its acknowledgment deadline
    TimedOut,
    /// The exchange was canceled before completing
    Aborted,
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) type SharedState = Arc<Mutex<HandlerState>>;

pub(crate) fn shared_state() -> SharedState {
    Arc::new(Mutex::new(HandlerState::Created))
}

pub(crate) fn set_state(state: &SharedState, value: HandlerState) {
    *state.lock().unwrap() = value;
}

/// Set a terminal state only if the handler is still `Ongoing`
pub(crate) fn finish_state(state: &SharedState, value: HandlerState) {
    let mut guard = state.lock().unwrap();
    if matches!(*guard, HandlerState::Created | HandlerState::Ongoing) {
        *guard = value;
    }
}

/// Header pairs for one stream: `Authorization` first, then caller headers in
/// insertion order. This ordering is a wire-format contract.
pub(crate) fn build_headers(
    auth_token: &str,
    extra: &[(String, String)],
) -> Vec<(String, String)> {
    let mut headers = Vec::with_capacity(extra.len() + 1);
    headers.push(("Authorization".to_owned(), format!("Bearer {auth_token}")));
    headers.extend(extra.iter().cloned());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_always_first_then_insertion_order() {
        let extra = vec![
            ("k1".to_owned(), "v1".to_owned()),
            ("k2".to_owned(), "v2".to_owned()),
        ];
        let headers = build_headers("authToken", &extra);
        let lines: Vec<String> = headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();
        assert_eq!(
            lines,
            vec!["Authorization: Bearer authToken", "k1: v1", "k2: v2"]
        );
    }

    #[test]
    fn finish_state_does_not_overwrite_terminal() {
        let state = shared_state();
        set_state(&state, HandlerState::Ongoing);
        finish_state(&state, HandlerState::TimedOut);
        finish_state(&state, HandlerState::Completed);
        assert_eq!(*state.lock().unwrap(), HandlerState::TimedOut);
    }
}
