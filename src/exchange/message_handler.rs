use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::{timeout, Instant};
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    build_headers, finish_state, set_state, shared_state, ExchangeContext, HandlerState,
    SharedState, EVENTS_PATH,
};
use crate::http2::{
    mime, FinishReason, Http2RequestConfig, Http2Stream, Http2StreamHandle, RequestBody,
    StreamEvent,
};
use crate::message::{AttachmentPayload, MessageRequest};
use crate::observer::{AttachmentManager, MessageConsumer, MetricRecorder, StreamMetric};
use crate::status::SendMessageStatus;
use crate::error::Http2Error;

/// Drives one [`MessageRequest`] through its stream lifecycle
///
/// `Created → Ongoing → (Completed | TimedOut | Aborted)`. Exactly one
/// terminal [`SendMessageStatus`] reaches the request's observers, whatever
/// path the exchange takes.
pub struct MessageRequestHandler {
    state: SharedState,
    handle: Arc<Http2StreamHandle>,
    header_lines: Vec<String>,
}

impl MessageRequestHandler {
    /// Create the stream for `request` and start driving it
    ///
    /// Returns `None` when the token is empty, the attachment cannot be
    /// resolved, or the stream cannot be created; in every failure case the
    /// request still receives a terminal status before this returns.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        context: Arc<dyn ExchangeContext>,
        auth_token: &str,
        request: Arc<MessageRequest>,
        consumer: Arc<dyn MessageConsumer>,
        attachment_manager: Arc<dyn AttachmentManager>,
        metrics: Arc<dyn MetricRecorder>,
        stream_id: String,
        ack_timeout: Duration,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Option<Arc<Self>> {
        if auth_token.is_empty() {
            warn!(id = %stream_id, "refusing to send with an empty auth token");
            request.complete(SendMessageStatus::InvalidAuth);
            return None;
        }

        let mut headers = build_headers(auth_token, request.headers());
        let header_lines: Vec<String> = headers
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect();

        let payload = Bytes::from(request.payload().to_owned());
        let body = match request.take_attachment() {
            None => {
                headers.push(("Content-Type".to_owned(), "application/json".to_owned()));
                RequestBody::Bytes(payload)
            }
            Some(attachment) => {
                let (name, reader) = match attachment {
                    AttachmentPayload::Reader { name, reader } => (name, reader),
                    AttachmentPayload::Managed {
                        name,
                        attachment_id,
                    } => match attachment_manager.open_reader(&attachment_id) {
                        Some(reader) => (name, reader),
                        None => {
                            warn!(id = %stream_id, attachment_id, "attachment not found");
                            request.complete(SendMessageStatus::InternalError);
                            return None;
                        }
                    },
                };
                let boundary = mime::boundary(&stream_id);
                headers.push(("Content-Type".to_owned(), mime::content_type(&boundary)));
                let (tx, rx) = mpsc::channel(4);
                tokio::spawn(mime::stream_multipart(boundary, payload, name, reader, tx));
                RequestBody::Stream(rx)
            }
        };

        let config = Http2RequestConfig {
            id: stream_id.clone(),
            method: http::Method::POST,
            url: format!("{}{}", context.gateway(), EVENTS_PATH),
            headers,
            body,
        };
        let stream = match context.create_and_send_request(config) {
            Ok(stream) => stream,
            Err(error) => {
                warn!(id = %stream_id, %error, "stream creation failed");
                request.complete(match error {
                    Http2Error::ConnectionClosed => SendMessageStatus::NotConnected,
                    _ => SendMessageStatus::InternalError,
                });
                return None;
            }
        };
        request.notify_pending();

        let state = shared_state();
        let this = Arc::new(Self {
            state: state.clone(),
            handle: stream.handle(),
            header_lines,
        });
        let span = debug_span!("event", id = %stream_id);
        let token = auth_token.to_owned();
        tokio::spawn(
            drive(
                state, context, request, consumer, metrics, stream, token, stream_id,
                ack_timeout, permit,
            )
            .instrument(span),
        );
        Some(this)
    }

    /// The exact header lines sent on the wire: `Authorization` first, then
    /// each caller header in the order supplied
    pub fn request_header_lines(&self) -> &[String] {
        &self.header_lines
    }

    /// Current lifecycle state
    pub fn state(&self) -> HandlerState {
        *self.state.lock().unwrap()
    }

    /// Best-effort abort; `false` once the exchange is already terminal
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    state: SharedState,
    context: Arc<dyn ExchangeContext>,
    request: Arc<MessageRequest>,
    consumer: Arc<dyn MessageConsumer>,
    metrics: Arc<dyn MetricRecorder>,
    mut stream: Http2Stream,
    auth_token: String,
    stream_id: String,
    ack_timeout: Duration,
    permit: Option<OwnedSemaphorePermit>,
) {
    set_state(&state, HandlerState::Ongoing);
    let started = Instant::now();
    let handle = stream.handle();
    let mut response_status: Option<u16> = None;
    let mut saw_body = false;
    let mut exception_body: Vec<u8> = Vec::new();

    let outcome = loop {
        // The acknowledgment deadline covers time to first response headers;
        // once acknowledged, only stream completion matters.
        let event = if response_status.is_none() {
            match timeout(ack_timeout, stream.next_event()).await {
                Ok(event) => event,
                Err(_) => {
                    debug!("no acknowledgment within {ack_timeout:?}");
                    handle.cancel();
                    finish_state(&state, HandlerState::TimedOut);
                    context.on_message_request_timeout();
                    break SendMessageStatus::TimedOut;
                }
            }
        } else {
            stream.next_event().await
        };
        let Some(event) = event else {
            // Producer vanished without a terminal event.
            break SendMessageStatus::InternalError;
        };
        context.on_activity();
        match event {
            StreamEvent::BodySent => context.on_message_request_sent(),
            StreamEvent::Headers { status } => {
                response_status = Some(status);
                context.on_message_request_acknowledged(status);
                if status == 403 {
                    context.on_forbidden(&auth_token);
                }
            }
            StreamEvent::Data(bytes) => {
                saw_body = true;
                match response_status {
                    // 2xx event responses can carry directives; they flow to
                    // the same consumer as the downchannel.
                    Some(status) if (200..300).contains(&status) => consumer.on_message(bytes),
                    _ => exception_body.extend_from_slice(&bytes),
                }
            }
            StreamEvent::Finished(reason) => match reason {
                FinishReason::Complete => match response_status {
                    Some(status) => {
                        break SendMessageStatus::from_http_status(status, saw_body);
                    }
                    None => break SendMessageStatus::ProtocolError,
                },
                FinishReason::Canceled => {
                    finish_state(&state, HandlerState::Aborted);
                    break SendMessageStatus::Canceled;
                }
                FinishReason::Error(error) => {
                    break match error {
                        Http2Error::Protocol(_) => SendMessageStatus::ProtocolError,
                        Http2Error::ConnectionClosed => SendMessageStatus::NotConnected,
                        _ => SendMessageStatus::InternalError,
                    };
                }
            },
        }
    };

    finish_state(&state, HandlerState::Completed);
    if !exception_body.is_empty() {
        request.notify_exception(&String::from_utf8_lossy(&exception_body));
    }
    request.complete(outcome);
    context.on_message_request_finished();
    metrics.record(StreamMetric {
        stream_id,
        response_status,
        send_status: Some(outcome),
        elapsed: started.elapsed(),
    });
    drop(permit);
}
