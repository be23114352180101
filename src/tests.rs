//! End-to-end transport scenarios over an in-process connection fake
//!
//! These exercise the whole stack below [`MessageRouter`]: the transport
//! task, the stream pool, and the exchange handlers, with only the physical
//! HTTP/2 connection replaced by [`testing::MockConnection`].
//!
//! [`testing::MockConnection`]: crate::testing::MockConnection

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use crate::exchange::{MessageRequestHandler, PingHandler};
use crate::observer::NoopMetricRecorder;
use crate::status::{ChangedReason, ConnectionStatus, SendMessageStatus};
use crate::testing::{
    subscribe, CollectingConsumer, CompletionRecorder, ContextCall, FixedAuth, MemoryAttachments,
    MockConnection, MockContext, MockFactory, MockRequest, MockRequests, StatusRecorder,
};
use crate::{
    AttachmentPayload, ExponentialBackoff, MessageRequest, MessageRouter, TransportConfig,
};

const GATEWAY: &str = "https://gateway.example";

fn quick_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.retry_policy(Arc::new(ExponentialBackoff::new(
        Duration::from_millis(20),
        Duration::from_millis(20),
    )));
    config
}

struct Harness {
    router: MessageRouter,
    factory: Arc<MockFactory>,
    auth: Arc<FixedAuth>,
    consumer: Arc<CollectingConsumer>,
    attachments: Arc<MemoryAttachments>,
    status: Arc<StatusRecorder>,
    requests: MockRequests,
    downchannel: MockRequest,
}

/// Bring a router up to `Connected` against one queued mock connection
async fn connect_harness(config: TransportConfig) -> Harness {
    let (connection, mut requests) = MockConnection::new();
    let factory = MockFactory::new();
    factory.push(connection);
    let auth = FixedAuth::new("authToken");
    let consumer = CollectingConsumer::new();
    let attachments = MemoryAttachments::new();
    let router = MessageRouter::new(
        config,
        factory.clone(),
        auth.clone(),
        consumer.clone(),
        attachments.clone(),
        Arc::new(NoopMetricRecorder),
        GATEWAY,
    );
    let status = StatusRecorder::new();
    router.add_connection_status_observer(status.clone());
    router.enable();

    let downchannel = requests.next().await;
    assert_eq!(downchannel.id, "DOWNCHANNEL");
    assert_eq!(downchannel.method, http::Method::GET);
    assert_eq!(downchannel.url, format!("{GATEWAY}/v20160207/directives"));
    downchannel
        .events
        .send(crate::http2::StreamEvent::Headers { status: 200 })
        .await;
    status
        .wait_for(|s, _| s == ConnectionStatus::Connected)
        .await;

    Harness {
        router,
        factory,
        auth,
        consumer,
        attachments,
        status,
        requests,
        downchannel,
    }
}

fn observed_request(router: &MessageRouter, payload: &str) -> (Arc<MessageRequest>, Arc<CompletionRecorder>) {
    let request = Arc::new(MessageRequest::new(payload));
    let recorder = CompletionRecorder::new();
    request.add_observer(recorder.clone());
    router.send_message(request.clone());
    (request, recorder)
}

#[tokio::test]
async fn connect_reports_pending_then_connected() {
    let _guard = subscribe();
    let harness = connect_harness(quick_config()).await;

    let seen = harness.status.seen();
    assert_eq!(
        &seen[..3],
        &[
            // Synchronous notification of the state current at registration.
            (ConnectionStatus::Disconnected, ChangedReason::ClientRequest),
            (ConnectionStatus::Pending, ChangedReason::ClientRequest),
            (ConnectionStatus::Connected, ChangedReason::ClientRequest),
        ]
    );

    // A second observer added while connected learns the current state
    // before the registration call returns.
    let late = StatusRecorder::new();
    harness.router.add_connection_status_observer(late.clone());
    assert_eq!(
        late.seen(),
        vec![(ConnectionStatus::Connected, ChangedReason::ClientRequest)]
    );
    assert!(harness.router.is_connected());
}

#[tokio::test]
async fn downchannel_directives_reach_the_consumer() {
    let _guard = subscribe();
    let harness = connect_harness(quick_config()).await;

    harness
        .downchannel
        .events
        .send(crate::http2::StreamEvent::Data(Bytes::from_static(
            b"{\"directive\":{}}",
        )))
        .await;
    assert_eq!(
        harness.consumer.wait_for_message().await,
        Bytes::from_static(b"{\"directive\":{}}")
    );
}

#[tokio::test]
async fn successful_send_reports_pending_then_one_success() {
    let _guard = subscribe();
    let mut harness = connect_harness(quick_config()).await;
    let (_request, recorder) = observed_request(&harness.router, "{\"event\":{}}");

    let mut event = harness.requests.next().await;
    assert_eq!(event.id, "AVSEVENT-0");
    assert_eq!(event.method, http::Method::POST);
    assert_eq!(event.url, format!("{GATEWAY}/v20160207/events"));
    assert_eq!(
        event.headers[0],
        ("Authorization".to_owned(), "Bearer authToken".to_owned())
    );
    assert_eq!(event.body_bytes().await, b"{\"event\":{}}");

    event.respond(200, Some(b"{\"ok\":true}")).await;
    assert_eq!(recorder.wait_terminal().await, SendMessageStatus::Success);
    assert_eq!(
        recorder.statuses(),
        vec![SendMessageStatus::Pending, SendMessageStatus::Success]
    );
    assert!(recorder.exceptions().is_empty());
    // 2xx event response bodies carry directives to the same consumer.
    assert_eq!(
        harness.consumer.wait_for_message().await,
        Bytes::from_static(b"{\"ok\":true}")
    );
}

#[tokio::test]
async fn forbidden_send_reports_invalid_auth_and_flags_the_token() {
    let _guard = subscribe();
    let mut harness = connect_harness(quick_config()).await;
    let (_request, recorder) = observed_request(&harness.router, "{}");

    let event = harness.requests.next().await;
    event.respond(403, Some(b"{\"error\":\"forbidden\"}")).await;

    assert_eq!(recorder.wait_terminal().await, SendMessageStatus::InvalidAuth);
    assert_eq!(recorder.exceptions(), vec!["{\"error\":\"forbidden\"}"]);
    // The rejection escalates: the provider hears about the bad token and
    // the session is torn down.
    harness
        .status
        .wait_for(|s, r| s == ConnectionStatus::Pending && r == ChangedReason::InvalidAuth)
        .await;
    assert_eq!(harness.auth.failures(), vec!["authToken"]);
}

#[tokio::test]
async fn attachment_sends_stream_a_multipart_body() {
    let _guard = subscribe();
    let mut harness = connect_harness(quick_config()).await;
    harness.attachments.insert("a1", b"\x01\x02\x03\x04".to_vec());

    let mut request = MessageRequest::new("{\"event\":{}}");
    request.set_attachment(AttachmentPayload::Managed {
        name: "audio".into(),
        attachment_id: "a1".into(),
    });
    let request = Arc::new(request);
    let recorder = CompletionRecorder::new();
    request.add_observer(recorder.clone());
    harness.router.send_message(request);

    let mut event = harness.requests.next().await;
    let content_type = event
        .headers
        .iter()
        .find(|(k, _)| k == "Content-Type")
        .cloned()
        .unwrap();
    assert_eq!(
        content_type.1,
        "multipart/form-data; boundary=avs-transport-AVSEVENT-0"
    );
    let body = event.body_bytes().await;
    let body = String::from_utf8_lossy(&body);
    assert!(body.starts_with("--avs-transport-AVSEVENT-0\r\n"));
    assert!(body.contains("name=\"metadata\""));
    assert!(body.contains("{\"event\":{}}"));
    assert!(body.contains("name=\"audio\""));
    assert!(body.contains("\x01\x02\x03\x04"));
    assert!(body.ends_with("--avs-transport-AVSEVENT-0--\r\n"));

    event.respond(204, None).await;
    assert_eq!(
        recorder.wait_terminal().await,
        SendMessageStatus::SuccessNoContent
    );
}

#[tokio::test]
async fn single_slot_sends_never_overlap() {
    let _guard = subscribe();
    let mut config = quick_config();
    config.max_concurrent_event_streams(1);
    let mut harness = connect_harness(config).await;

    let (_r1, recorder1) = observed_request(&harness.router, "{\"n\":1}");
    let (_r2, recorder2) = observed_request(&harness.router, "{\"n\":2}");

    let first = harness.requests.next().await;
    // The second stream must not exist until the first fully finished.
    assert!(timeout(Duration::from_millis(100), harness.requests.next())
        .await
        .is_err());

    first.respond(204, None).await;
    let second = harness.requests.next().await;
    second.respond(204, None).await;

    assert_eq!(
        recorder1.wait_terminal().await,
        SendMessageStatus::SuccessNoContent
    );
    assert_eq!(
        recorder2.wait_terminal().await,
        SendMessageStatus::SuccessNoContent
    );
}

#[tokio::test]
async fn teardown_resolves_acknowledged_in_flight_requests() {
    let _guard = subscribe();
    let mut harness = connect_harness(quick_config()).await;
    let (_request, recorder) = observed_request(&harness.router, "{}");

    // Acknowledged but never finished: the handler is past its ack deadline
    // and waiting on stream completion alone.
    let event = harness.requests.next().await;
    event.events.send(crate::http2::StreamEvent::BodySent).await;
    event
        .events
        .send(crate::http2::StreamEvent::Headers { status: 200 })
        .await;

    harness
        .downchannel
        .events
        .finish(crate::http2::FinishReason::Complete)
        .await;
    let status = timeout(Duration::from_secs(2), recorder.wait_terminal())
        .await
        .expect("in-flight request not resolved by teardown");
    assert_eq!(status, SendMessageStatus::NotConnected);
}

#[tokio::test]
async fn downchannel_close_triggers_reconnect() {
    let _guard = subscribe();
    let harness = connect_harness(quick_config()).await;
    let (next_connection, mut next_requests) = MockConnection::new();
    harness.factory.push(next_connection);

    harness
        .downchannel
        .events
        .finish(crate::http2::FinishReason::Complete)
        .await;
    harness
        .status
        .wait_for(|s, r| {
            s == ConnectionStatus::Pending && r == ChangedReason::ServerSideDisconnect
        })
        .await;

    let downchannel = next_requests.next().await;
    assert_eq!(downchannel.id, "DOWNCHANNEL");
    downchannel
        .events
        .send(crate::http2::StreamEvent::Headers { status: 200 })
        .await;
    harness
        .status
        .wait_for(|s, r| {
            s == ConnectionStatus::Connected && r == ChangedReason::ServerSideDisconnect
        })
        .await;
}

#[tokio::test]
async fn gateway_change_reconnects_to_the_new_endpoint() {
    let _guard = subscribe();
    let harness = connect_harness(quick_config()).await;
    let (next_connection, mut next_requests) = MockConnection::new();
    harness.factory.push(next_connection);

    harness.router.set_gateway("https://other.example");
    let downchannel = next_requests.next().await;
    assert_eq!(downchannel.url, "https://other.example/v20160207/directives");
    downchannel
        .events
        .send(crate::http2::StreamEvent::Headers { status: 200 })
        .await;
    harness
        .status
        .wait_for(|s, r| {
            s == ConnectionStatus::Connected && r == ChangedReason::ServerEndpointChanged
        })
        .await;
    assert_eq!(
        harness.factory.connected_gateways(),
        vec![GATEWAY.to_owned(), "https://other.example".to_owned()]
    );
}

#[tokio::test]
async fn idle_connection_pings_and_unanswered_ping_disconnects() {
    let _guard = subscribe();
    let mut config = quick_config();
    config
        .inactivity_timeout(Duration::from_millis(50))
        .ping_timeout(Duration::from_millis(100));
    let mut harness = connect_harness(config).await;

    let ping = harness.requests.next().await;
    assert_eq!(ping.id, "AVSPING-0");
    assert_eq!(ping.method, http::Method::GET);
    assert_eq!(ping.url, format!("{GATEWAY}/ping"));
    ping.respond(204, None).await;
    assert!(harness.router.is_connected());

    // Leave the next ping unanswered.
    let _ping = harness.requests.next().await;
    harness
        .status
        .wait_for(|s, r| s == ConnectionStatus::Pending && r == ChangedReason::PingTimeout)
        .await;
}

#[tokio::test]
async fn disable_cancels_queued_requests() {
    let _guard = subscribe();
    let mut config = TransportConfig::default();
    config.retry_policy(Arc::new(ExponentialBackoff::new(
        Duration::from_secs(3600),
        Duration::from_secs(3600),
    )));
    let factory = MockFactory::new();
    let router = MessageRouter::new(
        config,
        factory,
        FixedAuth::new("authToken"),
        CollectingConsumer::new(),
        MemoryAttachments::new(),
        Arc::new(NoopMetricRecorder),
        GATEWAY,
    );
    let status = StatusRecorder::new();
    router.add_connection_status_observer(status.clone());
    router.enable();
    status
        .wait_for(|s, r| s == ConnectionStatus::Pending && r == ChangedReason::ConnectTimeout)
        .await;

    let (_request, recorder) = observed_request(&router, "{}");
    router.disable();

    assert_eq!(recorder.wait_terminal().await, SendMessageStatus::Canceled);
    status
        .wait_for(|s, r| s == ConnectionStatus::Disconnected && r == ChangedReason::Disabled)
        .await;
}

#[tokio::test]
async fn send_while_disabled_resolves_not_connected() {
    let _guard = subscribe();
    let router = MessageRouter::new(
        quick_config(),
        MockFactory::new(),
        FixedAuth::new("authToken"),
        CollectingConsumer::new(),
        MemoryAttachments::new(),
        Arc::new(NoopMetricRecorder),
        GATEWAY,
    );
    let (_request, recorder) = observed_request(&router, "{}");
    assert_eq!(
        recorder.wait_terminal().await,
        SendMessageStatus::NotConnected
    );
}

#[tokio::test]
async fn event_request_headers_follow_wire_order() {
    let _guard = subscribe();
    let (connection, mut requests) = MockConnection::new();
    let context = MockContext::new(connection);

    let mut request = MessageRequest::new("{}");
    request.add_header("k1", "v1").add_header("k2", "v2");
    let handler = MessageRequestHandler::new(
        context,
        "authToken",
        Arc::new(request),
        CollectingConsumer::new(),
        MemoryAttachments::new(),
        Arc::new(NoopMetricRecorder),
        "AVSEVENT-0".to_owned(),
        Duration::from_secs(5),
        None,
    )
    .unwrap();

    assert_eq!(
        handler.request_header_lines(),
        ["Authorization: Bearer authToken", "k1: v1", "k2: v2"]
    );
    // On the wire, Content-Type follows the caller's headers.
    let event = requests.next().await;
    assert_eq!(
        event.headers.last().cloned().unwrap(),
        ("Content-Type".to_owned(), "application/json".to_owned())
    );
}

#[tokio::test]
async fn zero_ping_timeout_resolves_instead_of_blocking() {
    let _guard = subscribe();
    let (connection, mut requests) = MockConnection::new();
    let context = MockContext::new(connection);

    let handler = PingHandler::new(
        context.clone(),
        "authToken",
        "AVSPING-0".to_owned(),
        Duration::ZERO,
    )
    .unwrap();
    let _ping = requests.next().await;

    timeout(
        Duration::from_secs(1),
        context.wait_for_call(ContextCall::PingTimeout),
    )
    .await
    .expect("ping did not resolve");
    assert_eq!(handler.state(), crate::exchange::HandlerState::TimedOut);
}
