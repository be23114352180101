//! h2-backed implementation of the connection seam
//!
//! One [`H2Connection`] wraps a TLS+ALPN `h2` session. Each created stream
//! runs as its own task that drives the exchange and feeds
//! [`StreamEvent`]s to the consumer; cancellation resets the underlying
//! HTTP/2 stream by dropping it.

use std::{
    future::poll_fn,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use h2::client::SendRequest;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    ConnectFuture, FinishReason, Http2Connection, Http2ConnectionFactory, Http2RequestConfig,
    Http2Stream, RequestBody, StreamEvent, StreamEventSender, StreamRegistry,
};
use crate::error::Http2Error;

/// Host/port/origin pieces of an `https://` gateway URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GatewayUrl {
    pub host: String,
    pub port: u16,
}

impl GatewayUrl {
    pub(crate) fn parse(gateway: &str) -> Result<Self, Http2Error> {
        let rest = gateway
            .strip_prefix("https://")
            .ok_or_else(|| Http2Error::InvalidGateway(gateway.to_owned()))?;
        let authority = rest.split('/').next().unwrap_or("");
        if authority.is_empty() {
            return Err(Http2Error::InvalidGateway(gateway.to_owned()));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|_| Http2Error::InvalidGateway(gateway.to_owned()))?,
            ),
            None => (authority, 443),
        };
        if host.is_empty() {
            return Err(Http2Error::InvalidGateway(gateway.to_owned()));
        }
        Ok(Self {
            host: host.to_owned(),
            port,
        })
    }
}

/// Dials the gateway: DNS, TCP, TLS with ALPN `h2`, then HTTP/2 handshake
///
/// DNS and connect phases carry separate timeouts so a failure surfaces with
/// the matching connection-status reason.
#[derive(Debug, Clone)]
pub struct GatewayConnector {
    dns_timeout: Duration,
    connect_timeout: Duration,
}

impl GatewayConnector {
    /// A connector with the given phase timeouts
    pub fn new(dns_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            dns_timeout,
            connect_timeout,
        }
    }

    /// A connector taking its timeouts from `config`
    pub fn from_config(config: &crate::TransportConfig) -> Self {
        Self::new(config.dns_timeout, config.connect_timeout)
    }

    fn tls_config() -> rustls::ClientConfig {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];
        config
    }
}

impl Http2ConnectionFactory for GatewayConnector {
    fn connect(&self, gateway: &str) -> ConnectFuture {
        let gateway = gateway.to_owned();
        let dns_timeout = self.dns_timeout;
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let url = GatewayUrl::parse(&gateway)?;

            let addrs: Vec<SocketAddr> = timeout(
                dns_timeout,
                tokio::net::lookup_host((url.host.as_str(), url.port)),
            )
            .await
            .map_err(|_| Http2Error::DnsTimeout)?
            .map_err(|e| Http2Error::Dns(e.to_string()))?
            .collect();
            let addr = addrs
                .first()
                .copied()
                .ok_or_else(|| Http2Error::Dns(format!("no addresses for {}", url.host)))?;

            let tcp = timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| Http2Error::ConnectTimeout)?
                .map_err(|e| Http2Error::Connect(e.to_string()))?;
            let _ = tcp.set_nodelay(true);

            let server_name = ServerName::try_from(url.host.clone())
                .map_err(|e| Http2Error::Tls(e.to_string()))?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(Self::tls_config()));
            let tls = timeout(connect_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| Http2Error::ConnectTimeout)?
                .map_err(|e| Http2Error::Tls(e.to_string()))?;

            let (send_request, session) = timeout(connect_timeout, h2::client::handshake(tls))
                .await
                .map_err(|_| Http2Error::ConnectTimeout)?
                .map_err(|e| Http2Error::Protocol(e.to_string()))?;

            let closed = Arc::new(AtomicBool::new(false));
            let driver_closed = closed.clone();
            let session = tokio::spawn(
                async move {
                    if let Err(error) = session.await {
                        debug!(%error, "HTTP/2 session ended with error");
                    }
                    driver_closed.store(true, Ordering::Release);
                }
                .instrument(debug_span!("h2_session", gateway = %gateway)),
            );

            let connection: Arc<dyn Http2Connection> = Arc::new(H2Connection {
                send_request: Mutex::new(send_request),
                closed,
                streams: StreamRegistry::default(),
                session,
            });
            Ok(connection)
        })
    }
}

/// One live h2 session
pub struct H2Connection {
    send_request: Mutex<SendRequest<Bytes>>,
    closed: Arc<AtomicBool>,
    streams: StreamRegistry,
    session: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connection")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Http2Connection for H2Connection {
    fn create_and_send_request(&self, config: Http2RequestConfig) -> Result<Http2Stream, Http2Error> {
        if self.is_closed() {
            return Err(Http2Error::ConnectionClosed);
        }
        let send_request = self.send_request.lock().unwrap().clone();
        let (stream, events) = Http2Stream::channel(config.id.clone());
        self.streams.register(events.clone());
        let span = debug_span!("stream", id = %config.id);
        tokio::spawn(drive_exchange(send_request, config, events).instrument(span));
        Ok(stream)
    }

    fn disconnect(&self) {
        // New stream creation stops first; then every open stream hears an
        // error finish, and aborting the session task drops the socket.
        self.closed.store(true, Ordering::Release);
        self.streams.finish_all(Http2Error::ConnectionClosed);
        self.session.abort();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

async fn drive_exchange(
    send_request: SendRequest<Bytes>,
    config: Http2RequestConfig,
    events: StreamEventSender,
) {
    tokio::select! {
        () = events.canceled() => {
            debug!("stream canceled");
            events.finish(FinishReason::Canceled).await;
        }
        result = run_exchange(send_request, config, &events) => match result {
            Ok(()) => events.finish(FinishReason::Complete).await,
            Err(error) => {
                warn!(%error, "exchange failed");
                events.finish(FinishReason::Error(error)).await;
            }
        }
    }
}

async fn run_exchange(
    mut send_request: SendRequest<Bytes>,
    config: Http2RequestConfig,
    events: &StreamEventSender,
) -> Result<(), Http2Error> {
    let mut builder = http::Request::builder()
        .method(config.method.clone())
        .uri(config.url.as_str());
    // HeaderMap iterates distinct keys in insertion order and h2 encodes in
    // iteration order, so the wire sees the config's header ordering.
    for (name, value) in &config.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    let request = builder
        .body(())
        .map_err(|e| Http2Error::Internal(e.to_string()))?;

    poll_fn(|cx| send_request.poll_ready(cx))
        .await
        .map_err(stream_error)?;
    let end_of_stream = matches!(config.body, RequestBody::Empty);
    let (response, mut body_tx) = send_request
        .send_request(request, end_of_stream)
        .map_err(stream_error)?;

    match config.body {
        RequestBody::Empty => {}
        RequestBody::Bytes(data) => send_body(&mut body_tx, data, true).await?,
        RequestBody::Stream(rx) => send_body_stream(&mut body_tx, rx).await?,
    }
    events.send(StreamEvent::BodySent).await;

    let response = response.await.map_err(stream_error)?;
    let status = response.status().as_u16();
    events.send(StreamEvent::Headers { status }).await;

    let mut body = response.into_body();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(stream_error)?;
        let _ = body.flow_control().release_capacity(chunk.len());
        events.send(StreamEvent::Data(chunk)).await;
    }
    Ok(())
}

/// Send one chunk, respecting stream flow-control capacity
async fn send_body(
    body_tx: &mut h2::SendStream<Bytes>,
    mut data: Bytes,
    end_of_stream: bool,
) -> Result<(), Http2Error> {
    if data.is_empty() {
        if end_of_stream {
            body_tx.send_data(data, true).map_err(stream_error)?;
        }
        return Ok(());
    }
    while !data.is_empty() {
        body_tx.reserve_capacity(data.len());
        let granted = poll_fn(|cx| body_tx.poll_capacity(cx))
            .await
            .ok_or(Http2Error::ConnectionClosed)?
            .map_err(stream_error)?;
        let chunk = data.split_to(granted.min(data.len()));
        let last = end_of_stream && data.is_empty();
        body_tx.send_data(chunk, last).map_err(stream_error)?;
    }
    Ok(())
}

async fn send_body_stream(
    body_tx: &mut h2::SendStream<Bytes>,
    mut rx: mpsc::Receiver<Bytes>,
) -> Result<(), Http2Error> {
    while let Some(chunk) = rx.recv().await {
        send_body(body_tx, chunk, false).await?;
    }
    body_tx
        .send_data(Bytes::new(), true)
        .map_err(stream_error)?;
    Ok(())
}

fn stream_error(error: h2::Error) -> Http2Error {
    if error.is_io() {
        Http2Error::ConnectionClosed
    } else {
        Http2Error::Protocol(error.to_string())
    }
}
