use thiserror::Error;

use crate::status::ChangedReason;

/// Failures raised by the low-level HTTP/2 connection layer
#[derive(Debug, Error, Clone)]
pub enum Http2Error {
    /// DNS resolution of the gateway host did not complete in time
    #[error("DNS resolution timed out")]
    DnsTimeout,
    /// DNS resolution of the gateway host failed outright
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    /// The TCP connection attempt did not complete in time
    #[error("connection attempt timed out")]
    ConnectTimeout,
    /// The TCP connection attempt failed outright
    #[error("connection failed: {0}")]
    Connect(String),
    /// The TLS handshake was rejected or failed
    #[error("TLS handshake failed: {0}")]
    Tls(String),
    /// The gateway URL could not be parsed into host/port/authority
    #[error("invalid gateway URL: {0}")]
    InvalidGateway(String),
    /// The HTTP/2 session misbehaved at the framing/protocol level
    #[error("HTTP/2 protocol error: {0}")]
    Protocol(String),
    /// The physical connection is gone; no new streams can be created
    #[error("connection closed")]
    ConnectionClosed,
    /// A stream slot could not be acquired within the bounded wait
    #[error("no stream slot became available in time")]
    StreamLimit,
    /// A client-side fault that is not the caller's doing
    #[error("internal transport error: {0}")]
    Internal(String),
}

impl Http2Error {
    /// The connection-status reason this failure maps to when it is
    /// connection-scoped rather than stream-scoped
    pub(crate) fn changed_reason(&self) -> ChangedReason {
        match self {
            Self::DnsTimeout | Self::Dns(_) => ChangedReason::DnsTimeout,
            Self::ConnectTimeout | Self::Connect(_) | Self::Tls(_) => {
                ChangedReason::ConnectTimeout
            }
            Self::Protocol(_) => ChangedReason::ProtocolError,
            Self::ConnectionClosed => ChangedReason::ServerSideDisconnect,
            Self::InvalidGateway(_) | Self::StreamLimit | Self::Internal(_) => {
                ChangedReason::InternalError
            }
        }
    }
}
