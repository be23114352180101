use std::fmt;

/// Connectivity of the transport to the gateway
///
/// Exactly one value is held at a time, owned by the [`ConnectionStateMachine`]
/// and mutated only under its lock.
///
/// [`ConnectionStateMachine`]: crate::ConnectionStateMachine
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum ConnectionStatus {
    /// No connection to the gateway exists and none is being attempted
    Disconnected,
    /// A connection attempt (or reconnect) is in progress
    Pending,
    /// The downchannel is established and event streams may be sent
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Disconnected => "DISCONNECTED",
            Self::Pending => "PENDING",
            Self::Connected => "CONNECTED",
        })
    }
}

/// Why the most recent [`ConnectionStatus`] transition happened
///
/// Always paired with a status value when observers are notified.
/// Informational only; no transport logic branches on it.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum ChangedReason {
    /// The client asked for the transition (enable, explicit reconnect)
    ClientRequest,
    /// The transport was disabled by the client
    Disabled,
    /// DNS resolution of the gateway did not complete in time
    DnsTimeout,
    /// The TCP/TLS connection attempt did not complete in time
    ConnectTimeout,
    /// The server asked the client to back off
    Throttled,
    /// The gateway rejected the client's credentials
    InvalidAuth,
    /// A keepalive ping went unanswered
    PingTimeout,
    /// Writing to the connection did not complete in time
    WriteTimeout,
    /// Reading from the connection did not complete in time
    ReadTimeout,
    /// The HTTP/2 session violated the protocol
    ProtocolError,
    /// A client-side fault that is not the caller's doing
    InternalError,
    /// The server reported an internal failure
    ServerInternalError,
    /// The server closed the downchannel
    ServerSideDisconnect,
    /// The gateway endpoint was changed, forcing a reconnect
    ServerEndpointChanged,
}

impl fmt::Display for ChangedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::ClientRequest => "ACL_CLIENT_REQUEST",
            Self::Disabled => "ACL_DISABLED",
            Self::DnsTimeout => "DNS_TIMEDOUT",
            Self::ConnectTimeout => "CONNECTION_TIMEDOUT",
            Self::Throttled => "CONNECTION_THROTTLED",
            Self::InvalidAuth => "INVALID_AUTH",
            Self::PingTimeout => "PING_TIMEDOUT",
            Self::WriteTimeout => "WRITE_TIMEDOUT",
            Self::ReadTimeout => "READ_TIMEDOUT",
            Self::ProtocolError => "FAILURE_PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServerInternalError => "SERVER_INTERNAL_ERROR",
            Self::ServerSideDisconnect => "SERVER_SIDE_DISCONNECT",
            Self::ServerEndpointChanged => "SERVER_ENDPOINT_CHANGED",
        })
    }
}

/// Outcome of one [`MessageRequest`] send
///
/// `Pending` is the only non-terminal value; when reported at all it precedes
/// any terminal value. A request reaches at most one terminal status.
///
/// [`MessageRequest`]: crate::MessageRequest
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum SendMessageStatus {
    /// The request is waiting on the wire for a response
    Pending,
    /// The server returned 2xx with a response body
    Success,
    /// The server returned 2xx with no response body
    SuccessNoContent,
    /// The request was submitted while no connection existed
    NotConnected,
    /// The request was submitted before the client synchronized state
    NotSynchronized,
    /// No acknowledgment arrived within the configured deadline
    TimedOut,
    /// The HTTP/2 exchange itself failed
    ProtocolError,
    /// A client-side fault that is not the caller's doing
    InternalError,
    /// The server returned 500
    ServerInternalError,
    /// The server refused the request
    Refused,
    /// The request was canceled before completion
    Canceled,
    /// The server returned 429
    Throttled,
    /// The server returned 403
    InvalidAuth,
    /// The server returned a 4xx other than 403/429
    BadRequest,
    /// The server returned a 5xx other than 500
    ServerOtherError,
}

impl SendMessageStatus {
    /// Whether this status ends the request's lifecycle
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Fixed mapping from an HTTP response code to a terminal status
    pub fn from_http_status(status: u16, has_body: bool) -> Self {
        match status {
            200..=299 if has_body => Self::Success,
            200..=299 => Self::SuccessNoContent,
            403 => Self::InvalidAuth,
            429 => Self::Throttled,
            400..=499 => Self::BadRequest,
            500 => Self::ServerInternalError,
            501..=599 => Self::ServerOtherError,
            _ => Self::ProtocolError,
        }
    }
}

impl fmt::Display for SendMessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::SuccessNoContent => "SUCCESS_NO_CONTENT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::NotSynchronized => "NOT_SYNCHRONIZED",
            Self::TimedOut => "TIMEDOUT",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServerInternalError => "SERVER_INTERNAL_ERROR_V2",
            Self::Refused => "REFUSED",
            Self::Canceled => "CANCELED",
            Self::Throttled => "THROTTLED",
            Self::InvalidAuth => "INVALID_AUTH",
            Self::BadRequest => "BAD_REQUEST",
            Self::ServerOtherError => "SERVER_OTHER_ERROR",
        })
    }
}
