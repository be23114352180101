//! Multiplexed HTTP/2 transport core for the AVS cloud voice service
//!
//! This crate maintains one persistent connection to the gateway and
//! multiplexes everything a device exchanges with the cloud over it: a
//! long-lived downchannel stream for server-pushed directives, on-demand
//! streams for client events (with optional binary attachments), keepalive
//! pings driven off connection inactivity, and reconnection with an
//! injectable backoff policy.
//!
//! The most important types are [`MessageRouter`], the façade the rest of an
//! SDK talks to, and [`MessageRequest`], one outbound unit of work awaiting
//! exactly one terminal [`SendMessageStatus`]. Connectivity is observable
//! through [`ConnectionStatusObserver`]; a newly registered observer is
//! synchronously told the current state, so no transition is ever missed.
//!
//! Directive parsing, capability agents, token refresh, and attachment
//! storage live outside this crate behind the traits in [`observer`].

#![warn(missing_docs)]
#![cfg_attr(test, allow(dead_code))]
#![allow(clippy::cognitive_complexity)]

mod config;
mod connection_state;
mod error;
mod message;
mod pool;
mod router;
mod status;
mod transport;

pub mod exchange;
pub mod http2;
pub mod observer;

pub use crate::config::{ExponentialBackoff, RetryPolicy, TransportConfig};
pub use crate::connection_state::ConnectionStateMachine;
pub use crate::error::Http2Error;
pub use crate::message::{AttachmentPayload, MessageRequest};
pub use crate::observer::{
    AttachmentManager, AttachmentSink, AttachmentSource, AuthTokenProvider,
    ConnectionStatusObserver, MessageConsumer, MessageRequestObserver, MetricRecorder,
    NoopMetricRecorder, StreamMetric,
};
pub use crate::pool::StreamPool;
pub use crate::router::MessageRouter;
pub use crate::status::{ChangedReason, ConnectionStatus, SendMessageStatus};
pub use crate::transport::{Http2Transport, TransportHandle};

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;
