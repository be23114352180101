use std::{fmt, sync::Arc, time::Duration};

use rand::Rng;

/// Parameters governing the transport's timeouts, concurrency, and reconnects
///
/// Default values match what the gateway expects from production devices: a
/// five-minute inactivity window before a keepalive ping, and a small bounded
/// pool of concurrent outbound event streams next to the single downchannel.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) dns_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) ack_timeout: Duration,
    pub(crate) inactivity_timeout: Duration,
    pub(crate) ping_timeout: Duration,
    pub(crate) max_concurrent_event_streams: usize,
    pub(crate) stream_acquire_timeout: Duration,
    pub(crate) retry_policy: Arc<dyn RetryPolicy>,
}

impl TransportConfig {
    /// Maximum time to resolve the gateway host before giving up
    pub fn dns_timeout(&mut self, value: Duration) -> &mut Self {
        self.dns_timeout = value;
        self
    }

    /// Maximum time for the TCP + TLS + HTTP/2 handshake, and for the
    /// downchannel to be acknowledged after it
    pub fn connect_timeout(&mut self, value: Duration) -> &mut Self {
        self.connect_timeout = value;
        self
    }

    /// Maximum time from sending an event to receiving response headers
    ///
    /// A zero value resolves the exchange immediately rather than blocking.
    pub fn ack_timeout(&mut self, value: Duration) -> &mut Self {
        self.ack_timeout = value;
        self
    }

    /// Connection-wide inactivity window after which a ping is sent
    pub fn inactivity_timeout(&mut self, value: Duration) -> &mut Self {
        self.inactivity_timeout = value;
        self
    }

    /// Maximum time for a ping to be acknowledged
    ///
    /// A zero value resolves the ping immediately rather than blocking.
    pub fn ping_timeout(&mut self, value: Duration) -> &mut Self {
        self.ping_timeout = value;
        self
    }

    /// Maximum number of outbound event streams open at once
    ///
    /// The downchannel does not count against this limit. Requests beyond the
    /// limit wait FIFO for a slot.
    pub fn max_concurrent_event_streams(&mut self, value: usize) -> &mut Self {
        self.max_concurrent_event_streams = value;
        self
    }

    /// Bounded wait for a free event-stream slot when the pool is saturated
    ///
    /// Exceeding this fails the request with an internal-error status instead
    /// of hanging.
    pub fn stream_acquire_timeout(&mut self, value: Duration) -> &mut Self {
        self.stream_acquire_timeout = value;
        self
    }

    /// Schedule of delays between reconnection attempts
    pub fn retry_policy(&mut self, value: Arc<dyn RetryPolicy>) -> &mut Self {
        self.retry_policy = value;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dns_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(60),
            ack_timeout: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(300),
            ping_timeout: Duration::from_secs(30),
            max_concurrent_event_streams: 10,
            stream_acquire_timeout: Duration::from_secs(15),
            retry_policy: Arc::new(ExponentialBackoff::default()),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("dns_timeout", &self.dns_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("ack_timeout", &self.ack_timeout)
            .field("inactivity_timeout", &self.inactivity_timeout)
            .field("ping_timeout", &self.ping_timeout)
            .field(
                "max_concurrent_event_streams",
                &self.max_concurrent_event_streams,
            )
            .field("stream_acquire_timeout", &self.stream_acquire_timeout)
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

/// Schedule of delays between reconnection attempts
///
/// The transport never retries a failed stream internally; only the
/// connection itself is re-established, and the pause before attempt `n` is
/// whatever this policy returns. Injectable so integrators can match their
/// fleet's throttling rules.
pub trait RetryPolicy: Send + Sync + fmt::Debug {
    /// Delay before reconnection attempt `attempt` (0-based)
    fn delay(&self, attempt: u32) -> Duration;
}

/// Doubling backoff with equal jitter, capped at `max`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// A policy that starts at `base` and doubles up to `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20);
        let ceiling = self.base.saturating_mul(1u32 << exp).min(self.max);
        if ceiling.is_zero() {
            return ceiling;
        }
        // Equal jitter: uniform in [ceiling/2, ceiling]
        let half = ceiling / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(5));
        for attempt in 0..40 {
            assert!(policy.delay(attempt) <= Duration::from_secs(5));
        }
    }

    #[test]
    fn jitter_stays_in_the_upper_half_of_the_ceiling() {
        let policy = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60));
        // Attempt 2: ceiling 400ms, so delays land in [200ms, 400ms].
        for _ in 0..100 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(400));
        }
    }

    #[test]
    fn backoff_grows() {
        let policy = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(3600));
        // Jitter floors at half the ceiling, so attempt 4 strictly exceeds attempt 0's ceiling
        assert!(policy.delay(4) > Duration::from_secs(1));
    }
}
