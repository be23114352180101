use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::observer::ConnectionStatusObserver;
use crate::status::{ChangedReason, ConnectionStatus};

/// Single source of truth for connection status and transition reason
///
/// The (status, reason, observer set) triple is guarded by one mutex.
/// Observer callbacks are always invoked after the lock has been released,
/// so an observer may re-enter this object (for example to query the current
/// status) without deadlocking. Mutating the observer set from inside a
/// callback takes the same mutex again and is therefore serialized, not
/// reentrant.
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    inner: Mutex<Inner>,
}

struct Inner {
    status: ConnectionStatus,
    reason: ChangedReason,
    observers: Vec<Arc<dyn ConnectionStatusObserver>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            reason: ChangedReason::ClientRequest,
            observers: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ConnectionStateMachine {
    /// A state machine holding `(Disconnected, ClientRequest)`
    pub fn new() -> Self {
        Self::default()
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.inner.lock().unwrap().status
    }

    /// Reason for the most recent transition
    pub fn reason(&self) -> ChangedReason {
        self.inner.lock().unwrap().reason
    }

    /// Register `observer` and synchronously tell it the current state
    ///
    /// The notification happens before this call returns, outside the lock.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionStatusObserver>) {
        let (status, reason) = {
            let mut inner = self.inner.lock().unwrap();
            inner.observers.push(observer.clone());
            (inner.status, inner.reason)
        };
        observer.on_connection_status_changed(status, reason);
    }

    /// Deregister `observer`; it receives no further notifications
    pub fn remove_observer(&self, observer: &Arc<dyn ConnectionStatusObserver>) {
        self.inner
            .lock()
            .unwrap()
            .observers
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    /// Drop all registered observers (shutdown path)
    pub fn clear_observers(&self) {
        self.inner.lock().unwrap().observers.clear();
    }

    /// Write the new state and notify every observer
    ///
    /// The write is unconditional and observers are notified on every call,
    /// including repeats of the current status; observers de-duplicate if
    /// they care.
    pub(crate) fn update(&self, status: ConnectionStatus, reason: ChangedReason) {
        let observers = {
            let mut inner = self.inner.lock().unwrap();
            inner.status = status;
            inner.reason = reason;
            inner.observers.clone()
        };
        debug!(%status, %reason, "connection status updated");
        for observer in observers {
            observer.on_connection_status_changed(status, reason);
        }
    }
}
