use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::observer::{AttachmentSource, MessageRequestObserver};
use crate::status::SendMessageStatus;

/// Binary payload accompanying an event
pub enum AttachmentPayload {
    /// A caller-supplied reader, consumed once when the stream is created
    Reader {
        /// Part name used in the multipart body
        name: String,
        /// Source of the attachment bytes
        reader: AttachmentSource,
    },
    /// An attachment resolved through the [`AttachmentManager`] at send time
    ///
    /// [`AttachmentManager`]: crate::AttachmentManager
    Managed {
        /// Part name used in the multipart body
        name: String,
        /// Id handed to [`AttachmentManager::open_reader`]
        ///
        /// [`AttachmentManager::open_reader`]: crate::AttachmentManager::open_reader
        attachment_id: String,
    },
}

impl fmt::Debug for AttachmentPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reader { name, .. } => f.debug_struct("Reader").field("name", name).finish(),
            Self::Managed {
                name,
                attachment_id,
            } => f
                .debug_struct("Managed")
                .field("name", name)
                .field("attachment_id", attachment_id)
                .finish(),
        }
    }
}

/// One outbound unit of work: a JSON event, optionally with a binary
/// attachment, awaiting delivery and a terminal outcome
///
/// The payload is immutable once constructed. Extra headers keep their
/// insertion order; that order is a wire-format contract. Each registered
/// observer receives at most one terminal [`SendMessageStatus`]; once a
/// terminal value has been delivered no further status follows for this
/// object.
pub struct MessageRequest {
    payload: String,
    headers: Vec<(String, String)>,
    attachment: Mutex<Option<AttachmentPayload>>,
    shared: Mutex<Shared>,
}

#[derive(Default)]
struct Shared {
    observers: Vec<Arc<dyn MessageRequestObserver>>,
    pending_reported: bool,
    terminal: Option<SendMessageStatus>,
}

impl fmt::Debug for MessageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock().unwrap();
        f.debug_struct("MessageRequest")
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("terminal", &shared.terminal)
            .finish()
    }
}

impl MessageRequest {
    /// A request carrying `payload` as its JSON event body
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            headers: Vec::new(),
            attachment: Mutex::new(None),
            shared: Mutex::new(Shared::default()),
        }
    }

    /// Append an extra header; order of addition is preserved on the wire
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Attach a binary payload, turning the event body into multipart MIME
    pub fn set_attachment(&mut self, attachment: AttachmentPayload) -> &mut Self {
        *self.attachment.lock().unwrap() = Some(attachment);
        self
    }

    /// The JSON event body
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Extra headers in insertion order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Register an observer for this request's outcome
    ///
    /// An observer added after the terminal status was delivered is told that
    /// status immediately, so no outcome is ever lost to registration order.
    pub fn add_observer(&self, observer: Arc<dyn MessageRequestObserver>) {
        let delivered = {
            let mut shared = self.shared.lock().unwrap();
            match shared.terminal {
                Some(status) => Some(status),
                None => {
                    shared.observers.push(observer.clone());
                    None
                }
            }
        };
        if let Some(status) = delivered {
            observer.on_send_completed(status);
        }
    }

    /// Whether a terminal status has been delivered
    pub fn is_complete(&self) -> bool {
        self.shared.lock().unwrap().terminal.is_some()
    }

    /// Take the attachment for streaming; consumed at most once
    pub(crate) fn take_attachment(&self) -> Option<AttachmentPayload> {
        self.attachment.lock().unwrap().take()
    }

    pub(crate) fn has_attachment(&self) -> bool {
        self.attachment.lock().unwrap().is_some()
    }

    /// Report `Pending` once, if no terminal status has been delivered yet
    pub(crate) fn notify_pending(&self) {
        let observers = {
            let mut shared = self.shared.lock().unwrap();
            if shared.pending_reported || shared.terminal.is_some() {
                return;
            }
            shared.pending_reported = true;
            shared.observers.clone()
        };
        for observer in observers {
            observer.on_send_completed(SendMessageStatus::Pending);
        }
    }

    /// Deliver the terminal status, exactly once
    ///
    /// A second call is a no-op; the first delivery wins.
    pub(crate) fn complete(&self, status: SendMessageStatus) {
        debug_assert!(status.is_terminal());
        let observers = {
            let mut shared = self.shared.lock().unwrap();
            if shared.terminal.is_some() {
                warn!(%status, "terminal status already delivered, dropping");
                return;
            }
            shared.terminal = Some(status);
            shared.observers.clone()
        };
        for observer in observers {
            observer.on_send_completed(status);
        }
    }

    /// Hand a server exception payload to the observers
    pub(crate) fn notify_exception(&self, message: &str) {
        let observers = self.shared.lock().unwrap().observers.clone();
        for observer in observers {
            observer.on_exception_received(message);
        }
    }
}
